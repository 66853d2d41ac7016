/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Signing, verification and key support for MAR files.
//!
//! MAR signatures are RSA PKCS#1 v1.5 signatures over a digest of the whole
//! file, excluding the signature payloads themselves.  See
//! [`write_signature_data`] for exactly which bytes are covered.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    str::FromStr,
};

use byteorder::{BigEndian, WriteBytesExt};
use log::debug;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding},
    traits::PublicKeyParts,
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;
use sha2::{Digest, Sha384};

use crate::{
    error::{MarError, Result},
    format::{get_info, HEADER_SIZE},
};

/// The signature algorithms a MAR file can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningAlgorithm {
    /// Algorithm id 1: RSA-2048 over SHA-1.
    Sha1,
    /// Algorithm id 2: RSA-4096 over SHA-384.
    Sha384,
}

impl SigningAlgorithm {
    pub fn id(self) -> u32 {
        match self {
            SigningAlgorithm::Sha1 => 1,
            SigningAlgorithm::Sha384 => 2,
        }
    }

    pub fn from_id(id: u32) -> Option<SigningAlgorithm> {
        match id {
            1 => Some(SigningAlgorithm::Sha1),
            2 => Some(SigningAlgorithm::Sha384),
            _ => None,
        }
    }

    /// The RSA key size this algorithm is paired with.
    pub fn key_bits(self) -> usize {
        match self {
            SigningAlgorithm::Sha1 => 2048,
            SigningAlgorithm::Sha384 => 4096,
        }
    }

    pub fn from_key_bits(bits: usize) -> Option<SigningAlgorithm> {
        match bits {
            2048 => Some(SigningAlgorithm::Sha1),
            4096 => Some(SigningAlgorithm::Sha384),
            _ => None,
        }
    }

    /// Every signature made with this algorithm has exactly this length.
    pub fn signature_len(self) -> usize {
        self.key_bits() / 8
    }

    pub fn name(self) -> &'static str {
        match self {
            SigningAlgorithm::Sha1 => "sha1",
            SigningAlgorithm::Sha384 => "sha384",
        }
    }

    pub fn hasher(self) -> MarHasher {
        match self {
            SigningAlgorithm::Sha1 => MarHasher::Sha1(Sha1::new()),
            SigningAlgorithm::Sha384 => MarHasher::Sha384(Sha384::new()),
        }
    }

    /// A zero filled placeholder of the right size, written until the real
    /// signature is known.
    pub fn dummy_signature(self) -> Vec<u8> {
        vec![0; self.signature_len()]
    }

    fn scheme(self) -> Pkcs1v15Sign {
        match self {
            SigningAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
            SigningAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
        }
    }

    /// The ASN.1 DigestInfo header that precedes a digest of this type.
    fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            SigningAlgorithm::Sha1 => {
                &b"\x30\x21\x30\x09\x06\x05\x2b\x0e\x03\x02\x1a\x05\x00\x04\x14"[..]
            }
            SigningAlgorithm::Sha384 => {
                &b"\x30\x41\x30\x0d\x06\x09\x60\x86\x48\x01\x65\x03\x04\x02\x02\x05\x00\x04\x30"[..]
            }
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = MarError;

    fn from_str(s: &str) -> Result<SigningAlgorithm> {
        match s {
            "sha1" => Ok(SigningAlgorithm::Sha1),
            "sha384" => Ok(SigningAlgorithm::Sha384),
            _ => Err(MarError::Usage(format!("Unsupported signing algorithm: {}", s))),
        }
    }
}

/// What kind of signature a MAR file carries, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Known(SigningAlgorithm),
    Unknown,
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureType::Known(algorithm) => algorithm.fmt(f),
            SignatureType::Unknown => f.write_str("unknown"),
        }
    }
}

/// A running digest for one of the signing algorithms.
#[derive(Clone)]
pub enum MarHasher {
    Sha1(Sha1),
    Sha384(Sha384),
}

impl MarHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            MarHasher::Sha1(h) => h.update(data),
            MarHasher::Sha384(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            MarHasher::Sha1(h) => h.finalize().to_vec(),
            MarHasher::Sha384(h) => h.finalize().to_vec(),
        }
    }
}

impl Write for MarHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Feeds the same data to several hashers.
pub struct MultiHasher {
    hashers: Vec<(SigningAlgorithm, MarHasher)>,
}

impl MultiHasher {
    pub fn new<I: IntoIterator<Item = SigningAlgorithm>>(algorithms: I) -> MultiHasher {
        MultiHasher {
            hashers: algorithms.into_iter().map(|a| (a, a.hasher())).collect(),
        }
    }

    pub fn finalize(self) -> Vec<(SigningAlgorithm, Vec<u8>)> {
        self.hashers
            .into_iter()
            .map(|(algorithm, h)| (algorithm, h.finalize()))
            .collect()
    }
}

impl Write for MultiHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for (_, h) in &mut self.hashers {
            h.update(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes the bytes of `src` that MAR signatures cover into `dst`.
///
/// That is the 8 byte header, then `filesize` and the signature count, then
/// each signature's algorithm id and size (but never the signature itself),
/// then everything from the end of the signature block to the end of the
/// file.  `filesize` is passed in rather than read because the file being
/// signed still holds a placeholder.
pub fn write_signature_data<R, W>(src: &mut R, filesize: u64, dst: &mut W) -> Result<()>
where
    R: Read + Seek,
    W: Write,
{
    let info = get_info(src)?;
    let sigs = info.signatures().ok_or(MarError::MissingSignatureBlock)?;

    src.seek(SeekFrom::Start(0))?;
    let mut header = [0; HEADER_SIZE as usize];
    src.read_exact(&mut header)?;
    dst.write_all(&header)?;

    dst.write_u64::<BigEndian>(filesize)?;
    dst.write_u32::<BigEndian>(sigs.signatures.len() as u32)?;
    for sig in &sigs.signatures {
        dst.write_u32::<BigEndian>(sig.algorithm_id)?;
        dst.write_u32::<BigEndian>(sig.signature.len() as u32)?;
    }

    src.seek(SeekFrom::Start(
        HEADER_SIZE as u64 + sigs.encoded_len() as u64,
    ))?;
    io::copy(src, dst)?;
    Ok(())
}

/// Digests the signed portion of `src` once per algorithm.
pub fn calculate_hashes<R, I>(src: &mut R, filesize: u64, algorithms: I) -> Result<Vec<(SigningAlgorithm, Vec<u8>)>>
where
    R: Read + Seek,
    I: IntoIterator<Item = SigningAlgorithm>,
{
    let mut hashers = MultiHasher::new(algorithms);
    write_signature_data(src, filesize, &mut hashers)?;
    Ok(hashers.finalize())
}

fn pem_str(keydata: &[u8]) -> Result<&str> {
    std::str::from_utf8(keydata).map_err(|_| MarError::Key("key is not PEM encoded".to_owned()))
}

/// Loads a private key from PKCS#8 or PKCS#1 PEM data.
pub fn load_private_key(keydata: &[u8]) -> Result<RsaPrivateKey> {
    let pem = pem_str(keydata)?;
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| MarError::Key(e.to_string()))
}

/// Loads a public key from PEM data.  A private key is accepted too, in
/// which case its public half is returned.
pub fn load_public_key(keydata: &[u8]) -> Result<RsaPublicKey> {
    let pem = pem_str(keydata)?;
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .or_else(|_| load_private_key(keydata).map(|key| key.to_public_key()))
        .map_err(|_| MarError::Key("no RSA key found in PEM data".to_owned()))
}

/// Returns the size in bits of the key in `keydata`.
pub fn key_size(keydata: &[u8]) -> Result<usize> {
    Ok(load_public_key(keydata)?.size() * 8)
}

fn check_key_size<K: PublicKeyParts>(key: &K, algorithm: SigningAlgorithm) -> Result<()> {
    let bits = key.size() * 8;
    if bits == algorithm.key_bits() {
        Ok(())
    } else {
        Err(MarError::KeySizeMismatch {
            expected: algorithm.key_bits(),
            actual: bits,
        })
    }
}

/// Signs a digest produced by `algorithm`'s hasher.
pub fn sign_hash(key: &RsaPrivateKey, algorithm: SigningAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
    check_key_size(key, algorithm)?;
    Ok(key.sign(algorithm.scheme(), digest)?)
}

/// Checks `signature` against a digest produced by `algorithm`'s hasher.
///
/// A signature that doesn't match is `Ok(false)`; a key of the wrong size
/// for the algorithm is an error.
pub fn verify_signature(
    key: &RsaPublicKey,
    algorithm: SigningAlgorithm,
    signature: &[u8],
    digest: &[u8],
) -> Result<bool> {
    check_key_size(key, algorithm)?;
    match key.verify(algorithm.scheme(), digest, signature) {
        Ok(()) => Ok(true),
        Err(e) => {
            debug!("{} signature did not verify: {}", algorithm, e);
            Ok(false)
        }
    }
}

/// Generates an RSA key pair, returned as (private, public) PEM strings.
pub fn make_rsa_keypair(bits: usize) -> Result<(String, String)> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| MarError::Key(e.to_string()))?
        .to_string();
    let public_pem = private_key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| MarError::Key(e.to_string()))?;
    Ok((private_pem, public_pem))
}

/// Wraps a digest in the ASN.1 DigestInfo structure that external signing
/// services expect.
pub fn format_hash(digest: &[u8], algorithm: SigningAlgorithm) -> Vec<u8> {
    let mut out = algorithm.digest_info_prefix().to_vec();
    out.extend_from_slice(digest);
    out
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::format::{write_header, write_index, MarItem, SignatureBlock, SignatureEntry};

    fn signed_layout(signature: Vec<u8>) -> Vec<u8> {
        let sigs = SignatureBlock {
            filesize: 1234,
            signatures: vec![SignatureEntry {
                algorithm_id: 1,
                signature,
            }],
        };
        let data_offset = HEADER_SIZE + sigs.encoded_len() as u32;
        let mut buf = Vec::new();
        write_header(&mut buf, data_offset + 5).unwrap();
        sigs.write_to(&mut buf).unwrap();
        buf.extend_from_slice(b"hello");
        write_index(
            &mut buf,
            &[MarItem {
                offset: data_offset,
                length: 5,
                flags: 0o644,
                name: "hello".to_owned(),
            }],
        )
        .unwrap();
        buf
    }

    #[test]
    fn signature_data_skips_payload() {
        let buf = signed_layout(vec![0xaa; 256]);
        let mut covered = Vec::new();
        write_signature_data(&mut Cursor::new(buf.clone()), 99, &mut covered).unwrap();

        let mut expected = buf[..8].to_vec();
        expected.extend_from_slice(&99u64.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&256u32.to_be_bytes());
        expected.extend_from_slice(&buf[8 + 12 + 8 + 256..]);
        assert_eq!(covered, expected);

        // Only the payload differs, so the covered data is identical.
        let mut other = Vec::new();
        write_signature_data(&mut Cursor::new(signed_layout(vec![0x55; 256])), 99, &mut other)
            .unwrap();
        assert_eq!(covered, other);
    }

    #[test]
    fn signature_data_needs_signature_block() {
        let mut buf = Vec::new();
        write_header(&mut buf, 8).unwrap();
        write_index(&mut buf, &[]).unwrap();
        assert!(matches!(
            write_signature_data(&mut Cursor::new(buf), 0, &mut io::sink()),
            Err(MarError::MissingSignatureBlock)
        ));
    }

    #[test]
    fn algorithm_table() {
        assert_eq!(SigningAlgorithm::from_id(1), Some(SigningAlgorithm::Sha1));
        assert_eq!(SigningAlgorithm::from_id(2), Some(SigningAlgorithm::Sha384));
        assert_eq!(SigningAlgorithm::from_id(3), None);
        assert_eq!(SigningAlgorithm::Sha1.signature_len(), 256);
        assert_eq!(SigningAlgorithm::Sha384.signature_len(), 512);
        assert_eq!("sha384".parse::<SigningAlgorithm>().unwrap(), SigningAlgorithm::Sha384);
        assert!("md5".parse::<SigningAlgorithm>().is_err());
        assert_eq!(SignatureType::Unknown.to_string(), "unknown");
    }

    #[test]
    fn format_hash_prefixes_digest() {
        let digest = SigningAlgorithm::Sha1.hasher().finalize();
        let formatted = format_hash(&digest, SigningAlgorithm::Sha1);
        assert_eq!(formatted.len(), 15 + 20);
        assert!(formatted.ends_with(&digest));

        let digest = SigningAlgorithm::Sha384.hasher().finalize();
        assert_eq!(format_hash(&digest, SigningAlgorithm::Sha384).len(), 19 + 48);
    }

    #[test]
    fn sign_and_verify() {
        let (private_pem, public_pem) = make_rsa_keypair(2048).unwrap();
        assert_eq!(key_size(private_pem.as_bytes()).unwrap(), 2048);

        let private_key = load_private_key(private_pem.as_bytes()).unwrap();
        let public_key = load_public_key(public_pem.as_bytes()).unwrap();

        let mut h = SigningAlgorithm::Sha1.hasher();
        h.update(b"hello world");
        let digest = h.finalize();

        let signature = sign_hash(&private_key, SigningAlgorithm::Sha1, &digest).unwrap();
        assert_eq!(signature.len(), 256);
        assert!(verify_signature(&public_key, SigningAlgorithm::Sha1, &signature, &digest).unwrap());

        // Private keys are accepted where public keys are expected.
        let from_private = load_public_key(private_pem.as_bytes()).unwrap();
        assert!(verify_signature(&from_private, SigningAlgorithm::Sha1, &signature, &digest).unwrap());

        let mut tampered = signature.clone();
        tampered[0] ^= 1;
        assert!(!verify_signature(&public_key, SigningAlgorithm::Sha1, &tampered, &digest).unwrap());

        assert!(matches!(
            sign_hash(&private_key, SigningAlgorithm::Sha384, &digest),
            Err(MarError::KeySizeMismatch { expected: 4096, actual: 2048 })
        ));
        assert!(matches!(
            verify_signature(&public_key, SigningAlgorithm::Sha384, &signature, &digest),
            Err(MarError::KeySizeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_garbage_keys() {
        assert!(matches!(load_public_key(b"not a key"), Err(MarError::Key(_))));
        assert!(matches!(load_private_key(&[0xff, 0xfe]), Err(MarError::Key(_))));
    }
}
