/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Writing MAR files.
//!
//! A MAR file refers forward to data that is written after it: the header
//! holds the offset of the index at the end of the file, and the signature
//! block holds the final file size and a signature over everything else.
//! [`MarWriter`] therefore writes in phases:
//!
//! 1. [`MarWriter::new`] writes a header with a placeholder index offset and,
//!    for new format files, a signature block with placeholder signatures
//!    followed by the additional block.
//! 2. The `add_*` methods append member data.
//! 3. [`MarWriter::finish`] rewrites the header, writes the index, and
//!    replaces the placeholder signatures with real ones.
//!
//! `finish` consumes the writer so nothing can be added afterwards.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Component, Path},
};

use log::{debug, info};
use rsa::{traits::PublicKeyParts, RsaPrivateKey};
use walkdir::WalkDir;

use crate::{
    compression::{CompressedWrite, Compression},
    error::{MarError, Result},
    format::{
        get_info, validate_string, write_header, write_index, ExtraSection, ExtrasBlock, Layout,
        MarItem, ProductInfo, SignatureBlock, SignatureEntry, HEADER_SIZE,
        PIB_MAX_MAR_CHANNEL_ID_SIZE, PIB_MAX_PRODUCT_VERSION_SIZE,
    },
    signing::{self, load_private_key, sign_hash, SigningAlgorithm},
};

/// Settings for a new MAR file.
///
/// Supplying a product version and channel produces a new format file with
/// signature and additional blocks; without them an old format file is
/// written, which can't be signed.
#[derive(Debug, Clone, Default)]
pub struct MarWriterOptions {
    product_version: Option<String>,
    channel: Option<String>,
    signing_key: Option<Vec<u8>>,
    signing_algorithm: Option<SigningAlgorithm>,
}

impl MarWriterOptions {
    pub fn new() -> MarWriterOptions {
        MarWriterOptions::default()
    }

    pub fn product_version<S: Into<String>>(mut self, product_version: S) -> MarWriterOptions {
        self.product_version = Some(product_version.into());
        self
    }

    pub fn channel<S: Into<String>>(mut self, channel: S) -> MarWriterOptions {
        self.channel = Some(channel.into());
        self
    }

    /// PEM encoded RSA private key to sign with.  The algorithm defaults to
    /// the one matching the key size.
    pub fn signing_key<K: Into<Vec<u8>>>(mut self, pem: K) -> MarWriterOptions {
        self.signing_key = Some(pem.into());
        self
    }

    /// Without a signing key this reserves space for a signature of this
    /// type, to be filled in later with [`add_signature_block`].
    pub fn signing_algorithm(mut self, algorithm: SigningAlgorithm) -> MarWriterOptions {
        self.signing_algorithm = Some(algorithm);
        self
    }
}

enum Signing {
    Placeholder(SigningAlgorithm),
    Key(SigningAlgorithm, RsaPrivateKey),
}

impl Signing {
    fn algorithm(&self) -> SigningAlgorithm {
        match self {
            Signing::Placeholder(algorithm) | Signing::Key(algorithm, _) => *algorithm,
        }
    }
}

enum Format {
    Old,
    New {
        product_info: ProductInfo,
        signing: Option<Signing>,
    },
}

/// Writes a MAR file to a seekable stream.
///
/// The stream is read back while signing, so it must support reading as
/// well as writing; use [`MarWriter::create`] to open a file suitably.
pub struct MarWriter<W> {
    fileobj: W,
    format: Format,
    entries: Vec<MarItem>,
    additional_offset: u64,
    last_offset: u64,
    filesize: u64,
}

impl MarWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P, options: MarWriterOptions) -> Result<MarWriter<File>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        MarWriter::new(file, options)
    }
}

fn check_product_info(product_version: &str, channel: &str) -> Result<ProductInfo> {
    validate_string(product_version)?;
    validate_string(channel)?;
    if channel.len() > PIB_MAX_MAR_CHANNEL_ID_SIZE {
        return Err(MarError::Usage(format!(
            "channel may be at most {} bytes",
            PIB_MAX_MAR_CHANNEL_ID_SIZE
        )));
    }
    if product_version.len() > PIB_MAX_PRODUCT_VERSION_SIZE {
        return Err(MarError::Usage(format!(
            "productversion may be at most {} bytes",
            PIB_MAX_PRODUCT_VERSION_SIZE
        )));
    }
    Ok(ProductInfo::new(product_version, channel))
}

fn check_signing(options: &MarWriterOptions) -> Result<Option<Signing>> {
    let key = match &options.signing_key {
        Some(pem) => load_private_key(pem)?,
        None => return Ok(options.signing_algorithm.map(Signing::Placeholder)),
    };

    let bits = key.size() * 8;
    let algorithm = match options.signing_algorithm {
        Some(algorithm) => algorithm,
        None => SigningAlgorithm::from_key_bits(bits)
            .ok_or_else(|| MarError::Usage(format!("Unsupported key size {}", bits)))?,
    };
    if bits != algorithm.key_bits() {
        return Err(MarError::KeySizeMismatch {
            expected: algorithm.key_bits(),
            actual: bits,
        });
    }
    Ok(Some(Signing::Key(algorithm, key)))
}

/// Turns a filesystem path into a `/` separated MAR entry name.
fn path_to_name(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| MarError::InvalidString(part.to_string_lossy().into_owned()))?,
            ),
            Component::ParentDir => parts.push(".."),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn file_flags(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_flags(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn to_offset(position: u64) -> Result<u32> {
    u32::try_from(position)
        .map_err(|_| MarError::Malformed("MAR files are limited to 4 GiB".to_owned()))
}

impl<W> MarWriter<W>
where
    W: Read + Write + Seek,
{
    /// Starts a new MAR file at the beginning of `fileobj`.
    pub fn new(fileobj: W, options: MarWriterOptions) -> Result<MarWriter<W>> {
        let product_info = match (&options.product_version, &options.channel) {
            (Some(product_version), Some(channel)) => {
                Some(check_product_info(product_version, channel)?)
            }
            (None, None) => None,
            _ => {
                return Err(MarError::Usage(
                    "productversion and channel must be specified together".to_owned(),
                ))
            }
        };

        let signing = check_signing(&options)?;

        let format = match (product_info, signing) {
            (Some(product_info), signing) => Format::New {
                product_info,
                signing,
            },
            (None, None) => Format::Old,
            (None, Some(_)) => {
                return Err(MarError::Usage(
                    "productversion and channel must be specified when signing".to_owned(),
                ))
            }
        };

        let mut writer = MarWriter {
            fileobj,
            format,
            entries: Vec::new(),
            additional_offset: HEADER_SIZE as u64,
            last_offset: HEADER_SIZE as u64,
            filesize: 0,
        };

        writer.write_header()?;
        if let Format::New { product_info, signing } = &writer.format {
            let sigs = signing
                .as_ref()
                .map(|s| vec![(s.algorithm(), s.algorithm().dummy_signature())])
                .unwrap_or_default();
            let extras = ExtrasBlock {
                sections: vec![ExtraSection::ProductInfo(product_info.clone())],
            };
            writer.write_signatures(sigs)?;
            writer.write_additional(&extras)?;
        }
        debug!("file data starts at {}", writer.last_offset);

        Ok(writer)
    }

    /// Adds `path`, recursing into it if it's a directory.
    pub fn add<P: AsRef<Path>>(&mut self, path: P, compression: Compression) -> Result<()> {
        let path = path.as_ref();
        if path.is_dir() {
            self.add_dir(path, compression)
        } else {
            self.add_file(path, compression)
        }
    }

    /// Adds every file below the directory `path`, in sorted order.
    pub fn add_dir<P: AsRef<Path>>(&mut self, path: P, compression: Compression) -> Result<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(MarError::Usage(format!("{} is not a directory", path.display())));
        }

        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                self.add_file(entry.path(), compression)?;
            }
        }
        Ok(())
    }

    /// Adds a single file, named after `path` and carrying its permissions.
    pub fn add_file<P: AsRef<Path>>(&mut self, path: P, compression: Compression) -> Result<()> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(MarError::Usage(format!("{} is not a file", path.display())));
        }

        let file = File::open(path)?;
        let flags = file_flags(&file.metadata()?);
        let name = path_to_name(path)?;
        self.add_stream(file, &name, compression, flags)
    }

    /// Adds the contents of `stream` as `name`.
    pub fn add_stream<S: Read>(
        &mut self,
        mut stream: S,
        name: &str,
        compression: Compression,
        flags: u32,
    ) -> Result<()> {
        #[cfg(windows)]
        let name = &name.replace('\\', "/");
        validate_string(name)?;

        self.fileobj.seek(SeekFrom::Start(self.last_offset))?;
        let mut encoder = CompressedWrite::new(&mut self.fileobj, compression);
        io::copy(&mut stream, &mut encoder)?;
        let end = encoder.finish()?.stream_position()?;

        let item = MarItem {
            name: name.to_owned(),
            offset: to_offset(self.last_offset)?,
            length: to_offset(end - self.last_offset)?,
            flags,
        };
        to_offset(end)?;
        debug!(
            "added {} at {} ({} bytes, {})",
            item.name, item.offset, item.length, compression
        );

        self.entries.push(item);
        self.last_offset = end;
        Ok(())
    }

    /// Writes the header, with the index offset as currently known.
    fn write_header(&mut self) -> Result<()> {
        let offset = to_offset(self.last_offset)?;
        self.fileobj.seek(SeekFrom::Start(0))?;
        write_header(&mut self.fileobj, offset)?;
        Ok(())
    }

    fn write_signatures(&mut self, signatures: Vec<(SigningAlgorithm, Vec<u8>)>) -> Result<()> {
        let block = SignatureBlock {
            filesize: self.filesize,
            signatures: signatures
                .into_iter()
                .map(|(algorithm, signature)| SignatureEntry {
                    algorithm_id: algorithm.id(),
                    signature,
                })
                .collect(),
        };

        self.fileobj.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        block.write_to(&mut self.fileobj)?;
        let end = self.fileobj.stream_position()?;

        // Once data follows the block it must not change size.
        if self.last_offset > HEADER_SIZE as u64 && end != self.additional_offset {
            return Err(MarError::Malformed(format!(
                "signature block ended at {}, expected {}",
                end, self.additional_offset
            )));
        }
        self.additional_offset = end;
        Ok(())
    }

    fn write_additional(&mut self, extras: &ExtrasBlock) -> Result<()> {
        self.fileobj.seek(SeekFrom::Start(self.additional_offset))?;
        extras.write_to(&mut self.fileobj)?;
        self.last_offset = self.fileobj.stream_position()?;
        Ok(())
    }

    fn write_index(&mut self) -> Result<()> {
        self.fileobj.seek(SeekFrom::Start(self.last_offset))?;
        write_index(&mut self.fileobj, &self.entries)?;
        self.filesize = self.fileobj.stream_position()?;
        Ok(())
    }

    fn calculate_signatures(&mut self) -> Result<Vec<(SigningAlgorithm, Vec<u8>)>> {
        let signer = match &self.format {
            Format::New {
                signing: Some(signer),
                ..
            } => signer,
            _ => return Ok(Vec::new()),
        };

        match signer {
            Signing::Placeholder(algorithm) => Ok(vec![(*algorithm, algorithm.dummy_signature())]),
            Signing::Key(algorithm, key) => {
                let hashes =
                    signing::calculate_hashes(&mut self.fileobj, self.filesize, [*algorithm])?;
                hashes
                    .into_iter()
                    .map(|(algorithm, digest)| {
                        let signature = sign_hash(key, algorithm, &digest)?;
                        info!("signed with {}", algorithm);
                        Ok((algorithm, signature))
                    })
                    .collect()
            }
        }
    }

    /// Writes the index, fixes up the header and signs the file.
    pub fn finish(mut self) -> Result<W> {
        self.write_header()?;
        self.write_index()?;

        if let Format::New { .. } = self.format {
            let sigs = self.calculate_signatures()?;
            self.write_signatures(sigs)?;
        }
        debug!(
            "finished with {} entries, {} bytes",
            self.entries.len(),
            self.filesize
        );

        self.fileobj.flush()?;
        Ok(self.fileobj)
    }
}

/// Copies the MAR file in `src` to `dest`, replacing its signatures with a
/// single signature of type `algorithm`.
///
/// With `signature` unset a zero filled placeholder is written instead, so
/// the copy can be hashed with [`Mar::calculate_hashes`](crate::Mar::calculate_hashes),
/// the hash signed elsewhere, and the real signature added with a second
/// call.  The additional block and file data are copied verbatim; only the
/// index offsets move.
pub fn add_signature_block<R, W>(
    src: &mut R,
    dest: &mut W,
    algorithm: SigningAlgorithm,
    signature: Option<&[u8]>,
) -> Result<()>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let signature = match signature {
        Some(signature) if signature.len() != algorithm.signature_len() => {
            return Err(MarError::SignatureSizeMismatch {
                algorithm: algorithm.id(),
                expected: algorithm.signature_len(),
                actual: signature.len(),
            })
        }
        Some(signature) => signature.to_vec(),
        None => algorithm.dummy_signature(),
    };

    let mardata = get_info(src)?;

    // Header, fixed up later.
    dest.seek(SeekFrom::Start(0))?;
    write_header(dest, mardata.offset_to_index)?;

    let mut sigs = SignatureBlock {
        filesize: 0,
        signatures: vec![SignatureEntry {
            algorithm_id: algorithm.id(),
            signature,
        }],
    };
    sigs.write_to(dest)?;

    // Additional section.
    match &mardata.layout {
        Layout::New { signatures, .. } => {
            let start = HEADER_SIZE as u64 + signatures.encoded_len() as u64;
            let length = mardata.header_end as u64 - start;
            src.seek(SeekFrom::Start(start))?;
            let copied = io::copy(&mut src.by_ref().take(length), dest)?;
            if copied != length {
                return Err(MarError::Truncated {
                    expected: length,
                    available: copied,
                });
            }
        }
        Layout::Old => ExtrasBlock::default().write_to(dest)?,
    }

    // File data.
    let data_offset = dest.stream_position()?;
    src.seek(SeekFrom::Start(mardata.data_offset as u64))?;
    let length = mardata.data_length as u64;
    let copied = io::copy(&mut src.by_ref().take(length), dest)?;
    if copied != length {
        return Err(MarError::Truncated {
            expected: length,
            available: copied,
        });
    }

    // Index, with offsets shifted to the new data position.
    let index_offset = to_offset(dest.stream_position()?)?;
    let delta = data_offset as i64 - mardata.data_offset as i64;
    let entries = mardata
        .entries
        .iter()
        .map(|item| {
            Ok(MarItem {
                offset: to_offset((item.offset as i64 + delta) as u64)?,
                ..item.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;
    write_index(dest, &entries)?;
    sigs.filesize = dest.stream_position()?;

    dest.seek(SeekFrom::Start(0))?;
    write_header(dest, index_offset)?;
    sigs.write_to(dest)?;
    dest.flush()?;

    info!(
        "wrote {} signature block, data moved by {} bytes",
        algorithm, delta
    );
    Ok(())
}
