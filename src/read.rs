/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom, Take},
    path::Path,
    slice,
};

use log::debug;
use rsa::RsaPublicKey;

use crate::{
    compression::{CompressedRead, Compression, Decompression},
    error::{MarError, Result},
    format::{get_info, MarFileInfo, MarItem, ProductInfo},
    signing::{self, load_public_key, verify_signature, SignatureType, SigningAlgorithm},
};

/// An open MAR file.
///
/// The layout is parsed up front; member data is only read on demand.
pub struct Mar<R> {
    info: MarFileInfo,
    file_len: u64,
    buffer: R,
}

impl Mar<BufReader<File>> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Mar<BufReader<File>>> {
        let buffer = BufReader::new(File::open(path)?);
        Mar::from_buffer(buffer)
    }
}

impl<R> Mar<R>
where
    R: Read + Seek,
{
    pub fn from_buffer(mut buffer: R) -> Result<Mar<R>> {
        let info = get_info(&mut buffer)?;
        let file_len = buffer.seek(SeekFrom::End(0))?;

        Ok(Mar {
            info,
            file_len,
            buffer,
        })
    }

    pub fn info(&self) -> &MarFileInfo {
        &self.info
    }

    pub fn into_inner(self) -> R {
        self.buffer
    }

    /// The index entries, in the order their data appears in the file.
    pub fn files(&self) -> slice::Iter<'_, MarItem> {
        self.info.entries.iter()
    }

    /// Problems noticed while parsing that didn't stop the file being read.
    pub fn errors(&self) -> &[String] {
        &self.info.errors
    }

    /// Returns the raw stored bytes of `item`.
    pub fn read(&mut self, item: &MarItem) -> Result<Take<&mut R>> {
        let available = self.file_len.saturating_sub(item.offset as u64);
        if item.length as u64 > available {
            return Err(MarError::Truncated {
                expected: item.length as u64,
                available,
            });
        }

        self.buffer.seek(SeekFrom::Start(item.offset as u64))?;
        Ok(self.buffer.by_ref().take(item.length as u64))
    }

    /// Returns the contents of `item`, decompressed according to `mode`.
    pub fn read_entry(
        &mut self,
        item: &MarItem,
        mode: Decompression,
    ) -> Result<CompressedRead<'_, R>> {
        // Bounds check before handing out the stream.
        self.read(item)?;
        self.buffer.seek(SeekFrom::Start(item.offset as u64))?;
        Ok(CompressedRead::new(
            &mut self.buffer,
            item.length as u64,
            mode,
        )?)
    }

    /// Guesses the compression of the data at `offset`.  Data that runs past
    /// the end of the file is sniffed as far as it goes.
    fn sniff(&mut self, offset: u32, length: u32) -> Result<Compression> {
        let mut header = Vec::with_capacity(6);
        self.buffer.seek(SeekFrom::Start(offset as u64))?;
        self.buffer
            .by_ref()
            .take((length as u64).min(6))
            .read_to_end(&mut header)?;
        Ok(Compression::detect(&header))
    }

    /// The strongest compression used by any member.  xz beats bz2.
    pub fn compression_type(&mut self) -> Result<Option<Compression>> {
        let mut best = None;
        let entries: Vec<(u32, u32)> = self.files().map(|e| (e.offset, e.length)).collect();
        for (offset, length) in entries {
            match self.sniff(offset, length)? {
                Compression::Xz => return Ok(Some(Compression::Xz)),
                Compression::Bz2 => best = Some(Compression::Bz2),
                Compression::None => {}
            }
        }
        Ok(best)
    }

    /// Whether the data at the start of the data region looks compressed.
    pub fn is_compressed(&mut self) -> Result<bool> {
        let (offset, length) = (self.info.data_offset, self.info.data_length);
        Ok(self.sniff(offset, length)? != Compression::None)
    }

    /// The kind of signature this file carries, from its first signature.
    pub fn signature_type(&self) -> Option<SignatureType> {
        let first = self.info.signatures()?.signatures.first()?;
        Some(match SigningAlgorithm::from_id(first.algorithm_id) {
            Some(algorithm) => SignatureType::Known(algorithm),
            None => SignatureType::Unknown,
        })
    }

    pub fn product_info(&self) -> Option<&ProductInfo> {
        self.info.product_info()
    }

    fn signature_algorithms(&self) -> Result<Vec<SigningAlgorithm>> {
        self.info
            .signatures()
            .map(|sigs| sigs.signatures.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|sig| {
                SigningAlgorithm::from_id(sig.algorithm_id)
                    .ok_or(MarError::UnsupportedAlgorithm(sig.algorithm_id))
            })
            .collect()
    }

    /// Digests this file once for each of its signatures, returning
    /// `(algorithm id, digest)` pairs.  The digests are what an external
    /// signer needs to sign.
    pub fn calculate_hashes(&mut self) -> Result<Vec<(u32, Vec<u8>)>> {
        let filesize = match self.info.signatures() {
            Some(sigs) => sigs.filesize,
            None => return Ok(Vec::new()),
        };
        let algorithms = self.signature_algorithms()?;

        let hashes = signing::calculate_hashes(&mut self.buffer, filesize, algorithms)?;
        Ok(hashes
            .into_iter()
            .map(|(algorithm, digest)| (algorithm.id(), digest))
            .collect())
    }

    /// Checks that every signature in the file was made by `public_key`,
    /// given as PEM data.
    ///
    /// Files without signatures never verify.
    pub fn verify(&mut self, public_key: &[u8]) -> Result<bool> {
        let key = load_public_key(public_key)?;
        self.verify_with_key(&key)
    }

    pub fn verify_with_key(&mut self, key: &RsaPublicKey) -> Result<bool> {
        let sigs = match self.info.signatures() {
            Some(sigs) if !sigs.signatures.is_empty() => sigs.clone(),
            _ => {
                debug!("no signatures to verify");
                return Ok(false);
            }
        };
        let algorithms = self.signature_algorithms()?;

        let hashes = signing::calculate_hashes(&mut self.buffer, sigs.filesize, algorithms)?;
        for ((algorithm, digest), sig) in hashes.iter().zip(&sigs.signatures) {
            match verify_signature(key, *algorithm, &sig.signature, digest) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(MarError::KeySizeMismatch { expected, actual }) => {
                    debug!(
                        "{} signature needs a {} bit key, not {} bits",
                        algorithm, expected, actual
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
