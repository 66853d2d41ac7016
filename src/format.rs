/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The on-disk layout of a MAR file.
//!
//! ```text
//! Header:         "MAR1", index_offset: u32
//! Signatures:     filesize: u64, count: u32,
//!                 count * { algorithm_id: u32, size: u32, signature: [u8; size] }
//! Additional:     count: u32,
//!                 count * { size: u32, id: u32, data: [u8; size - 8] }
//! File data:      raw or compressed member bytes
//! Index:          size: u32, { offset: u32, length: u32, flags: u32, name: cstring }*
//! ```
//!
//! All integers are big-endian.  The signature and additional blocks are only
//! present in "new" format files, which are recognised by their file data
//! starting somewhere after the 8 byte header.

use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::error::{MarError, Result};
use crate::signing::SigningAlgorithm;

/// Every MAR file starts with these bytes.
pub const MAR_MAGIC: [u8; 4] = *b"MAR1";

/// Magic plus the offset to the index.
pub const HEADER_SIZE: u32 = 8;

/// The maximum size of any signature supported by current and future implementations of the
/// signmar program.
pub const MAX_SIGNATURE_LENGTH: usize = 2048;

/// Each additional block has a unique ID.  The product information block has an ID of 1.
pub const PRODUCT_INFO_BLOCK_ID: u32 = 1;

/// The largest index that will be parsed.  Everything from the index offset
/// to the end of the file is index, so a corrupt offset could otherwise turn
/// most of a large file into index entries.
pub const MAX_INDEX_SIZE: u64 = 64 * 1024 * 1024;

// Product Information Block (PIB) constants:
pub const PIB_MAX_MAR_CHANNEL_ID_SIZE: usize = 63;
pub const PIB_MAX_PRODUCT_VERSION_SIZE: usize = 31;

/// An index entry contains three 4-byte fields, a name, and a 1-byte terminator.
///
/// * 4 bytes : OffsetToContent - Offset in bytes relative to start of the MAR file
/// * 4 bytes : ContentSize - Size in bytes of the content
/// * 4 bytes : Flags - File permission bits (in standard unix-style format).
/// * M bytes : FileName - File name (byte array)
/// * 1 byte  : null terminator
#[inline]
fn mar_item_size(name_len: usize) -> usize {
    3 * 4 + name_len + 1
}

/// An entry in the MAR index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarItem {
    /// Position of the item within the archive file.
    pub offset: u32,
    /// Length of data in bytes, as stored (i.e. possibly compressed).
    pub length: u32,
    /// File mode bits.
    pub flags: u32,
    /// File path, always `/` separated.
    pub name: String,
}

/// One signature from the signature block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEntry {
    pub algorithm_id: u32,
    pub signature: Vec<u8>,
}

impl SignatureEntry {
    fn encoded_len(&self) -> usize {
        8 + self.signature.len()
    }
}

/// The signature block that follows the header in new format files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    /// Total size of the MAR file, as recorded when it was signed.
    pub filesize: u64,
    pub signatures: Vec<SignatureEntry>,
}

impl SignatureBlock {
    pub fn encoded_len(&self) -> usize {
        12 + self
            .signatures
            .iter()
            .map(SignatureEntry::encoded_len)
            .sum::<usize>()
    }

    /// Reads a signature block from the current position of `reader`.
    ///
    /// `file_len` bounds every declared size so that a corrupt count or size
    /// is reported instead of triggering a huge allocation.
    pub fn read_from<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<SignatureBlock> {
        ensure_available(reader, 12, file_len)?;
        let filesize = reader.read_u64::<BigEndian>()?;
        let count = reader.read_u32::<BigEndian>()?;

        let mut signatures = Vec::new();
        for _ in 0..count {
            ensure_available(reader, 8, file_len)?;
            let algorithm_id = reader.read_u32::<BigEndian>()?;
            let size = reader.read_u32::<BigEndian>()? as usize;
            if size > MAX_SIGNATURE_LENGTH {
                return Err(MarError::Malformed(format!(
                    "signature of {} bytes exceeds the maximum of {}",
                    size, MAX_SIGNATURE_LENGTH
                )));
            }
            ensure_available(reader, size as u64, file_len)?;
            let mut signature = vec![0; size];
            reader.read_exact(&mut signature)?;
            signatures.push(SignatureEntry {
                algorithm_id,
                signature,
            });
        }

        Ok(SignatureBlock {
            filesize,
            signatures,
        })
    }

    /// Serializes the block.  Counts and sizes are derived from the entries.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<BigEndian>(self.filesize)?;
        writer.write_u32::<BigEndian>(self.signatures.len() as u32)?;
        for entry in &self.signatures {
            writer.write_u32::<BigEndian>(entry.algorithm_id)?;
            writer.write_u32::<BigEndian>(entry.signature.len() as u32)?;
            writer.write_all(&entry.signature)?;
        }
        Ok(())
    }
}

/// The channel and version a MAR file applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub channel: String,
    pub product_version: String,
    /// Bytes reserved after the two strings.  Kept verbatim so that rewriting
    /// a file never changes this block.
    pub padding: Vec<u8>,
}

impl ProductInfo {
    pub fn new(product_version: &str, channel: &str) -> ProductInfo {
        ProductInfo {
            channel: channel.to_owned(),
            product_version: product_version.to_owned(),
            padding: Vec::new(),
        }
    }

    fn decode(data: &[u8]) -> Option<ProductInfo> {
        let channel_end = data.iter().position(|&b| b == 0)?;
        let rest = &data[channel_end + 1..];
        let version_end = rest.iter().position(|&b| b == 0)?;

        let channel = ascii_string(&data[..channel_end])?;
        let product_version = ascii_string(&rest[..version_end])?;

        Some(ProductInfo {
            channel,
            product_version,
            padding: rest[version_end + 1..].to_vec(),
        })
    }
}

fn ascii_string(bytes: &[u8]) -> Option<String> {
    if bytes.is_ascii() {
        String::from_utf8(bytes.to_vec()).ok()
    } else {
        None
    }
}

/// A section of the additional information block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraSection {
    ProductInfo(ProductInfo),
    /// Any section we don't understand, kept as raw bytes.
    Unknown { id: u32, data: Vec<u8> },
}

impl ExtraSection {
    pub fn id(&self) -> u32 {
        match self {
            ExtraSection::ProductInfo(_) => PRODUCT_INFO_BLOCK_ID,
            ExtraSection::Unknown { id, .. } => *id,
        }
    }

    /// Size of the section on disk, including its own size and id fields.
    pub fn encoded_len(&self) -> usize {
        8 + match self {
            ExtraSection::ProductInfo(info) => {
                info.channel.len() + 1 + info.product_version.len() + 1 + info.padding.len()
            }
            ExtraSection::Unknown { data, .. } => data.len(),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.encoded_len() as u32)?;
        writer.write_u32::<BigEndian>(self.id())?;
        match self {
            ExtraSection::ProductInfo(info) => {
                write_cstring(writer, &info.channel)?;
                write_cstring(writer, &info.product_version)?;
                writer.write_all(&info.padding)?;
            }
            ExtraSection::Unknown { data, .. } => writer.write_all(data)?,
        }
        Ok(())
    }
}

/// The additional information block that follows the signature block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtrasBlock {
    pub sections: Vec<ExtraSection>,
}

impl ExtrasBlock {
    pub fn encoded_len(&self) -> usize {
        4 + self
            .sections
            .iter()
            .map(ExtraSection::encoded_len)
            .sum::<usize>()
    }

    /// Reads the block from the current position, noting anything odd in `errors`.
    pub fn read_from<R: Read + Seek>(
        reader: &mut R,
        file_len: u64,
        errors: &mut Vec<String>,
    ) -> Result<ExtrasBlock> {
        ensure_available(reader, 4, file_len)?;
        let count = reader.read_u32::<BigEndian>()?;

        let mut sections = Vec::new();
        for _ in 0..count {
            ensure_available(reader, 8, file_len)?;
            let size = reader.read_u32::<BigEndian>()?;
            let id = reader.read_u32::<BigEndian>()?;
            if size < 8 {
                return Err(MarError::Malformed(format!(
                    "additional section {} declares a size of {} bytes",
                    id, size
                )));
            }
            ensure_available(reader, (size - 8) as u64, file_len)?;
            let mut data = vec![0; (size - 8) as usize];
            reader.read_exact(&mut data)?;

            let section = if id == PRODUCT_INFO_BLOCK_ID {
                match ProductInfo::decode(&data) {
                    Some(info) => ExtraSection::ProductInfo(info),
                    None => {
                        record(errors, "Malformed product information block".to_owned());
                        ExtraSection::Unknown { id, data }
                    }
                }
            } else {
                record(errors, format!("Unknown additional section id: {}", id));
                ExtraSection::Unknown { id, data }
            };
            sections.push(section);
        }

        Ok(ExtrasBlock { sections })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.sections.len() as u32)?;
        for section in &self.sections {
            section.write_to(writer)?;
        }
        Ok(())
    }

    pub fn product_info(&self) -> Option<&ProductInfo> {
        self.sections.iter().find_map(|s| match s {
            ExtraSection::ProductInfo(info) => Some(info),
            _ => None,
        })
    }
}

/// Which variant of the format a file uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// File data follows the header directly.
    Old,
    /// A signature block, and usually an additional block, sit between the
    /// header and the file data.
    New {
        signatures: SignatureBlock,
        extras: Option<ExtrasBlock>,
    },
}

/// Metadata about an entire MAR file.
#[derive(Debug, Clone)]
pub struct MarFileInfo {
    pub offset_to_index: u32,
    /// The size field stored in front of the index.
    pub index_size: u32,
    /// Where file data starts: the lowest entry offset, or the index for an
    /// empty file.
    pub data_offset: u32,
    pub data_length: u32,
    /// Offset just past the signature and additional blocks.
    pub header_end: u32,
    pub layout: Layout,
    /// Index entries ordered by offset.
    pub entries: Vec<MarItem>,
    /// Anomalies found while parsing.
    pub errors: Vec<String>,
}

impl MarFileInfo {
    pub fn signatures(&self) -> Option<&SignatureBlock> {
        match &self.layout {
            Layout::New { signatures, .. } => Some(signatures),
            Layout::Old => None,
        }
    }

    pub fn extras(&self) -> Option<&ExtrasBlock> {
        match &self.layout {
            Layout::New { extras, .. } => extras.as_ref(),
            Layout::Old => None,
        }
    }

    pub fn product_info(&self) -> Option<&ProductInfo> {
        self.extras().and_then(ExtrasBlock::product_info)
    }

    /// Offset of the additional block (or where it would be), if this is a
    /// new format file.
    pub fn offset_additional_blocks(&self) -> Option<u32> {
        self.signatures()
            .map(|sigs| HEADER_SIZE + sigs.encoded_len() as u32)
    }
}

fn record(errors: &mut Vec<String>, message: String) {
    warn!("{}", message);
    errors.push(message);
}

fn ensure_available<R: Seek>(reader: &mut R, needed: u64, file_len: u64) -> Result<()> {
    let position = reader.stream_position()?;
    let available = file_len.saturating_sub(position);
    if needed > available {
        Err(MarError::Truncated {
            expected: needed,
            available,
        })
    } else {
        Ok(())
    }
}

/// Parses the header, index, and (for new format files) the signature and
/// additional blocks.
pub fn get_info<R: Read + Seek>(buffer: &mut R) -> Result<MarFileInfo> {
    let file_len = buffer.seek(SeekFrom::End(0))?;
    buffer.seek(SeekFrom::Start(0))?;

    ensure_available(buffer, HEADER_SIZE as u64, file_len)?;
    let mut magic = [0; 4];
    buffer.read_exact(&mut magic)?;
    if magic != MAR_MAGIC {
        return Err(MarError::BadMagic(magic));
    }
    let offset_to_index = buffer.read_u32::<BigEndian>()?;
    if offset_to_index < HEADER_SIZE {
        return Err(MarError::Malformed(format!(
            "index offset {} points inside the header",
            offset_to_index
        )));
    }

    let mut errors = Vec::new();

    buffer.seek(SeekFrom::Start(offset_to_index as u64))?;
    ensure_available(buffer, 4, file_len)?;
    let index_size = buffer.read_u32::<BigEndian>()?;
    let index_len = file_len - offset_to_index as u64 - 4;
    if index_len > MAX_INDEX_SIZE {
        return Err(MarError::Malformed(format!(
            "index of {} bytes is larger than the {} byte limit",
            index_len, MAX_INDEX_SIZE
        )));
    }
    let index = BufReader::new(buffer.by_ref().take(index_len));
    let mut entries = read_index(index, index_len, &mut errors)?;

    if index_size as u64 != index_len && index_size as usize != entries.len() {
        record(
            &mut errors,
            format!(
                "Index size field is {} but the index holds {} entries in {} bytes",
                index_size,
                entries.len(),
                index_len
            ),
        );
    }

    entries.sort_by_key(|item| item.offset);

    let data_offset = entries
        .first()
        .map(|item| item.offset)
        .unwrap_or(offset_to_index);
    debug!(
        "index at {} holds {} entries, data starts at {}",
        offset_to_index,
        entries.len(),
        data_offset
    );

    let (layout, header_end) = if data_offset > HEADER_SIZE {
        buffer.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let signatures = SignatureBlock::read_from(buffer, file_len)?;
        for sig in &signatures.signatures {
            match SigningAlgorithm::from_id(sig.algorithm_id) {
                Some(algorithm) if algorithm.signature_len() != sig.signature.len() => record(
                    &mut errors,
                    format!(
                        "Signature for algorithm {} is {} bytes, expected {}",
                        sig.algorithm_id,
                        sig.signature.len(),
                        algorithm.signature_len()
                    ),
                ),
                Some(_) => {}
                None => record(
                    &mut errors,
                    format!("Unknown signature algorithm id: {}", sig.algorithm_id),
                ),
            }
        }

        let extras_offset = buffer.stream_position()?;
        if extras_offset > data_offset as u64 {
            return Err(MarError::Malformed(
                "signature block overlaps file data".to_owned(),
            ));
        }

        let extras = if data_offset as u64 > extras_offset {
            let extras = ExtrasBlock::read_from(buffer, file_len, &mut errors)?;
            if buffer.stream_position()? > data_offset as u64 {
                return Err(MarError::Malformed(
                    "additional block overlaps file data".to_owned(),
                ));
            }
            Some(extras)
        } else {
            None
        };

        let header_end = buffer.stream_position()? as u32;
        (Layout::New { signatures, extras }, header_end)
    } else {
        (Layout::Old, HEADER_SIZE)
    };

    check_entries(&entries, header_end, offset_to_index, &mut errors);

    Ok(MarFileInfo {
        offset_to_index,
        index_size,
        data_offset,
        data_length: offset_to_index.saturating_sub(data_offset),
        header_end,
        layout,
        entries,
        errors,
    })
}

/// Reports entries that stray outside `[header_end, index_offset)` or
/// overlap each other.  `entries` must be sorted by offset.
fn check_entries(entries: &[MarItem], header_end: u32, index_offset: u32, errors: &mut Vec<String>) {
    for item in entries {
        let end = item.offset as u64 + item.length as u64;
        if item.offset < header_end {
            record(
                errors,
                format!(
                    "Entry {} starts at {}, before the data region at {}",
                    item.name, item.offset, header_end
                ),
            );
        } else if item.offset > index_offset {
            record(
                errors,
                format!(
                    "Entry {} starts at {}, after the data region ending at {}",
                    item.name, item.offset, index_offset
                ),
            );
        } else if end > index_offset as u64 {
            record(
                errors,
                format!(
                    "Entry {} ends at {}, past the data region ending at {}",
                    item.name, end, index_offset
                ),
            );
        }
    }

    for pair in entries.windows(2) {
        if pair[0].offset as u64 + pair[0].length as u64 > pair[1].offset as u64 {
            record(
                errors,
                format!("Entry {} overlaps entry {}", pair[0].name, pair[1].name),
            );
        }
    }
}

/// Reads index entries until `index_len` bytes have been consumed.
fn read_index<R: Read>(
    mut index: R,
    index_len: u64,
    errors: &mut Vec<String>,
) -> Result<Vec<MarItem>> {
    let mut entries = Vec::new();
    let mut consumed = 0;
    while consumed < index_len {
        let item = read_next_item(&mut index).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                MarError::Malformed("index entry is truncated".to_owned())
            } else {
                MarError::Malformed(e.to_string())
            }
        })?;
        consumed += mar_item_size(item.name.len()) as u64;
        if !item.name.is_ascii() {
            record(errors, format!("Entry name {:?} is not ASCII", item.name));
        }
        entries.push(item);
    }
    Ok(entries)
}

pub fn read_next_item<R: Read>(mut index: R) -> io::Result<MarItem> {
    let offset = index.read_u32::<BigEndian>()?;
    let length = index.read_u32::<BigEndian>()?;
    let flags = index.read_u32::<BigEndian>()?;

    let mut name = Vec::new();
    loop {
        match index.read_u8()? {
            0 => break,
            b => name.push(b),
        }
    }
    let name = String::from_utf8(name).map_err(|_| {
        io::Error::new(ErrorKind::InvalidData, "entry name is not valid UTF-8")
    })?;

    Ok(MarItem {
        offset,
        length,
        flags,
        name,
    })
}

/// Rejects strings that can't be stored as a NUL terminated ASCII string.
pub fn validate_string(s: &str) -> Result<()> {
    if s.is_ascii() && !s.contains('\0') {
        Ok(())
    } else {
        Err(MarError::InvalidString(s.to_owned()))
    }
}

fn write_cstring<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    validate_string(s)?;
    writer.write_all(s.as_bytes())?;
    writer.write_u8(0)?;
    Ok(())
}

pub fn write_header<W: Write>(writer: &mut W, offset_to_index: u32) -> io::Result<()> {
    writer.write_all(&MAR_MAGIC)?;
    writer.write_u32::<BigEndian>(offset_to_index)
}

/// Writes the index, prefixed by its size in bytes.
pub fn write_index<W: Write>(writer: &mut W, entries: &[MarItem]) -> Result<()> {
    let size: usize = entries.iter().map(|e| mar_item_size(e.name.len())).sum();
    let size = u32::try_from(size)
        .map_err(|_| MarError::Malformed("index is larger than 4 GiB".to_owned()))?;

    writer.write_u32::<BigEndian>(size)?;
    for item in entries {
        writer.write_u32::<BigEndian>(item.offset)?;
        writer.write_u32::<BigEndian>(item.length)?;
        writer.write_u32::<BigEndian>(item.flags)?;
        write_cstring(writer, &item.name)?;
    }
    Ok(())
}
