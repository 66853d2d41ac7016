/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Take, Write},
    str::FromStr,
};

use bzip2::{read::BzDecoder, write::BzEncoder};
use xz::{read::XzDecoder, write::XzEncoder};

use crate::error::MarError;

pub const BZ2_HEADER: [u8; 3] = [b'B', b'Z', b'h'];
pub const XZ_HEADER: [u8; 6] = [253, b'7', b'z', b'X', b'Z', 0];

/// Matches the default preset of the reference xz tools.
const XZ_LEVEL: u32 = 6;

/// How a member is compressed inside the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Bz2,
    Xz,
}

impl Compression {
    /// Guesses the compression of data starting with `header`.
    pub fn detect(header: &[u8]) -> Compression {
        if header.starts_with(&XZ_HEADER) {
            Compression::Xz
        } else if header.starts_with(&BZ2_HEADER) {
            Compression::Bz2
        } else {
            Compression::None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Bz2 => "bz2",
            Compression::Xz => "xz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = MarError;

    fn from_str(s: &str) -> Result<Compression, MarError> {
        match s {
            "none" => Ok(Compression::None),
            "bz2" => Ok(Compression::Bz2),
            "xz" => Ok(Compression::Xz),
            _ => Err(MarError::UnsupportedCompression(s.to_owned())),
        }
    }
}

/// How member data is decoded when it's read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decompression {
    /// Return the stored bytes untouched.
    None,
    /// Sniff the first bytes and decompress if they look compressed.
    #[default]
    Auto,
    Bz2,
    Xz,
}

impl FromStr for Decompression {
    type Err = MarError;

    fn from_str(s: &str) -> Result<Decompression, MarError> {
        match s {
            "none" => Ok(Decompression::None),
            "auto" => Ok(Decompression::Auto),
            "bz2" => Ok(Decompression::Bz2),
            "xz" => Ok(Decompression::Xz),
            _ => Err(MarError::UnsupportedCompression(s.to_owned())),
        }
    }
}

pub enum CompressedRead<'a, R>
where
    R: Read + Seek,
{
    None(Take<&'a mut R>),
    Bz2(BzDecoder<Take<&'a mut R>>),
    Xz(XzDecoder<Take<&'a mut R>>),
}

impl<'a, R> Read for CompressedRead<'a, R>
where
    R: Read + Seek,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            CompressedRead::None(inner) => inner.read(buf),
            CompressedRead::Bz2(inner) => inner.read(buf),
            CompressedRead::Xz(inner) => inner.read(buf),
        }
    }
}

impl<'a, R> CompressedRead<'a, R>
where
    R: Read + Seek,
{
    /// Reads `length` bytes from the current position of `inner`, decoding
    /// them as `mode` asks.
    pub fn new(
        inner: &'a mut R,
        length: u64,
        mode: Decompression,
    ) -> io::Result<CompressedRead<'a, R>> {
        let compression = match mode {
            Decompression::None => Compression::None,
            Decompression::Bz2 => Compression::Bz2,
            Decompression::Xz => Compression::Xz,
            Decompression::Auto => {
                let position = inner.stream_position()?;

                let mut header = [0_u8; 6];
                let peek = length.min(header.len() as u64) as usize;
                inner.read_exact(&mut header[..peek])?;

                inner.seek(SeekFrom::Start(position))?;
                Compression::detect(&header[..peek])
            }
        };

        let data = inner.take(length);
        Ok(match compression {
            Compression::None => CompressedRead::None(data),
            Compression::Bz2 => CompressedRead::Bz2(BzDecoder::new(data)),
            Compression::Xz => CompressedRead::Xz(XzDecoder::new(data)),
        })
    }
}

/// Compresses everything written to it into `W`.
pub enum CompressedWrite<W: Write> {
    None(W),
    Bz2(BzEncoder<W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> CompressedWrite<W> {
    pub fn new(inner: W, compression: Compression) -> CompressedWrite<W> {
        match compression {
            Compression::None => CompressedWrite::None(inner),
            Compression::Bz2 => {
                CompressedWrite::Bz2(BzEncoder::new(inner, bzip2::Compression::best()))
            }
            Compression::Xz => CompressedWrite::Xz(XzEncoder::new(inner, XZ_LEVEL)),
        }
    }

    /// Flushes any buffered compressed data and returns the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressedWrite::None(w) => Ok(w),
            CompressedWrite::Bz2(w) => w.finish(),
            CompressedWrite::Xz(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWrite<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWrite::None(w) => w.write(buf),
            CompressedWrite::Bz2(w) => w.write(buf),
            CompressedWrite::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWrite::None(w) => w.flush(),
            CompressedWrite::Bz2(w) => w.flush(),
            CompressedWrite::Xz(w) => w.flush(),
        }
    }
}
