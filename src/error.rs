/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised while reading, writing or signing a MAR file.
#[derive(Debug, Error)]
pub enum MarError {
    /// Errors from the underlying stream or filesystem, passed through as-is.
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("bad MAR magic: expected \"MAR1\", found {0:?}")]
    BadMagic([u8; 4]),

    /// A section is internally inconsistent or runs past the end of the file.
    #[error("malformed MAR file: {0}")]
    Malformed(String),

    #[error("not enough data: expected {expected} bytes, only {available} available")]
    Truncated { expected: u64, available: u64 },

    #[error("invalid string {0:?}: must be ASCII without NUL bytes")]
    InvalidString(String),

    #[error("unsupported compression type: {0}")]
    UnsupportedCompression(String),

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(u32),

    #[error("signature for algorithm {algorithm} must be {expected} bytes, got {actual}")]
    SignatureSizeMismatch {
        algorithm: u32,
        expected: usize,
        actual: usize,
    },

    #[error("key is {actual} bits but the signing algorithm requires {expected} bits")]
    KeySizeMismatch { expected: usize, actual: usize },

    #[error("invalid key: {0}")]
    Key(String),

    #[error("signing failed: {0}")]
    Crypto(#[from] rsa::Error),

    #[error("can't generate signature data for a file without a signature block")]
    MissingSignatureBlock,

    #[error("{} is outside of the destination directory", .0.display())]
    UnsafePath(PathBuf),

    /// The caller asked for something that doesn't make sense.
    #[error("{0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, MarError>;
