/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! This is a Rust implementation of the [Mozilla Archive (MAR) file format][1]
//! used to deliver automatic updates to Firefox.  It includes both a library and
//! a command-line tool for reading, writing, signing and verifying MAR files.
//!
//! ```no_run
//! use mar::{Compression, Decompression, Mar, MarWriter, MarWriterOptions};
//!
//! # fn main() -> mar::Result<()> {
//! let options = MarWriterOptions::new()
//!     .product_version("99.9")
//!     .channel("release");
//! let mut writer = MarWriter::create("update.mar", options)?;
//! writer.add("dist", Compression::Xz)?;
//! writer.finish()?;
//!
//! let mut mar = Mar::from_path("update.mar")?;
//! for item in mar.files() {
//!     println!("{} {:o}", item.name, item.flags);
//! }
//! mar.extract("out", Decompression::Auto)?;
//! # Ok(())
//! # }
//! ```
//!
//! This code is subject to the terms of the Mozilla Public License, v. 2.0.
//!
//! [1]: https://wiki.mozilla.org/Software_Update:MAR

pub mod compression;
pub mod error;
pub mod extract;
pub mod format;
pub mod read;
pub mod signing;
pub mod write;

pub use compression::{Compression, Decompression};
pub use error::{MarError, Result};
pub use format::{MarFileInfo, MarItem, ProductInfo};
pub use read::Mar;
pub use signing::{SignatureType, SigningAlgorithm};
pub use write::{add_signature_block, MarWriter, MarWriterOptions};
