/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Seek, Write},
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    compression::Decompression,
    error::{MarError, Result},
    read::Mar,
};

/// Drive letters and backslashes are path syntax on Windows, so components
/// holding them could reach outside the destination there.
#[cfg(windows)]
fn is_portable_component(part: &str) -> bool {
    !part.contains('\\') && !part.contains(':')
}

#[cfg(not(windows))]
fn is_portable_component(_part: &str) -> bool {
    true
}

/// Joins the `/` separated entry `name` onto `base`, refusing anything that
/// would land outside `base`.
pub fn safe_join(base: &Path, name: &str) -> Result<PathBuf> {
    let unsafe_path = || MarError::UnsafePath(PathBuf::from(name));

    if name.starts_with('/') {
        return Err(unsafe_path());
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop().ok_or_else(unsafe_path)?;
            }
            part if !is_portable_component(part) => return Err(unsafe_path()),
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(unsafe_path());
    }

    let mut path = base.to_path_buf();
    path.extend(parts);
    Ok(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, flags: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(flags & 0o777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _flags: u32) -> io::Result<()> {
    Ok(())
}

impl<R> Mar<R>
where
    R: Read + Seek,
{
    /// Extracts every entry below `dest`, creating directories as needed and
    /// applying each entry's permission bits.
    pub fn extract<P: AsRef<Path>>(&mut self, dest: P, mode: Decompression) -> Result<()> {
        let dest = dest.as_ref();
        let items: Vec<_> = self.files().cloned().collect();

        for item in items {
            let path = safe_join(dest, &item.name)?;
            debug!("extracting {} to {}", item.name, path.display());

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut out = BufWriter::new(File::create(&path)?);
            io::copy(&mut self.read_entry(&item, mode)?, &mut out)?;
            out.flush()?;
            drop(out);

            set_mode(&path, item.flags)?;
        }
        Ok(())
    }
}
