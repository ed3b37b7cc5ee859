//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Dismail.
//
// Dismail is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Dismail is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Dismail. If not, see <http://www.gnu.org/licenses/>.

//! Miscellaneous functions for working with files.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

/// Write `data` into the file at `path`, atomically.
///
/// The file is first staged in the same directory as `path` so that the final
/// rename never crosses a file system boundary.
pub fn spit(path: impl AsRef<Path>, data: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tf = tempfile::NamedTempFile::new_in(dir)?;
    tf.as_file_mut().write_all(data)?;
    tf.as_file_mut().sync_all()?;
    tf.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Append a single line (which must not contain a line feed) to the file at
/// `path`, creating it if necessary.
pub fn append_line(path: impl AsRef<Path>, line: &str) -> io::Result<()> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    // One write call so concurrent appenders don't interleave partial lines
    f.write_all(format!("{}\n", line).as_bytes())
}

/// Read the file at `path` as a sequence of lines.
///
/// A missing file is treated as empty.
pub fn read_lines(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let f = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if io::ErrorKind::NotFound == e.kind() => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e),
    };

    io::BufReader::new(f).lines().collect()
}

/// Return how long ago the file at `path` was last modified.
///
/// Returns `None` if that cannot be determined, including if the file does
/// not exist or its mtime is in the future.
pub fn age(path: impl AsRef<Path>) -> Option<Duration> {
    path.as_ref()
        .metadata()
        .ok()
        .and_then(|md| md.modified().ok())
        .and_then(|mtime| mtime.elapsed().ok())
}

/// Move `src` to `dst`, falling back to copy-and-delete if they are on
/// different file systems.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if Some(nix::libc::EXDEV) == e.raw_os_error() => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

pub trait IgnoreKinds {
    fn ignore_already_exists(self) -> Self;
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, io::Error> {
    fn ignore_already_exists(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                Ok(R::default())
            }
            Err(e) => Err(e),
        }
    }

    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}
