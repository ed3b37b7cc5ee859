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

//! Local messages which were appended to the remote but whose remote copy
//! could not be identified.
//!
//! On disk this is the `uploads` file, one `<local_uid> <first> <last>` line
//! per message, where `first..=last` are the remote UIDs the append could
//! have been assigned. Remote UIDs in such a range are held back from
//! download until the upload is resolved, and the message is never appended
//! a second time while its entry exists.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use log::warn;

use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

/// The remote UIDs one unresolved upload may occupy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingUpload {
    pub local_uid: u64,
    pub first: u64,
    pub last: u64,
}

impl PendingUpload {
    pub fn contains(&self, remote_uid: u64) -> bool {
        remote_uid >= self.first && remote_uid <= self.last
    }
}

pub struct UploadLog {
    path: PathBuf,
    pending: BTreeMap<u64, (u64, u64)>,
}

impl UploadLog {
    /// Load the log from `path`. A missing file means nothing is pending.
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        let mut pending = BTreeMap::new();
        for line in file_ops::read_lines(&path)? {
            if line.trim().is_empty() {
                continue;
            }

            match parse_line(&line) {
                Some(p) => {
                    pending.insert(p.local_uid, (p.first, p.last));
                }
                None => warn!(
                    "{}: skipping malformed line {:?}",
                    path.display(),
                    line
                ),
            }
        }

        Ok(UploadLog { path, pending })
    }

    pub fn get(&self, local_uid: u64) -> Option<PendingUpload> {
        self.pending
            .get(&local_uid)
            .map(|&(first, last)| PendingUpload {
                local_uid,
                first,
                last,
            })
    }

    /// Whether `remote_uid` may be the copy of some unresolved upload.
    pub fn holds(&self, remote_uid: u64) -> bool {
        self.entries().iter().any(|p| p.contains(remote_uid))
    }

    pub fn entries(&self) -> Vec<PendingUpload> {
        self.pending
            .iter()
            .map(|(&local_uid, &(first, last))| PendingUpload {
                local_uid,
                first,
                last,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Note that `local_uid` was appended somewhere in `first..=last`.
    pub fn record(
        &mut self,
        local_uid: u64,
        first: u64,
        last: u64,
    ) -> Result<(), Error> {
        self.pending.insert(local_uid, (first, last));
        self.save()
    }

    /// Forget the entry for `local_uid`, returning it.
    pub fn remove(
        &mut self,
        local_uid: u64,
    ) -> Result<Option<PendingUpload>, Error> {
        let removed = self.get(local_uid);
        if removed.is_some() {
            self.pending.remove(&local_uid);
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<(), Error> {
        if self.pending.is_empty() {
            fs::remove_file(&self.path).ignore_not_found()?;
            return Ok(());
        }

        let mut data = String::new();
        for p in self.entries() {
            let _ = writeln!(data, "{} {} {}", p.local_uid, p.first, p.last);
        }
        file_ops::spit(&self.path, data.as_bytes())?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<PendingUpload> {
    let mut parts = line.split_whitespace();
    let local_uid = parts.next()?.parse().ok()?;
    let first = parts.next()?.parse().ok()?;
    let last = parts.next()?.parse().ok()?;
    if parts.next().is_some() || first > last {
        return None;
    }

    Some(PendingUpload {
        local_uid,
        first,
        last,
    })
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn record_and_reload() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("uploads");

        let mut log = UploadLog::open(path.clone()).unwrap();
        assert!(log.is_empty());
        assert!(!path.exists());

        log.record(4, 10, 12).unwrap();
        log.record(7, 13, 13).unwrap();
        assert_eq!("4 10 12\n7 13 13\n", fs::read_to_string(&path).unwrap());

        let mut log = UploadLog::open(path.clone()).unwrap();
        assert_eq!(2, log.len());
        assert!(log.holds(11));
        assert!(log.holds(13));
        assert!(!log.holds(9));
        assert!(!log.holds(14));

        assert_eq!(
            Some(PendingUpload {
                local_uid: 4,
                first: 10,
                last: 12,
            }),
            log.remove(4).unwrap()
        );
        assert_eq!(None, log.remove(4).unwrap());
        assert!(!log.holds(11));

        log.remove(7).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn malformed_lines_skipped() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("uploads");
        fs::write(&path, "1 2 3\nx 1 2\n2 5 4\n3 6\n4 7 8 9\n5 9 9\n")
            .unwrap();

        let log = UploadLog::open(path).unwrap();
        assert_eq!(
            vec![
                PendingUpload {
                    local_uid: 1,
                    first: 2,
                    last: 3,
                },
                PendingUpload {
                    local_uid: 5,
                    first: 9,
                    last: 9,
                },
            ],
            log.entries()
        );
    }
}
