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

//! The association between local and remote UIDs.
//!
//! On disk this is the `mappings` file, one `<local_uid> <remote_uid>` line
//! per message. The file is a set, not a log: lines appended by `insert()`
//! may duplicate or supersede earlier ones, and the last line for a local
//! UID wins when loading. `flush()` rewrites it without the redundancy.
//!
//! Very old folders keyed the file by message ID instead
//! (`<message-id> <remote_uid>`). Those lines are recognised by the angle
//! bracket and must be resolved against the local mailbox by
//! `migrate_legacy()`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use log::warn;

use crate::support::error::Error;
use crate::support::file_ops;

/// One mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UidMapEntry {
    pub local_uid: u64,
    pub remote_uid: u64,
}

pub struct UidMap {
    path: PathBuf,
    map: HashMap<u64, u64>,
    legacy: Vec<(String, u64)>,
    dirty: bool,
}

impl UidMap {
    /// Load the map from `path`. A missing file is an empty map.
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        let mut map = HashMap::new();
        let mut legacy = Vec::new();

        for line in file_ops::read_lines(&path)? {
            if line.trim().is_empty() {
                continue;
            }

            if line.contains('<') {
                match parse_legacy(&line) {
                    Some(entry) => legacy.push(entry),
                    None => warn!(
                        "{}: skipping malformed line {:?}",
                        path.display(),
                        line
                    ),
                }
                continue;
            }

            match parse_line(&line) {
                Some(e) => {
                    map.insert(e.local_uid, e.remote_uid);
                }
                None => warn!(
                    "{}: skipping malformed line {:?}",
                    path.display(),
                    line
                ),
            }
        }

        Ok(UidMap {
            path,
            map,
            legacy,
            dirty: false,
        })
    }

    /// Whether there are legacy lines awaiting `migrate_legacy()`.
    pub fn needs_migration(&self) -> bool {
        !self.legacy.is_empty()
    }

    /// Convert legacy message-ID keyed lines into ordinary mappings.
    ///
    /// `resolve` maps a message ID (with angle brackets) to the UID of the
    /// local message currently bearing it. Lines which cannot be resolved are
    /// dropped. Returns the number of mappings recovered.
    pub fn migrate_legacy(
        &mut self,
        mut resolve: impl FnMut(&str) -> Option<u64>,
    ) -> usize {
        let mut migrated = 0;
        for (message_id, remote_uid) in std::mem::take(&mut self.legacy) {
            match resolve(&message_id) {
                Some(local_uid) => {
                    self.map.insert(local_uid, remote_uid);
                    migrated += 1;
                }
                None => warn!(
                    "{}: no local message with ID {}, dropping mapping to {}",
                    self.path.display(),
                    message_id,
                    remote_uid
                ),
            }
        }

        // Even if nothing resolved, the legacy lines must go
        self.dirty = true;
        migrated
    }

    pub fn remote_uid(&self, local_uid: u64) -> Option<u64> {
        self.map.get(&local_uid).copied()
    }

    /// Find the local UID mapped to `remote_uid`.
    ///
    /// This is a linear scan. If several local messages claim the same remote
    /// UID, the lowest local UID is returned.
    pub fn local_uid(&self, remote_uid: u64) -> Option<u64> {
        self.map
            .iter()
            .filter(|&(_, &r)| r == remote_uid)
            .map(|(&l, _)| l)
            .min()
    }

    pub fn contains_remote(&self, remote_uid: u64) -> bool {
        self.map.values().any(|&r| r == remote_uid)
    }

    /// Record that `local_uid` corresponds to `remote_uid`, replacing any
    /// prior mapping for `local_uid`.
    ///
    /// The mapping is appended to the file immediately so that it survives a
    /// crash before the next `flush()`.
    pub fn insert(
        &mut self,
        local_uid: u64,
        remote_uid: u64,
    ) -> Result<(), Error> {
        if Some(remote_uid) == self.map.insert(local_uid, remote_uid) {
            return Ok(());
        }

        self.dirty = true;
        file_ops::append_line(
            &self.path,
            &format!("{} {}", local_uid, remote_uid),
        )?;
        Ok(())
    }

    /// Forget the mapping for `local_uid`, returning the remote UID it was
    /// mapped to.
    pub fn remove(&mut self, local_uid: u64) -> Option<u64> {
        let removed = self.map.remove(&local_uid);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Drop every mapping whose entry doesn't satisfy `keep`.
    ///
    /// Returns the number of mappings removed.
    pub fn retain(
        &mut self,
        mut keep: impl FnMut(&UidMapEntry) -> bool,
    ) -> usize {
        let before = self.map.len();
        self.map.retain(|&local_uid, &mut remote_uid| {
            keep(&UidMapEntry {
                local_uid,
                remote_uid,
            })
        });
        let removed = before - self.map.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Return all mappings, ordered by local UID.
    pub fn entries(&self) -> Vec<UidMapEntry> {
        let mut ret = self
            .map
            .iter()
            .map(|(&local_uid, &remote_uid)| UidMapEntry {
                local_uid,
                remote_uid,
            })
            .collect::<Vec<_>>();
        ret.sort();
        ret
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rewrite the file from memory if anything changed since it was loaded
    /// or last flushed.
    pub fn flush(&mut self) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }

        let mut data = String::new();
        for (local_uid, remote_uid) in &self.map {
            let _ = writeln!(data, "{} {}", local_uid, remote_uid);
        }
        // Legacy lines not yet migrated must not be lost
        for (message_id, remote_uid) in &self.legacy {
            let _ = writeln!(data, "{} {}", message_id, remote_uid);
        }

        file_ops::spit(&self.path, data.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<UidMapEntry> {
    let mut parts = line.split_whitespace();
    let local_uid = parts.next()?.parse().ok()?;
    let remote_uid = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    Some(UidMapEntry {
        local_uid,
        remote_uid,
    })
}

fn parse_legacy(line: &str) -> Option<(String, u64)> {
    let start = line.find('<')?;
    let end = start + line[start..].find('>')?;
    let remote_uid = line[end + 1..].trim().parse().ok()?;
    Some((line[start..=end].to_owned(), remote_uid))
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::fs;

    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn malformed_lines_skipped() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("mappings");
        fs::write(&path, "1 10\nfoo bar\n2\n\n3 30 x\n4 40\n1 11\n").unwrap();

        let map = UidMap::open(path).unwrap();
        assert_eq!(2, map.len());
        assert_eq!(Some(11), map.remote_uid(1));
        assert_eq!(Some(40), map.remote_uid(4));
        assert_eq!(None, map.remote_uid(2));
        assert_eq!(Some(4), map.local_uid(40));
        assert!(!map.is_dirty());
    }

    #[test]
    fn missing_file_is_empty() {
        let tmpdir = TempDir::new().unwrap();
        let mut map = UidMap::open(tmpdir.path().join("mappings")).unwrap();
        assert!(map.is_empty());
        map.flush().unwrap();
        assert!(!tmpdir.path().join("mappings").exists());
    }

    #[test]
    fn insert_is_durable_before_flush() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("mappings");

        let mut map = UidMap::open(path.clone()).unwrap();
        map.insert(1, 101).unwrap();
        map.insert(2, 102).unwrap();
        map.insert(1, 103).unwrap();
        map.insert(1, 103).unwrap();
        assert_eq!("1 101\n2 102\n1 103\n", fs::read_to_string(&path).unwrap());

        // Simulate a crash: no flush
        let mut reloaded = UidMap::open(path.clone()).unwrap();
        assert_eq!(Some(103), reloaded.remote_uid(1));
        assert_eq!(Some(102), reloaded.remote_uid(2));

        assert_eq!(Some(102), reloaded.remove(2));
        assert_eq!(None, reloaded.remove(2));
        reloaded.flush().unwrap();
        assert_eq!("1 103\n", fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn flush_only_when_dirty() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("mappings");
        fs::write(&path, "1 10\n1 10\n").unwrap();

        let mut map = UidMap::open(path.clone()).unwrap();
        map.flush().unwrap();
        assert_eq!("1 10\n1 10\n", fs::read_to_string(&path).unwrap());

        assert_eq!(0, map.retain(|_| true));
        assert!(!map.is_dirty());
        assert_eq!(1, map.retain(|e| e.local_uid != 1));
        map.flush().unwrap();
        assert_eq!("", fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn legacy_migration() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("mappings");
        fs::write(&path, "<a@example.com> 5\n<b@example.com> 6\n<broken 7\n")
            .unwrap();

        let mut map = UidMap::open(path.clone()).unwrap();
        assert!(map.needs_migration());
        assert!(map.is_empty());

        let migrated = map.migrate_legacy(|id| match id {
            "<a@example.com>" => Some(1),
            _ => None,
        });
        assert_eq!(1, migrated);
        assert!(!map.needs_migration());
        map.flush().unwrap();

        assert_eq!("1 5\n", fs::read_to_string(&path).unwrap());
        let map = UidMap::open(path).unwrap();
        assert!(!map.needs_migration());
        assert_eq!(Some(5), map.remote_uid(1));
    }

    proptest! {
        #[test]
        fn mapping_round_trip(
            ops in prop::collection::vec((1u64..50, 1u64..1000), 0..40)
        ) {
            let tmpdir = TempDir::new().unwrap();
            let path = tmpdir.path().join("mappings");
            let mut expected = BTreeMap::new();

            let mut map = UidMap::open(path.clone()).unwrap();
            for &(local, remote) in &ops {
                map.insert(local, remote).unwrap();
                expected.insert(local, remote);
            }
            map.flush().unwrap();

            let map = UidMap::open(path).unwrap();
            prop_assert_eq!(expected.len(), map.len());
            for (&local, &remote) in &expected {
                prop_assert_eq!(Some(remote), map.remote_uid(local));
            }
        }
    }
}
