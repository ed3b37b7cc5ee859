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

//! The queue of changes made while offline.
//!
//! The `changes` file holds one change per line:
//!
//! ```text
//! delete <remote_uid>
//! flag <remote_uid> <flag code> <0|1>
//! ```
//!
//! The file is only ever appended to until it is replayed against the remote
//! store, at which point it is deleted. Replay is idempotent, so a failure
//! part-way through simply leaves the whole file to be replayed again.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use log::{info, warn};

use crate::store::model::Flag;
use crate::store::remote::RemoteStore;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingChange {
    Delete { remote_uid: u64 },
    FlagSet { remote_uid: u64, flag: Flag, value: bool },
}

impl fmt::Display for PendingChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PendingChange::Delete { remote_uid } => {
                write!(f, "delete {}", remote_uid)
            }
            PendingChange::FlagSet {
                remote_uid,
                flag,
                value,
            } => write!(
                f,
                "flag {} {} {}",
                remote_uid,
                flag.as_code(),
                value as u32
            ),
        }
    }
}

impl PendingChange {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let change = match parts.next()? {
            "delete" => PendingChange::Delete {
                remote_uid: parts.next()?.parse().ok()?,
            },
            "flag" => PendingChange::FlagSet {
                remote_uid: parts.next()?.parse().ok()?,
                flag: Flag::from_code(parts.next()?.parse().ok()?)?,
                value: match parts.next()? {
                    "0" => false,
                    "1" => true,
                    _ => return None,
                },
            },
            _ => return None,
        };

        if parts.next().is_some() {
            None
        } else {
            Some(change)
        }
    }
}

/// What a replay did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// The number of distinct messages in the delete batch.
    pub deleted: usize,
    /// The number of flag changes applied.
    pub flags_applied: usize,
    /// The number of flag changes dropped because the message was gone.
    pub flags_skipped: usize,
}

pub struct ChangeLog {
    path: PathBuf,
}

impl ChangeLog {
    pub fn new(path: PathBuf) -> Self {
        ChangeLog { path }
    }

    pub fn append_delete(&self, remote_uid: u64) -> Result<(), Error> {
        self.append(PendingChange::Delete { remote_uid })
    }

    pub fn append_flag(
        &self,
        remote_uid: u64,
        flag: Flag,
        value: bool,
    ) -> Result<(), Error> {
        self.append(PendingChange::FlagSet {
            remote_uid,
            flag,
            value,
        })
    }

    fn append(&self, change: PendingChange) -> Result<(), Error> {
        file_ops::append_line(&self.path, &change.to_string())?;
        Ok(())
    }

    /// Read every well-formed change in the log, in order.
    pub fn pending(&self) -> Result<Vec<PendingChange>, Error> {
        let mut ret = Vec::new();
        for line in file_ops::read_lines(&self.path)? {
            match PendingChange::parse(&line) {
                Some(change) => ret.push(change),
                None if line.trim().is_empty() => (),
                None => warn!(
                    "{}: skipping malformed change {:?}",
                    self.path.display(),
                    line
                ),
            }
        }
        Ok(ret)
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.pending()?.is_empty())
    }

    /// Apply every pending change to `remote`, then delete the log.
    ///
    /// All deletions are made in one batch call. Each flag change is applied
    /// individually, after confirming that the message still exists.
    ///
    /// If anything fails, the log is left exactly as it was.
    pub fn drain_and_apply(
        &self,
        remote: &mut dyn RemoteStore,
    ) -> Result<ReplayReport, Error> {
        let changes = self.pending()?;
        let mut report = ReplayReport::default();

        let mut deletes = changes
            .iter()
            .filter_map(|c| match *c {
                PendingChange::Delete { remote_uid } => Some(remote_uid),
                _ => None,
            })
            .collect::<Vec<_>>();
        deletes.sort_unstable();
        deletes.dedup();

        if !deletes.is_empty() {
            remote.delete_messages(&deletes)?;
            report.deleted = deletes.len();
        }

        for change in &changes {
            if let PendingChange::FlagSet {
                remote_uid,
                flag,
                value,
            } = *change
            {
                if deletes.binary_search(&remote_uid).is_ok()
                    || remote.fetch_flags(remote_uid)?.is_none()
                {
                    report.flags_skipped += 1;
                    continue;
                }

                remote.store_flag(&[remote_uid], flag, value)?;
                report.flags_applied += 1;
            }
        }

        fs::remove_file(&self.path).ignore_not_found()?;
        if !changes.is_empty() {
            info!(
                "{}: replayed {} deletion(s) and {} flag change(s)",
                self.path.display(),
                report.deleted,
                report.flags_applied
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::store::model::Flags;
    use crate::store::remote::Connector;
    use crate::test_support::*;

    fn session(remote: &MemoryRemote) -> Box<dyn RemoteStore> {
        MemoryConnector::new(remote.clone()).connect("mem:").unwrap()
    }

    #[test]
    fn parse_and_format() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("changes");
        let log = ChangeLog::new(path.clone());

        log.append_delete(42).unwrap();
        log.append_flag(43, Flag::Seen, true).unwrap();
        log.append_flag(44, Flag::Draft, false).unwrap();
        file_ops::append_line(&path, "flag 1 99 1").unwrap();
        file_ops::append_line(&path, "frobnicate 3").unwrap();
        file_ops::append_line(&path, "delete").unwrap();

        assert_eq!(
            "delete 42\nflag 43 0 1\nflag 44 4 0\n\
             flag 1 99 1\nfrobnicate 3\ndelete\n",
            fs::read_to_string(&path).unwrap()
        );
        assert_eq!(
            vec![
                PendingChange::Delete { remote_uid: 42 },
                PendingChange::FlagSet {
                    remote_uid: 43,
                    flag: Flag::Seen,
                    value: true,
                },
                PendingChange::FlagSet {
                    remote_uid: 44,
                    flag: Flag::Draft,
                    value: false,
                },
            ],
            log.pending().unwrap()
        );
    }

    #[test]
    fn deletes_coalesced_into_one_call() {
        crate::init_test_log();

        let tmpdir = TempDir::new().unwrap();
        let log = ChangeLog::new(tmpdir.path().join("changes"));
        let remote = MemoryRemote::new(1);
        let uids = (0..5)
            .map(|n| remote.deliver(&sample_message(n), Flags::empty()))
            .collect::<Vec<_>>();

        log.append_delete(uids[3]).unwrap();
        log.append_flag(uids[0], Flag::Flagged, true).unwrap();
        log.append_delete(uids[1]).unwrap();
        log.append_flag(uids[1], Flag::Seen, true).unwrap();
        log.append_delete(uids[3]).unwrap();
        log.append_flag(999, Flag::Seen, true).unwrap();

        let report = log.drain_and_apply(&mut *session(&remote)).unwrap();
        assert_eq!(
            ReplayReport {
                deleted: 2,
                flags_applied: 1,
                flags_skipped: 2,
            },
            report
        );
        assert_eq!(
            vec![
                Call::Delete(vec![uids[1], uids[3]]),
                Call::StoreFlag(vec![uids[0]], Flag::Flagged, true),
            ],
            remote.mutations()
        );
        assert!(log.is_empty().unwrap());
        assert!(!tmpdir.path().join("changes").exists());
    }

    #[test]
    fn failure_keeps_log() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("changes");
        let log = ChangeLog::new(path.clone());
        let remote = MemoryRemote::new(1);
        let uid = remote.deliver(&sample_message(0), Flags::empty());

        log.append_flag(uid, Flag::Seen, true).unwrap();
        log.append_delete(uid + 1).unwrap();
        let before = fs::read(&path).unwrap();

        remote.set_failing(true);
        assert_matches!(
            Err(Error::Remote(..)),
            log.drain_and_apply(&mut *session(&remote))
        );
        assert_eq!(before, fs::read(&path).unwrap());

        remote.set_failing(false);
        log.drain_and_apply(&mut *session(&remote)).unwrap();
        assert_eq!(Some(Flags::SEEN), remote.flags(uid));
        assert!(!path.exists());
    }

    #[test]
    fn empty_log_makes_no_calls() {
        let tmpdir = TempDir::new().unwrap();
        let log = ChangeLog::new(tmpdir.path().join("changes"));
        let remote = MemoryRemote::new(1);
        assert_eq!(
            ReplayReport::default(),
            log.drain_and_apply(&mut *session(&remote)).unwrap()
        );
        assert!(remote.journal().is_empty());
    }

    fn arb_change() -> impl Strategy<Value = PendingChange> {
        prop_oneof![
            (1u64..8)
                .prop_map(|remote_uid| PendingChange::Delete { remote_uid }),
            (1u64..8, 0u32..5, any::<bool>()).prop_map(|(uid, code, value)| {
                PendingChange::FlagSet {
                    remote_uid: uid,
                    flag: Flag::from_code(code).unwrap(),
                    value,
                }
            }),
        ]
    }

    fn snapshot(remote: &MemoryRemote) -> Vec<(u64, Option<Flags>)> {
        remote.uids().into_iter().map(|u| (u, remote.flags(u))).collect()
    }

    proptest! {
        #[test]
        fn replay_is_idempotent(
            changes in prop::collection::vec(arb_change(), 0..20)
        ) {
            let tmpdir = TempDir::new().unwrap();
            let path = tmpdir.path().join("changes");
            let remote = MemoryRemote::new(1);
            for n in 0..6 {
                remote.deliver(&sample_message(n), Flags::empty());
            }

            let write_log = || {
                let log = ChangeLog::new(path.clone());
                for change in &changes {
                    log.append(*change).unwrap();
                }
                log
            };

            write_log().drain_and_apply(&mut *session(&remote)).unwrap();
            let once = snapshot(&remote);
            write_log().drain_and_apply(&mut *session(&remote)).unwrap();
            prop_assert_eq!(once, snapshot(&remote));
        }
    }
}
