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

//! A minimal directory-based mailbox.
//!
//! # Layout
//!
//! - `uidvalidity`: the UID validity, chosen from the clock when the mailbox
//!   is created.
//! - `uidnext`: the next UID to try to allocate.
//! - `index`: one line per message, `<uid> <unix date> <status>`.
//! - `<uid>.eml`: the message text.
//!
//! A new message file is created exclusively, so two processes can never be
//! assigned the same UID; the loser of a race just tries the next one. The
//! `index` file is rewritten whole on every change. There is no locking
//! between processes beyond that, so this is not suitable for a mailbox
//! that is actively written by several processes at once.
//!
//! The same format serves as the cache under a disconnected folder and, via
//! `DirRemote`, as a "remote" master reachable through the file system.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use log::{info, warn};

use super::local::LocalMailbox;
use super::model::*;
use super::remote::RemoteStore;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

#[derive(Clone, Copy, Debug)]
struct Entry {
    flags: Flags,
    date: DateTime<Utc>,
}

pub struct DirMailbox {
    root: PathBuf,
    uid_validity: u64,
    uid_next: u64,
    messages: BTreeMap<u64, Entry>,
}

impl DirMailbox {
    /// Open the mailbox at `root`, creating it if it does not exist.
    pub fn open(root: PathBuf) -> Result<Self, Error> {
        fs::create_dir_all(&root)?;

        let validity_path = root.join("uidvalidity");
        if !validity_path.is_file() {
            let validity = Utc::now().timestamp().max(1) as u64;
            info!(
                "Creating mailbox {} with UID validity {}",
                root.display(),
                validity
            );
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&validity_path)
                .and_then(|mut f| write!(f, "{}\n", validity))
                .ignore_already_exists()?;
        }

        let mut this = DirMailbox {
            root,
            uid_validity: 0,
            uid_next: 1,
            messages: BTreeMap::new(),
        };
        this.reload()?;
        Ok(this)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uid_validity(&self) -> u64 {
        self.uid_validity
    }

    /// Re-read all metadata from disk.
    pub fn reload(&mut self) -> Result<(), Error> {
        self.uid_validity = match read_number(&self.root.join("uidvalidity"))? {
            Some(v) => v,
            None => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: bad uidvalidity", self.root.display()),
                )))
            }
        };
        self.uid_next =
            read_number(&self.root.join("uidnext"))?.unwrap_or(1).max(1);

        self.messages.clear();
        for line in file_ops::read_lines(self.root.join("index"))? {
            match parse_index_line(&line) {
                Some((uid, entry)) => {
                    self.messages.insert(uid, entry);
                }
                None => warn!(
                    "{}: skipping malformed index line {:?}",
                    self.root.display(),
                    line
                ),
            }
        }

        Ok(())
    }

    fn message_path(&self, uid: u64) -> PathBuf {
        self.root.join(format!("{}.eml", uid))
    }

    fn save_index(&self) -> Result<(), Error> {
        let mut data = String::new();
        for (uid, entry) in &self.messages {
            data.push_str(&format!(
                "{} {} {}\n",
                uid,
                entry.date.timestamp(),
                entry.flags.to_status()
            ));
        }
        file_ops::spit(self.root.join("index"), data.as_bytes())?;
        Ok(())
    }

    fn entry_mut(&mut self, uid: u64) -> Result<&mut Entry, Error> {
        self.messages.get_mut(&uid).ok_or(Error::NxMessage)
    }

    fn headers(&self, uid: u64) -> Result<Headers, Error> {
        Ok(Headers::parse(&fs::read(self.message_path(uid))?))
    }
}

impl LocalMailbox for DirMailbox {
    fn list(&mut self) -> Result<Vec<LocalMessage>, Error> {
        Ok(self
            .messages
            .iter()
            .map(|(&uid, entry)| LocalMessage {
                uid,
                flags: entry.flags,
                date: entry.date,
            })
            .collect())
    }

    fn append(
        &mut self,
        raw: &[u8],
        flags: Flags,
        date: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut uid = self
            .uid_next
            .max(self.messages.keys().next_back().map_or(1, |&u| u + 1));
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.message_path(uid))
            {
                Ok(mut f) => {
                    if let Err(e) = f.write_all(raw) {
                        let _ = fs::remove_file(self.message_path(uid));
                        return Err(e.into());
                    }
                    break;
                }
                Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                    uid += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.uid_next = uid + 1;
        file_ops::spit(
            self.root.join("uidnext"),
            format!("{}\n", self.uid_next).as_bytes(),
        )?;
        self.messages.insert(uid, Entry { flags, date });
        self.save_index()?;
        Ok(uid)
    }

    fn read(&mut self, uid: u64) -> Result<Vec<u8>, Error> {
        if !self.messages.contains_key(&uid) {
            return Err(Error::NxMessage);
        }

        Ok(fs::read(self.message_path(uid))?)
    }

    fn set_flag(
        &mut self,
        uid: u64,
        flag: Flag,
        value: bool,
    ) -> Result<(), Error> {
        let entry = self.entry_mut(uid)?;
        if entry.flags.has(flag) == value {
            return Ok(());
        }

        entry.flags = entry.flags.with(flag, value);
        self.save_index()
    }

    fn expunge(&mut self) -> Result<Vec<u64>, Error> {
        let expunged = self
            .messages
            .iter()
            .filter(|&(_, e)| e.flags.has(Flag::Deleted))
            .map(|(&uid, _)| uid)
            .collect::<Vec<_>>();
        if expunged.is_empty() {
            return Ok(expunged);
        }

        for uid in &expunged {
            self.messages.remove(uid);
        }
        // Index first, so a crash in between leaves orphan files rather than
        // dangling index entries
        self.save_index()?;
        for &uid in &expunged {
            fs::remove_file(self.message_path(uid)).ignore_not_found()?;
        }

        Ok(expunged)
    }
}

/// Exposes a `DirMailbox` as a remote master store.
///
/// Every operation starts by re-reading the mailbox, since whoever "owns" it
/// may have changed it in the meantime.
pub struct DirRemote {
    mailbox: DirMailbox,
}

impl DirRemote {
    /// Open an existing mailbox. Unlike `DirMailbox::open()`, this refuses to
    /// create one, since a mistyped connection spec would otherwise silently
    /// sync against an empty mailbox.
    pub fn open(root: PathBuf) -> Result<Self, Error> {
        if !root.join("uidvalidity").is_file() {
            return Err(Error::Remote(format!(
                "{} is not a mailbox",
                root.display()
            )));
        }

        Ok(DirRemote {
            mailbox: DirMailbox::open(root)?,
        })
    }

    fn refresh(&mut self) -> Result<(), Error> {
        if !self.is_alive() {
            return Err(Error::SessionLost);
        }
        self.mailbox.reload()
    }
}

impl RemoteStore for DirRemote {
    fn status(&mut self) -> Result<RemoteStatus, Error> {
        self.refresh()?;
        Ok(RemoteStatus {
            uid_validity: self.mailbox.uid_validity,
            last_uid: self.mailbox.uid_next.saturating_sub(1).max(
                self.mailbox
                    .messages
                    .keys()
                    .next_back()
                    .copied()
                    .unwrap_or(0),
            ),
            exists: self.mailbox.messages.len(),
        })
    }

    fn list(&mut self) -> Result<Vec<RemoteFlags>, Error> {
        self.refresh()?;
        Ok(self
            .mailbox
            .messages
            .iter()
            .map(|(&uid, e)| RemoteFlags {
                uid,
                flags: e.flags,
            })
            .collect())
    }

    fn fetch(&mut self, uid: u64) -> Result<Option<RemoteMessage>, Error> {
        self.refresh()?;
        let entry = match self.mailbox.messages.get(&uid) {
            Some(&e) => e,
            None => return Ok(None),
        };

        match fs::read(self.mailbox.message_path(uid)) {
            Ok(raw) => Ok(Some(RemoteMessage {
                uid,
                flags: entry.flags,
                internal_date: entry.date,
                raw,
            })),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn fetch_flags(&mut self, uid: u64) -> Result<Option<Flags>, Error> {
        self.refresh()?;
        Ok(self.mailbox.messages.get(&uid).map(|e| e.flags))
    }

    fn store_flag(
        &mut self,
        uids: &[u64],
        flag: Flag,
        value: bool,
    ) -> Result<(), Error> {
        self.refresh()?;
        for &uid in uids {
            match self.mailbox.set_flag(uid, flag, value) {
                Ok(()) | Err(Error::NxMessage) => (),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn delete_messages(&mut self, uids: &[u64]) -> Result<(), Error> {
        self.refresh()?;
        // Only expunge what we were asked to, not anything else that happens
        // to be flagged \Deleted
        let mut changed = false;
        for &uid in uids {
            if self.mailbox.messages.remove(&uid).is_some() {
                changed = true;
            }
        }

        if changed {
            self.mailbox.save_index()?;
            for &uid in uids {
                fs::remove_file(self.mailbox.message_path(uid))
                    .ignore_not_found()?;
            }
        }
        Ok(())
    }

    fn append(
        &mut self,
        raw: &[u8],
        flags: Flags,
        date: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.refresh()?;
        self.mailbox.append(raw, flags, date).map(|_| ())
    }

    fn search(
        &mut self,
        criteria: &MatchCriteria,
        min_uid: u64,
    ) -> Result<Vec<u64>, Error> {
        self.refresh()?;
        let mut ret = Vec::new();
        let uids = self
            .mailbox
            .messages
            .range(min_uid..)
            .map(|(&uid, _)| uid)
            .collect::<Vec<_>>();
        for uid in uids {
            match self.mailbox.headers(uid) {
                Ok(headers) if criteria.matches(&headers) => ret.push(uid),
                Ok(_) => (),
                Err(Error::Io(ref e))
                    if io::ErrorKind::NotFound == e.kind() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(ret)
    }

    fn is_alive(&mut self) -> bool {
        self.mailbox.root.join("uidvalidity").is_file()
    }
}

fn read_number(path: &Path) -> Result<Option<u64>, Error> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s.trim().parse().ok()),
        Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_index_line(line: &str) -> Option<(u64, Entry)> {
    let mut parts = line.splitn(3, ' ');
    let uid = parts.next()?.parse().ok()?;
    let date = parts.next()?.parse::<i64>().ok()?;
    let status = parts.next().unwrap_or("");
    Some((
        uid,
        Entry {
            flags: Flags::from_status(status),
            date: Utc.timestamp_opt(date, 0).single()?,
        },
    ))
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn date() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000_000_000, 0).unwrap()
    }

    #[test]
    fn append_flag_expunge() {
        let tmpdir = TempDir::new().unwrap();
        let mut mb = DirMailbox::open(tmpdir.path().join("mb")).unwrap();

        let a = mb.append(b"Subject: a\n\nA", Flags::empty(), date()).unwrap();
        let b = mb.append(b"Subject: b\n\nB", Flags::SEEN, date()).unwrap();
        assert_eq!((1, 2), (a, b));

        mb.set_flag(a, Flag::Deleted, true).unwrap();
        mb.set_flag(b, Flag::Flagged, true).unwrap();
        assert_matches!(
            Err(Error::NxMessage),
            mb.set_flag(99, Flag::Seen, true)
        );

        // Everything survives a reopen
        let mut mb = DirMailbox::open(tmpdir.path().join("mb")).unwrap();
        let list = mb.list().unwrap();
        assert_eq!(2, list.len());
        assert_eq!(Flags::DELETED, list[0].flags);
        assert_eq!(Flags::SEEN | Flags::FLAGGED, list[1].flags);
        assert_eq!(date(), list[1].date);

        assert_eq!(vec![a], mb.expunge().unwrap());
        assert_matches!(Err(Error::NxMessage), mb.read(a));
        assert_eq!(b"Subject: b\n\nB".to_vec(), mb.read(b).unwrap());

        // UIDs are never reused
        let c = mb.append(b"Subject: c\n\nC", Flags::empty(), date()).unwrap();
        assert_eq!(3, c);
    }

    #[test]
    fn uid_validity_is_stable() {
        let tmpdir = TempDir::new().unwrap();
        let a = DirMailbox::open(tmpdir.path().to_owned()).unwrap();
        let b = DirMailbox::open(tmpdir.path().to_owned()).unwrap();
        assert_ne!(0, a.uid_validity());
        assert_eq!(a.uid_validity(), b.uid_validity());
    }

    #[test]
    fn remote_view() {
        let tmpdir = TempDir::new().unwrap();
        let root = tmpdir.path().join("master");
        assert_matches!(
            Err(Error::Remote(..)),
            DirRemote::open(root.clone()).map(|_| ())
        );

        let mut owner = DirMailbox::open(root.clone()).unwrap();
        let mut remote = DirRemote::open(root.clone()).unwrap();
        assert_eq!(0, remote.status().unwrap().last_uid);

        owner
            .append(
                b"Subject: x\nMessage-ID: <x@y>\n\nbody",
                Flags::empty(),
                date(),
            )
            .unwrap();
        let status = remote.status().unwrap();
        assert_eq!(1, status.last_uid);
        assert_eq!(1, status.exists);
        assert_eq!(owner.uid_validity(), status.uid_validity);

        let fetched = remote.fetch(1).unwrap().unwrap();
        assert_eq!(
            b"Subject: x\nMessage-ID: <x@y>\n\nbody".to_vec(),
            fetched.raw
        );
        assert!(remote.fetch(2).unwrap().is_none());

        remote.store_flag(&[1, 2], Flag::Seen, true).unwrap();
        assert_eq!(Some(Flags::SEEN), remote.fetch_flags(1).unwrap());

        let criteria = MatchCriteria {
            subject: "x".to_owned(),
            message_id: "<x@y>".to_owned(),
            ..MatchCriteria::default()
        };
        assert_eq!(vec![1], remote.search(&criteria, 1).unwrap());
        assert!(remote.search(&criteria, 2).unwrap().is_empty());

        remote.delete_messages(&[1]).unwrap();
        remote.delete_messages(&[1]).unwrap();
        assert!(remote.list().unwrap().is_empty());
        // The high-water mark doesn't go backwards
        assert_eq!(1, remote.status().unwrap().last_uid);

        fs::remove_file(root.join("uidvalidity")).unwrap();
        assert!(!remote.is_alive());
        assert_matches!(Err(Error::SessionLost), remote.list());
    }
}
