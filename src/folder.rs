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

//! The generic folder abstraction.
//!
//! A folder presents a mailbox as a list of messages addressed by position
//! (index), in ascending local UID order. The position of a message only
//! changes on `update()`. Folders can be stacked: `DisconnectedFolder` wraps
//! a `LocalFolder` and intercepts mutations on their way through.

use chrono::prelude::*;
use log::info;

use crate::disfolder::sync::SyncReport;
use crate::store::local::SharedMailbox;
use crate::store::model::*;
use crate::support::error::Error;

/// What `FolderBackend::update()` should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Pick up messages that arrived since the last update.
    Update,
    /// Make sure all state is durable, without changing the message list.
    Checkpoint,
    /// Expunge deleted messages, then update.
    Sync,
}

/// Summary information about one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    pub uid: u64,
    pub flags: Flags,
    pub date: DateTime<Utc>,
    pub from: String,
    pub subject: String,
    pub size: usize,
}

/// A fully loaded message.
#[derive(Clone, Debug)]
pub struct Message {
    pub uid: u64,
    pub headers: Headers,
    pub raw: Vec<u8>,
}

impl Message {
    /// The part of the message after the header block.
    pub fn body(&self) -> &[u8] {
        for sep in &[&b"\r\n\r\n"[..], &b"\n\n"[..]] {
            if let Some(pos) =
                self.raw.windows(sep.len()).position(|w| w == *sep)
            {
                return &self.raw[pos + sep.len()..];
            }
        }

        &[]
    }
}

pub trait FolderBackend {
    /// Prepare the folder for use. Must be called once before anything else.
    fn init(&mut self) -> Result<(), Error>;

    /// Release the folder, optionally expunging first.
    fn close(&mut self, expunge: bool) -> Result<(), Error>;

    /// Refresh the message list; see `UpdateMode`.
    ///
    /// Returns the number of messages added to the list.
    fn update(&mut self, mode: UpdateMode) -> Result<usize, Error>;

    /// Add a new message to the folder, returning its local UID. It is
    /// appended to the end of the list immediately.
    fn insert(
        &mut self,
        raw: &[u8],
        flags: Flags,
        date: DateTime<Utc>,
    ) -> Result<u64, Error>;

    /// Set or clear `flag` on the messages at each of `indices`.
    fn set_flag(
        &mut self,
        indices: &[usize],
        flag: Flag,
        value: bool,
    ) -> Result<(), Error>;

    fn get_flag(&mut self, index: usize, flag: Flag) -> Result<bool, Error>;

    fn info(&mut self, index: usize) -> Result<MessageInfo, Error>;

    /// Replace the mutable parts of the info for the message at `index`.
    ///
    /// Currently only the flags can be changed; other fields of `info` are
    /// ignored.
    fn set_info(&mut self, index: usize, info: &MessageInfo)
        -> Result<(), Error>;

    /// Load the full message at `index`.
    fn create(&mut self, index: usize) -> Result<Message, Error>;

    /// Bring the folder in line with its master copy, if it has one.
    fn sync(&mut self, force: bool) -> Result<SyncReport, Error>;

    /// The number of messages in the list.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        0 == self.len()
    }
}

/// A folder backed directly by a local mailbox.
pub struct LocalFolder {
    log_prefix: String,
    mailbox: SharedMailbox,
    messages: Vec<LocalMessage>,
}

impl LocalFolder {
    pub fn new(log_prefix: String, mailbox: SharedMailbox) -> Self {
        LocalFolder {
            log_prefix,
            mailbox,
            messages: Vec::new(),
        }
    }

    fn message(&self, index: usize) -> Result<&LocalMessage, Error> {
        self.messages.get(index).ok_or(Error::NxMessage)
    }

    fn reload(&mut self) -> Result<usize, Error> {
        let old_max = self.messages.last().map_or(0, |m| m.uid);
        self.messages = self.mailbox.lock().unwrap().list()?;
        Ok(self.messages.iter().filter(|m| m.uid > old_max).count())
    }
}

impl FolderBackend for LocalFolder {
    fn init(&mut self) -> Result<(), Error> {
        self.reload().map(|_| ())
    }

    fn close(&mut self, expunge: bool) -> Result<(), Error> {
        if expunge {
            self.update(UpdateMode::Sync)?;
        }
        self.messages.clear();
        Ok(())
    }

    fn update(&mut self, mode: UpdateMode) -> Result<usize, Error> {
        match mode {
            UpdateMode::Checkpoint => Ok(0),
            UpdateMode::Update => self.reload(),
            UpdateMode::Sync => {
                let expunged = self.mailbox.lock().unwrap().expunge()?;
                if !expunged.is_empty() {
                    info!(
                        "{} Expunged {} message(s)",
                        self.log_prefix,
                        expunged.len()
                    );
                }
                self.reload()
            }
        }
    }

    fn insert(
        &mut self,
        raw: &[u8],
        flags: Flags,
        date: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let uid = self.mailbox.lock().unwrap().append(raw, flags, date)?;
        self.messages.push(LocalMessage { uid, flags, date });
        Ok(uid)
    }

    fn set_flag(
        &mut self,
        indices: &[usize],
        flag: Flag,
        value: bool,
    ) -> Result<(), Error> {
        // Validate everything first so a bad index changes nothing
        for &index in indices {
            self.message(index)?;
        }

        let mut mailbox = self.mailbox.lock().unwrap();
        for &index in indices {
            let message = &mut self.messages[index];
            mailbox.set_flag(message.uid, flag, value)?;
            message.flags = message.flags.with(flag, value);
        }
        Ok(())
    }

    fn get_flag(&mut self, index: usize, flag: Flag) -> Result<bool, Error> {
        self.message(index).map(|m| m.flags.has(flag))
    }

    fn info(&mut self, index: usize) -> Result<MessageInfo, Error> {
        let message = *self.message(index)?;
        let raw = self.mailbox.lock().unwrap().read(message.uid)?;
        let headers = Headers::parse(&raw);
        Ok(MessageInfo {
            uid: message.uid,
            flags: message.flags,
            date: message.date,
            from: headers.text("From").to_owned(),
            subject: headers.text("Subject").to_owned(),
            size: raw.len(),
        })
    }

    fn set_info(
        &mut self,
        index: usize,
        info: &MessageInfo,
    ) -> Result<(), Error> {
        let current = self.message(index)?.flags;
        for &flag in &Flag::ALL {
            if current.has(flag) != info.flags.has(flag) {
                self.set_flag(&[index], flag, info.flags.has(flag))?;
            }
        }
        Ok(())
    }

    fn create(&mut self, index: usize) -> Result<Message, Error> {
        let uid = self.message(index)?.uid;
        let raw = self.mailbox.lock().unwrap().read(uid)?;
        Ok(Message {
            uid,
            headers: Headers::parse(&raw),
            raw,
        })
    }

    fn sync(&mut self, _force: bool) -> Result<SyncReport, Error> {
        // Nothing to sync against; just pick up anything new
        self.reload()?;
        Ok(SyncReport::default())
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}
