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

//! Shared fixtures for tests: an in-memory remote mailbox which records every
//! call made against it, and canned messages.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::prelude::*;

use crate::store::model::*;
use crate::store::remote::{Connector, RemoteStore};
use crate::support::error::Error;

/// One call made against a `MemoryRemote`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Status,
    List,
    Fetch(u64),
    FetchFlags(u64),
    StoreFlag(Vec<u64>, Flag, bool),
    Delete(Vec<u64>),
    Append,
    Search(u64),
}

#[derive(Clone, Debug)]
struct StoredMessage {
    flags: Flags,
    date: DateTime<Utc>,
    raw: Vec<u8>,
}

#[derive(Default)]
struct State {
    uid_validity: u64,
    next_uid: u64,
    messages: BTreeMap<u64, StoredMessage>,
    journal: Vec<Call>,
    connects: usize,
    generation: u64,
    failing: bool,
    duplicate_appends: bool,
    blind_search: bool,
    deliver_before_append: Option<Vec<u8>>,
}

impl State {
    fn insert(
        &mut self,
        raw: Vec<u8>,
        flags: Flags,
        date: DateTime<Utc>,
    ) -> u64 {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.messages.insert(uid, StoredMessage { flags, date, raw });
        uid
    }
}

/// An in-memory remote mailbox.
///
/// This is a handle; clones share the same mailbox, so a test can keep one
/// to inspect and manipulate the "server" while the code under test talks to
/// it through a `MemoryConnector`.
#[derive(Clone)]
pub struct MemoryRemote(Arc<Mutex<State>>);

impl MemoryRemote {
    pub fn new(uid_validity: u64) -> Self {
        MemoryRemote(Arc::new(Mutex::new(State {
            uid_validity,
            next_uid: 1,
            ..State::default()
        })))
    }

    /// Add a message as if delivered by someone else, returning its UID.
    pub fn deliver(&self, raw: &[u8], flags: Flags) -> u64 {
        self.0
            .lock()
            .unwrap()
            .insert(raw.to_vec(), flags, sample_date())
    }

    /// Make the next UID assigned `uid`.
    pub fn set_next_uid(&self, uid: u64) {
        self.0.lock().unwrap().next_uid = uid;
    }

    /// Simulate the mailbox being deleted and recreated.
    pub fn set_uid_validity(&self, uid_validity: u64) {
        self.0.lock().unwrap().uid_validity = uid_validity;
    }

    /// Expunge a message behind the client's back.
    pub fn remove(&self, uid: u64) {
        self.0.lock().unwrap().messages.remove(&uid);
    }

    pub fn set_flag(&self, uid: u64, flag: Flag, value: bool) {
        if let Some(m) = self.0.lock().unwrap().messages.get_mut(&uid) {
            m.flags = m.flags.with(flag, value);
        }
    }

    pub fn flags(&self, uid: u64) -> Option<Flags> {
        self.0.lock().unwrap().messages.get(&uid).map(|m| m.flags)
    }

    pub fn raw(&self, uid: u64) -> Option<Vec<u8>> {
        self.0.lock().unwrap().messages.get(&uid).map(|m| m.raw.clone())
    }

    pub fn uids(&self) -> Vec<u64> {
        self.0.lock().unwrap().messages.keys().copied().collect()
    }

    /// Return the calls made so far, excluding the read-only `Status`,
    /// `List` and `FetchFlags` calls.
    pub fn mutations(&self) -> Vec<Call> {
        self.0
            .lock()
            .unwrap()
            .journal
            .iter()
            .filter(|c| match **c {
                Call::StoreFlag(..) | Call::Delete(..) | Call::Append => true,
                _ => false,
            })
            .cloned()
            .collect()
    }

    pub fn journal(&self) -> Vec<Call> {
        self.0.lock().unwrap().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.0.lock().unwrap().journal.clear();
    }

    /// The number of sessions ever opened.
    pub fn connects(&self) -> usize {
        self.0.lock().unwrap().connects
    }

    /// Make every currently open session dead.
    pub fn kill_session(&self) {
        self.0.lock().unwrap().generation += 1;
    }

    /// While set, every mutating call fails with `Error::Remote`.
    pub fn set_failing(&self, failing: bool) {
        self.0.lock().unwrap().failing = failing;
    }

    /// While set, every append stores the message twice, as if an identical
    /// message arrived from elsewhere at the same moment.
    pub fn set_duplicate_appends(&self, duplicate: bool) {
        self.0.lock().unwrap().duplicate_appends = duplicate;
    }

    /// While set, searches find nothing, as with a server which doesn't
    /// index new messages right away.
    pub fn set_blind_search(&self, blind: bool) {
        self.0.lock().unwrap().blind_search = blind;
    }

    /// Deliver `raw` just before the next append is processed, as if it had
    /// arrived from elsewhere while a sync was in progress.
    pub fn deliver_before_next_append(&self, raw: &[u8]) {
        self.0.lock().unwrap().deliver_before_append = Some(raw.to_vec());
    }

    fn session(&self) -> MemorySession {
        let mut state = self.0.lock().unwrap();
        state.connects += 1;
        MemorySession {
            remote: self.clone(),
            generation: state.generation,
        }
    }
}

struct MemorySession {
    remote: MemoryRemote,
    generation: u64,
}

impl MemorySession {
    fn with<R>(
        &mut self,
        call: Call,
        mutating: bool,
        f: impl FnOnce(&mut State) -> R,
    ) -> Result<R, Error> {
        let mut state = self.remote.0.lock().unwrap();
        if state.generation != self.generation {
            return Err(Error::SessionLost);
        }
        if mutating && state.failing {
            return Err(Error::Remote("simulated failure".to_owned()));
        }

        state.journal.push(call);
        Ok(f(&mut state))
    }
}

impl RemoteStore for MemorySession {
    fn status(&mut self) -> Result<RemoteStatus, Error> {
        self.with(Call::Status, false, |s| RemoteStatus {
            uid_validity: s.uid_validity,
            last_uid: s.next_uid - 1,
            exists: s.messages.len(),
        })
    }

    fn list(&mut self) -> Result<Vec<RemoteFlags>, Error> {
        self.with(Call::List, false, |s| {
            s.messages
                .iter()
                .map(|(&uid, m)| RemoteFlags {
                    uid,
                    flags: m.flags,
                })
                .collect()
        })
    }

    fn fetch(&mut self, uid: u64) -> Result<Option<RemoteMessage>, Error> {
        self.with(Call::Fetch(uid), false, |s| {
            s.messages.get(&uid).map(|m| RemoteMessage {
                uid,
                flags: m.flags,
                internal_date: m.date,
                raw: m.raw.clone(),
            })
        })
    }

    fn fetch_flags(&mut self, uid: u64) -> Result<Option<Flags>, Error> {
        self.with(Call::FetchFlags(uid), false, |s| {
            s.messages.get(&uid).map(|m| m.flags)
        })
    }

    fn store_flag(
        &mut self,
        uids: &[u64],
        flag: Flag,
        value: bool,
    ) -> Result<(), Error> {
        self.with(Call::StoreFlag(uids.to_vec(), flag, value), true, |s| {
            for uid in uids {
                if let Some(m) = s.messages.get_mut(uid) {
                    m.flags = m.flags.with(flag, value);
                }
            }
        })
    }

    fn delete_messages(&mut self, uids: &[u64]) -> Result<(), Error> {
        self.with(Call::Delete(uids.to_vec()), true, |s| {
            for uid in uids {
                s.messages.remove(uid);
            }
        })
    }

    fn append(
        &mut self,
        raw: &[u8],
        flags: Flags,
        date: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.with(Call::Append, true, |s| {
            if let Some(other) = s.deliver_before_append.take() {
                s.insert(other, Flags::empty(), sample_date());
            }
            s.insert(raw.to_vec(), flags, date);
            if s.duplicate_appends {
                s.insert(raw.to_vec(), flags, date);
            }
        })
    }

    fn search(
        &mut self,
        criteria: &MatchCriteria,
        min_uid: u64,
    ) -> Result<Vec<u64>, Error> {
        self.with(Call::Search(min_uid), false, |s| {
            if s.blind_search {
                return Vec::new();
            }

            s.messages
                .range(min_uid..)
                .filter(|&(_, m)| criteria.matches(&Headers::parse(&m.raw)))
                .map(|(&uid, _)| uid)
                .collect()
        })
    }

    fn is_alive(&mut self) -> bool {
        self.remote.0.lock().unwrap().generation == self.generation
    }
}

/// A connector that hands out sessions on one `MemoryRemote` regardless of
/// the spec.
pub struct MemoryConnector {
    remote: MemoryRemote,
}

impl MemoryConnector {
    pub fn new(remote: MemoryRemote) -> Self {
        MemoryConnector { remote }
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, _spec: &str) -> Result<Box<dyn RemoteStore>, Error> {
        Ok(Box::new(self.remote.session()))
    }
}

pub fn sample_date() -> DateTime<Utc> {
    Utc.timestamp_opt(1_577_880_000, 0).unwrap()
}

/// Generate a distinct, well-formed message numbered `n`.
pub fn sample_message(n: u32) -> Vec<u8> {
    format!(
        "From: sender{n}@example.com\r\n\
         To: Receiver <receiver@example.org>\r\n\
         Subject: Message {n}\r\n\
         Message-ID: <{n}@example.com>\r\n\
         Date: Wed, 1 Jan 2020 12:00:{sec:02} +0000\r\n\
         \r\n\
         This is the body of message {n}.\r\n",
        n = n,
        sec = n % 60,
    )
    .into_bytes()
}
