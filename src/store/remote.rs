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

//! The remote master mailbox, and the pool of open connections to such
//! mailboxes.
//!
//! A remote store is addressed by a _connection spec_, an opaque string whose
//! prefix selects the implementation (e.g. `dir:/srv/mail/INBOX`). Folders
//! sharing a spec share one underlying session through the
//! `ConnectionPool`, which reference-counts sessions and only closes them
//! after they have sat unused for a while.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::prelude::*;
use log::{info, warn};

use super::dir_mailbox::DirRemote;
use super::model::*;
use crate::support::error::Error;

/// An open session on the authoritative remote mailbox.
///
/// UIDs are the remote store's own, stable for as long as `uid_validity` is
/// unchanged. All mutating operations must be idempotent: deleting a message
/// that is already gone, or setting a flag that is already set, succeeds
/// without effect.
///
/// Implementations report a dead session with `Error::SessionLost`.
pub trait RemoteStore: Send {
    /// Return the UID validity and UID high-water mark.
    fn status(&mut self) -> Result<RemoteStatus, Error>;

    /// Return the UID and flags of every message currently in the mailbox,
    /// in ascending UID order.
    fn list(&mut self) -> Result<Vec<RemoteFlags>, Error>;

    /// Fetch one complete message. Returns `None` if it no longer exists.
    fn fetch(&mut self, uid: u64) -> Result<Option<RemoteMessage>, Error>;

    /// Fetch the flags of one message. Returns `None` if it no longer exists.
    fn fetch_flags(&mut self, uid: u64) -> Result<Option<Flags>, Error>;

    /// Set or clear `flag` on every message in `uids` that exists.
    fn store_flag(
        &mut self,
        uids: &[u64],
        flag: Flag,
        value: bool,
    ) -> Result<(), Error>;

    /// Mark every message in `uids` deleted and expunge them, in one
    /// operation.
    fn delete_messages(&mut self, uids: &[u64]) -> Result<(), Error>;

    /// Append a message. The UID it receives is not reported.
    fn append(
        &mut self,
        raw: &[u8],
        flags: Flags,
        date: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Return the UIDs, at or above `min_uid`, of messages whose headers
    /// exactly match `criteria`.
    fn search(
        &mut self,
        criteria: &MatchCriteria,
        min_uid: u64,
    ) -> Result<Vec<u64>, Error>;

    /// Cheaply check whether the session is still usable.
    fn is_alive(&mut self) -> bool;
}

pub type SharedRemote = Arc<Mutex<Box<dyn RemoteStore>>>;
pub type SharedPool = Arc<Mutex<ConnectionPool>>;

/// Opens new sessions given a connection spec.
pub trait Connector: Send {
    fn connect(&self, spec: &str) -> Result<Box<dyn RemoteStore>, Error>;
}

/// The connector for the connection specs supported out of the box.
///
/// - `dir:<path>` opens the `DirMailbox` at `<path>` as a remote master.
pub struct StandardConnector;

impl Connector for StandardConnector {
    fn connect(&self, spec: &str) -> Result<Box<dyn RemoteStore>, Error> {
        if let Some(path) = spec.strip_prefix("dir:") {
            Ok(Box::new(DirRemote::open(PathBuf::from(path))?))
        } else {
            Err(Error::UnsupportedConnection(spec.to_owned()))
        }
    }
}

/// A checked-out reference to a pooled session.
///
/// Must be handed back with `ConnectionPool::release()`.
#[derive(Clone)]
pub struct Connection {
    spec: String,
    store: SharedRemote,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection").field("spec", &self.spec).finish()
    }
}

impl Connection {
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn store(&self) -> &SharedRemote {
        &self.store
    }
}

struct PoolEntry {
    store: SharedRemote,
    refs: usize,
    idle_since: Option<Instant>,
}

/// Reference-counted cache of remote sessions keyed by connection spec.
///
/// Folders share one pool through a `SharedPool`.
pub struct ConnectionPool {
    connector: Box<dyn Connector>,
    idle_timeout: Duration,
    entries: HashMap<String, PoolEntry>,
}

impl ConnectionPool {
    pub fn new(connector: Box<dyn Connector>, idle_timeout: Duration) -> Self {
        ConnectionPool {
            connector,
            idle_timeout,
            entries: HashMap::new(),
        }
    }

    /// Check out a session for `spec`, reusing a cached one if it is still
    /// alive.
    pub fn open(&mut self, spec: &str) -> Result<Connection, Error> {
        if let Some(entry) = self.entries.get_mut(spec) {
            if entry.store.lock().unwrap().is_alive() {
                entry.refs += 1;
                entry.idle_since = None;
                return Ok(Connection {
                    spec: spec.to_owned(),
                    store: Arc::clone(&entry.store),
                });
            }

            warn!("Cached connection to {} is dead, reconnecting", spec);
            self.entries.remove(spec);
        }

        info!("Opening connection to {}", spec);
        let store = Arc::new(Mutex::new(self.connector.connect(spec)?));
        self.entries.insert(
            spec.to_owned(),
            PoolEntry {
                store: Arc::clone(&store),
                refs: 1,
                idle_since: None,
            },
        );
        Ok(Connection {
            spec: spec.to_owned(),
            store,
        })
    }

    /// Hand back a checked-out session.
    ///
    /// The session is not closed immediately; once nothing references it, it
    /// stays cached for the idle timeout so that a retry or another folder
    /// can pick it up again cheaply.
    pub fn release(&mut self, conn: Connection) {
        if let Some(entry) = self.entries.get_mut(&conn.spec) {
            // A connection invalidated and reopened in the meantime doesn't
            // count against the new session
            if !Arc::ptr_eq(&entry.store, &conn.store) {
                return;
            }

            entry.refs = entry.refs.saturating_sub(1);
            if 0 == entry.refs {
                entry.idle_since = Some(Instant::now());
            }
        }
    }

    /// Forget the session for `spec` because it was found to be dead.
    ///
    /// Outstanding `Connection`s keep the old session object alive but it
    /// will never be handed out again.
    pub fn invalidate(&mut self, spec: &str) {
        if self.entries.remove(spec).is_some() {
            warn!("Dropping dead connection to {}", spec);
        }
    }

    /// Close every session that has been idle for at least the idle timeout
    /// as of `now`.
    ///
    /// Returns the number of sessions closed.
    pub fn reap(&mut self, now: Instant) -> usize {
        let idle_timeout = self.idle_timeout;
        let before = self.entries.len();
        self.entries.retain(|spec, entry| match entry.idle_since {
            Some(since)
                if now.saturating_duration_since(since) >= idle_timeout =>
            {
                info!("Closing idle connection to {}", spec);
                false
            }
            _ => true,
        });
        before - self.entries.len()
    }

    pub fn into_shared(self) -> SharedPool {
        Arc::new(Mutex::new(self))
    }

    /// Return the number of sessions currently cached, in use or idle.
    pub fn cached(&self) -> usize {
        self.entries.len()
    }
}
