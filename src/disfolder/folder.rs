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

use std::fs;
use std::path::Path;

use chrono::prelude::*;
use log::{info, warn};

use super::change_log::PendingChange;
use super::checkpoint::{MailboxCheckpoint, Master};
use super::sync::{Routed, SyncEngine, SyncReport};
use crate::folder::*;
use crate::store::dir_mailbox::DirMailbox;
use crate::store::local::{self, SharedMailbox};
use crate::store::model::*;
use crate::store::remote::{Connection, SharedPool};
use crate::support::error::Error;

/// A folder whose messages live in a local cache and are kept in sync with a
/// remote master.
///
/// All ordinary folder operations go to the wrapped local folder. Mutations
/// are additionally pushed towards the master: directly while online, or via
/// the change log while offline.
///
/// The folder directory holds `master`, `state`, `mappings`, `changes`,
/// `uploads` and the cache mailbox itself in `folder/`.
pub struct DisconnectedFolder {
    inner: Box<dyn FolderBackend>,
    engine: SyncEngine,
    online: Option<Connection>,
}

impl DisconnectedFolder {
    /// Set up a new disconnected folder directory.
    pub fn create_dir(dir: &Path, name: &str, spec: &str) -> Result<(), Error> {
        fs::create_dir_all(dir.join("folder"))?;
        Master {
            name: name.to_owned(),
            spec: spec.to_owned(),
        }
        .save(&dir.join("master"))
    }

    /// Open the disconnected folder in `dir`, using a `DirMailbox` for the
    /// local cache. The folder starts offline.
    pub fn open(dir: &Path, pool: SharedPool) -> Result<Self, Error> {
        let mailbox = local::share(DirMailbox::open(dir.join("folder"))?);
        Self::with_mailbox(dir, mailbox, pool)
    }

    /// Open the disconnected folder in `dir` over an arbitrary cache mailbox.
    pub fn with_mailbox(
        dir: &Path,
        mailbox: SharedMailbox,
        pool: SharedPool,
    ) -> Result<Self, Error> {
        let engine = SyncEngine::open(dir, mailbox.clone(), pool)?;
        let inner = Box::new(LocalFolder::new(
            engine.log_prefix().to_owned(),
            mailbox,
        ));
        Ok(DisconnectedFolder {
            inner,
            engine,
            online: None,
        })
    }

    pub fn master(&self) -> &Master {
        self.engine.master()
    }

    pub fn checkpoint(&self) -> MailboxCheckpoint {
        self.engine.checkpoint()
    }

    pub fn pending_changes(&self) -> Result<Vec<PendingChange>, Error> {
        self.engine.pending_changes()
    }

    /// The remote UID of the message at `index`, if it has one.
    pub fn remote_uid(&mut self, index: usize) -> Result<Option<u64>, Error> {
        let uid = self.inner.info(index)?.uid;
        Ok(self.engine.uid_map().remote_uid(uid))
    }

    pub fn is_online(&self) -> bool {
        self.online.is_some()
    }

    /// Connect to the master and do a forced sync, staying connected
    /// afterwards.
    pub fn go_online(&mut self) -> Result<SyncReport, Error> {
        if self.online.is_none() {
            self.online = Some(self.engine.connect()?);
        }

        self.sync(true)
    }

    /// Let go of the connection to the master.
    ///
    /// Nothing is lost; every change made from here on goes to the change
    /// log.
    pub fn go_offline(&mut self) {
        if let Some(conn) = self.online.take() {
            info!("{} Going offline", self.engine.log_prefix());
            self.engine.disconnect(conn);
        }
    }

    fn route_flag(
        &mut self,
        local_uid: u64,
        flag: Flag,
        value: bool,
    ) -> Result<(), Error> {
        let routed =
            self.engine
                .route_flag(self.online.as_ref(), local_uid, flag, value)?;
        if Routed::Queued == routed && self.online.is_some() {
            // The direct path failed; don't keep trying it for every message
            self.go_offline();
        }
        Ok(())
    }

    /// Run a sync over whichever connection is appropriate.
    fn sync_pass(&mut self, force: bool) -> Result<SyncReport, Error> {
        let result = match self.online {
            Some(ref conn) => self.engine.sync_on(conn, force),
            None => self.engine.sync(force),
        };

        if let Err(Error::SessionLost) = result {
            self.go_offline();
        }
        result
    }
}

impl FolderBackend for DisconnectedFolder {
    fn init(&mut self) -> Result<(), Error> {
        self.inner.init()
    }

    fn close(&mut self, expunge: bool) -> Result<(), Error> {
        if expunge {
            self.update(UpdateMode::Sync)?;
        }

        self.engine.flush()?;
        self.go_offline();
        self.inner.close(false)
    }

    fn update(&mut self, mode: UpdateMode) -> Result<usize, Error> {
        match mode {
            UpdateMode::Checkpoint => {
                self.engine.flush()?;
            }

            UpdateMode::Update => {
                if self.online.is_some() {
                    match self.sync_pass(false) {
                        Ok(_) => (),
                        Err(e @ Error::UidValidityChanged { .. }) => {
                            return Err(e)
                        }
                        Err(e) => {
                            warn!(
                                "{} Update from master failed: {}",
                                self.engine.log_prefix(),
                                e
                            );
                            self.go_offline();
                        }
                    }
                }
            }

            UpdateMode::Sync => {
                // Deleted messages which still have a mapping got the flag
                // from somewhere other than `set_flag()`, e.g. a legacy
                // mapping or a message reconciled as deleted remotely
                for index in 0..self.inner.len() {
                    let info = self.inner.info(index)?;
                    if info.flags.has(Flag::Deleted)
                        && self.engine.uid_map().remote_uid(info.uid).is_some()
                    {
                        self.route_flag(info.uid, Flag::Deleted, true)?;
                    }
                }
            }
        }

        let added = self.inner.update(mode)?;
        if UpdateMode::Sync == mode {
            self.engine.prune_mappings()?;
        }
        Ok(added)
    }

    fn insert(
        &mut self,
        raw: &[u8],
        flags: Flags,
        date: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let uid = self.inner.insert(raw, flags, date)?;

        let uploaded = match self.online {
            Some(ref conn) => Some(self.engine.upload_now(conn, uid)),
            None => None,
        };

        if let Some(Err(e)) = uploaded {
            warn!(
                "{} Immediate upload of {} failed, will upload on next \
                 sync: {}",
                self.engine.log_prefix(),
                uid,
                e
            );
            if let Error::SessionLost = e {
                self.go_offline();
            }
        }

        Ok(uid)
    }

    fn set_flag(
        &mut self,
        indices: &[usize],
        flag: Flag,
        value: bool,
    ) -> Result<(), Error> {
        let mut uids = Vec::with_capacity(indices.len());
        for &index in indices {
            let info = self.inner.info(index)?;
            if info.flags.has(flag) != value {
                uids.push(info.uid);
            }
        }

        // Local first: if routing fails, a deleted message keeps its mapping
        // and the expunge path still takes the deletion to the remote
        self.inner.set_flag(indices, flag, value)?;
        for uid in uids {
            self.route_flag(uid, flag, value)?;
        }
        Ok(())
    }

    fn get_flag(&mut self, index: usize, flag: Flag) -> Result<bool, Error> {
        self.inner.get_flag(index, flag)
    }

    fn info(&mut self, index: usize) -> Result<MessageInfo, Error> {
        self.inner.info(index)
    }

    fn set_info(
        &mut self,
        index: usize,
        info: &MessageInfo,
    ) -> Result<(), Error> {
        let current = self.inner.info(index)?;
        self.inner.set_info(index, info)?;
        for &flag in &Flag::ALL {
            if current.flags.has(flag) != info.flags.has(flag) {
                self.route_flag(current.uid, flag, info.flags.has(flag))?;
            }
        }
        Ok(())
    }

    fn create(&mut self, index: usize) -> Result<Message, Error> {
        self.inner.create(index)
    }

    fn sync(&mut self, force: bool) -> Result<SyncReport, Error> {
        let report = self.sync_pass(force)?;
        self.inner.update(UpdateMode::Update)?;
        Ok(report)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl Drop for DisconnectedFolder {
    fn drop(&mut self) {
        self.go_offline();
    }
}
