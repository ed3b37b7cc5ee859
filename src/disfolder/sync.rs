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

//! The synchronisation engine for one disconnected folder.
//!
//! A sync pass runs these steps in order:
//!
//! 1. Connect. Check the remote UID validity against the checkpoint.
//! 2. Replay the change log against the remote.
//! 3. Download every remote message above the checkpoint.
//! 4. Copy flags from remote to local for every mapped message, and mark
//!    local copies of vanished remote messages deleted.
//! 5. Upload local messages which have no remote counterpart, or identify
//!    the remote copy of earlier uploads, then download anything that landed
//!    between the checkpoint and the uploads.
//! 6. Save the checkpoint and the UID map.
//!
//! Every step is safe to interrupt. Downloads save the checkpoint after each
//! message, the change log is only removed once fully replayed, and the UID
//! map is appended to as mappings are made.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::change_log::{ChangeLog, PendingChange, ReplayReport};
use super::checkpoint::{MailboxCheckpoint, Master};
use super::uid_map::UidMap;
use super::uploads::{PendingUpload, UploadLog};
use crate::store::local::SharedMailbox;
use crate::store::model::*;
use crate::store::remote::{Connection, RemoteStore, SharedPool};
use crate::support::error::Error;

/// What a sync pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Set if there was nothing to do and the pass was skipped.
    pub skipped: bool,
    pub replayed: ReplayReport,
    pub downloaded: usize,
    pub uploaded: usize,
    /// Local messages uploaded now or earlier whose remote copy could not be
    /// identified unambiguously.
    pub unresolved: usize,
    /// Mapped messages found missing from the remote.
    pub vanished: usize,
    /// Individual local flags changed to match the remote.
    pub flags_updated: usize,
}

/// Where a flag change or deletion went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routed {
    /// The message has no remote counterpart; nothing to do.
    LocalOnly,
    /// Applied to the remote immediately.
    Remote,
    /// Queued in the change log.
    Queued,
}

/// The outcome of getting one local message onto the remote.
#[derive(Clone, Copy, Debug)]
struct Upload {
    appended: bool,
    /// Whether the remote copy is now mapped.
    resolved: bool,
    /// The highest remote UID the copy may have.
    top: Option<u64>,
}

pub struct SyncEngine {
    log_prefix: String,
    dir: PathBuf,
    master: Master,
    mailbox: SharedMailbox,
    uid_map: UidMap,
    uploads: UploadLog,
    changes: ChangeLog,
    checkpoint: MailboxCheckpoint,
    pool: SharedPool,
}

impl SyncEngine {
    /// Load the sync state of the disconnected folder in `dir`, whose local
    /// cache is `mailbox`.
    ///
    /// A legacy `mappings` file is converted here.
    pub fn open(
        dir: &Path,
        mailbox: SharedMailbox,
        pool: SharedPool,
    ) -> Result<Self, Error> {
        let master = Master::load(&dir.join("master"))?;
        let checkpoint = MailboxCheckpoint::load(&dir.join("state"))?;
        let mut uid_map = UidMap::open(dir.join("mappings"))?;
        let log_prefix = format!("disfolder:{}", master.name);

        if uid_map.needs_migration() {
            let ids = message_ids(&mailbox)?;
            let migrated = uid_map.migrate_legacy(|id| ids.get(id).copied());
            uid_map.flush()?;
            info!(
                "{} Converted {} legacy mapping(s)",
                log_prefix, migrated
            );
        }

        Ok(SyncEngine {
            log_prefix,
            dir: dir.to_owned(),
            master,
            mailbox,
            uid_map,
            uploads: UploadLog::open(dir.join("uploads"))?,
            changes: ChangeLog::new(dir.join("changes")),
            checkpoint,
            pool,
        })
    }

    pub fn master(&self) -> &Master {
        &self.master
    }

    pub fn checkpoint(&self) -> MailboxCheckpoint {
        self.checkpoint
    }

    pub fn uid_map(&self) -> &UidMap {
        &self.uid_map
    }

    pub fn pending_changes(&self) -> Result<Vec<PendingChange>, Error> {
        self.changes.pending()
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Check out a connection to the master from the pool.
    pub fn connect(&self) -> Result<Connection, Error> {
        self.pool.lock().unwrap().open(&self.master.spec)
    }

    /// Hand a connection from `connect()` back to the pool.
    pub fn disconnect(&self, conn: Connection) {
        self.pool.lock().unwrap().release(conn);
    }

    /// Run a sync pass on a connection of its own.
    pub fn sync(&mut self, force: bool) -> Result<SyncReport, Error> {
        let conn = self.connect()?;
        let result = self.sync_on(&conn, force);
        self.disconnect(conn);
        result
    }

    /// Run a sync pass over `conn`.
    ///
    /// Unless `force` is set, the pass is skipped if there are no queued
    /// changes, no local-only messages, and the remote has no UIDs beyond the
    /// checkpoint.
    pub fn sync_on(
        &mut self,
        conn: &Connection,
        force: bool,
    ) -> Result<SyncReport, Error> {
        let result = {
            let mut store = conn.store().lock().unwrap();
            self.run(&mut **store, force)
        };

        if let Err(ref e) = result {
            self.note_failure(conn, e);
        }
        result
    }

    fn run(
        &mut self,
        remote: &mut dyn RemoteStore,
        force: bool,
    ) -> Result<SyncReport, Error> {
        let status = remote.status()?;
        if 0 != self.checkpoint.remote_uid_validity
            && status.uid_validity != self.checkpoint.remote_uid_validity
        {
            return Err(Error::UidValidityChanged {
                stored: self.checkpoint.remote_uid_validity,
                current: status.uid_validity,
            });
        }

        if !force
            && status.last_uid <= self.checkpoint.last_synced_remote_uid
            && self.changes.is_empty()?
            && !self.has_local_only()?
        {
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        info!(
            "{} Syncing with {} (checkpoint {}/{}, remote {}/{})",
            self.log_prefix,
            self.master.spec,
            self.checkpoint.remote_uid_validity,
            self.checkpoint.last_synced_remote_uid,
            status.uid_validity,
            status.last_uid
        );

        self.checkpoint.remote_uid_validity = status.uid_validity;
        let mut report = SyncReport {
            replayed: self.changes.drain_and_apply(remote)?,
            ..SyncReport::default()
        };

        report.downloaded += self.download_new(remote, status.last_uid)?;
        self.reconcile_flags(remote, &mut report)?;

        if let Some(top) = self.upload_local_only(remote, &mut report)? {
            // Anything delivered by others between the download and our
            // uploads sits below our own messages
            report.downloaded += self.download_new(remote, top)?;
        }

        self.save_checkpoint()?;
        self.uid_map.flush()?;

        info!(
            "{} Sync done: {} replayed, {} down, {} up, {} unresolved, \
             {} vanished, {} flag(s) updated",
            self.log_prefix,
            report.replayed.deleted + report.replayed.flags_applied,
            report.downloaded,
            report.uploaded,
            report.unresolved,
            report.vanished,
            report.flags_updated
        );
        Ok(report)
    }

    fn save_checkpoint(&self) -> Result<(), Error> {
        self.checkpoint.save(&self.dir.join("state"))
    }

    fn has_local_only(&self) -> Result<bool, Error> {
        Ok(self.mailbox.lock().unwrap().list()?.iter().any(|m| {
            !m.flags.has(Flag::Deleted)
                && self.uid_map.remote_uid(m.uid).is_none()
        }))
    }

    /// Whether `remote_uid` is known not to be someone else's message.
    fn is_ours(&self, remote_uid: u64) -> bool {
        self.uid_map.contains_remote(remote_uid)
            || self.uploads.holds(remote_uid)
    }

    /// Download every remote message with a UID in
    /// `(last_synced_remote_uid, upper]`, other than those already mapped or
    /// held for an unresolved upload, and advance the checkpoint to `upper`.
    fn download_new(
        &mut self,
        remote: &mut dyn RemoteStore,
        upper: u64,
    ) -> Result<usize, Error> {
        let lower = self.checkpoint.last_synced_remote_uid;
        if upper <= lower {
            return Ok(0);
        }

        let uids = remote
            .list()?
            .into_iter()
            .map(|r| r.uid)
            .filter(|&uid| uid > lower && uid <= upper)
            .collect::<Vec<_>>();

        let mut downloaded = 0;
        for uid in uids {
            if !self.is_ours(uid) && self.download_one(remote, uid)? {
                downloaded += 1;
            }
            self.checkpoint.advance(uid);
            self.save_checkpoint()?;
        }

        self.checkpoint.advance(upper);
        self.save_checkpoint()?;
        if downloaded > 0 {
            info!(
                "{} Downloaded {} message(s) up to UID {}",
                self.log_prefix, downloaded, upper
            );
        }
        Ok(downloaded)
    }

    /// Copy remote message `uid` into the local mailbox and map it.
    ///
    /// Returns `false` if the message is gone.
    fn download_one(
        &mut self,
        remote: &mut dyn RemoteStore,
        uid: u64,
    ) -> Result<bool, Error> {
        let message = match remote.fetch(uid)? {
            Some(m) => m,
            None => {
                warn!(
                    "{} Remote message {} vanished during download",
                    self.log_prefix, uid
                );
                return Ok(false);
            }
        };

        let local_uid = self.mailbox.lock().unwrap().append(
            &message.raw,
            message.flags | Flags::RECENT,
            message.internal_date,
        )?;
        self.uid_map.insert(local_uid, uid)?;
        Ok(true)
    }

    fn reconcile_flags(
        &mut self,
        remote: &mut dyn RemoteStore,
        report: &mut SyncReport,
    ) -> Result<(), Error> {
        let remote_flags = remote
            .list()?
            .into_iter()
            .map(|r| (r.uid, r.flags))
            .collect::<HashMap<_, _>>();

        let mut mailbox = self.mailbox.lock().unwrap();
        for local in mailbox.list()? {
            let remote_uid = match self.uid_map.remote_uid(local.uid) {
                Some(r) => r,
                None => continue,
            };

            match remote_flags.get(&remote_uid) {
                None => {
                    info!(
                        "{} Remote message {} is gone, deleting local {}",
                        self.log_prefix, remote_uid, local.uid
                    );
                    if !local.flags.has(Flag::Deleted) {
                        mailbox.set_flag(local.uid, Flag::Deleted, true)?;
                    }
                    self.uid_map.remove(local.uid);
                    report.vanished += 1;
                }

                Some(&flags) => {
                    for &flag in &Flag::SYNCED {
                        if local.flags.has(flag) != flags.has(flag) {
                            mailbox.set_flag(local.uid, flag, flags.has(flag))?;
                            report.flags_updated += 1;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Upload every live, unmapped local message, or resolve its earlier
    /// upload.
    ///
    /// Returns the highest remote UID any of the uploads may occupy.
    fn upload_local_only(
        &mut self,
        remote: &mut dyn RemoteStore,
        report: &mut SyncReport,
    ) -> Result<Option<u64>, Error> {
        let locals = self.mailbox.lock().unwrap().list()?;
        report.downloaded += self.release_uploads(remote, &locals)?;

        let mut top = None;
        for local in locals {
            if local.flags.has(Flag::Deleted)
                || self.uid_map.remote_uid(local.uid).is_some()
            {
                continue;
            }

            let upload = match self.uploads.get(local.uid) {
                Some(pending) => {
                    self.resolve_upload(remote, &local, pending, report)?
                }
                None => self.upload(remote, &local)?,
            };
            if upload.appended {
                report.uploaded += 1;
            }
            if !upload.resolved {
                report.unresolved += 1;
            }
            top = top.max(upload.top);
        }

        Ok(top)
    }

    /// Upload one local message and try to find out which remote UID it got.
    ///
    /// Since the remote doesn't report that, the remote is searched for a
    /// message with identical subject, in-reply-to, message ID and date
    /// headers which isn't mapped to anything yet. A search is first made
    /// over the whole mailbox, in case a copy is already there; only if that
    /// finds nothing is the message appended, followed by a search of the
    /// UIDs the append could have used.
    ///
    /// If the search after the append is inconclusive but the append was the
    /// only thing to add a UID, that UID is taken. Otherwise the range of
    /// possible UIDs goes into the upload log, so the message is never
    /// appended twice and its copy is never downloaded as a new message.
    fn upload(
        &mut self,
        remote: &mut dyn RemoteStore,
        local: &LocalMessage,
    ) -> Result<Upload, Error> {
        let raw = self.mailbox.lock().unwrap().read(local.uid)?;
        let criteria = MatchCriteria::for_headers(&Headers::parse(&raw));

        let existing = self.unclaimed(remote.search(&criteria, 1)?);
        if !existing.is_empty() {
            let top = existing.iter().copied().max();
            let resolved = self.adopt(local, &criteria, &existing)?;
            return Ok(Upload {
                appended: false,
                resolved,
                top,
            });
        }

        let before = remote.status()?.last_uid;
        remote.append(&raw, local.flags - Flags::RECENT, local.date)?;
        let mut matches =
            self.unclaimed(remote.search(&criteria, before + 1)?);
        let after = remote.status()?.last_uid.max(before + 1);

        if matches.is_empty() && after == before + 1 {
            matches.push(after);
        }

        let resolved = self.adopt(local, &criteria, &matches)?;
        if !resolved {
            self.uploads.record(local.uid, before + 1, after)?;
        }

        Ok(Upload {
            appended: true,
            resolved,
            top: Some(after),
        })
    }

    /// Retry identifying the remote copy of a message in the upload log.
    ///
    /// Once resolved, the other UIDs in its range are downloaded, since they
    /// belong to someone else. If none of the UIDs exist any more, the copy
    /// was expunged remotely and the message is uploaded again.
    fn resolve_upload(
        &mut self,
        remote: &mut dyn RemoteStore,
        local: &LocalMessage,
        pending: PendingUpload,
        report: &mut SyncReport,
    ) -> Result<Upload, Error> {
        let present = remote
            .list()?
            .into_iter()
            .map(|r| r.uid)
            .filter(|&uid| pending.contains(uid))
            .collect::<Vec<_>>();
        if present.is_empty() {
            info!(
                "{} Remote copy of local message {} is gone, uploading again",
                self.log_prefix, local.uid
            );
            self.uploads.remove(local.uid)?;
            return self.upload(remote, local);
        }

        let raw = self.mailbox.lock().unwrap().read(local.uid)?;
        let criteria = MatchCriteria::for_headers(&Headers::parse(&raw));
        let matches = self
            .unmapped(remote.search(&criteria, pending.first)?)
            .into_iter()
            .filter(|&uid| pending.contains(uid))
            .collect::<Vec<_>>();

        let resolved = self.adopt(local, &criteria, &matches)?;
        if resolved {
            self.uploads.remove(local.uid)?;
            for uid in present {
                if !self.is_ours(uid) && self.download_one(remote, uid)? {
                    report.downloaded += 1;
                }
            }
        }

        Ok(Upload {
            appended: false,
            resolved,
            top: Some(pending.last),
        })
    }

    /// Drop upload log entries whose local message was deleted, expunged or
    /// mapped by other means, downloading whatever they were holding back.
    fn release_uploads(
        &mut self,
        remote: &mut dyn RemoteStore,
        locals: &[LocalMessage],
    ) -> Result<usize, Error> {
        let waiting = locals
            .iter()
            .filter(|m| {
                !m.flags.has(Flag::Deleted)
                    && self.uid_map.remote_uid(m.uid).is_none()
            })
            .map(|m| m.uid)
            .collect::<HashSet<_>>();
        let released = self
            .uploads
            .entries()
            .into_iter()
            .filter(|p| !waiting.contains(&p.local_uid))
            .collect::<Vec<_>>();
        if released.is_empty() {
            return Ok(0);
        }

        for p in &released {
            self.uploads.remove(p.local_uid)?;
        }

        let mut downloaded = 0;
        for r in remote.list()? {
            if released.iter().any(|p| p.contains(r.uid))
                && !self.is_ours(r.uid)
                && self.download_one(remote, r.uid)?
            {
                downloaded += 1;
            }
        }
        Ok(downloaded)
    }

    /// Map `local` to the single element of `matches`, if there is exactly
    /// one.
    fn adopt(
        &mut self,
        local: &LocalMessage,
        criteria: &MatchCriteria,
        matches: &[u64],
    ) -> Result<bool, Error> {
        if 1 == matches.len() {
            self.uid_map.insert(local.uid, matches[0])?;
            return Ok(true);
        }

        warn!(
            "{} Local message {} ({:?}) matched {} remote message(s) \
             after upload; will retry",
            self.log_prefix,
            local.uid,
            criteria.message_id,
            matches.len()
        );
        Ok(false)
    }

    fn unmapped(&self, uids: Vec<u64>) -> Vec<u64> {
        uids.into_iter()
            .filter(|&uid| !self.uid_map.contains_remote(uid))
            .collect()
    }

    /// Like `unmapped()`, but also excluding UIDs held for unresolved
    /// uploads.
    fn unclaimed(&self, uids: Vec<u64>) -> Vec<u64> {
        uids.into_iter().filter(|&uid| !self.is_ours(uid)).collect()
    }

    /// Upload the single local message `local_uid` over `conn` right away.
    pub fn upload_now(
        &mut self,
        conn: &Connection,
        local_uid: u64,
    ) -> Result<(), Error> {
        let local = self
            .mailbox
            .lock()
            .unwrap()
            .list()?
            .into_iter()
            .find(|m| m.uid == local_uid)
            .ok_or(Error::NxMessage)?;

        let result = {
            let mut store = conn.store().lock().unwrap();
            self.upload(&mut **store, &local)
        };
        match result {
            Ok(_) => self.uid_map.flush(),
            Err(e) => {
                self.note_failure(conn, &e);
                Err(e)
            }
        }
    }

    /// Propagate a local flag change on `local_uid` towards the remote.
    ///
    /// Setting `\Deleted` on a mapped message deletes the remote copy and
    /// drops the mapping at once, since the local message may be expunged
    /// before the next sync. `\Recent` never leaves the local side.
    ///
    /// With a connection, the change is applied directly; if that fails (or
    /// there is no connection), it is queued in the change log instead.
    pub fn route_flag(
        &mut self,
        conn: Option<&Connection>,
        local_uid: u64,
        flag: Flag,
        value: bool,
    ) -> Result<Routed, Error> {
        if Flag::Recent == flag {
            return Ok(Routed::LocalOnly);
        }

        let remote_uid = match self.uid_map.remote_uid(local_uid) {
            Some(r) => r,
            None => return Ok(Routed::LocalOnly),
        };

        let change = if Flag::Deleted == flag && value {
            PendingChange::Delete { remote_uid }
        } else {
            PendingChange::FlagSet {
                remote_uid,
                flag,
                value,
            }
        };

        let mut routed = Routed::Queued;
        if let Some(conn) = conn {
            let result = {
                let mut store = conn.store().lock().unwrap();
                match change {
                    PendingChange::Delete { remote_uid } => {
                        store.delete_messages(&[remote_uid])
                    }
                    PendingChange::FlagSet {
                        remote_uid,
                        flag,
                        value,
                    } => store.store_flag(&[remote_uid], flag, value),
                }
            };

            match result {
                Ok(()) => routed = Routed::Remote,
                Err(e) => {
                    warn!(
                        "{} Applying {} remotely failed, queuing: {}",
                        self.log_prefix, change, e
                    );
                    self.note_failure(conn, &e);
                }
            }
        }

        if Routed::Queued == routed {
            match change {
                PendingChange::Delete { remote_uid } => {
                    self.changes.append_delete(remote_uid)?
                }
                PendingChange::FlagSet {
                    remote_uid,
                    flag,
                    value,
                } => self.changes.append_flag(remote_uid, flag, value)?,
            }
        }

        if let PendingChange::Delete { .. } = change {
            self.uid_map.remove(local_uid);
            self.uid_map.flush()?;
        }

        Ok(routed)
    }

    /// Drop mappings for local messages that no longer exist.
    pub fn prune_mappings(&mut self) -> Result<usize, Error> {
        let live = self
            .mailbox
            .lock()
            .unwrap()
            .list()?
            .into_iter()
            .map(|m| m.uid)
            .collect::<HashSet<_>>();
        let pruned = self.uid_map.retain(|e| live.contains(&e.local_uid));
        self.uid_map.flush()?;
        Ok(pruned)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.uid_map.flush()
    }

    fn note_failure(&self, conn: &Connection, error: &Error) {
        if let Error::SessionLost = *error {
            self.pool.lock().unwrap().invalidate(conn.spec());
        }
    }
}

/// Build a table from message ID to local UID.
fn message_ids(mailbox: &SharedMailbox) -> Result<HashMap<String, u64>, Error> {
    let mut mailbox = mailbox.lock().unwrap();
    let mut ret = HashMap::new();
    for message in mailbox.list()? {
        let raw = mailbox.read(message.uid)?;
        if let Some(id) = Headers::parse(&raw).get("Message-ID") {
            ret.entry(id.to_owned()).or_insert(message.uid);
        }
    }
    Ok(ret)
}
