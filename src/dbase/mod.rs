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


//! The local message database.
//!
//! A database directory holds message metadata in `index` (13 lines per
//! record) with the record count in `index.info`. Mutations are not made to
//! `index` in place; instead they are appended to `index.changes` and applied
//! to the in-memory copy by every handle as it syncs. Once enough changes
//! accumulate and nobody else has the database open, `index` is rewritten
//! without the deleted records and the change log starts over. This is
//! "compaction", and it renumbers records, so raw record indices must never
//! be remembered across a `sync()`; use the message-id or filename instead.
//!
//! The message bodies live in `dbase/<bucket>/<seq>`, where the bucket is
//! derived from the first recipient and the sequence number comes from the
//! bucket's `.seq` file.

pub mod changes;
pub mod entry;
pub mod expire;
pub mod lock;
pub mod search;

use std::fs;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};

use self::changes::Change;
use self::entry::{one_line, DbEntry, NewEntry};
use self::expire::ExpireAction;
use self::lock::{DbLock, LockTiming, ReaderLock};
use crate::store::model::Flags;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::safe_name;
use crate::support::system_config::DbaseConfig;

/// The only `index.info` format version understood.
pub const FORMAT_VERSION: u32 = 5;

#[derive(Clone, Debug)]
struct Record {
    entry: DbEntry,
    tombstone: bool,
}

/// Identifies one compaction of the index, so a handle notices when some
/// other process compacted behind its back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Generation {
    info: String,
    index_inode: u64,
}

/// An open database.
///
/// Multiple handles, in this or other processes, may have the same database
/// open; they coordinate through the files in the database directory.
#[derive(Debug)]
pub struct Database {
    log_prefix: String,
    dir: PathBuf,
    config: DbaseConfig,
    cancel: Option<Arc<AtomicBool>>,
    rlock: ReaderLock,
    records: Vec<Record>,
    /// Bytes of `index.changes` already applied.
    changes_consumed: u64,
    /// Change lines applied since the last compaction.
    changes_applied: usize,
    generation: Generation,
}

impl Database {
    /// Open the database in `dir`, creating it if it does not exist yet.
    pub fn open(
        dir: impl AsRef<Path>,
        config: &DbaseConfig,
    ) -> Result<Self, Error> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(dir.join("dbase"))?;

        let _lock = DbLock::acquire(&dir, lock_timing(config), None)?;
        lock::purge_stale_readers(&dir, config.rlock_timeout())?;
        // Dropped, and so removed again, if the rest of the open fails
        let rlock = ReaderLock::create(&dir)?;

        let index_path = dir.join("index");
        if !index_path.exists() {
            file_ops::spit(&index_path, b"")?;
        }
        let info_path = dir.join("index.info");
        if !info_path.exists() {
            file_ops::spit(
                &info_path,
                format!("{} 0\n", FORMAT_VERSION).as_bytes(),
            )?;
        }

        let mut db = Database {
            log_prefix: format!("dbase:{}", dir.display()),
            dir,
            config: config.clone(),
            cancel: None,
            rlock,
            records: Vec::new(),
            changes_consumed: 0,
            changes_applied: 0,
            generation: Generation::default(),
        };
        db.load()?;
        db.sync_locked()?;
        info!("{} Opened with {} records", db.log_prefix, db.records.len());
        Ok(db)
    }

    /// Set a flag which, once set, makes operations waiting for the lock
    /// give up with `Error::Cancelled`.
    pub fn set_cancel_flag(&mut self, cancel: Arc<AtomicBool>) {
        self.cancel = Some(cancel);
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The number of record slots, including deleted records that have not
    /// been compacted away yet.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The entry at `index`, unless it is deleted or out of range.
    pub fn get(&self, index: usize) -> Option<&DbEntry> {
        self.records
            .get(index)
            .filter(|r| !r.tombstone)
            .map(|r| &r.entry)
    }

    pub fn live_indices(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|&(_, r)| !r.tombstone)
            .map(|(ix, _)| ix)
            .collect()
    }

    /// Read the stored message of the entry at `index`.
    pub fn read_message(&self, index: usize) -> Result<Vec<u8>, Error> {
        let entry = self.get(index).ok_or(Error::NxRecord)?;
        fs::read(self.message_path(&entry.filename)).map_err(|e| {
            if io::ErrorKind::NotFound == e.kind() {
                Error::NxMessage
            } else {
                e.into()
            }
        })
    }

    /// Store a new message, returning the index of its record.
    pub fn insert(
        &mut self,
        new: &NewEntry,
        body: &[u8],
    ) -> Result<usize, Error> {
        let _lock = self.lock()?;
        self.sync_locked()?;

        let bucket = safe_name::bucket_name(&new.to);
        let bucket_dir = self.dir.join("dbase").join(&bucket);
        fs::create_dir_all(&bucket_dir)?;
        let seq = next_seq(&bucket_dir)?;
        let entry = new
            .clone()
            .into_entry(body.len() as u64, format!("{}/{}", bucket, seq));
        let message_path = self.message_path(&entry.filename);

        let mut index = fs::OpenOptions::new()
            .append(true)
            .open(self.index_path())?;
        let start = index.metadata()?.len();

        let mut created_message = false;
        if let Err(e) = self.append_new(
            &mut index,
            &entry,
            start,
            &message_path,
            body,
            &mut created_message,
        ) {
            warn!(
                "{} Insert of {} failed, rolling back: {}",
                self.log_prefix, entry.filename, e
            );
            index.set_len(start)?;
            if created_message {
                fs::remove_file(&message_path).ignore_not_found()?;
            }
            return Err(e);
        }

        self.sync_locked()?;
        // Nothing else could have been added while we held the lock, and
        // compaction keeps the order, so ours is last.
        Ok(self.records.len() - 1)
    }

    fn append_new(
        &self,
        index: &mut fs::File,
        entry: &DbEntry,
        start: u64,
        message_path: &Path,
        body: &[u8],
        created_message: &mut bool,
    ) -> Result<(), Error> {
        index.write_all(entry.to_record().as_bytes())?;

        let mut message = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(message_path)?;
        *created_message = true;
        message.write_all(body)?;
        message.sync_all()?;

        self.append_change(&Change::Add { offset: start })
    }

    /// Change the status of the entry at `index`.
    ///
    /// Nothing is written if the status is unchanged.
    pub fn set_status(
        &mut self,
        index: usize,
        status: Flags,
    ) -> Result<(), Error> {
        if status == self.get(index).ok_or(Error::NxRecord)?.status {
            return Ok(());
        }

        let _lock = self.lock()?;
        self.sync_locked()?;
        self.check_live(&[index])?;
        self.append_change(&Change::Status { index, status })?;
        self.sync_locked()
    }

    /// Set the keywords and expiry of every entry in `indices` at once.
    pub fn set_info(
        &mut self,
        indices: &[usize],
        keywords: &str,
        expiration_time: i64,
        expiration_type: ExpireAction,
    ) -> Result<(), Error> {
        let _lock = self.lock()?;
        self.sync_locked()?;
        self.check_live(indices)?;
        self.append_change(&Change::Info {
            indices: indices.to_vec(),
            keywords: one_line(keywords),
            expiration_time,
            expiration_type,
        })?;
        self.sync_locked()
    }

    /// Delete the entries in `indices`.
    ///
    /// The records and message files stay around until the next compaction.
    pub fn delete(&mut self, indices: &[usize]) -> Result<(), Error> {
        let _lock = self.lock()?;
        self.sync_locked()?;
        self.check_live(indices)?;
        for &index in indices {
            self.append_change(&Change::Delete { index })?;
        }
        self.sync_locked()
    }

    /// Bring this handle up to date with changes made by others, compacting
    /// if that is due.
    pub fn sync(&mut self) -> Result<(), Error> {
        let _lock = self.lock()?;
        self.sync_locked()
    }

    /// Refresh this handle's reader lock.
    ///
    /// This must happen more often than `rlock_timeout_secs`, or other
    /// processes will consider this handle dead and may compact the index
    /// under it.
    pub fn touch_rlock(&self) -> Result<(), Error> {
        self.rlock.touch()
    }

    pub fn close(self) {
        info!("{} Closed", self.log_prefix);
    }

    fn lock(&self) -> Result<DbLock, Error> {
        let lock = DbLock::acquire(
            &self.dir,
            lock_timing(&self.config),
            self.cancel.as_deref(),
        )?;
        lock::purge_stale_readers(&self.dir, self.config.rlock_timeout())?;
        Ok(lock)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index")
    }

    fn info_path(&self) -> PathBuf {
        self.dir.join("index.info")
    }

    fn changes_path(&self) -> PathBuf {
        self.dir.join("index.changes")
    }

    fn message_path(&self, filename: &str) -> PathBuf {
        self.dir.join("dbase").join(filename)
    }

    fn check_live(&self, indices: &[usize]) -> Result<(), Error> {
        if indices.iter().all(|&ix| self.get(ix).is_some()) {
            Ok(())
        } else {
            Err(Error::NxRecord)
        }
    }

    fn append_change(&self, change: &Change) -> Result<(), Error> {
        file_ops::append_line(self.changes_path(), &change.to_string())?;
        Ok(())
    }

    fn current_generation(&self) -> Result<Generation, Error> {
        Ok(Generation {
            info: fs::read_to_string(self.info_path())?,
            index_inode: fs::metadata(self.index_path())?.ino(),
        })
    }

    /// Discard the in-memory state and read `index` from scratch.
    ///
    /// Only the records counted in `index.info` are read; anything after
    /// them is reached through `a` lines in the change log.
    fn load(&mut self) -> Result<(), Error> {
        let generation = self.current_generation()?;
        let count = parse_info(&generation.info)?;

        let mut reader = BufReader::new(fs::File::open(self.index_path())?);
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = reader.stream_position()?;
            let entry = DbEntry::read_record(&mut reader)?
                .ok_or(Error::CorruptRecord(offset))?;
            records.push(Record {
                entry,
                tombstone: false,
            });
        }

        self.records = records;
        self.changes_consumed = 0;
        self.changes_applied = 0;
        self.generation = generation;
        Ok(())
    }

    /// Apply new lines from `index.changes`, then compact if due. The
    /// caller holds the lock.
    fn sync_locked(&mut self) -> Result<(), Error> {
        let changes_len = match fs::metadata(self.changes_path()) {
            Ok(md) => md.len(),
            Err(e) if io::ErrorKind::NotFound == e.kind() => 0,
            Err(e) => return Err(e.into()),
        };

        if changes_len < self.changes_consumed
            || self.current_generation()? != self.generation
        {
            info!(
                "{} Index was compacted by another process, reloading",
                self.log_prefix
            );
            self.load()?;
        }

        if changes_len > self.changes_consumed {
            let mut file = fs::File::open(self.changes_path())?;
            file.seek(SeekFrom::Start(self.changes_consumed))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;

            // A writer may be halfway through a line; leave that for later
            let complete =
                data.iter().rposition(|&b| b'\n' == b).map_or(0, |p| p + 1);
            for line in String::from_utf8_lossy(&data[..complete]).lines() {
                match Change::parse(line) {
                    Some(change) => self.apply(change)?,
                    None => warn!(
                        "{} Skipping malformed change {:?}",
                        self.log_prefix, line
                    ),
                }
                self.changes_applied += 1;
            }
            self.changes_consumed += complete as u64;
        }

        if self.changes_applied >= self.config.compact_threshold {
            let others = lock::other_readers(
                &self.dir,
                self.rlock.path(),
                self.config.rlock_timeout(),
            )?;
            if 0 == others {
                self.compact()?;
            } else {
                info!(
                    "{} {} other readers active, not compacting",
                    self.log_prefix, others
                );
            }
        }

        Ok(())
    }

    fn apply(&mut self, change: Change) -> Result<(), Error> {
        match change {
            Change::Add { offset } => {
                let mut file = fs::File::open(self.index_path())?;
                file.seek(SeekFrom::Start(offset))?;
                let entry = DbEntry::read_record(&mut BufReader::new(file))?
                    .ok_or(Error::CorruptRecord(offset))?;
                self.records.push(Record {
                    entry,
                    tombstone: false,
                });
            }

            Change::Delete { index } => match self.records.get_mut(index) {
                Some(record) => record.tombstone = true,
                None => self.warn_no_record(index),
            },

            Change::Status { index, status } => {
                match self.records.get_mut(index) {
                    Some(record) => record.entry.status = status,
                    None => self.warn_no_record(index),
                }
            }

            Change::Info {
                indices,
                keywords,
                expiration_time,
                expiration_type,
            } => {
                for index in indices {
                    match self.records.get_mut(index) {
                        Some(record) => {
                            record.entry.keywords = keywords.clone();
                            record.entry.expiration_time = expiration_time;
                            record.entry.expiration_type =
                                expiration_type.clone();
                        }
                        None => self.warn_no_record(index),
                    }
                }
            }
        }

        Ok(())
    }

    fn warn_no_record(&self, index: usize) {
        warn!(
            "{} Change refers to nonexistent record {}",
            self.log_prefix, index
        );
    }

    /// Rewrite `index` with only the live records and start a fresh change
    /// log. The caller holds the lock and has checked for other readers.
    fn compact(&mut self) -> Result<(), Error> {
        let live = self
            .records
            .iter()
            .filter(|r| !r.tombstone)
            .cloned()
            .collect::<Vec<_>>();

        let mut index = String::new();
        for record in &live {
            index.push_str(&record.entry.to_record());
        }
        file_ops::spit(self.index_path(), index.as_bytes())?;
        file_ops::spit(
            self.info_path(),
            format!("{} {}\n", FORMAT_VERSION, live.len()).as_bytes(),
        )?;
        fs::remove_file(self.changes_path()).ignore_not_found()?;

        for record in self.records.iter().filter(|r| r.tombstone) {
            // Expiry may already have moved the file elsewhere
            fs::remove_file(self.message_path(&record.entry.filename))
                .ignore_not_found()?;
        }

        info!(
            "{} Compacted after {} changes: {} records kept, {} removed",
            self.log_prefix,
            self.changes_applied,
            live.len(),
            self.records.len() - live.len()
        );

        self.records = live;
        self.changes_consumed = 0;
        self.changes_applied = 0;
        self.generation = self.current_generation()?;
        Ok(())
    }
}

fn lock_timing(config: &DbaseConfig) -> LockTiming {
    LockTiming {
        poll: config.lock_poll(),
        timeout: config.lock_timeout(),
        stale: config.stale_lock(),
    }
}

fn parse_info(info: &str) -> Result<usize, Error> {
    let mut parts = info.split_whitespace();
    let version = parts
        .next()
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or(Error::CorruptInfo)?;
    if FORMAT_VERSION != version {
        return Err(Error::DbaseVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    parts
        .next()
        .and_then(|c| c.parse::<usize>().ok())
        .ok_or(Error::CorruptInfo)
}

/// Allocate the next sequence number in `bucket_dir`.
fn next_seq(bucket_dir: &Path) -> Result<u64, Error> {
    let path = bucket_dir.join(".seq");
    let last = match fs::read_to_string(&path) {
        Ok(s) => s.trim().parse::<u64>().map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: bad sequence number", path.display()),
            ))
        })?,
        Err(e) if io::ErrorKind::NotFound == e.kind() => 0,
        Err(e) => return Err(e.into()),
    };

    let seq = last + 1;
    file_ops::spit(&path, format!("{}\n", seq).as_bytes())?;
    Ok(seq)
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::test_support::*;

    pub(super) fn config() -> DbaseConfig {
        DbaseConfig {
            lock_poll_millis: 1,
            lock_timeout_secs: 1,
            ..DbaseConfig::default()
        }
    }

    pub(super) fn insert_sample(db: &mut Database, n: u32) -> usize {
        let raw = sample_message(n);
        db.insert(&NewEntry::from_message(&raw, sample_date()), &raw)
            .unwrap()
    }

    fn rlocks(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_str()
                    .unwrap()
                    .starts_with("rlock.")
            })
            .count()
    }

    fn change_lines(dir: &Path) -> usize {
        fs::read_to_string(dir.join("index.changes"))
            .unwrap_or_default()
            .lines()
            .count()
    }

    /// Toggle the status of `index` until the change log reaches the
    /// compaction threshold.
    fn pad_until_compacted(db: &mut Database, index: usize) {
        let mut seen = false;
        while db.dir().join("index.changes").exists() {
            seen = !seen;
            let status = if seen { Flags::SEEN } else { Flags::empty() };
            db.set_status(index, status).unwrap();
        }
    }

    #[test]
    fn open_creates_files() {
        crate::init_test_log();
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();

        let db = Database::open(dir, &config()).unwrap();
        assert!(db.is_empty());
        assert!(dir.join("dbase").is_dir());
        assert_eq!("", fs::read_to_string(dir.join("index")).unwrap());
        assert_eq!(
            "5 0\n",
            fs::read_to_string(dir.join("index.info")).unwrap()
        );
        assert!(!dir.join("lock").exists());
        assert_eq!(1, rlocks(dir));

        db.close();
        assert_eq!(0, rlocks(dir));
    }

    #[test]
    fn wrong_version_rejected() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        fs::write(dir.join("index.info"), "4 0\n").unwrap();

        assert_matches!(
            Err(Error::DbaseVersion {
                found: 4,
                expected: 5
            }),
            Database::open(dir, &config())
        );
        assert_eq!(0, rlocks(dir));
        assert!(!dir.join("lock").exists());

        fs::write(dir.join("index.info"), "five\n").unwrap();
        assert_matches!(
            Err(Error::CorruptInfo),
            Database::open(dir, &config())
        );
    }

    #[test]
    fn lock_timeout() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        fs::write(dir.join("lock"), "otherhost:1").unwrap();

        let config = DbaseConfig {
            lock_timeout_secs: 0,
            ..config()
        };
        assert_matches!(
            Err(Error::LockTimeout(..)),
            Database::open(dir, &config)
        );
        assert_eq!(0, rlocks(dir));
    }

    #[test]
    fn insert_and_read() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut db = Database::open(dir, &config()).unwrap();

        assert_eq!(0, insert_sample(&mut db, 1));
        assert_eq!(1, insert_sample(&mut db, 2));

        let entry = db.get(1).unwrap();
        assert_eq!("sender2@example.com", entry.from);
        assert_eq!("Message 2", entry.subject);
        assert_eq!("receiver/2", entry.filename);
        assert_eq!(sample_message(2).len() as u64, entry.size);
        assert_eq!(sample_message(2), db.read_message(1).unwrap());
        assert_eq!(
            "2\n",
            fs::read_to_string(dir.join("dbase/receiver/.seq")).unwrap()
        );
        assert_eq!(2, change_lines(dir));

        let other = Database::open(dir, &config()).unwrap();
        assert_eq!(db.get(0), other.get(0));
        assert_eq!(db.get(1), other.get(1));
        assert_matches!(Err(Error::NxRecord), db.read_message(2));
    }

    #[test]
    fn status_info_and_delete() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut db = Database::open(dir, &config()).unwrap();
        for n in 0..3 {
            insert_sample(&mut db, n);
        }

        db.set_status(0, Flags::SEEN | Flags::RECENT).unwrap();
        assert_eq!(4, change_lines(dir));
        db.set_status(0, Flags::SEEN | Flags::RECENT).unwrap();
        assert_eq!(4, change_lines(dir));

        db.set_info(&[1, 2], "work", 1_600_000_000, ExpireAction::Backup)
            .unwrap();
        assert_eq!(5, change_lines(dir));
        for ix in 1..3 {
            let entry = db.get(ix).unwrap();
            assert_eq!("work", entry.keywords);
            assert_eq!(1_600_000_000, entry.expiration_time);
            assert_eq!(ExpireAction::Backup, entry.expiration_type);
        }

        db.delete(&[1]).unwrap();
        assert_eq!(None, db.get(1));
        assert_eq!(vec![0, 2], db.live_indices());
        assert_eq!(3, db.len());
        assert_matches!(Err(Error::NxRecord), db.set_status(1, Flags::SEEN));
        assert_matches!(Err(Error::NxRecord), db.delete(&[0, 7]));

        // A fresh handle sees the same state by replaying the log
        let other = Database::open(dir, &config()).unwrap();
        assert_eq!(vec![0, 2], other.live_indices());
        assert_eq!(Flags::SEEN | Flags::RECENT, other.get(0).unwrap().status);
        assert_eq!("work", other.get(2).unwrap().keywords);
    }

    #[test]
    fn compaction_after_twenty_changes() {
        crate::init_test_log();
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut db = Database::open(dir, &config()).unwrap();

        for n in 0..25 {
            let ix = insert_sample(&mut db, n);
            assert_eq!(Flags::empty(), db.get(ix).unwrap().status);
            db.set_status(ix, Flags::SEEN).unwrap();

            if 8 == n {
                assert_eq!(18, change_lines(dir));
            } else if 9 == n {
                assert!(!dir.join("index.changes").exists());
                assert_eq!(
                    "5 10\n",
                    fs::read_to_string(dir.join("index.info")).unwrap()
                );
            }
        }

        assert_eq!(10, change_lines(dir));
        assert_eq!(25, db.live_indices().len());
        db.close();

        let db = Database::open(dir, &config()).unwrap();
        assert_eq!(25, db.len());
        for ix in 0..25 {
            let entry = db.get(ix).unwrap();
            assert_eq!(Flags::SEEN, entry.status);
            assert_eq!(format!("Message {}", ix), entry.subject);
        }
    }

    #[test]
    fn compaction_drops_deleted_records() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut db = Database::open(dir, &config()).unwrap();
        for n in 0..6 {
            insert_sample(&mut db, n);
        }
        let before = db
            .live_indices()
            .into_iter()
            .filter(|&ix| ix % 2 == 1)
            .map(|ix| db.get(ix).unwrap().clone())
            .collect::<Vec<_>>();

        db.delete(&[0, 2, 4]).unwrap();
        assert!(dir.join("dbase/receiver/1").exists());

        pad_until_compacted(&mut db, 1);

        let after = db
            .live_indices()
            .into_iter()
            .map(|ix| db.get(ix).unwrap().clone())
            .collect::<Vec<_>>();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.filename, a.filename);
            assert_eq!(b.subject, a.subject);
        }
        assert_eq!(3, db.len());
        assert_eq!(
            "5 3\n",
            fs::read_to_string(dir.join("index.info")).unwrap()
        );
        assert!(!dir.join("dbase/receiver/1").exists());
        assert!(dir.join("dbase/receiver/2").exists());
    }

    #[test]
    fn compaction_deferred_for_other_reader() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut db = Database::open(dir, &config()).unwrap();
        let other = dir.join("rlock.otherhost:1");
        fs::write(&other, "otherhost:1").unwrap();

        for n in 0..15 {
            let ix = insert_sample(&mut db, n);
            db.set_status(ix, Flags::SEEN).unwrap();
        }
        assert_eq!(30, change_lines(dir));
        assert_eq!(
            "5 0\n",
            fs::read_to_string(dir.join("index.info")).unwrap()
        );

        // Once the other reader goes stale, its lock is purged and the
        // compaction goes ahead
        lock::backdate(&other, 3 * 3600);
        db.sync().unwrap();
        assert!(!other.exists());
        assert!(!dir.join("index.changes").exists());
        assert_eq!(
            "5 15\n",
            fs::read_to_string(dir.join("index.info")).unwrap()
        );
    }

    #[test]
    fn reload_after_foreign_compaction() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut a = Database::open(dir, &config()).unwrap();
        for n in 0..4 {
            insert_sample(&mut a, n);
        }
        a.delete(&[0]).unwrap();

        // Something else compacts the index; here the handle's identity
        // is shared, so it does not count as another reader
        let mut b = Database::open(dir, &config()).unwrap();
        pad_until_compacted(&mut b, 1);
        insert_sample(&mut b, 10);
        assert_eq!(4, b.len());

        a.sync().unwrap();
        assert_eq!(4, a.len());
        assert_eq!("Message 1", a.get(0).unwrap().subject);
        assert_eq!("Message 10", a.get(3).unwrap().subject);
    }

    #[test]
    fn rlock_kept_while_any_handle_open() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let a = Database::open(dir, &config()).unwrap();
        let b = Database::open(dir, &config()).unwrap();
        assert_eq!(1, rlocks(dir));

        b.close();
        assert_eq!(1, rlocks(dir));
        // Another process still sees this one as a reader
        assert_eq!(
            1,
            lock::other_readers(
                dir,
                &dir.join("rlock.otherhost:9"),
                config().rlock_timeout()
            )
            .unwrap()
        );

        a.close();
        assert_eq!(0, rlocks(dir));
    }

    #[test]
    fn failed_insert_rolled_back() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut db = Database::open(dir, &config()).unwrap();
        insert_sample(&mut db, 1);
        let index_before = fs::read(dir.join("index")).unwrap();
        let changes_before = fs::read(dir.join("index.changes")).unwrap();

        // Something is squatting on the file name the next insert will use
        fs::create_dir(dir.join("dbase/receiver/2")).unwrap();

        let raw = sample_message(2);
        assert_matches!(
            Err(Error::Io(..)),
            db.insert(&NewEntry::from_message(&raw, sample_date()), &raw)
        );
        assert_eq!(index_before, fs::read(dir.join("index")).unwrap());
        assert_eq!(
            changes_before,
            fs::read(dir.join("index.changes")).unwrap()
        );
        assert!(dir.join("dbase/receiver/2").is_dir());
        assert_eq!(1, db.len());
        assert!(!dir.join("lock").exists());

        // The sequence number was used up, so the next one works
        assert_eq!(1, insert_sample(&mut db, 3));
        assert_eq!("receiver/3", db.get(1).unwrap().filename);
    }

    #[test]
    fn partial_change_line_left_for_later() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut db = Database::open(dir, &config()).unwrap();
        insert_sample(&mut db, 1);

        let mut changes = fs::OpenOptions::new()
            .append(true)
            .open(dir.join("index.changes"))
            .unwrap();
        changes.write_all(b"s 0 R").unwrap();
        db.sync().unwrap();
        assert_eq!(Flags::empty(), db.get(0).unwrap().status);

        changes.write_all(b"F\nbogus\n").unwrap();
        db.sync().unwrap();
        assert_eq!(Flags::SEEN | Flags::FLAGGED, db.get(0).unwrap().status);
    }
}
