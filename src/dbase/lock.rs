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


//! Cross-process locking for a database directory.
//!
//! `lock` is held for the duration of any operation that reads or writes the
//! index files. `rlock.<host>:<pid>` files, one per process with the
//! database open, announce that somebody holds raw record indices, which
//! blocks compaction. Handles within one process share the file; it goes
//! away when the last of them is dropped.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::warn;

use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

const RLOCK_PREFIX: &str = "rlock.";

lazy_static! {
    /// Number of live `ReaderLock`s in this process, by rlock path.
    static ref READERS: Mutex<HashMap<PathBuf, usize>> =
        Mutex::new(HashMap::new());
}

static BREAK_SEQ: AtomicUsize = AtomicUsize::new(0);

/// `<host>:<pid>` for this process.
pub fn identity() -> String {
    let mut buf = [0u8; 256];
    let host = match nix::unistd::gethostname(&mut buf) {
        Ok(host) => host.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Failed to determine host name: {}", e);
            "localhost".to_owned()
        }
    };
    format!("{}:{}", host, std::process::id())
}

/// Timing of lock acquisition.
#[derive(Clone, Copy, Debug)]
pub struct LockTiming {
    pub poll: Duration,
    pub timeout: Duration,
    pub stale: Duration,
}

/// The exclusive lock on a database directory. Released on drop.
#[derive(Debug)]
pub struct DbLock {
    path: PathBuf,
}

impl DbLock {
    /// Acquire the lock in `dir`, waiting as long as `timing` permits.
    ///
    /// If `cancel` becomes set while waiting, gives up with
    /// `Error::Cancelled`.
    pub fn acquire(
        dir: &Path,
        timing: LockTiming,
        cancel: Option<&AtomicBool>,
    ) -> Result<Self, Error> {
        let path = dir.join("lock");
        let start = Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let lock = DbLock { path };
                    file.write_all(identity().as_bytes())?;
                    return Ok(lock);
                }
                Err(e) if io::ErrorKind::AlreadyExists == e.kind() => (),
                Err(e) => return Err(e.into()),
            }

            if file_ops::age(&path).map_or(false, |age| age >= timing.stale)
                && break_stale(&path, timing.stale)?
            {
                continue;
            }

            if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
                return Err(Error::Cancelled(path));
            }

            if start.elapsed() >= timing.timeout {
                return Err(Error::LockTimeout(path));
            }

            thread::sleep(timing.poll);
        }
    }
}

/// Remove the lock file at `path` if it is (still) older than `stale`.
///
/// The file is first renamed to a name unique to this call, so that only
/// the file actually inspected can be removed. If it turns out to be fresh,
/// i.e. another process broke the stale lock and took the lock in the
/// meantime, it is put back. Returns whether a stale lock was removed.
fn break_stale(path: &Path, stale: Duration) -> Result<bool, Error> {
    let aside = path.with_file_name(format!(
        "lock.stale.{}.{}",
        identity(),
        BREAK_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    match fs::rename(path, &aside) {
        Ok(()) => (),
        Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    if file_ops::age(&aside).map_or(false, |age| age >= stale) {
        let holder = fs::read_to_string(&aside).unwrap_or_default();
        warn!(
            "{}: breaking stale lock held by {}",
            path.display(),
            holder.trim()
        );
        fs::remove_file(&aside).ignore_not_found()?;
        return Ok(true);
    }

    // hard_link() won't replace a lock somebody created since the rename
    if let Err(e) = fs::hard_link(&aside, path) {
        warn!(
            "{}: failed to restore live lock moved aside: {}",
            path.display(),
            e
        );
    }
    fs::remove_file(&aside).ignore_not_found()?;
    Ok(false)
}

impl Drop for DbLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("{}: failed to release lock: {}", self.path.display(), e);
        }
    }
}

/// A claim on this process's `rlock` file. The file is removed when the
/// last claim on it is dropped.
#[derive(Debug)]
pub struct ReaderLock {
    path: PathBuf,
    key: PathBuf,
}

impl ReaderLock {
    pub fn create(dir: &Path) -> Result<Self, Error> {
        let name = format!("{}{}", RLOCK_PREFIX, identity());
        let path = dir.join(&name);
        let key = dir
            .canonicalize()
            .map(|d| d.join(&name))
            .unwrap_or_else(|_| path.clone());

        let mut readers = READERS.lock().unwrap();
        fs::write(&path, identity())?;
        *readers.entry(key.clone()).or_insert(0) += 1;
        Ok(ReaderLock { path, key })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refresh the modification time so other processes keep considering
    /// this reader alive.
    pub fn touch(&self) -> Result<(), Error> {
        fs::write(&self.path, identity())?;
        Ok(())
    }
}

impl Drop for ReaderLock {
    fn drop(&mut self) {
        let mut readers = READERS.lock().unwrap();
        match readers.get_mut(&self.key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return;
            }
            _ => {
                readers.remove(&self.key);
            }
        }

        if let Err(e) = fs::remove_file(&self.path).ignore_not_found() {
            warn!("{}: failed to remove: {}", self.path.display(), e);
        }
    }
}

/// Delete `rlock` files in `dir` which have not been refreshed within
/// `timeout`, returning how many were removed.
pub fn purge_stale_readers(
    dir: &Path,
    timeout: Duration,
) -> Result<usize, Error> {
    let mut purged = 0;
    for path in reader_files(dir)? {
        if file_ops::age(&path).map_or(false, |age| age >= timeout) {
            warn!("{}: removing stale reader lock", path.display());
            fs::remove_file(&path).ignore_not_found()?;
            purged += 1;
        }
    }
    Ok(purged)
}

/// Count the live `rlock` files in `dir` other than `own`.
pub fn other_readers(
    dir: &Path,
    own: &Path,
    timeout: Duration,
) -> Result<usize, Error> {
    Ok(reader_files(dir)?
        .into_iter()
        .filter(|p| p != own)
        .filter(|p| file_ops::age(p).map_or(false, |age| age < timeout))
        .count())
}

fn reader_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_str()
            .map_or(false, |n| n.starts_with(RLOCK_PREFIX))
        {
            files.push(entry.path());
        }
    }
    Ok(files)
}

/// Set the modification time of `path` to `secs_ago` seconds in the past.
#[cfg(test)]
pub fn backdate(path: &Path, secs_ago: i64) {
    use nix::sys::time::{TimeVal, TimeValLike};

    let then = TimeVal::seconds(chrono::Utc::now().timestamp() - secs_ago);
    nix::sys::stat::utimes(path, &then, &then).unwrap();
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;

    fn timing() -> LockTiming {
        LockTiming {
            poll: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
            stale: Duration::from_secs(600),
        }
    }

    #[test]
    fn lock_is_exclusive() {
        let tmpdir = TempDir::new().unwrap();
        let lock = DbLock::acquire(tmpdir.path(), timing(), None).unwrap();
        assert_eq!(
            identity(),
            fs::read_to_string(tmpdir.path().join("lock")).unwrap()
        );

        assert_matches!(
            Err(Error::LockTimeout(..)),
            DbLock::acquire(tmpdir.path(), timing(), None)
        );

        drop(lock);
        assert!(!tmpdir.path().join("lock").exists());
        DbLock::acquire(tmpdir.path(), timing(), None).unwrap();
    }

    #[test]
    fn cancelled_wait() {
        let tmpdir = TempDir::new().unwrap();
        let _lock = DbLock::acquire(tmpdir.path(), timing(), None).unwrap();

        let cancel = Arc::new(AtomicBool::new(true));
        let timing = LockTiming {
            timeout: Duration::from_secs(3600),
            ..timing()
        };
        assert_matches!(
            Err(Error::Cancelled(..)),
            DbLock::acquire(tmpdir.path(), timing, Some(&cancel))
        );
    }

    #[test]
    fn stale_lock_broken() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("lock");
        fs::write(&path, "otherhost:1").unwrap();
        backdate(&path, 3600);

        let _lock = DbLock::acquire(tmpdir.path(), timing(), None).unwrap();
        assert_eq!(identity(), fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn reader_locks() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let timeout = Duration::from_secs(7200);

        let own = ReaderLock::create(dir).unwrap();
        assert!(own.path().exists());
        assert_eq!(0, other_readers(dir, own.path(), timeout).unwrap());

        let other = dir.join("rlock.otherhost:1");
        fs::write(&other, "").unwrap();
        assert_eq!(1, other_readers(dir, own.path(), timeout).unwrap());

        backdate(&other, 7300);
        assert_eq!(0, other_readers(dir, own.path(), timeout).unwrap());
        assert_eq!(1, purge_stale_readers(dir, timeout).unwrap());
        assert!(!other.exists());
        assert!(own.path().exists());

        let path = own.path().to_owned();
        drop(own);
        assert!(!path.exists());
    }

    #[test]
    fn reader_lock_shared_within_process() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();

        let a = ReaderLock::create(dir).unwrap();
        let b = ReaderLock::create(dir).unwrap();
        assert_eq!(a.path(), b.path());

        drop(b);
        assert!(a.path().exists());

        let path = a.path().to_owned();
        drop(a);
        assert!(!path.exists());

        // A fresh claim after all are gone recreates the file
        let c = ReaderLock::create(dir).unwrap();
        assert!(c.path().exists());
    }

    #[test]
    fn live_lock_survives_late_break() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("lock");

        // Someone else saw the old lock as stale, but by the time they get
        // to break it, it was replaced by a live one
        fs::write(&path, "otherhost:2").unwrap();
        assert!(!break_stale(&path, Duration::from_secs(600)).unwrap());
        assert_eq!("otherhost:2", fs::read_to_string(&path).unwrap());
        assert_eq!(1, fs::read_dir(tmpdir.path()).unwrap().count());

        backdate(&path, 3600);
        assert!(break_stale(&path, Duration::from_secs(600)).unwrap());
        assert!(!path.exists());
        assert_eq!(0, fs::read_dir(tmpdir.path()).unwrap().count());

        // Nothing to break
        assert!(!break_stale(&path, Duration::from_secs(600)).unwrap());
    }
}
