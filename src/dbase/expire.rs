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


use std::convert::Infallible;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::prelude::*;
use flate2::write::GzEncoder;
use log::{info, warn};

use super::changes::Change;
use super::Database;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

/// What happens to a message once its expiration time has passed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpireAction {
    /// Nothing; the message is kept.
    None,
    Delete,
    /// Move the message into the backup directory, where it will eventually
    /// be compressed into an archive.
    Backup,
    /// Move the message into the incoming directory for re-import.
    Incoming,
    /// Something only the caller knows how to do. The value is the whole
    /// action string, which starts with `custom`.
    Custom(String),
}

impl Default for ExpireAction {
    fn default() -> Self {
        ExpireAction::None
    }
}

impl fmt::Display for ExpireAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ExpireAction::None => write!(f, "none"),
            ExpireAction::Delete => write!(f, "delete"),
            ExpireAction::Backup => write!(f, "backup"),
            ExpireAction::Incoming => write!(f, "incoming"),
            ExpireAction::Custom(ref action) => write!(f, "{}", action),
        }
    }
}

/// Anything unrecognised means `Delete`.
impl FromStr for ExpireAction {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Infallible> {
        Ok(match s {
            "" | "none" => ExpireAction::None,
            "backup" => ExpireAction::Backup,
            "incoming" => ExpireAction::Incoming,
            s if s.starts_with("custom") => ExpireAction::Custom(s.to_owned()),
            _ => ExpireAction::Delete,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpireReport {
    pub deleted: usize,
    pub backed_up: usize,
    pub moved_to_incoming: usize,
    /// Expired entries with a custom action, which the caller must carry
    /// out itself. They are left in the database.
    pub custom: Vec<(usize, String)>,
    /// Archives written because enough backed up messages accumulated.
    pub archives: Vec<PathBuf>,
}

impl Database {
    /// Run the expiry action of every entry whose expiration time is at or
    /// before `now`.
    pub fn expire(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<ExpireReport, Error> {
        let _lock = self.lock()?;
        self.sync_locked()?;

        let backup_dir = self.dir.join(&self.config.backup_dir);
        let incoming_dir = self.dir.join(&self.config.incoming_dir);
        let mut report = ExpireReport::default();
        let mut expired = 0;

        for index in self.live_indices() {
            let entry = &self.records[index].entry;
            if 0 == entry.expiration_time
                || entry.expiration_time > now.timestamp()
            {
                continue;
            }

            let message_path = self.message_path(&entry.filename);
            match entry.expiration_type {
                ExpireAction::None => continue,
                ExpireAction::Delete => report.deleted += 1,
                ExpireAction::Backup => {
                    move_out(&message_path, &backup_dir, &entry.filename)?;
                    report.backed_up += 1;
                }
                ExpireAction::Incoming => {
                    move_out(&message_path, &incoming_dir, &entry.filename)?;
                    report.moved_to_incoming += 1;
                }
                ExpireAction::Custom(ref action) => {
                    report.custom.push((index, action.clone()));
                    continue;
                }
            }

            // Written per entry so a failure part way through doesn't leave
            // records pointing at moved files
            self.append_change(&Change::Delete { index })?;
            expired += 1;
        }

        if expired > 0 {
            self.sync_locked()?;
        }

        if report.backed_up > 0 {
            if let Some(archive) =
                archive_backups(&backup_dir, self.config.backup_batch, now)?
            {
                report.archives.push(archive);
            }
        }

        info!(
            "{} Expired {} entries ({} deleted, {} backed up, {} to \
             incoming, {} custom)",
            self.log_prefix,
            expired + report.custom.len(),
            report.deleted,
            report.backed_up,
            report.moved_to_incoming,
            report.custom.len()
        );
        Ok(report)
    }
}

/// Move `src` into `dir`, naming it after its `dbase/`-relative `filename`.
fn move_out(src: &Path, dir: &Path, filename: &str) -> Result<(), Error> {
    fs::create_dir_all(dir)?;
    let dst = dir.join(filename.replace('/', "_"));
    match file_ops::move_file(src, &dst) {
        Ok(()) => Ok(()),
        Err(e) if io::ErrorKind::NotFound == e.kind() => {
            warn!("{}: already gone", src.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// If at least `batch` loose messages are in `backup_dir`, compress them
/// all into one gzip'd mbox and delete the originals.
fn archive_backups(
    backup_dir: &Path,
    batch: usize,
    now: DateTime<Utc>,
) -> Result<Option<PathBuf>, Error> {
    let mut loose = Vec::new();
    for entry in fs::read_dir(backup_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.file_type()?.is_file()
            && !name.starts_with('.')
            && !name.ends_with(".mbox.gz")
        {
            loose.push(entry.path());
        }
    }

    if loose.is_empty() || loose.len() < batch {
        return Ok(None);
    }
    loose.sort();

    let mut tmp = tempfile::NamedTempFile::new_in(backup_dir)?;
    {
        let mut w = GzEncoder::new(
            tmp.as_file_mut(),
            flate2::Compression::default(),
        );
        for path in &loose {
            write_mbox_message(&mut w, &fs::read(path)?, now)?;
        }
        w.finish()?;
    }
    tmp.as_file_mut().sync_all()?;

    // Never replace an earlier archive from the same second
    let mut suffix = 0;
    let archive = loop {
        let name = if 0 == suffix {
            format!("backup-{}.mbox.gz", now.timestamp())
        } else {
            format!("backup-{}.{}.mbox.gz", now.timestamp(), suffix)
        };
        let archive = backup_dir.join(name);
        match tmp.persist_noclobber(&archive) {
            Ok(_) => break archive,
            Err(e) if io::ErrorKind::AlreadyExists == e.error.kind() => {
                tmp = e.file;
                suffix += 1;
            }
            Err(e) => return Err(e.error.into()),
        }
    };

    for path in &loose {
        fs::remove_file(path).ignore_not_found()?;
    }

    info!(
        "Archived {} backed up messages into {}",
        loose.len(),
        archive.display()
    );
    Ok(Some(archive))
}

/// Write one message in mboxrd format.
fn write_mbox_message(
    w: &mut impl Write,
    message: &[u8],
    date: DateTime<Utc>,
) -> io::Result<()> {
    writeln!(
        w,
        "From dismail@localhost {}",
        date.format("%a %b %e %H:%M:%S %Y")
    )?;

    let mut lines = message.split(|&b| b'\n' == b).peekable();
    while let Some(line) = lines.next() {
        // The final empty piece after the trailing newline
        if line.is_empty() && lines.peek().is_none() {
            break;
        }

        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let unquoted = line
            .iter()
            .position(|&b| b'>' != b)
            .map_or(&line[line.len()..], |p| &line[p..]);
        if unquoted.starts_with(b"From ") {
            w.write_all(b">")?;
        }
        w.write_all(line)?;
        w.write_all(b"\n")?;
    }

    w.write_all(b"\n")
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    use super::super::entry::NewEntry;
    use super::super::test::{config, insert_sample};
    use super::*;
    use crate::support::system_config::DbaseConfig;
    use crate::test_support::*;

    #[test]
    fn parse_actions() {
        assert_eq!(ExpireAction::None, "none".parse().unwrap());
        assert_eq!(ExpireAction::None, "".parse().unwrap());
        assert_eq!(ExpireAction::Backup, "backup".parse().unwrap());
        assert_eq!(ExpireAction::Delete, "remove".parse().unwrap());
        assert_eq!(ExpireAction::Delete, "frobnicate".parse().unwrap());
        assert_eq!(
            ExpireAction::Custom("custom mv /x".to_owned()),
            "custom mv /x".parse().unwrap()
        );
        assert_eq!("incoming", ExpireAction::Incoming.to_string());
    }

    #[test]
    fn expire_actions() {
        crate::init_test_log();
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let mut db = Database::open(dir, &config()).unwrap();
        for n in 0..6 {
            insert_sample(&mut db, n);
        }

        let now = Utc.timestamp_opt(2_000_000_000, 0).unwrap();
        let past = now.timestamp() - 1;
        let future = now.timestamp() + 1;
        db.set_info(&[0], "", past, ExpireAction::Delete).unwrap();
        db.set_info(&[1], "", past, ExpireAction::Backup).unwrap();
        db.set_info(&[2], "", past, ExpireAction::Incoming).unwrap();
        db.set_info(&[3], "", past, "custom x".parse().unwrap())
            .unwrap();
        db.set_info(&[4], "", future, ExpireAction::Delete).unwrap();
        db.set_info(&[5], "", past, ExpireAction::None).unwrap();

        let report = db.expire(now).unwrap();
        assert_eq!(1, report.deleted);
        assert_eq!(1, report.backed_up);
        assert_eq!(1, report.moved_to_incoming);
        assert_eq!(vec![(3, "custom x".to_owned())], report.custom);
        assert!(report.archives.is_empty());

        assert_eq!(vec![3, 4, 5], db.live_indices());
        assert_eq!(
            sample_message(1),
            fs::read(dir.join("backup/receiver_2")).unwrap()
        );
        assert_eq!(
            sample_message(2),
            fs::read(dir.join("incoming/receiver_3")).unwrap()
        );
        assert!(!dir.join("dbase/receiver/2").exists());
        assert!(dir.join("dbase/receiver/1").exists());

        // Nothing new is due the second time round
        let report = db.expire(now).unwrap();
        assert_eq!(vec![(3, "custom x".to_owned())], report.custom);
        assert_eq!(0, report.deleted);
    }

    #[test]
    fn backups_archived_in_batches() {
        let tmpdir = TempDir::new().unwrap();
        let dir = tmpdir.path();
        let config = DbaseConfig {
            backup_batch: 3,
            ..config()
        };
        let mut db = Database::open(dir, &config).unwrap();
        let now = Utc.timestamp_opt(2_000_000_000, 0).unwrap();

        let raw = b"From: a@example.com\nTo: b@example.com\n\n\
                    From here on\n>From there\n";
        let mut new = NewEntry::from_message(raw, sample_date());
        new.expiration_time = now.timestamp();
        new.expiration_type = ExpireAction::Backup;
        for _ in 0..2 {
            db.insert(&new, raw).unwrap();
        }

        let report = db.expire(now).unwrap();
        assert_eq!(2, report.backed_up);
        assert!(report.archives.is_empty());

        db.insert(&new, raw).unwrap();
        let report = db.expire(now).unwrap();
        assert_eq!(1, report.backed_up);
        let archive = dir.join("backup/backup-2000000000.mbox.gz");
        assert_eq!(vec![archive.clone()], report.archives);
        assert_eq!(1, fs::read_dir(dir.join("backup")).unwrap().count());

        let mut mbox = String::new();
        GzDecoder::new(fs::File::open(&archive).unwrap())
            .read_to_string(&mut mbox)
            .unwrap();
        assert_eq!(3, mbox.matches("\nFrom dismail@localhost ").count() + 1);
        assert_eq!(3, mbox.matches("\n>From here on\n").count());
        assert_eq!(3, mbox.matches("\n>>From there\n").count());

        // A second batch within the same second gets its own archive
        let first = fs::read(&archive).unwrap();
        for _ in 0..3 {
            db.insert(&new, raw).unwrap();
        }
        let report = db.expire(now).unwrap();
        assert_eq!(3, report.backed_up);
        assert_eq!(
            vec![dir.join("backup/backup-2000000000.1.mbox.gz")],
            report.archives
        );
        assert_eq!(first, fs::read(&archive).unwrap());
        assert_eq!(2, fs::read_dir(dir.join("backup")).unwrap().count());
    }
}
