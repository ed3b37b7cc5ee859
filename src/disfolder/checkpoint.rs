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
use std::io;
use std::path::Path;

use log::warn;

use crate::support::error::Error;
use crate::support::file_ops;

/// How far a disconnected folder has synced with its master.
///
/// Stored in the `state` file as two lines, UID validity then last synced
/// UID. A UID validity of 0 means the folder has never synced and will adopt
/// whatever the remote reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxCheckpoint {
    pub remote_uid_validity: u64,
    pub last_synced_remote_uid: u64,
}

impl MailboxCheckpoint {
    /// Read the checkpoint at `path`. A missing file is the zero checkpoint;
    /// unparsable content is treated likewise.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let lines = file_ops::read_lines(path)?;
        let mut numbers = lines.iter().map(|l| l.trim().parse::<u64>().ok());
        match (numbers.next(), numbers.next()) {
            (Some(Some(remote_uid_validity)), Some(Some(last))) => {
                Ok(MailboxCheckpoint {
                    remote_uid_validity,
                    last_synced_remote_uid: last,
                })
            }
            (None, _) => Ok(MailboxCheckpoint::default()),
            _ => {
                warn!(
                    "{}: unparsable checkpoint, starting over",
                    path.display()
                );
                Ok(MailboxCheckpoint::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        file_ops::spit(
            path,
            format!(
                "{}\n{}\n",
                self.remote_uid_validity, self.last_synced_remote_uid
            )
            .as_bytes(),
        )?;
        Ok(())
    }

    /// Advance the last synced UID to `uid` if that moves it forward.
    pub fn advance(&mut self, uid: u64) {
        self.last_synced_remote_uid = self.last_synced_remote_uid.max(uid);
    }
}

/// The `master` file: which remote mailbox a disconnected folder mirrors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Master {
    /// The display name of the folder.
    pub name: String,
    /// The connection spec for the remote mailbox.
    pub spec: String,
}

impl Master {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                return Err(Error::BadMaster(path.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = data.lines();
        match (lines.next(), lines.next()) {
            (Some(name), Some(spec)) if !spec.trim().is_empty() => Ok(Master {
                name: name.to_owned(),
                spec: spec.trim().to_owned(),
            }),
            _ => Err(Error::BadMaster(path.to_owned())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if self.name.contains('\n') || self.spec.contains('\n') {
            return Err(Error::UnsafeName);
        }

        file_ops::spit(
            path,
            format!("{}\n{}\n", self.name, self.spec).as_bytes(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn checkpoint_round_trip() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("state");

        assert_eq!(
            MailboxCheckpoint::default(),
            MailboxCheckpoint::load(&path).unwrap()
        );

        let mut cp = MailboxCheckpoint {
            remote_uid_validity: 5,
            last_synced_remote_uid: 100,
        };
        cp.save(&path).unwrap();
        assert_eq!("5\n100\n", fs::read_to_string(&path).unwrap());
        assert_eq!(cp, MailboxCheckpoint::load(&path).unwrap());

        cp.advance(99);
        assert_eq!(100, cp.last_synced_remote_uid);
        cp.advance(105);
        assert_eq!(105, cp.last_synced_remote_uid);

        fs::write(&path, "garbage\n").unwrap();
        assert_eq!(
            MailboxCheckpoint::default(),
            MailboxCheckpoint::load(&path).unwrap()
        );
    }

    #[test]
    fn master_file() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("master");
        assert_matches!(Err(Error::BadMaster(..)), Master::load(&path));

        let master = Master {
            name: "INBOX".to_owned(),
            spec: "dir:/srv/mail/inbox".to_owned(),
        };
        master.save(&path).unwrap();
        assert_eq!(
            "INBOX\ndir:/srv/mail/inbox\n",
            fs::read_to_string(&path).unwrap()
        );
        assert_eq!(master, Master::load(&path).unwrap());

        fs::write(&path, "INBOX\n").unwrap();
        assert_matches!(Err(Error::BadMaster(..)), Master::load(&path));

        assert_matches!(
            Err(Error::UnsafeName),
            Master {
                name: "a\nb".to_owned(),
                spec: "dir:x".to_owned(),
            }
            .save(&path)
        );
    }
}
