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
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// The configuration for Dismail.
///
/// This is stored in a file named `dismail.toml` under the Dismail root,
/// which is typically `~/.dismail`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Options for the local message database.
    #[serde(default)]
    pub dbase: DbaseConfig,

    /// Options for disconnected folders.
    #[serde(default)]
    pub disconnected: DisconnectedConfig,
}

impl SystemConfig {
    /// Load the configuration from the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = fs::read_to_string(path)?;
        Ok(toml::from_str(&data)?)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DbaseConfig {
    /// The database directory. Relative paths are resolved against the
    /// Dismail root.
    pub dir: PathBuf,

    /// How long to sleep between attempts to take the database lock.
    pub lock_poll_millis: u64,

    /// How long to wait for the database lock before giving up.
    ///
    /// Lock hold times are short, so hitting this usually means something has
    /// gone wrong with another process.
    pub lock_timeout_secs: u64,

    /// A lock file older than this is assumed to belong to a process that
    /// died while holding it, and is removed.
    pub stale_lock_secs: u64,

    /// How often an open database refreshes its reader lock.
    pub rlock_heartbeat_secs: u64,

    /// Reader locks not refreshed for this long are considered dead. This
    /// must be comfortably longer than `rlock_heartbeat_secs`.
    pub rlock_timeout_secs: u64,

    /// The number of accumulated changes after which the index is compacted
    /// (provided nobody else is reading it).
    pub compact_threshold: usize,

    /// Where the `backup` expiry action puts messages. Relative paths are
    /// resolved against the database directory.
    pub backup_dir: PathBuf,

    /// How many backed up messages to accumulate before compressing them.
    pub backup_batch: usize,

    /// Where the `incoming` expiry action puts messages for re-import.
    /// Relative paths are resolved against the database directory.
    pub incoming_dir: PathBuf,
}

impl Default for DbaseConfig {
    fn default() -> Self {
        DbaseConfig {
            dir: "db".into(),
            lock_poll_millis: 200,
            lock_timeout_secs: 120,
            stale_lock_secs: 600,
            rlock_heartbeat_secs: 20 * 60,
            rlock_timeout_secs: 2 * 3600,
            compact_threshold: 20,
            backup_dir: "backup".into(),
            backup_batch: 50,
            incoming_dir: "incoming".into(),
        }
    }
}

impl DbaseConfig {
    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn stale_lock(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    pub fn rlock_heartbeat(&self) -> Duration {
        Duration::from_secs(self.rlock_heartbeat_secs)
    }

    pub fn rlock_timeout(&self) -> Duration {
        Duration::from_secs(self.rlock_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DisconnectedConfig {
    /// The directory holding one subdirectory per disconnected folder.
    /// Relative paths are resolved against the Dismail root.
    pub dir: PathBuf,

    /// How long an unused connection to a remote mailbox is kept open in case
    /// something wants it again.
    pub connection_idle_secs: u64,

    /// How often `folder watch` polls for new mail.
    pub poll_interval_secs: u64,
}

impl Default for DisconnectedConfig {
    fn default() -> Self {
        DisconnectedConfig {
            dir: "disconnected".into(),
            connection_idle_secs: 60,
            poll_interval_secs: 300,
        }
    }
}

impl DisconnectedConfig {
    pub fn connection_idle(&self) -> Duration {
        Duration::from_secs(self.connection_idle_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
