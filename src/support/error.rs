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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe file or mailbox name")]
    UnsafeName,
    #[error("Timed out waiting for lock {0}")]
    LockTimeout(PathBuf),
    #[error("Gave up waiting for lock {0}")]
    Cancelled(PathBuf),
    #[error("Database format version {found} unsupported (expected {expected})")]
    DbaseVersion { found: u32, expected: u32 },
    #[error("Corrupt database record at byte offset {0}")]
    CorruptRecord(u64),
    #[error("Corrupt database info file")]
    CorruptInfo,
    #[error("No such database record")]
    NxRecord,
    #[error("No such message")]
    NxMessage,
    #[error(
        "Remote mailbox was recreated (UID validity was {stored}, \
         now {current})"
    )]
    UidValidityChanged { stored: u64, current: u64 },
    #[error("Connection to remote mailbox lost; reconnect required")]
    SessionLost,
    #[error("Remote mailbox operation failed: {0}")]
    Remote(String),
    #[error("Unsupported connection spec: {0}")]
    UnsupportedConnection(String),
    #[error("Folder is offline")]
    Offline,
    #[error("Malformed folder master file {0}")]
    BadMaster(PathBuf),
    #[error("Bad search expression: {0}")]
    BadQuery(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
