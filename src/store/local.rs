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

use std::sync::{Arc, Mutex};

use chrono::prelude::*;

use super::model::*;
use crate::support::error::Error;

/// A mailbox on local disk, holding the cached copy of a disconnected folder
/// or simply a plain local folder.
///
/// Messages are identified by a local UID which is assigned on append,
/// strictly increases, and is never reused.
pub trait LocalMailbox: Send {
    /// Return every message in ascending UID order.
    fn list(&mut self) -> Result<Vec<LocalMessage>, Error>;

    /// Append a message, returning its new UID.
    fn append(
        &mut self,
        raw: &[u8],
        flags: Flags,
        date: DateTime<Utc>,
    ) -> Result<u64, Error>;

    /// Read the full text of a message.
    fn read(&mut self, uid: u64) -> Result<Vec<u8>, Error>;

    /// Set or clear one flag on one message.
    fn set_flag(&mut self, uid: u64, flag: Flag, value: bool)
        -> Result<(), Error>;

    /// Permanently remove every message flagged `\Deleted`, returning the
    /// UIDs removed.
    fn expunge(&mut self) -> Result<Vec<u64>, Error>;
}

pub type SharedMailbox = Arc<Mutex<Box<dyn LocalMailbox>>>;

pub fn share(mailbox: impl LocalMailbox + 'static) -> SharedMailbox {
    Arc::new(Mutex::new(Box::new(mailbox)))
}
