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

//! Exit codes from `sysexits.h`, and the mapping from our errors onto them.

use crate::support::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_DATAERR: Sysexit = Sysexit(65);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_CANTCREAT: Sysexit = Sysexit(73);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    /// Choose the exit code that best describes `err`.
    pub fn for_error(err: &Error) -> Self {
        match *err {
            Error::LockTimeout(..)
            | Error::Cancelled(..)
            | Error::SessionLost
            | Error::Remote(..) => EX_TEMPFAIL,
            Error::UidValidityChanged { .. }
            | Error::UnsupportedConnection(..)
            | Error::BadMaster(..)
            | Error::Toml(..) => EX_CONFIG,
            Error::DbaseVersion { .. }
            | Error::CorruptRecord(..)
            | Error::CorruptInfo => EX_DATAERR,
            Error::NxRecord | Error::NxMessage => EX_NOINPUT,
            Error::BadQuery(..) | Error::UnsafeName => EX_USAGE,
            Error::Offline => EX_UNAVAILABLE,
            Error::Io(..) | Error::Nix(..) => EX_IOERR,
        }
    }
}
