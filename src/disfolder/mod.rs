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

//! Disconnected folders: a local cache of a remote mailbox which can be used
//! and modified while offline, and brought back in line with the remote by
//! a sync pass.

pub mod change_log;
pub mod checkpoint;
pub mod folder;
pub mod sync;
pub mod uid_map;
pub mod uploads;
