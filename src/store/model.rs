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

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use chrono::prelude::*;

/// A system message flag.
///
/// Keywords are not flags in this sense; the database keeps them as free
/// text and remote mailboxes never see them.
///
/// The integer codes (`as_code()`) are what gets written to the `changes`
/// file of a disconnected folder and must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Seen,
    Deleted,
    Flagged,
    Answered,
    Draft,
    Recent,
}

impl Flag {
    pub const ALL: [Flag; 6] = [
        Flag::Seen,
        Flag::Deleted,
        Flag::Flagged,
        Flag::Answered,
        Flag::Draft,
        Flag::Recent,
    ];

    /// The flags which are copied from the remote master to the local cache.
    ///
    /// `\Recent` is per-session on the remote side so it is never copied.
    pub const SYNCED: [Flag; 5] = [
        Flag::Seen,
        Flag::Deleted,
        Flag::Flagged,
        Flag::Answered,
        Flag::Draft,
    ];

    pub fn as_code(self) -> u32 {
        match self {
            Flag::Seen => 0,
            Flag::Deleted => 1,
            Flag::Flagged => 2,
            Flag::Answered => 3,
            Flag::Draft => 4,
            Flag::Recent => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Flag::ALL.get(code as usize).copied()
    }

    /// The character representing this flag in a status string.
    pub fn status_char(self) -> char {
        match self {
            Flag::Seen => 'R',
            Flag::Deleted => 'D',
            Flag::Flagged => 'F',
            Flag::Answered => 'A',
            Flag::Draft => 'T',
            Flag::Recent => 'O',
        }
    }

    pub fn bit(self) -> Flags {
        match self {
            Flag::Seen => Flags::SEEN,
            Flag::Deleted => Flags::DELETED,
            Flag::Flagged => Flags::FLAGGED,
            Flag::Answered => Flags::ANSWERED,
            Flag::Draft => Flags::DRAFT,
            Flag::Recent => Flags::RECENT,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
        }
    }
}

impl FromStr for Flag {
    type Err = String;

    /// Accepts either the IMAP spelling (`\Seen`, any case, backslash
    /// optional) or the single status character.
    fn from_str(s: &str) -> Result<Self, String> {
        let bare = s.strip_prefix('\\').unwrap_or(s);
        for &flag in &Flag::ALL {
            let name = flag.to_string();
            if bare.eq_ignore_ascii_case(&name[1..])
                || (bare.len() == 1
                    && bare.eq_ignore_ascii_case(
                        flag.status_char().encode_utf8(&mut [0u8; 4]),
                    ))
            {
                return Ok(flag);
            }
        }

        Err(format!("Unknown flag: {}", s))
    }
}

bitflags! {
    /// A set of system flags.
    ///
    /// The canonical text form is a status string such as `RF`; see
    /// `Flag::status_char()`. Presence of `O` means the message is recent.
    #[derive(Default)]
    pub struct Flags: u8 {
        const SEEN = 1 << 0;
        const DELETED = 1 << 1;
        const FLAGGED = 1 << 2;
        const ANSWERED = 1 << 3;
        const DRAFT = 1 << 4;
        const RECENT = 1 << 5;
    }
}

impl Flags {
    pub fn has(self, flag: Flag) -> bool {
        self.contains(flag.bit())
    }

    pub fn with(mut self, flag: Flag, value: bool) -> Self {
        self.set(flag.bit(), value);
        self
    }

    /// Parse a status string. Unknown characters are ignored.
    pub fn from_status(status: &str) -> Self {
        status.chars().fold(Flags::empty(), |flags, ch| {
            match Flag::ALL.iter().find(|f| f.status_char() == ch) {
                Some(&f) => flags.with(f, true),
                None => flags,
            }
        })
    }

    pub fn to_status(self) -> String {
        Flag::ALL
            .iter()
            .filter(|&&f| self.has(f))
            .map(|f| f.status_char())
            .collect()
    }
}

/// The top-level header block of a message.
///
/// Only unfolding is done; no decoding of encoded words or addresses. Header
/// names are matched case-insensitively and the first occurrence wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut fields: Vec<(String, String)> = Vec::new();

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(&mut (_, ref mut value)) = fields.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }

            if let Some(colon) = line.find(':') {
                fields.push((
                    line[..colon].trim().to_owned(),
                    line[colon + 1..].trim().to_owned(),
                ));
            }
        }

        Headers { fields }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| v.as_str())
    }

    /// Like `get()`, but returns the empty string for missing headers.
    pub fn text(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    /// The parsed `Date` header, if present and valid.
    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        self.get("Date")
            .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
    }
}

/// The criteria used to find a freshly appended message in a remote store
/// that doesn't report the UID it assigned.
///
/// Every field must match the corresponding header exactly; a missing header
/// is matched by the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchCriteria {
    pub subject: String,
    pub in_reply_to: String,
    pub message_id: String,
    pub date: String,
}

impl MatchCriteria {
    pub fn for_headers(headers: &Headers) -> Self {
        MatchCriteria {
            subject: headers.text("Subject").to_owned(),
            in_reply_to: headers.text("In-Reply-To").to_owned(),
            message_id: headers.text("Message-ID").to_owned(),
            date: headers.text("Date").to_owned(),
        }
    }

    pub fn matches(&self, headers: &Headers) -> bool {
        *self == MatchCriteria::for_headers(headers)
    }
}

/// Status information reported by a remote mailbox when it is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteStatus {
    pub uid_validity: u64,
    /// The greatest UID currently assigned, or 0 if the mailbox has never
    /// held a message.
    pub last_uid: u64,
    pub exists: usize,
}

/// The flag state of one remote message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteFlags {
    pub uid: u64,
    pub flags: Flags,
}

/// A complete message fetched from the remote store.
#[derive(Clone, Debug)]
pub struct RemoteMessage {
    pub uid: u64,
    pub flags: Flags,
    pub internal_date: DateTime<Utc>,
    /// The full RFC 822 text, header and body.
    pub raw: Vec<u8>,
}

/// One message in a local mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalMessage {
    pub uid: u64,
    pub flags: Flags,
    pub date: DateTime<Utc>,
}
