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


use std::io::{self, BufRead};

use chrono::prelude::*;

use super::expire::ExpireAction;
use crate::store::model::{Flags, Headers};

/// The number of lines making up one record in `index`.
pub const FIELDS: usize = 13;

/// The metadata for one message in the database.
///
/// In `index`, every field occupies one line, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbEntry {
    pub to: String,
    pub from: String,
    pub cc: String,
    pub message_id: String,
    pub references: String,
    pub subject: String,
    /// Unix time.
    pub date: i64,
    pub keywords: String,
    pub size: u64,
    pub status: Flags,
    /// Unix time at which the expiry action runs, or 0 for never.
    pub expiration_time: i64,
    pub expiration_type: ExpireAction,
    /// Path of the message file, relative to `dbase/`.
    pub filename: String,
}

impl DbEntry {
    /// Format this entry as an `index` record.
    pub fn to_record(&self) -> String {
        let mut s = String::new();
        for field in &[
            &self.to,
            &self.from,
            &self.cc,
            &self.message_id,
            &self.references,
            &self.subject,
        ] {
            s.push_str(&one_line(field));
            s.push('\n');
        }

        s.push_str(&format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.date,
            one_line(&self.keywords),
            self.size,
            self.status.to_status(),
            self.expiration_time,
            self.expiration_type,
            one_line(&self.filename),
        ));
        s
    }

    /// Read one record from `r`.
    ///
    /// Returns `Ok(None)` if the record is truncated or a numeric field is
    /// unparsable; the caller knows where it started reading and can report
    /// that.
    pub fn read_record(r: &mut impl BufRead) -> io::Result<Option<Self>> {
        let mut lines = Vec::with_capacity(FIELDS);
        let mut line = String::new();
        for _ in 0..FIELDS {
            line.clear();
            if 0 == r.read_line(&mut line)? || !line.ends_with('\n') {
                return Ok(None);
            }
            line.pop();
            lines.push(line.clone());
        }

        let mut lines = lines.into_iter();
        let mut next = || lines.next().unwrap_or_default();
        let (to, from, cc, message_id, references, subject) =
            (next(), next(), next(), next(), next(), next());
        let date = next().parse::<i64>();
        let keywords = next();
        let size = next().parse::<u64>();
        let status = Flags::from_status(&next());
        let expiration_time = next().parse::<i64>();
        let expiration_type = next().parse::<ExpireAction>();
        let filename = next();

        match (date, size, expiration_time, expiration_type) {
            (Ok(date), Ok(size), Ok(expiration_time), Ok(expiration_type)) => {
                Ok(Some(DbEntry {
                    to,
                    from,
                    cc,
                    message_id,
                    references,
                    subject,
                    date,
                    keywords,
                    size,
                    status,
                    expiration_time,
                    expiration_type,
                    filename,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// A message about to be inserted into the database.
///
/// This is a `DbEntry` minus the fields the database assigns itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewEntry {
    pub to: String,
    pub from: String,
    pub cc: String,
    pub message_id: String,
    pub references: String,
    pub subject: String,
    pub date: i64,
    pub keywords: String,
    pub status: Flags,
    pub expiration_time: i64,
    pub expiration_type: ExpireAction,
}

impl NewEntry {
    /// Derive the header fields of a new entry from the raw message.
    ///
    /// If the message has no usable `Date` header, `fallback_date` is used.
    pub fn from_message(raw: &[u8], fallback_date: DateTime<Utc>) -> Self {
        let headers = Headers::parse(raw);
        let references = match headers.get("References") {
            Some(r) => r.to_owned(),
            None => headers.text("In-Reply-To").to_owned(),
        };

        NewEntry {
            to: headers.text("To").to_owned(),
            from: headers.text("From").to_owned(),
            cc: headers.text("Cc").to_owned(),
            message_id: headers.text("Message-ID").to_owned(),
            references,
            subject: headers.text("Subject").to_owned(),
            date: headers
                .date()
                .map(|d| d.timestamp())
                .unwrap_or_else(|| fallback_date.timestamp()),
            ..NewEntry::default()
        }
    }

    pub(super) fn into_entry(self, size: u64, filename: String) -> DbEntry {
        DbEntry {
            to: self.to,
            from: self.from,
            cc: self.cc,
            message_id: self.message_id,
            references: self.references,
            subject: self.subject,
            date: self.date,
            keywords: self.keywords,
            size,
            status: self.status,
            expiration_time: self.expiration_time,
            expiration_type: self.expiration_type,
            filename,
        }
    }
}

/// Replace line breaks with spaces so `s` fits on one index line.
pub fn one_line(s: &str) -> String {
    s.replace(|c| '\n' == c || '\r' == c, " ")
}
