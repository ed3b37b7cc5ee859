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


//! Searching the database.
//!
//! A query is a list of terms combined with either "and" or "or", plus an
//! optional date window applied before anything else. The textual form is
//!
//! ```text
//! [between <start> <end>] and|or [not] <key> <value> [not] <key> <value>...
//! ```
//!
//! where the keys are `to`, `from`, `cc`, `subject`, `keywords`,
//! `addresses` (any of to, from and cc), `body`, and `within` (which takes
//! two unix times). Values containing spaces are brace-quoted as in Tcl.

use std::fs;
use std::str::FromStr;

use log::warn;
use regex::{Regex, RegexBuilder};

use super::changes::tcl_split;
use super::entry::DbEntry;
use super::Database;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Combine {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    To,
    From,
    Cc,
    Subject,
    Keywords,
}

impl Field {
    fn get(self, entry: &DbEntry) -> &str {
        match self {
            Field::To => &entry.to,
            Field::From => &entry.from,
            Field::Cc => &entry.cc,
            Field::Subject => &entry.subject,
            Field::Keywords => &entry.keywords,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Criterion {
    /// Case-insensitive substring of one field.
    Field(Field, String),
    /// Case-insensitive substring of any of to, from and cc.
    Addresses(String),
    /// Case-insensitive substring of the whole stored message.
    Body(String),
    /// Date within `start..=end`.
    Within { start: i64, end: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Term {
    pub negated: bool,
    pub criterion: Criterion,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub combine: Combine,
    pub terms: Vec<Term>,
    /// If set, only entries dated within `start..=end` are considered.
    pub window: Option<(i64, i64)>,
}

impl FromStr for Query {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let tokens = tcl_split(s)
            .ok_or_else(|| Error::BadQuery("unbalanced braces".to_owned()))?;
        let mut tokens = tokens.iter().map(String::as_str).peekable();

        let mut window = None;
        if Some(&"between") == tokens.peek() {
            tokens.next();
            window = Some((
                parse_time(tokens.next())?,
                parse_time(tokens.next())?,
            ));
        }

        let combine = match tokens.next() {
            Some("and") => Combine::And,
            Some("or") => Combine::Or,
            Some(other) => {
                return Err(Error::BadQuery(format!(
                    "expected 'and' or 'or', got '{}'",
                    other
                )))
            }
            None => return Err(Error::BadQuery("empty query".to_owned())),
        };

        let mut terms = Vec::new();
        while let Some(mut key) = tokens.next() {
            let negated = "not" == key;
            if negated {
                key = tokens.next().ok_or_else(|| {
                    Error::BadQuery("'not' at end of query".to_owned())
                })?;
            }

            let mut value = || {
                tokens.next().map(str::to_owned).ok_or_else(|| {
                    Error::BadQuery(format!("missing value for '{}'", key))
                })
            };
            let criterion = match key {
                "to" => Criterion::Field(Field::To, value()?),
                "from" => Criterion::Field(Field::From, value()?),
                "cc" => Criterion::Field(Field::Cc, value()?),
                "subject" => Criterion::Field(Field::Subject, value()?),
                "keywords" => Criterion::Field(Field::Keywords, value()?),
                "addresses" => Criterion::Addresses(value()?),
                "body" => Criterion::Body(value()?),
                "within" => Criterion::Within {
                    start: parse_time(Some(value()?.as_str()))?,
                    end: parse_time(Some(value()?.as_str()))?,
                },
                other => {
                    return Err(Error::BadQuery(format!(
                        "unknown search key '{}'",
                        other
                    )))
                }
            };

            terms.push(Term { negated, criterion });
        }

        Ok(Query {
            combine,
            terms,
            window,
        })
    }
}

fn parse_time(s: Option<&str>) -> Result<i64, Error> {
    let s = s.ok_or_else(|| Error::BadQuery("missing time".to_owned()))?;
    s.parse()
        .map_err(|_| Error::BadQuery(format!("bad time '{}'", s)))
}

enum Matcher {
    Field(Field, Regex),
    Addresses(Regex),
    Body(Regex),
    Within(i64, i64),
}

fn substring(text: &str) -> Result<Regex, Error> {
    RegexBuilder::new(&regex::escape(text))
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::BadQuery(e.to_string()))
}

impl Database {
    /// Return the indices of the live entries matching `query`, in index
    /// order.
    ///
    /// An empty list of terms matches every entry in the window.
    pub fn search(&mut self, query: &Query) -> Result<Vec<usize>, Error> {
        let matchers = query
            .terms
            .iter()
            .map(|term| {
                let matcher = match term.criterion {
                    Criterion::Field(field, ref text) => {
                        Matcher::Field(field, substring(text)?)
                    }
                    Criterion::Addresses(ref text) => {
                        Matcher::Addresses(substring(text)?)
                    }
                    Criterion::Body(ref text) => {
                        Matcher::Body(substring(text)?)
                    }
                    Criterion::Within { start, end } => {
                        Matcher::Within(start, end)
                    }
                };
                Ok((term.negated, matcher))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        {
            let _lock = self.lock()?;
            self.sync_locked()?;
        }

        let mut found = Vec::new();
        for index in self.live_indices() {
            let entry = &self.records[index].entry;
            if let Some((start, end)) = query.window {
                if entry.date < start || entry.date > end {
                    continue;
                }
            }

            let mut results = matchers
                .iter()
                .map(|&(negated, ref m)| negated != self.matches(entry, m));
            let hit = matchers.is_empty()
                || match query.combine {
                    Combine::And => results.all(|r| r),
                    Combine::Or => results.any(|r| r),
                };
            if hit {
                found.push(index);
            }
        }

        Ok(found)
    }

    fn matches(&self, entry: &DbEntry, matcher: &Matcher) -> bool {
        match *matcher {
            Matcher::Field(field, ref re) => re.is_match(field.get(entry)),
            Matcher::Addresses(ref re) => {
                re.is_match(&entry.to)
                    || re.is_match(&entry.from)
                    || re.is_match(&entry.cc)
            }
            Matcher::Body(ref re) => {
                match fs::read(self.message_path(&entry.filename)) {
                    Ok(data) => re.is_match(&String::from_utf8_lossy(&data)),
                    Err(e) => {
                        warn!(
                            "{} Can't search {}: {}",
                            self.log_prefix, entry.filename, e
                        );
                        false
                    }
                }
            }
            Matcher::Within(start, end) => {
                entry.date >= start && entry.date <= end
            }
        }
    }
}
