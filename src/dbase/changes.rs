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


//! The lines of `index.changes`.
//!
//! `k` lines carry their payload as a Tcl list, so this module also has the
//! minimal amount of Tcl list quoting needed to read and write them.

use std::fmt;

use super::expire::ExpireAction;
use crate::store::model::Flags;

/// One entry in `index.changes`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// `a <offset>`: the record starting at `offset` in `index` was added.
    Add { offset: u64 },
    /// `d <index>`: the record was deleted.
    Delete { index: usize },
    /// `s <index> <status>`
    Status { index: usize, status: Flags },
    /// `k {<indices>} <keywords> <time> <type>`
    Info {
        indices: Vec<usize>,
        keywords: String,
        expiration_time: i64,
        expiration_type: ExpireAction,
    },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Change::Add { offset } => write!(f, "a {}", offset),
            Change::Delete { index } => write!(f, "d {}", index),
            Change::Status { index, status } => {
                write!(f, "s {} {}", index, status.to_status())
            }
            Change::Info {
                ref indices,
                ref keywords,
                expiration_time,
                ref expiration_type,
            } => {
                let indices = indices
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                write!(
                    f,
                    "k {}",
                    tcl_list(&[
                        &indices,
                        keywords,
                        &expiration_time.to_string(),
                        &expiration_type.to_string(),
                    ])
                )
            }
        }
    }
}

impl Change {
    /// Parse one line (without its terminator). Returns `None` if the line
    /// is malformed.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(2, ' ');
        let (kind, rest) = (parts.next()?, parts.next()?);

        match kind {
            "a" => Some(Change::Add {
                offset: rest.parse().ok()?,
            }),
            "d" => Some(Change::Delete {
                index: rest.parse().ok()?,
            }),
            "s" => {
                let mut parts = rest.splitn(2, ' ');
                let index = parts.next()?.parse().ok()?;
                Some(Change::Status {
                    index,
                    status: Flags::from_status(parts.next().unwrap_or("")),
                })
            }
            "k" => {
                let list = tcl_split(rest)?;
                if 4 != list.len() {
                    return None;
                }

                let indices = tcl_split(&list[0])?
                    .iter()
                    .map(|i| i.parse::<usize>().ok())
                    .collect::<Option<Vec<_>>>()?;
                Some(Change::Info {
                    indices,
                    keywords: list[1].clone(),
                    expiration_time: list[2].parse().ok()?,
                    expiration_type: list[3].parse().ok()?,
                })
            }
            _ => None,
        }
    }
}

fn is_special(c: char) -> bool {
    c.is_whitespace() || "{}\"\\[]$;".contains(c)
}

fn braces_balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => (),
        }
    }
    0 == depth
}

/// Quote `s` as a single Tcl list element.
pub fn tcl_quote(s: &str) -> String {
    if s.is_empty() {
        "{}".to_owned()
    } else if !s.contains(is_special) {
        s.to_owned()
    } else if braces_balanced(s) && !s.contains('\\') {
        format!("{{{}}}", s)
    } else {
        let mut quoted = String::with_capacity(s.len() * 2);
        for c in s.chars() {
            if is_special(c) {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        quoted
    }
}

pub fn tcl_list(elements: &[&str]) -> String {
    elements
        .iter()
        .map(|e| tcl_quote(e))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a Tcl list into its elements.
///
/// Handles brace-quoted and backslash-escaped elements, which is everything
/// `tcl_quote()` produces. Returns `None` for unbalanced braces.
pub fn tcl_split(s: &str) -> Option<Vec<String>> {
    let chars = s.chars().collect::<Vec<_>>();
    let mut elements = Vec::new();
    let mut i = 0;

    loop {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        if '{' == chars[i] {
            let start = i + 1;
            let mut depth = 1;
            i += 1;
            while i < chars.len() {
                match chars[i] {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if 0 == depth {
                            break;
                        }
                    }
                    '\\' => i += 1,
                    _ => (),
                }
                i += 1;
            }

            if depth != 0 || i >= chars.len() {
                return None;
            }
            elements.push(chars[start..i].iter().collect());
            i += 1;
            if i < chars.len() && !chars[i].is_whitespace() {
                return None;
            }
        } else {
            let mut element = String::new();
            while i < chars.len() && !chars[i].is_whitespace() {
                if '\\' == chars[i] && i + 1 < chars.len() {
                    i += 1;
                }
                element.push(chars[i]);
                i += 1;
            }
            elements.push(element);
        }
    }

    Some(elements)
}
