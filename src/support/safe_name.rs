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

/// Determine whether the given name is "safe" to use as a single file system
/// element.
///
/// It excludes empty names and patterns that cause directory traversal or
/// hidden files on UNIX, as well as control characters.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() &&
        // Block directory traversal through .. and creation of hidden files
        name.chars().next() != Some('.') &&
        name.find('/').is_none() &&
        // Only a path separator on Windows, but always block since it has high
        // potential of causing problems
        name.find('\\').is_none() &&
        // Don't allow any ASCII control characters
        name.find(|c| c < ' ' || c == '\x7F').is_none()
}

/// Derive the name of the `dbase/` bucket directory for a message addressed
/// to `to`.
///
/// This is the local part of the first address, lower-cased, with anything
/// that would be awkward in a file name replaced by `_`. If nothing usable
/// remains, `default` is used.
pub fn bucket_name(to: &str) -> String {
    let first = to.split(',').next().unwrap_or("");
    // Prefer the angle-bracketed part of `Name <user@host>`
    let addr = match (first.find('<'), first.rfind('>')) {
        (Some(start), Some(end)) if start < end => &first[start + 1..end],
        _ => first,
    };
    let local = addr.split('@').next().unwrap_or("").trim();

    let bucket = local
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '+' || c == '_' {
                c.to_lowercase().next().unwrap_or('_')
            } else {
                '_'
            }
        })
        .collect::<String>();

    if is_safe_name(&bucket) && bucket.chars().any(|c| c != '_') {
        bucket
    } else {
        "default".to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_safe_name() {
        assert!(is_safe_name("foo"));
        assert!(is_safe_name("Entwürfe"));
        assert!(is_safe_name("foo.bar"));
        assert!(!is_safe_name("."));
        assert!(!is_safe_name(".."));
        assert!(!is_safe_name(".seq"));
        assert!(!is_safe_name("foo/bar"));
        assert!(!is_safe_name("foo\\bar"));
        assert!(!is_safe_name("foo\0"));
        assert!(!is_safe_name("fo\x7Fo"));
    }

    #[test]
    fn test_bucket_name() {
        assert_eq!("alice", bucket_name("alice@example.com"));
        assert_eq!("bob", bucket_name("Bob Smith <Bob@example.com>"));
        assert_eq!(
            "carol",
            bucket_name("carol@example.com, dave@example.com")
        );
        assert_eq!("first_last", bucket_name("first.last@example.com"));
        assert_eq!("default", bucket_name(""));
        assert_eq!("default", bucket_name("../@evil"));
        assert_eq!(
            "undisclosed-recipients__",
            bucket_name("undisclosed-recipients:;")
        );
    }
}
