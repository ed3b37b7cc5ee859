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


use std::io::{self, Write};
use std::path::PathBuf;

use chrono::prelude::*;
use structopt::StructOpt;

use super::main::{read_input, Context};
use crate::dbase::entry::{DbEntry, NewEntry};
use crate::dbase::expire::ExpireAction;
use crate::dbase::search::Query;
use crate::dbase::Database;
use crate::store::model::Flags;
use crate::support::error::Error;

#[derive(StructOpt)]
pub(super) enum DbaseSubcommand {
    Insert(InsertSubcommand),
    /// List the entries matching a query.
    ///
    /// The query has the form
    ///
    /// [between START END] and|or [not] KEY VALUE [not] KEY VALUE...
    ///
    /// KEY is one of to, from, cc, subject, keywords, addresses, body, or
    /// within (which takes two unix times). Matching is by case-insensitive
    /// substring. Quote multi-word values with braces, e.g.
    /// `and subject {weekly report}`.
    Search {
        /// The query, in one or more arguments.
        query: Vec<String>,
    },
    /// Write the stored message of an entry to standard output.
    Show { index: usize },
    /// List every entry.
    List,
    /// Set the status of an entry.
    ///
    /// STATUS is a string of flag letters: R (seen), D (deleted), F
    /// (flagged), A (answered), T (draft), O (recent).
    Status { index: usize, status: String },
    /// Run the expiry actions which are due.
    Expire,
    /// Delete entries.
    ///
    /// The entries disappear immediately; their messages are removed the next
    /// time the index is compacted.
    Delete {
        #[structopt(required = true)]
        indices: Vec<usize>,
    },
}

/// Store messages in the database.
#[derive(StructOpt)]
pub(super) struct InsertSubcommand {
    /// Keywords to attach to the messages.
    #[structopt(short, long, default_value = "")]
    keywords: String,

    /// Expire the messages this many days from now.
    #[structopt(long)]
    expire_days: Option<u32>,

    /// What to do once the messages expire: none, delete, backup, incoming,
    /// or custom...
    #[structopt(long, default_value = "delete")]
    expire_action: ExpireAction,

    /// Initial status flags, as for `status`.
    #[structopt(long, default_value = "")]
    status: String,

    /// The files to insert. "-" reads standard input.
    #[structopt(parse(from_os_str), default_value = "-")]
    inputs: Vec<PathBuf>,
}

pub(super) fn main(
    context: &Context,
    cmd: DbaseSubcommand,
) -> Result<(), Error> {
    let mut db = Database::open(context.dbase_dir(), &context.config.dbase)?;

    match cmd {
        DbaseSubcommand::Insert(cmd) => insert(&mut db, cmd)?,

        DbaseSubcommand::Search { query } => {
            let query = query.join(" ").parse::<Query>()?;
            for index in db.search(&query)? {
                if let Some(entry) = db.get(index) {
                    print_entry(index, entry);
                }
            }
        }

        DbaseSubcommand::Show { index } => {
            let data = db.read_message(index)?;
            io::stdout().write_all(&data)?;
        }

        DbaseSubcommand::List => {
            for index in db.live_indices() {
                if let Some(entry) = db.get(index) {
                    print_entry(index, entry);
                }
            }
        }

        DbaseSubcommand::Status { index, status } => {
            db.set_status(index, Flags::from_status(&status))?;
        }

        DbaseSubcommand::Expire => {
            let report = db.expire(Utc::now())?;
            println!(
                "deleted: {}\nbacked up: {}\nmoved to incoming: {}",
                report.deleted, report.backed_up, report.moved_to_incoming
            );
            for archive in &report.archives {
                println!("archive: {}", archive.display());
            }
            for &(index, ref action) in &report.custom {
                println!("custom: {} {}", index, action);
            }
        }

        DbaseSubcommand::Delete { indices } => db.delete(&indices)?,
    }

    db.close();
    Ok(())
}

fn insert(db: &mut Database, cmd: InsertSubcommand) -> Result<(), Error> {
    let now = Utc::now();
    for input in &cmd.inputs {
        let raw = read_input(input)?;
        let mut new = NewEntry::from_message(&raw, now);
        new.keywords = cmd.keywords.clone();
        new.status = Flags::from_status(&cmd.status);
        if let Some(days) = cmd.expire_days {
            new.expiration_time =
                (now + chrono::Duration::days(days.into())).timestamp();
            new.expiration_type = cmd.expire_action.clone();
        }

        let index = db.insert(&new, &raw)?;
        println!("{} {}", index, input.display());
    }

    Ok(())
}

fn print_entry(index: usize, entry: &DbEntry) {
    let date = Utc
        .timestamp_opt(entry.date, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_owned());
    println!(
        "{:>5} {:<6} {} {:<30.30} {}",
        index,
        entry.status.to_status(),
        date,
        entry.from,
        entry.subject
    );
}
