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


use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use chrono::prelude::*;
use log::{error, info, warn};
use structopt::StructOpt;

use super::main::{read_input, Context};
use crate::dbase::Database;
use crate::disfolder::folder::DisconnectedFolder;
use crate::disfolder::sync::SyncReport;
use crate::folder::{FolderBackend, UpdateMode};
use crate::store::model::{Flag, Flags};
use crate::store::remote::{ConnectionPool, SharedPool, StandardConnector};
use crate::support::error::Error;
use crate::support::safe_name::is_safe_name;
use crate::support::scheduler::{Scheduler, Tick};

#[derive(StructOpt)]
pub(super) enum FolderSubcommand {
    /// Set up a new disconnected folder.
    ///
    /// SPEC says where the master lives. Currently supported is
    /// `dir:/path/to/mailbox`, a Dismail directory mailbox.
    Create { name: String, spec: String },
    /// Add messages to a folder.
    ///
    /// The messages are uploaded to the master on the next sync.
    Import {
        name: String,
        /// The files to import. "-" reads standard input.
        #[structopt(parse(from_os_str), default_value = "-")]
        inputs: Vec<PathBuf>,
    },
    /// List the messages in a folder.
    List { name: String },
    /// Set or clear a flag on messages.
    ///
    /// FLAG is a flag name like `\Seen` or `flagged`, or a status letter.
    Flag {
        name: String,
        flag: Flag,
        /// Clear the flag instead of setting it.
        #[structopt(long)]
        clear: bool,
        #[structopt(required = true)]
        indices: Vec<usize>,
    },
    /// Permanently remove the messages marked deleted.
    Expunge { name: String },
    /// Synchronise folders with their masters.
    Sync {
        /// Sync even if nothing seems to have changed.
        #[structopt(long)]
        force: bool,
        /// The folders to sync [default: all]
        names: Vec<String>,
    },
    /// Show the sync state of a folder.
    Status { name: String },
    /// Keep folders synchronised until interrupted.
    ///
    /// This also keeps the database open, so that it is not compacted
    /// while a client may be holding raw record indices.
    Watch {
        /// The folders to watch [default: all]
        names: Vec<String>,
    },
}

pub(super) fn main(
    context: &Context,
    cmd: FolderSubcommand,
) -> Result<(), Error> {
    let pool = ConnectionPool::new(
        Box::new(StandardConnector),
        context.config.disconnected.connection_idle(),
    )
    .into_shared();

    match cmd {
        FolderSubcommand::Create { name, spec } => {
            let dir = folder_dir(context, &name)?;
            DisconnectedFolder::create_dir(&dir, &name, &spec)?;
            info!("Created disconnected folder {} for {}", name, spec);
        }

        FolderSubcommand::Import { name, inputs } => {
            let mut folder = open(context, &name, &pool)?;
            for input in &inputs {
                let raw = read_input(input)?;
                let uid = folder.insert(&raw, Flags::empty(), Utc::now())?;
                println!("{} {}", uid, input.display());
            }
            folder.close(false)?;
        }

        FolderSubcommand::List { name } => {
            let mut folder = open(context, &name, &pool)?;
            for index in 0..folder.len() {
                let info = folder.info(index)?;
                println!(
                    "{:>5} {:<6} {} {:<30.30} {}",
                    index,
                    info.flags.to_status(),
                    info.date.format("%Y-%m-%d %H:%M"),
                    info.from,
                    info.subject
                );
            }
            folder.close(false)?;
        }

        FolderSubcommand::Flag {
            name,
            flag,
            clear,
            indices,
        } => {
            let mut folder = open(context, &name, &pool)?;
            folder.set_flag(&indices, flag, !clear)?;
            folder.close(false)?;
        }

        FolderSubcommand::Expunge { name } => {
            let mut folder = open(context, &name, &pool)?;
            folder.close(true)?;
        }

        FolderSubcommand::Sync { force, names } => {
            for name in resolve_names(context, names)? {
                let mut folder = open(context, &name, &pool)?;
                let report = folder.sync(force)?;
                print_report(&name, &report);
                folder.close(false)?;
            }
        }

        FolderSubcommand::Status { name } => {
            let mut folder = open(context, &name, &pool)?;
            let checkpoint = folder.checkpoint();
            println!("name: {}", folder.master().name);
            println!("master: {}", folder.master().spec);
            println!("uid validity: {}", checkpoint.remote_uid_validity);
            println!("last synced: {}", checkpoint.last_synced_remote_uid);
            println!("messages: {}", folder.len());
            println!("pending changes: {}", folder.pending_changes()?.len());
            folder.close(false)?;
        }

        FolderSubcommand::Watch { names } => {
            watch(context, resolve_names(context, names)?, &pool)?;
        }
    }

    Ok(())
}

fn folder_dir(context: &Context, name: &str) -> Result<PathBuf, Error> {
    if !is_safe_name(name) {
        return Err(Error::UnsafeName);
    }
    Ok(context.folders_dir().join(name))
}

fn open(
    context: &Context,
    name: &str,
    pool: &SharedPool,
) -> Result<DisconnectedFolder, Error> {
    let mut folder =
        DisconnectedFolder::open(&folder_dir(context, name)?, pool.clone())?;
    folder.init()?;
    Ok(folder)
}

/// `names`, or if empty, every folder there is.
fn resolve_names(
    context: &Context,
    names: Vec<String>,
) -> Result<Vec<String>, Error> {
    if !names.is_empty() {
        return Ok(names);
    }

    let dir = context.folders_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().join("master").is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn print_report(name: &str, report: &SyncReport) {
    if report.skipped {
        println!("{}: up to date", name);
        return;
    }

    println!(
        "{}: {} replayed ({} deleted), {} downloaded, {} uploaded, \
         {} unresolved, {} vanished, {} flags updated",
        name,
        report.replayed.deleted + report.replayed.flags_applied,
        report.replayed.deleted,
        report.downloaded,
        report.uploaded,
        report.unresolved,
        report.vanished,
        report.flags_updated
    );
}

fn watch(
    context: &Context,
    names: Vec<String>,
    pool: &SharedPool,
) -> Result<(), Error> {
    let db = Database::open(context.dbase_dir(), &context.config.dbase)?;
    let mut folders = Vec::with_capacity(names.len());
    for name in names {
        let folder = open(context, &name, pool)?;
        folders.push((name, folder));
    }

    let mut scheduler = Scheduler::new();
    let now = Instant::now();
    scheduler.every(
        Tick::RlockHeartbeat,
        context.config.dbase.rlock_heartbeat(),
        now,
    );
    scheduler.every(
        Tick::ReapConnections,
        context.config.disconnected.connection_idle(),
        now,
    );
    scheduler.every(
        Tick::PollFolders,
        context.config.disconnected.poll_interval(),
        now,
    );

    poll(&mut folders);
    loop {
        if folders.is_empty() {
            info!("No folders left to watch");
            return Ok(());
        }

        if let Some(wait) = scheduler.until_next(Instant::now()) {
            thread::sleep(wait);
        }

        for tick in scheduler.due(Instant::now()) {
            match tick {
                Tick::RlockHeartbeat => {
                    if let Err(e) = db.touch_rlock() {
                        warn!("Failed to refresh database reader lock: {}", e);
                    }
                }
                Tick::ReapConnections => {
                    let closed = pool.lock().unwrap().reap(Instant::now());
                    if closed > 0 {
                        info!("Closed {} idle connections", closed);
                    }
                }
                Tick::PollFolders => poll(&mut folders),
            }
        }
    }
}

/// Sync every folder once. A folder whose master was recreated is dropped
/// from the list, since it can't sync again without intervention.
fn poll(folders: &mut Vec<(String, DisconnectedFolder)>) {
    let mut i = 0;
    while i < folders.len() {
        let (ref name, ref mut folder) = folders[i];
        match folder.sync(false) {
            Ok(report) => {
                if !report.skipped {
                    print_report(name, &report);
                }
                if let Err(e) = folder.update(UpdateMode::Checkpoint) {
                    warn!("{}: checkpoint failed: {}", name, e);
                }
                i += 1;
            }
            Err(e @ Error::UidValidityChanged { .. }) => {
                error!("{}: {}; no longer watching it", name, e);
                folders.remove(i);
            }
            Err(e) => {
                warn!("{}: sync failed, will retry: {}", name, e);
                i += 1;
            }
        }
    }
}
