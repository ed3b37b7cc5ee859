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
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::error;
use structopt::StructOpt;

use super::dbase::DbaseSubcommand;
use super::folder::FolderSubcommand;
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// The directory containing `dismail.toml`, the database and the
    /// disconnected folders [default: ~/.dismail]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Work with the local message database.
    Dbase(DbaseSubcommand),
    /// Work with disconnected folders.
    Folder(FolderSubcommand),
}

/// What every subcommand gets to work with.
pub(super) struct Context {
    pub(super) root: PathBuf,
    pub(super) config: SystemConfig,
}

impl Context {
    pub(super) fn dbase_dir(&self) -> PathBuf {
        self.root.join(&self.config.dbase.dir)
    }

    pub(super) fn folders_dir(&self) -> PathBuf {
        self.root.join(&self.config.disconnected.dir)
    }
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options =
        Options::from_clap(&match Options::clap().get_matches_safe() {
            Ok(matches) => matches,
            Err(
                e @ clap::Error {
                    kind: clap::ErrorKind::HelpDisplayed,
                    ..
                },
            )
            | Err(
                e @ clap::Error {
                    kind: clap::ErrorKind::VersionDisplayed,
                    ..
                },
            ) => {
                println!("{}", e.message);
                return;
            }
            Err(e) => {
                eprintln!("{}", e.message);
                EX_USAGE.exit()
            }
        });

    let root = options.root.unwrap_or_else(|| {
        match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".dismail"),
            None => {
                eprintln!(
                    "HOME is not set; use --root=/path/to/dismail to say \
                     where Dismail's files are."
                );
                EX_CONFIG.exit()
            }
        }
    });

    if let Err(e) = fs::create_dir_all(&root) {
        eprintln!("Unable to create '{}': {}", root.display(), e);
        EX_CANTCREAT.exit();
    }

    let config_path = root.join("dismail.toml");
    let config = if config_path.is_file() {
        match SystemConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Error in config file at '{}': {}",
                    config_path.display(),
                    e
                );
                EX_CONFIG.exit()
            }
        }
    } else {
        SystemConfig::default()
    };

    init_logging(&root);

    let context = Context { root, config };
    let result = match options.command {
        Command::Dbase(cmd) => super::dbase::main(&context, cmd),
        Command::Folder(cmd) => super::folder::main(&context, cmd),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{}", e);
        Sysexit::for_error(&e).exit();
    }
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        init_simple_log();
        return;
    }

    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            eprintln!(
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
            EX_CONFIG.exit();
        }
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_MAIL,
        hostname: None,
        process: env!("CARGO_PKG_NAME").to_owned(),
        pid: nix::unistd::getpid().as_raw(),
    };

    match syslog::unix(formatter) {
        Ok(logger) => {
            if log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .is_ok()
            {
                log::set_max_level(log::LevelFilter::Info);
            }
        }
        // Not fatal; this also happens in minimal containers with no syslog
        Err(e) => {
            eprintln!("Failed to connect to syslog: {}", e);
            init_simple_log();
        }
    }
}

fn init_simple_log() {
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} [{l}] {m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(
            Root::builder()
                .appender("stderr")
                .build(log::LevelFilter::Info),
        );

    match config {
        Ok(config) => {
            // Only fails if a logger is already installed
            let _ = log4rs::init_config(config);
        }
        Err(e) => eprintln!("Failed to configure logging: {}", e),
    }
}

/// Read an input file, where `-` means standard input.
pub(super) fn read_input(path: &Path) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    if Path::new("-") == path {
        io::stdin().lock().read_to_end(&mut data)?;
    } else {
        fs::File::open(path)?.read_to_end(&mut data)?;
    }
    Ok(data)
}
