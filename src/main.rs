/*
 * This file is part of raphael-thermal.
 *
 * Copyright (C) 2025 raphael-thermal contributors
 *
 * raphael-thermal is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * raphael-thermal is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with raphael-thermal. If not, see <https://www.gnu.org/licenses/>.
 */

//! raphael-thermald: thermal throttling daemon

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use raphael_thermal::constants::paths;
use raphael_thermal::service;
use raphael_thermal::settings::Settings;

const VERSION: &str = env!("CARGO_PKG_VERSION");

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn print_help() {
    eprintln!("raphael-thermald {} - thermal throttling daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    raphael-thermald [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH     Thermal configuration document");
    eprintln!("    -s, --settings PATH   Daemon settings file (default {})", paths::SETTINGS_FILE);
    eprintln!("    -j, --journal PATH    Append JSON-lines events to PATH");
    eprintln!("    -d, --dump            Print the state dump and exit");
    eprintln!("    -v, --version         Print version");
    eprintln!("    -h, --help            Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    THERMAL_LOG           Log filter (trace, debug, info, warn, error)");
}

struct Args {
    config: Option<PathBuf>,
    settings: PathBuf,
    journal: Option<PathBuf>,
    dump: bool,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        config: None,
        settings: PathBuf::from(paths::SETTINGS_FILE),
        journal: None,
        dump: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("raphael-thermald {}", VERSION);
                return Ok(None);
            }
            "-c" | "--config" => args.config = Some(it.next().context("--config requires a path")?.into()),
            "-s" | "--settings" => args.settings = it.next().context("--settings requires a path")?.into(),
            "-j" | "--journal" => args.journal = Some(it.next().context("--journal requires a path")?.into()),
            "-d" | "--dump" => args.dump = true,
            other => {
                print_help();
                anyhow::bail!("unknown argument: {other}");
            }
        }
    }
    Ok(Some(args))
}

fn init_logging() {
    let log_level = std::env::var("THERMAL_LOG").unwrap_or_else(|_| "info".to_string());

    if std::env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stderr", e),
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(io::stderr)
        .with_env_filter(&log_level)
        .init();
}

fn main() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    init_logging();
    info!("raphael-thermald {} starting", VERSION);

    let mut settings = Settings::load(&args.settings)
        .with_context(|| format!("loading settings from {}", args.settings.display()))?;
    if let Some(config) = args.config {
        settings.config_path = config;
    }
    if args.journal.is_some() {
        settings.journal_path = args.journal;
    }

    if args.dump {
        let thermal = service::build(&settings)?;
        let stdout = io::stdout();
        thermal.debug_dump(&mut stdout.lock()).context("writing dump")?;
        return Ok(());
    }

    if let Err(e) = ctrlc::set_handler(|| {
        info!("received SIGINT/SIGTERM, shutting down");
        SHUTDOWN.store(true, Ordering::Release);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    if let Err(e) = service::run(&settings, &SHUTDOWN) {
        error!("thermal service failed: {:#}", e);
        return Err(e);
    }
    info!("raphael-thermald stopped");
    Ok(())
}
