//! mpris-idle-inhibit: keep a Wayland session awake while media plays.
//! - Watches MPRIS players on the session bus (zbus 3.x), signal-driven, no polling.
//! - Holds one `zwp_idle_inhibitor_v1` while any player reports Playing.
//! - Survives compositor restarts; exits if the session bus goes away.
//!
//! Notes:
//! - Single-threaded: one current-thread runtime, one task owning all state.
//! - No unsafe. Every exit path releases the inhibitor.

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery, clippy::perf)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod aggregator;
mod bus;
mod config;
mod daemon;
mod error;
mod logging;
mod player;
mod registry;
mod wayland;

use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use crate::{config::Config, daemon::Exit};

#[derive(Debug, Parser)]
#[command(version, about = "Inhibit Wayland idle while an MPRIS player is playing")]
struct Cli {
    /// Config file [default: $XDG_CONFIG_HOME/mpris-idle-inhibit/config.toml]
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "mpris_idle_inhibitd=trace" (RUST_LOG wins)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

fn setup(cli: &Cli) -> Result<Config> {
    let cfg = Config::load(cli.config.as_deref())?;
    let level = cli.log_level.as_deref().unwrap_or(&cfg.logging.level);
    logging::init(level, cfg.logging.format)?;
    Ok(cfg)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match setup(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("mpris-idle-inhibitd: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "starting");

    match daemon::run(&cfg.compositor).await {
        Ok(Exit::Signal) => ExitCode::SUCCESS,
        Ok(Exit::BusLost) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
