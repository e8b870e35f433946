//! proctor: command-line driver for the proctoring engine.
//!
//! ## Subcommands
//!
//! - `replay`: Run a scripted sensor timeline through a session
//! - `end-session`: Close a session in the store (idempotent)
//! - `report`: Print the full report of one session
//! - `sessions`: List stored sessions, newest first
//! - `health`: Daemon health

mod logging;
mod replay;
mod timeline;

use clap::{Parser, Subcommand};
use proctor_engine::{
    load_config, DaemonSessionStore, MemorySessionStore, ProctorError, SessionStore, StoreError,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use timeline::Timeline;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Engine(#[from] ProctorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Timeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser)]
#[command(name = "proctor")]
#[command(about = "Remote exam proctoring engine driver")]
#[command(version)]
struct Cli {
    /// Daemon socket (defaults to $PROCTOR_DAEMON_SOCKET or ~/.proctor/daemon.sock)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a sensor timeline through one session
    Replay {
        /// Timeline JSON file
        #[arg(value_name = "TIMELINE")]
        timeline: PathBuf,

        /// Use an in-memory store instead of the daemon
        #[arg(long)]
        memory: bool,

        /// Engine config (defaults to ~/.proctor/engine.toml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// End a session in the store; safe to repeat
    EndSession {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Print a session report
    Report {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// List sessions, newest first
    Sessions,

    /// Check daemon health
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "proctor command failed");
        eprintln!("proctor: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Replay {
            timeline,
            memory,
            config,
        } => {
            let engine_config = load_config(config.as_deref())?;
            let parsed = Timeline::load(&timeline).map_err(CliError::Timeline)?;
            let store: Arc<dyn SessionStore> = if memory {
                Arc::new(MemorySessionStore::new())
            } else {
                Arc::new(daemon_store(cli.socket)?)
            };
            replay::run(&parsed, engine_config, store, &mut out)?;
        }
        Commands::EndSession { session_id } => {
            let closed = daemon_store(cli.socket)?.end_session(&session_id)?;
            print_json(&mut out, &closed)?;
        }
        Commands::Report { session_id } => {
            let report = daemon_store(cli.socket)?.report(&session_id)?;
            print_json(&mut out, &report)?;
        }
        Commands::Sessions => {
            let sessions = daemon_store(cli.socket)?.list_sessions()?;
            print_json(&mut out, &sessions)?;
        }
        Commands::Health => {
            let health = daemon_store(cli.socket)?.health()?;
            print_json(&mut out, &health)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn daemon_store(socket: Option<PathBuf>) -> Result<DaemonSessionStore, StoreError> {
    match socket {
        Some(path) => Ok(DaemonSessionStore::new(path)),
        None => DaemonSessionStore::from_env(),
    }
}

fn print_json(out: &mut impl Write, value: &impl Serialize) -> Result<(), CliError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
