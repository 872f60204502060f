//! A minimal kernel instance that relay clients connect to.
//!
//! The server keeps a table of remote processes, each with its own descriptor table, and
//! services the sysproxy protocol: handshakes, fork reservations, and a small set of descriptor
//! and identity syscalls. Each channel is served by its own thread.

use std::str::FromStr;

use miette::Diagnostic;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod config;
mod process;
mod server;

pub use config::*;
pub use process::{Description, FdEntry, ProcTable, RemoteProc};
pub use server::{RumpServer, ServerHandle};

#[derive(Debug, Error, Diagnostic)]
pub enum ServerError {
    #[error("configuration error: {reason}")]
    Config { reason: String },
    #[error("failed to bind {addr}")]
    #[diagnostic(help("is another server already listening there?"))]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Install a stderr fmt subscriber at `level`. Does nothing if one is already installed.
pub fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Like [init_logging], with the level taken from `RUMP_LOG` (default `info`).
pub fn init_logging_from_env() {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|l| Level::from_str(&l).ok())
        .unwrap_or(Level::INFO);
    init_logging(level);
}
