//! Client side of the syscall relay.
//!
//! A [RumpClient] forwards system calls to a separately running rump kernel over one or more
//! channels, and keeps the kernel's view of this process consistent while the host process
//! forks, vforks, execs and shuffles its descriptors.
//!
//! Most programs use the process-wide session from [global], configured from the environment:
//!
//! ```no_run
//! let client = rumpclient::global()?;
//! client.init()?;
//! let pid = client.getpid()?;
//! # Ok::<(), rumpclient::RelayError>(())
//! ```

use std::sync::OnceLock;

mod channel;
mod client;
mod config;
mod error;
mod exec;
mod fdnotify;
mod fork;

pub use channel::Channel;
pub use client::{RemoteIdentity, RumpClient, MAX_CHANNELS};
pub use config::*;
pub use error::*;
pub use exec::ExecFd;
pub use fdnotify::CloseVariant;
pub use fork::{ForkOutcome, ForkToken, VforkChild};

static GLOBAL: OnceLock<RumpClient> = OnceLock::new();

/// The process-wide session, configured by [ClientConfig::from_env] on first use.
pub fn global() -> Result<&'static RumpClient, RelayError> {
    if let Some(client) = GLOBAL.get() {
        return Ok(client);
    }
    let client = RumpClient::from_env()?;
    Ok(GLOBAL.get_or_init(|| client))
}

#[doc(hidden)]
pub mod __private {
    pub use libc;

    pub use crate::fork::vfork_child_main;

    pub fn last_os_error() -> std::io::Error {
        std::io::Error::last_os_error()
    }
}
