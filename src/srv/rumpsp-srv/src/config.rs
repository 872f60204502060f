use rumpsp::ServerAddr;

use crate::ServerError;

pub const SERVER_ENV: &str = "RUMP_SERVER";
pub const LOG_ENV: &str = "RUMP_LOG";
pub const DEFAULT_MAX_PROCS: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: ServerAddr,
    /// Upper bound on live processes plus outstanding fork reservations.
    pub max_procs: usize,
}

impl ServerConfig {
    pub fn new(addr: ServerAddr) -> Self {
        Self {
            addr,
            max_procs: DEFAULT_MAX_PROCS,
        }
    }

    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs;
        self
    }

    /// Read the listen address from `RUMP_SERVER`.
    pub fn from_env() -> Result<Self, ServerError> {
        let addr = std::env::var(SERVER_ENV).map_err(|_| ServerError::Config {
            reason: format!("{} is not set", SERVER_ENV),
        })?;
        let addr = addr.parse().map_err(|e: rumpsp::ProtoError| ServerError::Config {
            reason: e.to_string(),
        })?;
        Ok(Self::new(addr))
    }
}
