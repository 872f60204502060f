use std::{fmt::Display, str::FromStr};

use rumpsp::ServerAddr;

use crate::RelayError;

pub const SERVER_ENV: &str = "RUMP_SERVER";
pub const RETRY_ENV: &str = "RUMPCLIENT_RETRY";
/// Set across exec to hand the relay channel to the new image. Not for users.
pub const EXECFD_ENV: &str = "RUMPCLIENT__EXECFD";

/// What to do when the connection to the kernel is lost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    Forever,
    Once,
    ForSeconds(u64),
    /// Log and exit the process with status 1.
    Fatal,
}

impl FromStr for RetryPolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "forever" => RetryPolicy::Forever,
            "once" => RetryPolicy::Once,
            "fatal" => RetryPolicy::Fatal,
            secs => RetryPolicy::ForSeconds(secs.parse().map_err(|_| RelayError::Config {
                reason: format!("bad retry policy '{}'", s),
            })?),
        })
    }
}

impl Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::Forever => write!(f, "forever"),
            RetryPolicy::Once => write!(f, "once"),
            RetryPolicy::ForSeconds(n) => write!(f, "{}", n),
            RetryPolicy::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub server: ServerAddr,
    pub retry: RetryPolicy,
    /// Command name announced to the kernel.
    pub comm: String,
}

impl ClientConfig {
    pub fn new(server: ServerAddr) -> Self {
        Self {
            server,
            retry: RetryPolicy::default(),
            comm: default_comm(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_comm(mut self, comm: impl Into<String>) -> Self {
        self.comm = comm.into();
        self
    }

    /// Read `RUMP_SERVER` (required) and `RUMPCLIENT_RETRY`.
    pub fn from_env() -> Result<Self, RelayError> {
        let server = std::env::var(SERVER_ENV).map_err(|_| RelayError::Config {
            reason: format!("{} is not set", SERVER_ENV),
        })?;
        let server = server.parse().map_err(|e: rumpsp::ProtoError| RelayError::Config {
            reason: e.to_string(),
        })?;
        let retry = match std::env::var(RETRY_ENV) {
            Ok(v) => v.parse()?,
            Err(_) => RetryPolicy::default(),
        };
        Ok(Self::new(server).with_retry(retry))
    }
}

fn default_comm() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .and_then(|a| std::path::Path::new(a).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "rumpclient".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy() {
        assert_eq!("forever".parse::<RetryPolicy>().unwrap(), RetryPolicy::Forever);
        assert_eq!("once".parse::<RetryPolicy>().unwrap(), RetryPolicy::Once);
        assert_eq!("fatal".parse::<RetryPolicy>().unwrap(), RetryPolicy::Fatal);
        assert_eq!(
            "30".parse::<RetryPolicy>().unwrap(),
            RetryPolicy::ForSeconds(30)
        );
        assert!("sometimes".parse::<RetryPolicy>().is_err());
        assert!("-1".parse::<RetryPolicy>().is_err());
        for p in [
            RetryPolicy::Forever,
            RetryPolicy::Once,
            RetryPolicy::ForSeconds(5),
            RetryPolicy::Fatal,
        ] {
            assert_eq!(p.to_string().parse::<RetryPolicy>().unwrap(), p);
        }
    }

    #[test]
    fn builder() {
        let c = ClientConfig::new(ServerAddr::Unix("/tmp/k".into()))
            .with_retry(RetryPolicy::Once)
            .with_comm("ls");
        assert_eq!(c.retry, RetryPolicy::Once);
        assert_eq!(c.comm, "ls");
    }
}
