use std::{fmt::Display, path::PathBuf, str::FromStr};

use crate::ProtoError;

/// Where a kernel instance listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for ServerAddr {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ProtoError::BadAddress {
            addr: s.to_string(),
        };
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(bad());
            }
            Ok(ServerAddr::Unix(PathBuf::from(path)))
        } else if let Some(hostport) = s.strip_prefix("tcp://") {
            match hostport.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(ServerAddr::Tcp(hostport.to_string()))
                }
                _ => Err(bad()),
            }
        } else {
            Err(bad())
        }
    }
}

impl Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            ServerAddr::Tcp(hostport) => write!(f, "tcp://{}", hostport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(
            "unix:///tmp/rump.sock".parse::<ServerAddr>().unwrap(),
            ServerAddr::Unix("/tmp/rump.sock".into())
        );
        assert_eq!(
            "tcp://127.0.0.1:12345".parse::<ServerAddr>().unwrap(),
            ServerAddr::Tcp("127.0.0.1:12345".into())
        );
        assert_eq!(
            "unix:///a".parse::<ServerAddr>().unwrap().to_string(),
            "unix:///a"
        );
        for bad in ["", "unix://", "tcp://host", "tcp://:80", "tcp://h:port", "/tmp/x"] {
            assert!(bad.parse::<ServerAddr>().is_err(), "{}", bad);
        }
    }
}
