use miette::Diagnostic;
use rumpsp::{sysno::errno, ProtoError};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RelayError {
    #[error("configuration error: {reason}")]
    Config { reason: String },
    #[error("failed to connect to {addr}")]
    #[diagnostic(help("check that a rump kernel is listening at RUMP_SERVER"))]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("protocol error")]
    Protocol(#[source] ProtoError),
    #[error("connection to the rump kernel was lost")]
    Disconnected,
    #[error("remote kernel returned errno {0}")]
    Remote(i32),
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
    #[error("out of memory")]
    Allocation,
}

impl RelayError {
    /// The kernel was reached and refused the request.
    pub fn is_remote(&self) -> bool {
        matches!(self, RelayError::Remote(_))
    }

    /// The kernel, or this process's place in it, is gone. Attaching to a process the kernel has
    /// already dropped counts too.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            RelayError::Connect { .. } | RelayError::Disconnected | RelayError::Remote(errno::ESRCH)
        )
    }

    /// The errno for this failure, whether it came from the kernel or the host.
    pub fn errno(&self) -> Option<i32> {
        match self {
            RelayError::Remote(e) => Some(*e),
            RelayError::Os(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<ProtoError> for RelayError {
    fn from(value: ProtoError) -> Self {
        if value.is_transport() {
            RelayError::Disconnected
        } else {
            RelayError::Protocol(value)
        }
    }
}
