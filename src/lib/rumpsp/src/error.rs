use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ProtoError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("short message: need {need} bytes, got {got}")]
    Short { need: usize, got: usize },
    #[error("payload of {len} bytes exceeds limit")]
    TooLarge { len: u64 },
    #[error("unknown message class {0}")]
    BadClass(u16),
    #[error("unknown message kind {0}")]
    BadKind(u16),
    #[error("unknown handshake type {0}")]
    BadHandshake(u32),
    #[error("expected a {expect} frame")]
    Unexpected { expect: &'static str },
    #[error("bad server address '{addr}'")]
    #[diagnostic(help("use unix:///path/to/socket or tcp://host:port"))]
    BadAddress { addr: String },
}

impl ProtoError {
    /// True if the underlying transport failed, as opposed to the peer sending garbage.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtoError::Io(_))
    }
}
