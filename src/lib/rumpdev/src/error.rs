use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pseudo-device registry is full ({capacity} descriptors)")]
    #[diagnostic(help("raise the registry capacity in the boot configuration"))]
    CapacityExceeded { capacity: usize },
}

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum AutoconfError {
    #[error("root device {name} not configured")]
    RootNotConfigured { name: String },
    #[error("failed to attach {name}{unit}: {reason}")]
    AttachFailed {
        name: String,
        unit: u32,
        reason: String,
    },
}
