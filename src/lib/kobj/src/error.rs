//! Definitions for errors for object namespacing.
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KobjError {
    #[error("failed to allocate {size} bytes for string table")]
    Allocation { size: usize },
    #[error("string table offset {offset} is out of range (table is {len} bytes)")]
    BadStringOffset { offset: usize, len: usize },
    #[error("string at offset {offset} is not terminated")]
    Unterminated { offset: usize },
    #[error("string table cursor overflow: need {need} bytes, capacity {cap}")]
    CursorOverflow { need: usize, cap: usize },
    #[error("string table too large for 32-bit name offsets ({len} bytes)")]
    TableTooLarge { len: usize },
    #[error("object is missing a required section '{name}'")]
    MissingSection { name: String },
    #[error("unsupported object: {reason}")]
    Unsupported { reason: String },
    #[error("parse failed: {err}")]
    Parse {
        #[from]
        err: elf::ParseError,
    },
}
