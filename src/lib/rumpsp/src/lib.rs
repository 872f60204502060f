//! The sysproxy protocol spoken between relay clients and a kernel instance.
//!
//! Every message is a [FrameHeader] followed by `len` payload bytes. Requests travel from client
//! to kernel, and each is answered by exactly one response or error frame carrying the same
//! request number. A channel carries one outstanding request at a time.

pub mod addr;
pub mod error;
pub mod frame;
pub mod message;
pub mod sysno;

pub use addr::ServerAddr;
pub use error::*;
pub use frame::{FrameHeader, HEADER_LEN, MAX_PAYLOAD};
pub use message::{
    pack_args, read_request, read_response, unpack_args, write_request, write_response, Cookie,
    Handshake, Request, Response,
};
