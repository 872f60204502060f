use std::io::{Read, Write};

use crate::{
    frame::{read_frame, write_frame, *},
    ProtoError,
};

/// Opaque token naming a remote process (attach cookie) or a pending fork.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Cookie(pub [u8; 16]);

impl Cookie {
    pub const LEN: usize = 16;

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; Self::LEN];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, ProtoError> {
        let raw: [u8; Self::LEN] = bytes.try_into().map_err(|_| ProtoError::Short {
            need: Self::LEN,
            got: bytes.len(),
        })?;
        Ok(Self(raw))
    }
}

/// How a new channel relates to remote process state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handshake {
    /// Create a fresh remote process.
    Guest { comm: String },
    /// Join the existing remote process named by the cookie.
    Attach(Cookie),
    /// Claim the remote child reserved by a prefork.
    Fork(Cookie),
    /// The process on this channel is about to exec into `comm`.
    Exec { comm: String },
}

impl Handshake {
    fn code(&self) -> u32 {
        match self {
            Handshake::Guest { .. } => HANDSHAKE_GUEST,
            Handshake::Attach(_) => HANDSHAKE_ATTACH,
            Handshake::Fork(_) => HANDSHAKE_FORK,
            Handshake::Exec { .. } => HANDSHAKE_EXEC,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Handshake::Guest { comm } | Handshake::Exec { comm } => comm.as_bytes().to_vec(),
            Handshake::Attach(c) | Handshake::Fork(c) => c.0.to_vec(),
        }
    }

    fn decode(code: u32, payload: &[u8]) -> Result<Self, ProtoError> {
        let comm = || String::from_utf8_lossy(payload).into_owned();
        Ok(match code {
            HANDSHAKE_GUEST => Handshake::Guest { comm: comm() },
            HANDSHAKE_ATTACH => Handshake::Attach(Cookie::from_slice(payload)?),
            HANDSHAKE_FORK => Handshake::Fork(Cookie::from_slice(payload)?),
            HANDSHAKE_EXEC => Handshake::Exec { comm: comm() },
            x => return Err(ProtoError::BadHandshake(x)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Handshake(Handshake),
    /// Syscall number followed by the packed argument block.
    Syscall { nr: u32, args: Vec<u8> },
    /// Reserve a remote child of the calling process.
    Prefork,
    /// Release a reservation whose host fork never happened.
    ForkCancel(Cookie),
}

impl Request {
    pub fn kind(&self) -> u16 {
        match self {
            Request::Handshake(_) => KIND_HANDSHAKE,
            Request::Syscall { .. } => KIND_SYSCALL,
            Request::Prefork => KIND_PREFORK,
            Request::ForkCancel(_) => KIND_FORKCANCEL,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// The remote pid bound to the channel, and the cookie further channels attach with.
    Handshake { pid: u32, cookie: Cookie },
    /// Kernel errno (0 on success) and the two return registers.
    Syscall { error: i32, retval: [u64; 2] },
    Prefork(Cookie),
    /// Empty acknowledgement.
    Done,
    /// The request failed before reaching the kernel proper.
    Error(i32),
}

pub fn write_request<W: Write>(w: &mut W, reqno: u64, req: &Request) -> Result<(), ProtoError> {
    let (handshake, payload) = match req {
        Request::Handshake(hs) => (hs.code(), hs.payload()),
        Request::Syscall { nr, args } => {
            let mut p = Vec::with_capacity(4 + args.len());
            p.extend_from_slice(&nr.to_le_bytes());
            p.extend_from_slice(args);
            (0, p)
        }
        Request::Prefork => (0, Vec::new()),
        Request::ForkCancel(c) => (0, c.0.to_vec()),
    };
    let hdr = FrameHeader::new(payload.len(), reqno, CLASS_REQ, req.kind(), handshake);
    write_frame(w, hdr, &payload)
}

pub fn read_request<R: Read>(r: &mut R) -> Result<(u64, Request), ProtoError> {
    let (hdr, payload) = read_frame(r)?;
    if hdr.class() != CLASS_REQ {
        return Err(ProtoError::BadClass(hdr.class()));
    }
    let req = match hdr.kind() {
        KIND_HANDSHAKE => Request::Handshake(Handshake::decode(hdr.handshake(), &payload)?),
        KIND_SYSCALL => {
            let (nr, args) = split_u32(&payload)?;
            Request::Syscall {
                nr,
                args: args.to_vec(),
            }
        }
        KIND_PREFORK => Request::Prefork,
        KIND_FORKCANCEL => Request::ForkCancel(Cookie::from_slice(&payload)?),
        x => return Err(ProtoError::BadKind(x)),
    };
    Ok((hdr.reqno(), req))
}

/// Answer request `reqno` of type `kind`.
pub fn write_response<W: Write>(
    w: &mut W,
    reqno: u64,
    kind: u16,
    resp: &Response,
) -> Result<(), ProtoError> {
    let mut class = CLASS_RESP;
    let payload = match resp {
        Response::Handshake { pid, cookie } => {
            let mut p = pid.to_le_bytes().to_vec();
            p.extend_from_slice(&cookie.0);
            p
        }
        Response::Syscall { error, retval } => {
            let mut p = error.to_le_bytes().to_vec();
            p.extend_from_slice(&retval[0].to_le_bytes());
            p.extend_from_slice(&retval[1].to_le_bytes());
            p
        }
        Response::Prefork(c) => c.0.to_vec(),
        Response::Done => Vec::new(),
        Response::Error(errno) => {
            class = CLASS_ERROR;
            errno.to_le_bytes().to_vec()
        }
    };
    let hdr = FrameHeader::new(payload.len(), reqno, class, kind, 0);
    write_frame(w, hdr, &payload)
}

pub fn read_response<R: Read>(r: &mut R) -> Result<(u64, Response), ProtoError> {
    let (hdr, payload) = read_frame(r)?;
    let resp = match hdr.class() {
        CLASS_ERROR => Response::Error(split_u32(&payload)?.0 as i32),
        CLASS_RESP => match hdr.kind() {
            KIND_HANDSHAKE => {
                let (pid, rest) = split_u32(&payload)?;
                Response::Handshake {
                    pid,
                    cookie: Cookie::from_slice(rest)?,
                }
            }
            KIND_SYSCALL => {
                let (error, rest) = split_u32(&payload)?;
                let vals = unpack_args(rest);
                if vals.len() != 2 {
                    return Err(ProtoError::Short {
                        need: 20,
                        got: payload.len(),
                    });
                }
                Response::Syscall {
                    error: error as i32,
                    retval: [vals[0], vals[1]],
                }
            }
            KIND_PREFORK => Response::Prefork(Cookie::from_slice(&payload)?),
            KIND_FORKCANCEL => Response::Done,
            x => return Err(ProtoError::BadKind(x)),
        },
        x => return Err(ProtoError::BadClass(x)),
    };
    Ok((hdr.reqno(), resp))
}

fn split_u32(payload: &[u8]) -> Result<(u32, &[u8]), ProtoError> {
    if payload.len() < 4 {
        return Err(ProtoError::Short {
            need: 4,
            got: payload.len(),
        });
    }
    let (head, rest) = payload.split_at(4);
    let mut raw = [0u8; 4];
    raw.copy_from_slice(head);
    Ok((u32::from_le_bytes(raw), rest))
}

/// Pack register-sized syscall arguments into a little-endian argument block.
pub fn pack_args(args: &[u64]) -> Vec<u8> {
    args.iter().flat_map(|a| a.to_le_bytes()).collect()
}

/// Inverse of [pack_args]. Trailing bytes that do not fill a whole argument are ignored.
pub fn unpack_args(block: &[u8]) -> Vec<u64> {
    block
        .chunks_exact(8)
        .map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            u64::from_le_bytes(raw)
        })
        .collect()
}
