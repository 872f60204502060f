use std::io::{Read, Write};

use static_assertions::const_assert_eq;
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::ProtoError;

pub const CLASS_REQ: u16 = 0;
pub const CLASS_RESP: u16 = 1;
pub const CLASS_ERROR: u16 = 2;

pub const KIND_HANDSHAKE: u16 = 0;
pub const KIND_SYSCALL: u16 = 1;
pub const KIND_PREFORK: u16 = 2;
pub const KIND_FORKCANCEL: u16 = 3;

pub const HANDSHAKE_GUEST: u32 = 0;
pub const HANDSHAKE_ATTACH: u32 = 1;
pub const HANDSHAKE_FORK: u32 = 2;
pub const HANDSHAKE_EXEC: u32 = 3;

/// Largest payload either side will accept.
pub const MAX_PAYLOAD: u64 = 1 << 20;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct FrameHeader {
    len: U64,
    reqno: U64,
    class: U16,
    kind: U16,
    handshake: U32,
}

pub const HEADER_LEN: usize = core::mem::size_of::<FrameHeader>();
const_assert_eq!(HEADER_LEN, 24);

impl FrameHeader {
    pub fn new(len: usize, reqno: u64, class: u16, kind: u16, handshake: u32) -> Self {
        Self {
            len: U64::new(len as u64),
            reqno: U64::new(reqno),
            class: U16::new(class),
            kind: U16::new(kind),
            handshake: U32::new(handshake),
        }
    }

    pub fn len(&self) -> u64 {
        self.len.get()
    }

    pub fn reqno(&self) -> u64 {
        self.reqno.get()
    }

    pub fn class(&self) -> u16 {
        self.class.get()
    }

    pub fn kind(&self) -> u16 {
        self.kind.get()
    }

    pub fn handshake(&self) -> u32 {
        self.handshake.get()
    }
}

/// Write a header and its payload with a single write.
pub(crate) fn write_frame<W: Write>(
    w: &mut W,
    hdr: FrameHeader,
    payload: &[u8],
) -> Result<(), ProtoError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(hdr.as_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

pub(crate) fn read_frame<R: Read>(r: &mut R) -> Result<(FrameHeader, Vec<u8>), ProtoError> {
    let mut raw = [0u8; HEADER_LEN];
    r.read_exact(&mut raw)?;
    let hdr = FrameHeader::read_from_bytes(&raw[..]).map_err(|_| ProtoError::Short {
        need: HEADER_LEN,
        got: raw.len(),
    })?;
    if hdr.len() > MAX_PAYLOAD {
        return Err(ProtoError::TooLarge { len: hdr.len() });
    }
    let mut payload = vec![0u8; hdr.len() as usize];
    r.read_exact(&mut payload)?;
    Ok((hdr, payload))
}
