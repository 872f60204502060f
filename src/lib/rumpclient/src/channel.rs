use std::{
    io::{self, Read, Write},
    net::TcpStream,
    os::{
        fd::{IntoRawFd, RawFd},
        unix::net::UnixStream,
    },
};

use rumpsp::{read_response, write_request, Cookie, Handshake, Request, Response, ServerAddr};

use crate::RelayError;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// One connection to the kernel.
///
/// A channel is just a descriptor number. It is copied freely (into fork snapshots, onto the
/// stack of a vfork child) and never closes itself; whoever removes it from a channel set closes
/// it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Channel {
    fd: RawFd,
}

/// Reads and writes a channel's descriptor without owning it.
struct FdStream(RawFd);

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.0, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::send(self.0, buf.as_ptr().cast(), buf.len(), SEND_FLAGS) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel {
    /// Open a new connection. The descriptor is close-on-exec.
    pub fn dial(addr: &ServerAddr) -> Result<Self, RelayError> {
        let fd = match addr {
            ServerAddr::Unix(path) => UnixStream::connect(path).map(IntoRawFd::into_raw_fd),
            ServerAddr::Tcp(hostport) => TcpStream::connect(hostport.as_str()).and_then(|s| {
                s.set_nodelay(true)?;
                Ok(s.into_raw_fd())
            }),
        }
        .map_err(|source| RelayError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self { fd })
    }

    pub(crate) fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn set_fd(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    pub(crate) fn close(self) {
        unsafe { libc::close(self.fd) };
    }

    /// Send one request and wait for its response.
    pub fn call(&self, reqno: u64, req: &Request) -> Result<Response, RelayError> {
        let mut stream = FdStream(self.fd);
        write_request(&mut stream, reqno, req)?;
        let (back, resp) = read_response(&mut stream)?;
        if back != reqno {
            return Err(RelayError::Protocol(rumpsp::ProtoError::Unexpected {
                expect: "matching response",
            }));
        }
        Ok(resp)
    }

    /// Bind this channel to a remote process. Returns the remote pid and attach cookie.
    pub fn handshake(&self, reqno: u64, hs: Handshake) -> Result<(u32, Cookie), RelayError> {
        match self.call(reqno, &Request::Handshake(hs))? {
            Response::Handshake { pid, cookie } => Ok((pid, cookie)),
            Response::Error(errno) => Err(RelayError::Remote(errno)),
            _ => Err(RelayError::Protocol(rumpsp::ProtoError::Unexpected {
                expect: "handshake",
            })),
        }
    }

    pub fn set_cloexec(&self, on: bool) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFD, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Shut the connection down in both directions without releasing the descriptor.
    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
    }
}
