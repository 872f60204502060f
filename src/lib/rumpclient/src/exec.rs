use std::{
    ffi::CString,
    fmt::Display,
    fs::OpenOptions,
    io,
    os::fd::{AsRawFd, IntoRawFd, RawFd},
    path::Path,
    ptr,
};

use rumpsp::{Cookie, Handshake};
use tracing::debug;

use crate::{
    client::{ChannelSet, RemoteIdentity},
    CloseVariant, ForkOutcome, RelayError, RumpClient, EXECFD_ENV,
};

/// A channel handed to a new image across exec: `fd:pid:cookie`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecFd {
    pub fd: RawFd,
    pub pid: u32,
    pub cookie: Cookie,
}

impl ExecFd {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(':');
        let fd = parts.next()?.parse().ok()?;
        let pid = parts.next()?.parse().ok()?;
        let cookie = Cookie::from_hex(parts.next()?)?;
        if parts.next().is_some() || fd < 0 {
            return None;
        }
        Some(Self { fd, pid, cookie })
    }

    /// The descriptor is open and is a socket.
    pub(crate) fn is_socket(&self) -> bool {
        let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(self.fd, st.as_mut_ptr()) } < 0 {
            return false;
        }
        let st = unsafe { st.assume_init() };
        st.st_mode & libc::S_IFMT == libc::S_IFSOCK
    }
}

impl Display for ExecFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.fd, self.pid, self.cookie.to_hex())
    }
}

/// `envp` with any previous handoff entry replaced by `handoff`.
pub(crate) fn exec_env(envp: &[&str], handoff: &ExecFd) -> Vec<String> {
    let marker = format!("{}=", EXECFD_ENV);
    envp.iter()
        .filter(|e| !e.starts_with(&marker))
        .map(|e| e.to_string())
        .chain(std::iter::once(format!("{}{}", marker, handoff)))
        .collect()
}

fn cstring(s: &str) -> Result<CString, RelayError> {
    CString::new(s).map_err(|e| RelayError::Os(io::Error::new(io::ErrorKind::InvalidInput, e)))
}

impl RumpClient {
    /// Replace the process image, keeping the remote process.
    ///
    /// The kernel is told about the exec first, and the channel is handed to the new image through
    /// `RUMPCLIENT__EXECFD` in `envp`. Only returns on failure, in which case the channel is made
    /// close-on-exec again. The calling process's own environment is never modified.
    pub fn exec<P: AsRef<Path>>(&self, path: P, argv: &[&str], envp: &[&str]) -> RelayError {
        let mut set = self.state.lock();
        if let Err(e) = self.wait_idle(&mut set) {
            return e;
        }
        self.exec_in(&mut set, path.as_ref(), argv, envp)
    }

    pub(crate) fn exec_in(
        &self,
        set: &mut ChannelSet,
        path: &Path,
        argv: &[&str],
        envp: &[&str],
    ) -> RelayError {
        let (Some(ident), Some(chan)) = (set.identity, set.idle()) else {
            return RelayError::Disconnected;
        };

        let Some(cpath) = path.to_str() else {
            return RelayError::Os(io::Error::from(io::ErrorKind::InvalidInput));
        };
        let handoff = ExecFd {
            fd: chan.fd(),
            pid: ident.pid,
            cookie: ident.cookie,
        };
        let built = cstring(cpath).and_then(|p| {
            let args = argv.iter().map(|a| cstring(a)).collect::<Result<Vec<_>, _>>()?;
            let env = exec_env(envp, &handoff)
                .iter()
                .map(|e| cstring(e))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((p, args, env))
        });
        let (cpath, args, env) = match built {
            Ok(b) => b,
            Err(e) => return e,
        };

        let comm = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match chan.handshake(self.next_reqno(), Handshake::Exec { comm }) {
            Ok((pid, cookie)) => set.identity = Some(RemoteIdentity { pid, cookie }),
            Err(e) => {
                if !e.is_remote() {
                    set.discard(chan);
                }
                return e;
            }
        }
        if let Err(e) = chan.set_cloexec(false) {
            return e.into();
        }

        let argv_ptrs: Vec<*const libc::c_char> = args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        let env_ptrs: Vec<*const libc::c_char> = env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        unsafe { libc::execve(cpath.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr()) };

        let err = io::Error::last_os_error();
        let _ = chan.set_cloexec(true);
        RelayError::Os(err)
    }

    /// Detach from the controlling terminal, as daemon(3), keeping the remote process tree in
    /// step. Returns in the daemon; the original process exits.
    pub fn daemon(&self, nochdir: bool, noclose: bool) -> Result<(), RelayError> {
        // The parent's reservation goes away with it, so it waits for the child to claim it.
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let [rd, wr] = fds;
        let host = std::process::id();
        match self.fork() {
            Ok(ForkOutcome::Parent(pid)) => {
                unsafe { libc::close(wr) };
                let mut status = [0u8; 4];
                let n = unsafe { libc::read(rd, status.as_mut_ptr().cast(), status.len()) };
                unsafe { libc::close(rd) };
                let code = if n == 4 { i32::from_ne_bytes(status) } else { libc::EIO };
                if code == 0 {
                    debug!("daemonized as host pid {}", pid);
                    unsafe { libc::_exit(0) };
                }
                return Err(io::Error::from_raw_os_error(code).into());
            }
            Ok(ForkOutcome::Child) => {
                unsafe {
                    libc::close(rd);
                    libc::write(wr, 0i32.to_ne_bytes().as_ptr().cast(), 4);
                    libc::close(wr);
                }
            }
            Err(e) if std::process::id() != host => {
                let code = e.errno().unwrap_or(libc::EIO);
                unsafe {
                    libc::write(wr, code.to_ne_bytes().as_ptr().cast(), 4);
                    libc::_exit(1);
                }
            }
            Err(e) => {
                unsafe {
                    libc::close(rd);
                    libc::close(wr);
                }
                return Err(e);
            }
        }

        if unsafe { libc::setsid() } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if !nochdir {
            std::env::set_current_dir("/")?;
        }
        if !noclose {
            let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
            let nullfd = null.as_raw_fd();
            for fd in 0..=2 {
                if fd == nullfd {
                    continue;
                }
                self.close_notify(fd, CloseVariant::Dup2Overwrite)?;
                if unsafe { libc::dup2(nullfd, fd) } < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            if nullfd <= 2 {
                // It now is one of the standard descriptors; keep it open.
                let _ = null.into_raw_fd();
            }
        }
        Ok(())
    }
}
