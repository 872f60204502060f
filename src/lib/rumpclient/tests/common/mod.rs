#![allow(dead_code)]

use std::{
    os::fd::RawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};

use rumpclient::{ClientConfig, RumpClient};
use rumpsp::ServerAddr;
use rumpsp_srv::{RumpServer, ServerConfig, ServerHandle, DEFAULT_MAX_PROCS};
use tempfile::TempDir;

/// A kernel instance on a private Unix socket, served from this process.
pub struct TestServer {
    pub handle: ServerHandle,
    _dir: TempDir,
}

impl TestServer {
    pub fn start() -> Self {
        Self::with_max_procs(DEFAULT_MAX_PROCS)
    }

    pub fn with_max_procs(max_procs: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rumpsp.sock");
        let config = ServerConfig::new(ServerAddr::Unix(path)).with_max_procs(max_procs);
        let handle = RumpServer::bind(config).unwrap().spawn().unwrap();
        Self { handle, _dir: dir }
    }

    pub fn client(&self) -> RumpClient {
        RumpClient::new(ClientConfig::new(self.handle.addr().clone()).with_comm("relaytest"))
    }
}

pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Exit status of host process `pid`, or -1 if it did not exit normally.
pub fn wait_exit(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    loop {
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r == pid {
            break;
        }
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::EINTR)
        );
    }
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        -1
    }
}

/// Run `f` in a forked child's context and exit with its result. Never returns.
pub fn child_exit(f: impl FnOnce() -> i32) -> ! {
    let code = catch_unwind(AssertUnwindSafe(f)).unwrap_or(101);
    unsafe { libc::_exit(code) }
}

pub fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
    (fds[0], fds[1])
}

pub fn inode(fd: RawFd) -> u64 {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    assert_eq!(unsafe { libc::fstat(fd, st.as_mut_ptr()) }, 0);
    unsafe { st.assume_init() }.st_ino as u64
}
