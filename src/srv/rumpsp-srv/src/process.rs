use std::collections::{BTreeMap, HashMap};

use rumpsp::{
    sysno::{self, errno},
    Cookie, Response,
};
use tracing::{debug, trace, warn};

/// Descriptors every new guest starts with.
const CONSOLE_FDS: [i32; 3] = [0, 1, 2];

/// An open file description. Descriptors that were dup'd from each other share the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Description {
    pub id: u64,
    pub console: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdEntry {
    pub desc: Description,
    pub cloexec: bool,
}

#[derive(Clone, Debug)]
pub struct RemoteProc {
    pub pid: u32,
    pub ppid: u32,
    pub comm: String,
    pub fds: BTreeMap<i32, FdEntry>,
    cookie: Cookie,
    channels: usize,
}

impl RemoteProc {
    fn lowest_free_fd(&self, from: i32) -> i32 {
        let mut fd = from;
        while self.fds.contains_key(&fd) {
            fd += 1;
        }
        fd
    }
}

#[derive(Clone, Debug)]
struct PendingFork {
    ppid: u32,
    comm: String,
    fds: BTreeMap<i32, FdEntry>,
}

/// Per-server kernel process state.
pub struct ProcTable {
    procs: HashMap<u32, RemoteProc>,
    attach: HashMap<Cookie, u32>,
    pending: HashMap<Cookie, PendingFork>,
    cancelled: usize,
    next_pid: u32,
    next_desc: u64,
    max_procs: usize,
}

type ProcResult<T> = Result<T, i32>;

impl ProcTable {
    pub fn new(max_procs: usize) -> Self {
        Self {
            procs: HashMap::new(),
            attach: HashMap::new(),
            pending: HashMap::new(),
            cancelled: 0,
            next_pid: 1,
            next_desc: 0,
            max_procs,
        }
    }

    /// Cookies grant access to a process, so they come from the OS random source.
    fn new_cookie(&self) -> ProcResult<Cookie> {
        let mut out = Cookie::default();
        getrandom::fill(&mut out.0).map_err(|e| {
            warn!("failed to generate cookie: {}", e);
            errno::EAGAIN
        })?;
        Ok(out)
    }

    fn alloc_pid(&mut self) -> u32 {
        loop {
            let pid = self.next_pid;
            self.next_pid = self.next_pid.checked_add(1).unwrap_or(2);
            if pid > 1 && !self.procs.contains_key(&pid) {
                return pid;
            }
        }
    }

    fn new_description(&mut self, console: bool) -> Description {
        self.next_desc += 1;
        Description {
            id: self.next_desc,
            console,
        }
    }

    fn check_capacity(&self) -> ProcResult<()> {
        if self.procs.len() + self.pending.len() >= self.max_procs {
            return Err(errno::EAGAIN);
        }
        Ok(())
    }

    fn insert(
        &mut self,
        ppid: u32,
        comm: String,
        fds: BTreeMap<i32, FdEntry>,
        cookie: Cookie,
    ) -> (u32, Cookie) {
        let pid = self.alloc_pid();
        self.procs.insert(
            pid,
            RemoteProc {
                pid,
                ppid,
                comm,
                fds,
                cookie,
                channels: 1,
            },
        );
        self.attach.insert(cookie, pid);
        (pid, cookie)
    }

    /// Create a fresh process for a guest handshake.
    pub fn guest(&mut self, comm: String) -> ProcResult<(u32, Cookie)> {
        self.check_capacity()?;
        let mut fds = BTreeMap::new();
        for fd in CONSOLE_FDS {
            let desc = self.new_description(true);
            fds.insert(
                fd,
                FdEntry {
                    desc,
                    cloexec: false,
                },
            );
        }
        let cookie = self.new_cookie()?;
        let (pid, cookie) = self.insert(1, comm, fds, cookie);
        debug!("guest process {} created", pid);
        Ok((pid, cookie))
    }

    /// Bind one more channel to the process named by `cookie`.
    pub fn attach(&mut self, cookie: &Cookie) -> ProcResult<(u32, Cookie)> {
        let pid = *self.attach.get(cookie).ok_or(errno::ESRCH)?;
        let proc = self.procs.get_mut(&pid).ok_or(errno::ESRCH)?;
        proc.channels += 1;
        trace!("process {} now has {} channels", pid, proc.channels);
        Ok((pid, *cookie))
    }

    /// Reserve a child of `pid`, to be claimed with [ProcTable::fork].
    pub fn prefork(&mut self, pid: u32) -> ProcResult<Cookie> {
        self.check_capacity()?;
        let parent = self.procs.get(&pid).ok_or(errno::ESRCH)?;
        let reservation = PendingFork {
            ppid: pid,
            comm: parent.comm.clone(),
            fds: parent.fds.clone(),
        };
        let cookie = self.new_cookie()?;
        self.pending.insert(cookie, reservation);
        debug!("process {} reserved a fork", pid);
        Ok(cookie)
    }

    pub fn fork(&mut self, cookie: &Cookie) -> ProcResult<(u32, Cookie)> {
        if !self.pending.contains_key(cookie) {
            return Err(errno::ESRCH);
        }
        let attach = self.new_cookie()?;
        let reservation = self.pending.remove(cookie).ok_or(errno::ESRCH)?;
        let (pid, attach) = self.insert(reservation.ppid, reservation.comm, reservation.fds, attach);
        debug!("process {} forked from {}", pid, reservation.ppid);
        Ok((pid, attach))
    }

    /// Release a reservation of `pid`'s. Other processes' reservations are not visible.
    pub fn cancel_fork(&mut self, pid: u32, cookie: &Cookie) -> ProcResult<()> {
        match self.pending.get(cookie) {
            Some(r) if r.ppid == pid => {}
            _ => return Err(errno::ESRCH),
        }
        self.pending.remove(cookie);
        self.cancelled += 1;
        debug!("fork reservation cancelled");
        Ok(())
    }

    /// The process is replacing its image: rename it and drop close-on-exec descriptors.
    pub fn exec(&mut self, pid: u32, comm: String) -> ProcResult<(u32, Cookie)> {
        let proc = self.procs.get_mut(&pid).ok_or(errno::ESRCH)?;
        debug!("process {} exec {} -> {}", pid, proc.comm, comm);
        proc.comm = comm;
        proc.fds.retain(|_, e| !e.cloexec);
        Ok((pid, proc.cookie))
    }

    /// A channel of `pid` went away. The process goes with its last channel.
    pub fn detach(&mut self, pid: u32) {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return;
        };
        proc.channels = proc.channels.saturating_sub(1);
        if proc.channels == 0 {
            let cookie = proc.cookie;
            self.procs.remove(&pid);
            self.attach.remove(&cookie);
            let before = self.pending.len();
            self.pending.retain(|_, r| r.ppid != pid);
            debug!(
                "process {} exited, {} fork reservation(s) dropped",
                pid,
                before - self.pending.len()
            );
        }
    }

    pub fn get(&self, pid: u32) -> Option<&RemoteProc> {
        self.procs.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn pending_forks(&self) -> usize {
        self.pending.len()
    }

    pub fn cancelled_forks(&self) -> usize {
        self.cancelled
    }

    pub fn syscall(&mut self, pid: u32, nr: u32, args: &[u64]) -> Response {
        match self.dispatch(pid, nr, args) {
            Ok(retval) => Response::Syscall { error: 0, retval },
            Err(error) => Response::Syscall {
                error,
                retval: [u64::MAX, 0],
            },
        }
    }

    fn dispatch(&mut self, pid: u32, nr: u32, args: &[u64]) -> ProcResult<[u64; 2]> {
        let arg = |i: usize| args.get(i).copied().ok_or(errno::EINVAL);
        let fd_arg = |i: usize| -> ProcResult<i32> {
            i32::try_from(arg(i)? as i64).map_err(|_| errno::EBADF)
        };
        let ret = |v: u64| Ok([v, 0]);

        match nr {
            sysno::SYS_GETPID => {
                let proc = self.procs.get(&pid).ok_or(errno::ESRCH)?;
                ret(proc.pid as u64)
            }
            sysno::SYS_GETPPID => {
                let proc = self.procs.get(&pid).ok_or(errno::ESRCH)?;
                ret(proc.ppid as u64)
            }
            sysno::SYS_CLOSE => {
                let fd = fd_arg(0)?;
                let proc = self.procs.get_mut(&pid).ok_or(errno::ESRCH)?;
                proc.fds.remove(&fd).ok_or(errno::EBADF)?;
                ret(0)
            }
            sysno::SYS_DUP => {
                let fd = fd_arg(0)?;
                let proc = self.procs.get_mut(&pid).ok_or(errno::ESRCH)?;
                let entry = *proc.fds.get(&fd).ok_or(errno::EBADF)?;
                let newfd = proc.lowest_free_fd(0);
                proc.fds.insert(
                    newfd,
                    FdEntry {
                        cloexec: false,
                        ..entry
                    },
                );
                ret(newfd as u64)
            }
            sysno::SYS_DUP2 => {
                let (from, to) = (fd_arg(0)?, fd_arg(1)?);
                if to < 0 {
                    return Err(errno::EBADF);
                }
                let proc = self.procs.get_mut(&pid).ok_or(errno::ESRCH)?;
                let entry = *proc.fds.get(&from).ok_or(errno::EBADF)?;
                if from != to {
                    proc.fds.insert(
                        to,
                        FdEntry {
                            cloexec: false,
                            ..entry
                        },
                    );
                }
                ret(to as u64)
            }
            sysno::SYS_FCNTL => {
                let (fd, cmd) = (fd_arg(0)?, arg(1)?);
                let proc = self.procs.get(&pid).ok_or(errno::ESRCH)?;
                let entry = proc.fds.get(&fd).ok_or(errno::EBADF)?;
                match cmd {
                    sysno::F_GETFD => ret(entry.cloexec as u64),
                    _ => Err(errno::EINVAL),
                }
            }
            _ => {
                trace!("process {}: unimplemented syscall {}", pid, nr);
                Err(errno::ENOSYS)
            }
        }
    }
}
