use std::{
    os::fd::RawFd,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use arrayvec::ArrayVec;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rumpsp::{sysno, Cookie, Handshake, ProtoError, Request, Response};
use tracing::{debug, error, info, trace, warn};

use crate::{exec::ExecFd, Channel, ClientConfig, RelayError, RetryPolicy, EXECFD_ENV};

/// Most channels a session keeps open at once.
pub const MAX_CHANNELS: usize = 16;

/// The remote process this session speaks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub pid: u32,
    pub cookie: Cookie,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ChannelSlot {
    pub chan: Channel,
    pub busy: bool,
    /// Connection generation the channel was opened in.
    pub generation: u64,
}

/// Everything the session knows about its connections.
///
/// Plain data with no heap: a vfork child writes its own channel over this in shared memory and
/// the parent restores a snapshot afterwards, so nothing here may own an allocation.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChannelSet {
    pub identity: Option<RemoteIdentity>,
    pub generation: u64,
    pub slots: ArrayVec<ChannelSlot, MAX_CHANNELS>,
}

impl ChannelSet {
    fn position(&self, fd: RawFd) -> Option<usize> {
        self.slots.iter().position(|s| s.chan.fd() == fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.position(fd).is_some()
    }

    pub fn max_fd(&self) -> Option<RawFd> {
        self.slots.iter().map(|s| s.chan.fd()).max()
    }

    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    /// First idle channel of the current generation, left idle.
    pub fn idle(&self) -> Option<Channel> {
        self.slots
            .iter()
            .find(|s| !s.busy && s.generation == self.generation)
            .map(|s| s.chan)
    }

    fn take_idle(&mut self) -> Option<Channel> {
        let generation = self.generation;
        self.slots
            .iter_mut()
            .find(|s| !s.busy && s.generation == generation)
            .map(|s| {
                s.busy = true;
                s.chan
            })
    }

    /// Returns false, leaving the channel unowned, if the set is full.
    pub fn push(&mut self, chan: Channel, busy: bool) -> bool {
        self.slots
            .try_push(ChannelSlot {
                chan,
                busy,
                generation: self.generation,
            })
            .is_ok()
    }

    /// Mark a channel idle again. Channels from an earlier generation are closed instead.
    fn checkin(&mut self, chan: Channel) {
        let Some(idx) = self.position(chan.fd()) else {
            return;
        };
        if self.slots[idx].generation == self.generation {
            self.slots[idx].busy = false;
        } else {
            self.slots.remove(idx).chan.close();
        }
    }

    /// Drop a broken channel. Does nothing if the descriptor is no longer ours.
    pub fn discard(&mut self, chan: Channel) {
        if let Some(idx) = self.position(chan.fd()) {
            self.slots.remove(idx).chan.close();
        }
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.drain(..) {
            slot.chan.close();
        }
        self.identity = None;
    }
}

/// Per-process relay state: connections to one kernel, and the remote process they speak for.
pub struct RumpClient {
    config: ClientConfig,
    retry: Mutex<RetryPolicy>,
    pub(crate) state: Mutex<ChannelSet>,
    idle: Condvar,
    reqno: AtomicU64,
    handoff_seen: AtomicBool,
}

impl RumpClient {
    /// Create a session. Nothing is dialled until first use or [RumpClient::init].
    pub fn new(config: ClientConfig) -> Self {
        Self {
            retry: Mutex::new(config.retry),
            config,
            state: Mutex::new(ChannelSet::default()),
            idle: Condvar::new(),
            reqno: AtomicU64::new(1),
            handoff_seen: AtomicBool::new(false),
        }
    }

    pub fn from_env() -> Result<Self, RelayError> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        *self.retry.lock()
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        debug!("retry policy set to {}", policy);
        *self.retry.lock() = policy;
    }

    pub fn identity(&self) -> Option<RemoteIdentity> {
        self.state.lock().identity
    }

    /// Host descriptors currently used by the relay.
    pub fn channel_fds(&self) -> Vec<RawFd> {
        self.state.lock().slots.iter().map(|s| s.chan.fd()).collect()
    }

    /// Establish the first channel. A channel handed over by exec is adopted rather than dialled.
    pub fn init(&self) -> Result<(), RelayError> {
        self.ensure_connected(&mut self.state.lock())
    }

    /// Give the session an identity if it has none: adopt a channel handed over by exec, or
    /// start a new remote process.
    pub(crate) fn ensure_connected(&self, set: &mut ChannelSet) -> Result<(), RelayError> {
        if set.identity.is_some() {
            return Ok(());
        }
        // Only the first connection of the image may claim the handoff; the descriptor number
        // can be reused afterwards.
        let first = !self.handoff_seen.swap(true, Ordering::Relaxed);
        if let Some(value) = std::env::var(EXECFD_ENV).ok().filter(|_| first) {
            match ExecFd::parse(&value) {
                Some(handoff) if handoff.is_socket() && !set.contains(handoff.fd) => {
                    return self.adopt(set, handoff)
                }
                _ => warn!("ignoring stale {}={}", EXECFD_ENV, value),
            }
        }
        self.connect_guest(set)
    }

    fn adopt(&self, set: &mut ChannelSet, handoff: ExecFd) -> Result<(), RelayError> {
        let chan = Channel::from_raw_fd(handoff.fd);
        chan.set_cloexec(true)?;
        set.generation += 1;
        set.identity = Some(RemoteIdentity {
            pid: handoff.pid,
            cookie: handoff.cookie,
        });
        set.push(chan, false);
        debug!("adopted channel {} for remote pid {}", handoff.fd, handoff.pid);
        Ok(())
    }

    pub(crate) fn next_reqno(&self) -> u64 {
        self.reqno.fetch_add(1, Ordering::Relaxed)
    }

    /// Dial a channel that creates a fresh remote process, and make it the session's identity.
    pub(crate) fn connect_guest(&self, set: &mut ChannelSet) -> Result<(), RelayError> {
        let chan = Channel::dial(&self.config.server)?;
        let comm = self.config.comm.clone();
        match chan.handshake(self.next_reqno(), Handshake::Guest { comm }) {
            Ok((pid, cookie)) => {
                set.generation += 1;
                set.identity = Some(RemoteIdentity { pid, cookie });
                set.push(chan, false);
                debug!("connected to {} as remote pid {}", self.config.server, pid);
                Ok(())
            }
            Err(e) => {
                chan.close();
                Err(e)
            }
        }
    }

    /// Dial one more channel into the session's existing remote process.
    pub(crate) fn attach_channel(&self, set: &ChannelSet) -> Result<Channel, RelayError> {
        let ident = set.identity.ok_or(RelayError::Disconnected)?;
        let chan = Channel::dial(&self.config.server)?;
        match chan.handshake(self.next_reqno(), Handshake::Attach(ident.cookie)) {
            Ok((pid, _)) if pid == ident.pid => {
                trace!("attached channel {} to remote pid {}", chan.fd(), pid);
                Ok(chan)
            }
            Ok(_) => {
                chan.close();
                Err(RelayError::Protocol(ProtoError::Unexpected {
                    expect: "attach to the same process",
                }))
            }
            Err(e) => {
                chan.close();
                Err(e)
            }
        }
    }

    /// Wait until the session has an idle channel, connecting or attaching as needed.
    pub(crate) fn wait_idle(
        &self,
        set: &mut MutexGuard<'_, ChannelSet>,
    ) -> Result<Channel, RelayError> {
        loop {
            self.ensure_connected(set)?;
            if let Some(chan) = set.idle() {
                return Ok(chan);
            }
            if !set.is_full() {
                let generation = set.generation;
                match self.attach_channel(set) {
                    Ok(chan) => {
                        set.push(chan, false);
                        return Ok(chan);
                    }
                    Err(e) if e.is_connection_lost() => {
                        MutexGuard::unlocked(set, || self.recover(generation))?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            self.idle.wait(set);
        }
    }

    fn checkout(&self) -> Result<(Channel, u64), RelayError> {
        let mut set = self.state.lock();
        loop {
            self.ensure_connected(&mut set)?;
            if let Some(chan) = set.take_idle() {
                return Ok((chan, set.generation));
            }
            if !set.is_full() {
                let generation = set.generation;
                match self.attach_channel(&set) {
                    Ok(chan) => {
                        set.push(chan, true);
                        return Ok((chan, generation));
                    }
                    Err(e) if e.is_connection_lost() => {
                        MutexGuard::unlocked(&mut set, || self.recover(generation))?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            self.idle.wait(&mut set);
        }
    }

    fn checkin(&self, chan: Channel) {
        self.state.lock().checkin(chan);
        self.idle.notify_one();
    }

    fn discard(&self, chan: Channel) {
        self.state.lock().discard(chan);
        self.idle.notify_one();
    }

    /// Send a request on a channel of its own, recovering from connection loss per the retry
    /// policy.
    pub(crate) fn call(&self, req: &Request) -> Result<Response, RelayError> {
        loop {
            let (chan, generation) = self.checkout()?;
            match chan.call(self.next_reqno(), req) {
                Ok(resp) => {
                    self.checkin(chan);
                    return Ok(resp);
                }
                Err(RelayError::Disconnected) => {
                    self.discard(chan);
                    self.recover(generation)?;
                }
                Err(e) => {
                    self.discard(chan);
                    return Err(e);
                }
            }
        }
    }

    /// Send a request while already holding the channel set. Never waits for another thread's
    /// channel: if none is idle, a transient one is used.
    pub(crate) fn call_locked(
        &self,
        set: &mut ChannelSet,
        req: &Request,
    ) -> Result<Response, RelayError> {
        let (chan, owned) = match set.idle() {
            Some(chan) => (chan, true),
            None => {
                let chan = self.attach_channel(set)?;
                let owned = set.push(chan, false);
                (chan, owned)
            }
        };
        let res = chan.call(self.next_reqno(), req);
        if !owned {
            chan.close();
        } else if res.is_err() {
            set.discard(chan);
        }
        res
    }

    /// Reconnect after losing channel `generation`. Returns once some thread has reconnected.
    pub(crate) fn recover(&self, generation: u64) -> Result<(), RelayError> {
        let policy = self.retry_policy();
        if policy == RetryPolicy::Fatal {
            error!("lost connection to rump kernel at {}", self.config.server);
            std::process::exit(1);
        }

        let deadline = match policy {
            RetryPolicy::ForSeconds(secs) => Some(Instant::now() + Duration::from_secs(secs)),
            _ => None,
        };
        let mut attempt = 0u32;
        loop {
            {
                let mut set = self.state.lock();
                if set.generation != generation {
                    return Ok(());
                }
                attempt += 1;
                match self.reconnect(&mut set) {
                    Ok(()) => {
                        info!(
                            "reconnected to {} after {} attempt(s)",
                            self.config.server, attempt
                        );
                        self.idle.notify_all();
                        return Ok(());
                    }
                    Err(e) => {
                        let give_up = match policy {
                            RetryPolicy::Forever => false,
                            RetryPolicy::ForSeconds(_) => {
                                deadline.map_or(true, |d| Instant::now() >= d)
                            }
                            RetryPolicy::Once | RetryPolicy::Fatal => true,
                        };
                        if give_up {
                            warn!(
                                "giving up on {} after {} attempt(s): {}",
                                self.config.server, attempt, e
                            );
                            return Err(e);
                        }
                        debug!("reconnect attempt {} failed: {}", attempt, e);
                    }
                }
            }
            thread::sleep(backoff(attempt));
        }
    }

    /// Drop the lost connection and start over as a new remote process. Channels still out with
    /// other callers are closed when they come back.
    fn reconnect(&self, set: &mut ChannelSet) -> Result<(), RelayError> {
        set.slots.retain(|s| {
            if !s.busy {
                s.chan.close();
            }
            s.busy
        });
        set.identity = None;
        self.connect_guest(set)
    }

    /// Issue a syscall against the remote kernel. `args` is the packed argument block.
    pub fn syscall(&self, nr: u32, args: &[u8]) -> Result<[u64; 2], RelayError> {
        let mut block = Vec::new();
        block
            .try_reserve_exact(args.len())
            .map_err(|_| RelayError::Allocation)?;
        block.extend_from_slice(args);

        match self.call(&Request::Syscall { nr, args: block })? {
            Response::Syscall { error: 0, retval } => Ok(retval),
            Response::Syscall { error, .. } | Response::Error(error) => {
                Err(RelayError::Remote(error))
            }
            _ => Err(RelayError::Protocol(ProtoError::Unexpected {
                expect: "syscall response",
            })),
        }
    }

    /// The remote process id.
    pub fn getpid(&self) -> Result<u32, RelayError> {
        Ok(self.syscall(sysno::SYS_GETPID, &[])?[0] as u32)
    }
}

impl Drop for RumpClient {
    fn drop(&mut self) {
        self.state.get_mut().close_all();
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((25u64 << attempt.min(6)).min(1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_with(fds: &[RawFd]) -> ChannelSet {
        let mut set = ChannelSet {
            generation: 1,
            ..Default::default()
        };
        for fd in fds {
            assert!(set.push(Channel::from_raw_fd(*fd), false));
        }
        set
    }

    #[test]
    fn checkout_marks_busy() {
        let mut set = set_with(&[100, 101]);
        let a = set.take_idle().unwrap();
        let b = set.take_idle().unwrap();
        assert_ne!(a, b);
        assert!(set.take_idle().is_none());
        set.checkin(a);
        assert_eq!(set.take_idle(), Some(a));
    }

    #[test]
    fn unknown_checkin_is_ignored() {
        let mut set = set_with(&[100]);
        set.checkin(Channel::from_raw_fd(7));
        assert_eq!(set.slots.len(), 1);
        assert_eq!(set.max_fd(), Some(100));
        assert!(set.contains(100));
        assert!(!set.contains(7));
    }

    #[test]
    fn stale_generation_not_reused() {
        let mut set = set_with(&[100]);
        set.slots[0].busy = true;
        set.generation += 1;
        assert!(set.idle().is_none());
    }

    #[test]
    fn lost_process_on_attach_recovers() {
        use rumpsp::ServerAddr;
        use rumpsp_srv::{RumpServer, ServerConfig};

        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(ServerAddr::Unix(dir.path().join("rumpsp.sock")));
        let server = RumpServer::bind(config).unwrap().spawn().unwrap();
        let client = RumpClient::new(
            ClientConfig::new(server.addr().clone()).with_retry(RetryPolicy::Once),
        );
        let before = client.getpid().unwrap();

        // Another caller has the only channel out when the kernel drops the process.
        client.state.lock().slots[0].busy = true;
        server.disconnect_all();
        let deadline = Instant::now() + Duration::from_secs(10);
        while server.process_count() != 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.process_count(), 0);

        let after = client.getpid().unwrap();
        assert_ne!(before, after);
        assert_eq!(client.identity().unwrap().pid, after);
    }

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(backoff(1), Duration::from_millis(50));
        assert_eq!(backoff(40), Duration::from_millis(1000));
    }
}
