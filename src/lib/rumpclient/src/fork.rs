//! Keeping the remote process tree in step with host forks.
//!
//! A host fork is bracketed by a reservation on the kernel side:
//!
//! 1. [RumpClient::prefork] asks the kernel to reserve a child of the calling process and returns
//!    a [ForkToken]. The token holds the session's channel lock until it is consumed, so no other
//!    thread can open, close or use channels across the fork.
//! 2. The host fork happens.
//! 3. Exactly one of [RumpClient::fork_init] (child), [RumpClient::fork_vparent] (parent) or
//!    [RumpClient::fork_cancel] (the host fork failed) consumes the token.
//!
//! [RumpClient::fork] and [RumpClient::fork_with] do all of this, and [crate::vfork!] does it for
//! vfork, where the child borrows the parent's memory until it execs or exits.

use std::io;

use parking_lot::MutexGuard;
use rumpsp::{Cookie, Handshake, ProtoError, Request, Response};
use tracing::warn;

use crate::{
    client::{ChannelSet, RemoteIdentity},
    Channel, RelayError, RumpClient,
};

/// Which side of a fork the caller is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkOutcome {
    Parent(libc::pid_t),
    Child,
}

/// A kernel-side fork reservation in flight.
///
/// Holds the session's channel lock and a snapshot of the parent's channel set. The snapshot is
/// plain data, so a vfork child overwriting the live set cannot free anything the parent owns.
#[must_use = "a fork token must be consumed by fork_init, fork_vparent or fork_cancel"]
pub struct ForkToken<'a> {
    cookie: Cookie,
    parent: ChannelSet,
    guard: MutexGuard<'a, ChannelSet>,
}

impl std::fmt::Debug for ForkToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkToken")
            .field("cookie", &self.cookie)
            .field("parent", &self.parent.identity)
            .finish()
    }
}

impl ForkToken<'_> {
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }
}

impl RumpClient {
    /// Reserve a remote child of this process ahead of a host fork.
    pub fn prefork(&self) -> Result<ForkToken<'_>, RelayError> {
        loop {
            let mut guard = self.state.lock();
            self.ensure_connected(&mut guard)?;
            let generation = guard.generation;
            match self.call_locked(&mut guard, &Request::Prefork) {
                Ok(Response::Prefork(cookie)) => {
                    let parent = ChannelSet::clone(&guard);
                    return Ok(ForkToken {
                        cookie,
                        parent,
                        guard,
                    });
                }
                Ok(Response::Error(errno)) => return Err(RelayError::Remote(errno)),
                Ok(_) => {
                    return Err(RelayError::Protocol(ProtoError::Unexpected {
                        expect: "prefork response",
                    }))
                }
                Err(RelayError::Disconnected) => {
                    drop(guard);
                    self.recover(generation)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Child side: forget the parent's channels and claim the reservation on a new one.
    ///
    /// May run in a vfork child, so it neither logs nor touches anything but the locked set.
    pub(crate) fn fork_child(&self, token: &mut ForkToken<'_>) -> Result<(), RelayError> {
        let set = &mut *token.guard;
        // These are our copies of the parent's descriptors; its connections stay up.
        for slot in set.slots.drain(..) {
            slot.chan.close();
        }
        set.identity = None;

        let chan = Channel::dial(&self.config().server)?;
        match chan.handshake(self.next_reqno(), Handshake::Fork(token.cookie)) {
            Ok((pid, cookie)) => {
                set.generation += 1;
                set.identity = Some(RemoteIdentity { pid, cookie });
                set.push(chan, false);
                Ok(())
            }
            Err(e) => {
                chan.close();
                Err(e)
            }
        }
    }

    /// Child side of a host fork. On failure the session is left disconnected, and the next call
    /// starts a fresh remote process.
    pub fn fork_init(&self, mut token: ForkToken<'_>) -> Result<(), RelayError> {
        self.fork_child(&mut token)
    }

    /// Parent side after a successful host fork.
    pub fn fork_vparent(&self, token: ForkToken<'_>) {
        let ForkToken {
            parent, mut guard, ..
        } = token;
        *guard = parent;
    }

    /// Release a reservation whose host fork never happened.
    pub fn fork_cancel(&self, token: ForkToken<'_>) -> Result<(), RelayError> {
        let ForkToken {
            cookie, mut guard, ..
        } = token;
        match self.call_locked(&mut guard, &Request::ForkCancel(cookie))? {
            Response::Done => Ok(()),
            Response::Error(errno) => Err(RelayError::Remote(errno)),
            _ => Err(RelayError::Protocol(ProtoError::Unexpected {
                expect: "fork cancel response",
            })),
        }
    }

    /// Cancel after a failed host fork, where the fork error is what the caller needs to see.
    #[doc(hidden)]
    pub fn fork_abandon(&self, token: ForkToken<'_>) {
        if let Err(e) = self.fork_cancel(token) {
            warn!("failed to release fork reservation: {}", e);
        }
    }

    /// Run the fork protocol around `os_fork`, which must behave like fork(2).
    pub fn fork_with<F>(&self, os_fork: F) -> Result<ForkOutcome, RelayError>
    where
        F: FnOnce() -> io::Result<libc::pid_t>,
    {
        let token = self.prefork()?;
        match os_fork() {
            Ok(0) => {
                self.fork_init(token)?;
                Ok(ForkOutcome::Child)
            }
            Ok(pid) => {
                self.fork_vparent(token);
                Ok(ForkOutcome::Parent(pid))
            }
            Err(e) => {
                self.fork_abandon(token);
                Err(RelayError::Os(e))
            }
        }
    }

    pub fn fork(&self) -> Result<ForkOutcome, RelayError> {
        self.fork_with(|| match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()),
            pid => Ok(pid),
        })
    }
}

/// The session as seen from a vfork child, before it execs.
pub struct VforkChild<'a> {
    pub(crate) client: &'a RumpClient,
    pub(crate) set: &'a mut ChannelSet,
}

impl VforkChild<'_> {
    /// The child's remote identity.
    pub fn identity(&self) -> Option<RemoteIdentity> {
        self.set.identity
    }

    /// Replace the child's image, handing its channel over. Only returns on failure.
    pub fn exec<P: AsRef<std::path::Path>>(
        &mut self,
        path: P,
        argv: &[&str],
        envp: &[&str],
    ) -> RelayError {
        self.client.exec_in(self.set, path.as_ref(), argv, envp)
    }
}

#[doc(hidden)]
pub fn vfork_child_main<F, R>(client: &RumpClient, token: &mut ForkToken<'_>, child: F) -> !
where
    F: FnOnce(VforkChild<'_>) -> R,
{
    if client.fork_child(token).is_ok() {
        child(VforkChild {
            client,
            set: &mut token.guard,
        });
    }
    unsafe { libc::_exit(127) }
}

/// Fork the calling process with vfork(2), keeping the remote process tree in step.
///
/// `vfork!(client, |child| ...)` evaluates to `Result<pid_t, RelayError>` in the parent. The
/// closure runs in the child with a [VforkChild]; it should do little more than
/// [VforkChild::exec]. The child never returns to the caller: if the closure returns, the child
/// exits with status 127.
///
/// This has to be a macro. The parent resumes from vfork in the frame that called it, and that
/// frame must not have returned in between, so vfork is called directly in the caller's frame.
#[macro_export]
macro_rules! vfork {
    ($client:expr, $child:expr) => {{
        let client: &$crate::RumpClient = $client;
        match client.prefork() {
            Err(e) => Err(e),
            Ok(mut token) => {
                #[allow(deprecated)]
                let pid = unsafe { $crate::__private::libc::vfork() };
                if pid == 0 {
                    $crate::__private::vfork_child_main(client, &mut token, $child)
                } else if pid > 0 {
                    client.fork_vparent(token);
                    Ok(pid)
                } else {
                    let err = $crate::__private::last_os_error();
                    client.fork_abandon(token);
                    Err($crate::RelayError::Os(err))
                }
            }
        }
    }};
}
