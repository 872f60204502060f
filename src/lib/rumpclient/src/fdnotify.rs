use std::{io, os::fd::RawFd};

use tracing::debug;

use crate::{RelayError, RumpClient};

/// Lowest descriptor a relocated channel may take, so it never lands on stdio.
const RELOCATE_MIN_FD: RawFd = 3;

/// The host descriptor operation about to happen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseVariant {
    /// close(fd)
    Close,
    /// dup2(_, fd), which closes fd implicitly.
    Dup2Overwrite,
    /// closefrom(fd)
    CloseFromMark,
}

impl RumpClient {
    /// Call immediately before the host closes or overwrites `fd`.
    ///
    /// For [CloseVariant::Close] and [CloseVariant::Dup2Overwrite], a channel living on `fd` is
    /// moved to a new descriptor and `fd` is returned for the caller to proceed with. The old
    /// descriptor is left for the caller's own operation to release.
    ///
    /// For [CloseVariant::CloseFromMark], every non-channel descriptor from `fd` up to the
    /// highest channel descriptor is closed, and the returned mark is where the caller's
    /// closefrom should continue.
    pub fn close_notify(&self, fd: RawFd, variant: CloseVariant) -> Result<RawFd, RelayError> {
        let mut set = self.state.lock();
        match variant {
            CloseVariant::Close | CloseVariant::Dup2Overwrite => {
                let Some(slot) = set.slots.iter_mut().find(|s| s.chan.fd() == fd) else {
                    return Ok(fd);
                };
                let newfd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, RELOCATE_MIN_FD) };
                if newfd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                slot.chan.set_fd(newfd);
                debug!("relay channel moved from fd {} to {}", fd, newfd);
                Ok(fd)
            }
            CloseVariant::CloseFromMark => {
                let Some(max) = set.max_fd() else {
                    return Ok(fd);
                };
                if fd > max {
                    return Ok(fd);
                }
                for f in fd..max {
                    if !set.contains(f) {
                        unsafe { libc::close(f) };
                    }
                }
                Ok(max + 1)
            }
        }
    }
}
