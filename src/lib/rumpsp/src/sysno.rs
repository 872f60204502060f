//! Syscall and errno numbers of the kernel side. These follow the NetBSD ABI, not the host's.

pub const SYS_CLOSE: u32 = 6;
pub const SYS_GETPID: u32 = 20;
pub const SYS_GETPPID: u32 = 39;
pub const SYS_DUP: u32 = 41;
pub const SYS_DUP2: u32 = 90;
pub const SYS_FCNTL: u32 = 92;

pub const F_GETFD: u64 = 1;

pub mod errno {
    pub const ESRCH: i32 = 3;
    pub const EBADF: i32 = 9;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const EMFILE: i32 = 24;
    pub const EAGAIN: i32 = 35;
    pub const ENOSYS: i32 = 78;
}
