mod common;

use std::io;

use common::*;
use rumpclient::{ForkOutcome, RelayError, RumpClient, SERVER_ENV};
use rumpsp::sysno::{self, errno};

#[test]
fn failed_host_fork_releases_reservation() {
    let server = TestServer::start();
    let client = server.client();
    let parent = client.getpid().unwrap();

    let err = client
        .fork_with(|| Err(io::Error::from_raw_os_error(libc::EAGAIN)))
        .unwrap_err();
    assert!(matches!(err, RelayError::Os(_)));
    assert_eq!(err.errno(), Some(libc::EAGAIN));
    assert_eq!(server.handle.cancelled_forks(), 1);
    assert_eq!(server.handle.pending_forks(), 0);

    // A retry goes through.
    let host = std::process::id();
    let res = client.fork();
    if std::process::id() != host {
        child_exit(|| {
            if res.is_err() {
                return 2;
            }
            match client.getpid() {
                Ok(pid) if pid != parent => {}
                _ => return 3,
            }
            match client.syscall(sysno::SYS_GETPPID, &[]) {
                Ok(r) if r[0] == parent as u64 => 0,
                _ => 4,
            }
        });
    }
    let Ok(ForkOutcome::Parent(child)) = res else {
        panic!("fork failed: {:?}", res);
    };
    assert_eq!(wait_exit(child), 0);
    assert_eq!(server.handle.pending_forks(), 0);
    assert_eq!(client.getpid().unwrap(), parent);
}

#[test]
fn refused_reservation_skips_host_fork() {
    let server = TestServer::with_max_procs(1);
    let client = server.client();
    client.init().unwrap();

    let mut forked = false;
    let err = client
        .fork_with(|| {
            forked = true;
            Ok(0)
        })
        .unwrap_err();
    assert!(!forked);
    assert!(err.is_remote());
    assert_eq!(err.errno(), Some(errno::EAGAIN));
    assert_eq!(server.handle.pending_forks(), 0);
    client.getpid().unwrap();
}

#[test]
fn explicit_token_cancel() {
    let server = TestServer::start();
    let client = server.client();

    let token = client.prefork().unwrap();
    assert_eq!(server.handle.pending_forks(), 1);
    client.fork_cancel(token).unwrap();
    assert_eq!(server.handle.pending_forks(), 0);
    assert_eq!(server.handle.cancelled_forks(), 1);
}

#[test]
fn vfork_exec() {
    let server = TestServer::start();
    let client = server.client();
    let before = client.getpid().unwrap();
    let channels = client.channel_fds();

    let pid = rumpclient::vfork!(&client, |mut child| {
        child.exec("/bin/sh", &["sh", "-c", "exit 7"], &[])
    })
    .unwrap();
    assert_eq!(wait_exit(pid), 7);

    // The parent's view survived the child's use of shared memory.
    assert_eq!(client.identity().unwrap().pid, before);
    assert_eq!(client.channel_fds(), channels);
    assert_eq!(client.getpid().unwrap(), before);
    assert_eq!(server.handle.pending_forks(), 0);
    assert!(wait_for(|| server.handle.process_count() == 1));
}

#[test]
fn exec_hands_channel_over() {
    let server = TestServer::start();
    let client = server.client();
    client.init().unwrap();

    let host = std::process::id();
    let res = client.fork();
    if std::process::id() != host {
        child_exit(|| {
            if res.is_err() {
                return 2;
            }
            let err = client.exec(
                "/bin/sh",
                &[
                    "sh",
                    "-c",
                    "case \"$RUMPCLIENT__EXECFD\" in *:*:*) exit 3;; esac; exit 1",
                ],
                &["PATH=/bin:/usr/bin"],
            );
            drop(err);
            4
        });
    }
    let Ok(ForkOutcome::Parent(child)) = res else {
        panic!("fork failed: {:?}", res);
    };
    assert_eq!(wait_exit(child), 3);
    assert!(wait_for(|| server.handle.process_count() == 1));
}

const EXPECT_PID_ENV: &str = "RUMPCLIENT_TEST_EXPECT_PID";
const ADOPTED: i32 = 42;

/// Runs as the new image in `exec_image_keeps_remote_process`; a no-op otherwise.
#[test]
fn exec_image_target() {
    let Ok(expect) = std::env::var(EXPECT_PID_ENV) else {
        return;
    };
    let code = match RumpClient::from_env().map(|c| c.getpid()) {
        // The first call, with no init, must land on the inherited process.
        Ok(Ok(pid)) if pid.to_string() == expect => ADOPTED,
        _ => 9,
    };
    std::process::exit(code);
}

#[test]
fn exec_image_keeps_remote_process() {
    let server = TestServer::start();
    let client = server.client();
    client.init().unwrap();
    let exe = std::env::current_exe().unwrap();
    let exe = exe.to_str().unwrap();

    let host = std::process::id();
    let res = client.fork();
    if std::process::id() != host {
        child_exit(|| {
            let Ok(pid) = client.getpid() else {
                return 2;
            };
            let server_env = format!("{}={}", SERVER_ENV, server.handle.addr());
            let expect_env = format!("{}={}", EXPECT_PID_ENV, pid);
            let err = client.exec(
                exe,
                &[exe, "--exact", "exec_image_target", "--test-threads=1", "-q"],
                &[server_env.as_str(), expect_env.as_str()],
            );
            drop(err);
            4
        });
    }
    let Ok(ForkOutcome::Parent(child)) = res else {
        panic!("fork failed: {:?}", res);
    };
    assert_eq!(wait_exit(child), ADOPTED);
    assert!(wait_for(|| server.handle.process_count() == 1));
}

#[test]
fn exec_failure_keeps_channel() {
    let server = TestServer::start();
    let client = server.client();
    let pid = client.getpid().unwrap();
    let fd = client.channel_fds()[0];

    let err = client.exec("/nonexistent/rumpclient-test", &["x"], &[]);
    assert_eq!(err.errno(), Some(libc::ENOENT));
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    assert_eq!(flags & libc::FD_CLOEXEC, libc::FD_CLOEXEC);
    assert_eq!(client.getpid().unwrap(), pid);
    assert_eq!(
        server.handle.comm_of(pid).as_deref(),
        Some("rumpclient-test")
    );
}

#[test]
fn daemon() {
    let server = TestServer::start();
    let (r, w) = pipe();

    let child = unsafe { libc::fork() };
    if child == 0 {
        child_exit(|| {
            unsafe { libc::close(r) };
            let client = server.client();
            if client.daemon(false, false).is_err() {
                return 1;
            }
            // Only the daemon gets here.
            let ok = client.getpid().is_ok()
                && unsafe { libc::getsid(0) == libc::getpid() }
                && std::env::current_dir().map_or(false, |d| d == std::path::Path::new("/"));
            let byte = if ok { b'y' } else { b'n' };
            unsafe { libc::write(w, [byte].as_ptr().cast(), 1) };
            0
        });
    }
    unsafe { libc::close(w) };
    assert_eq!(wait_exit(child), 0);

    let mut byte = [0u8; 1];
    let n = unsafe { libc::read(r, byte.as_mut_ptr().cast(), 1) };
    unsafe { libc::close(r) };
    assert_eq!(n, 1);
    assert_eq!(byte[0], b'y');
    assert_eq!(server.handle.pending_forks(), 0);
}
