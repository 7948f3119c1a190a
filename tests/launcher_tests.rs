//! Real child spawn + SIGCHLD pipe wakeup + reap.
//!
//! Kept to a single test: SIGCHLD registration and child reaping are
//! process-global, so concurrent tests in this binary would steal each
//! other's exits.

use kfmon::launcher::{Launcher, ProcessLauncher, SigchldPipe};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

/// SIGCHLD itself interrupts the poll, so EINTR here is expected traffic,
/// not a failure.
fn wait_for_wakeup(sigchld: &SigchldPipe) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut fds = [PollFd::new(sigchld.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, 1000u16) {
            Ok(n) if n > 0 => return,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => panic!("poll failed: {e}"),
        }
        assert!(Instant::now() < deadline, "no SIGCHLD wakeup within 5s");
    }
}

#[test]
fn test_spawn_reap_relaunch_roundtrip() {
    let sigchld = SigchldPipe::register().unwrap();

    let mut launcher = ProcessLauncher::new("/bin/true".into());
    launcher.launch().unwrap();
    assert!(launcher.is_busy());
    let first_pid = launcher.in_flight().unwrap();

    wait_for_wakeup(&sigchld);
    sigchld.drain();
    launcher.reap();
    assert!(!launcher.is_busy());

    // Reaping frees the single spawn slot.
    launcher.launch().unwrap();
    assert!(launcher.is_busy());
    assert_ne!(launcher.in_flight(), Some(first_pid));

    wait_for_wakeup(&sigchld);
    sigchld.drain();
    launcher.reap();
    assert!(!launcher.is_busy());
}
