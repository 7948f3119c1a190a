//! Child process launching and reaping.
//!
//! At most one launched child may be in flight at any time; while it lives,
//! every trigger is ignored. Child exits are routed through a self-pipe:
//! the SIGCHLD handler (signal-hook's, which only ever performs an
//! async-signal-safe `write`) pushes a byte into a nonblocking pipe, and
//! the read end sits in the orchestrator's poll set next to the inotify fd.
//! All reaping and in-flight bookkeeping therefore runs on the one worker
//! thread, with no signal masking anywhere.

use nix::fcntl::OFlag;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, Pid};
use signal_hook::consts::SIGCHLD;
use signal_hook::low_level::pipe;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd};
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The SIGCHLD notification pipe could not be set up (startup-fatal).
    #[error("cannot create the SIGCHLD pipe: {0}")]
    Pipe(#[from] nix::Error),

    #[error("cannot register the SIGCHLD handler: {0}")]
    Handler(#[source] std::io::Error),

    /// The action executable failed to spawn. Never fatal to the daemon.
    #[error("cannot spawn the action: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Seam between event dispatch and real processes.
pub trait Launcher {
    /// True while a previously launched child is still alive.
    fn is_busy(&self) -> bool;

    /// Spawn the action. On success the child is tracked as in flight;
    /// on failure nothing is tracked and the caller logs and moves on.
    fn launch(&mut self) -> Result<(), SpawnError>;
}

/// Read end of the SIGCHLD self-pipe.
pub struct SigchldPipe {
    read: File,
}

impl SigchldPipe {
    /// Create the pipe and register the SIGCHLD handler. The write end is
    /// handed to the handler for the life of the process.
    pub fn register() -> Result<Self, SpawnError> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        pipe::register_raw(SIGCHLD, write.into_raw_fd()).map_err(SpawnError::Handler)?;
        Ok(Self {
            read: File::from(read),
        })
    }

    /// Swallow queued wakeup bytes so a burst of exits collapses into a
    /// single reap pass.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "SIGCHLD pipe read failed");
                    break;
                }
            }
        }
    }
}

impl AsFd for SigchldPipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

/// Spawns the configured action and tracks the single in-flight child.
pub struct ProcessLauncher {
    action: PathBuf,
    in_flight: Option<Pid>,
}

impl ProcessLauncher {
    pub fn new(action: PathBuf) -> Self {
        Self {
            action,
            in_flight: None,
        }
    }

    pub fn in_flight(&self) -> Option<Pid> {
        self.in_flight
    }

    /// Reap every child that has exited, logging how each one went.
    ///
    /// Called when the SIGCHLD pipe turns readable. `WNOHANG` in a loop:
    /// several exits may have been collapsed into one wakeup byte.
    pub fn reap(&mut self) {
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => {
                    info!(%pid, status, "child exited");
                    self.note_reaped(pid);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    info!(%pid, %signal, "child was killed by a signal");
                    self.note_reaped(pid);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(nix::Error::ECHILD) => break,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
    }

    fn note_reaped(&mut self, pid: Pid) {
        match self.in_flight.take() {
            Some(stored) if stored == pid => {
                info!(%pid, "reaped our in-flight spawn, ready to launch again");
            }
            Some(stored) => {
                // Shouldn't happen with a single spawn slot, but log both.
                warn!(reaped = %pid, stored = %stored, "reaped pid does not match the tracked spawn");
            }
            None => {
                warn!(%pid, "reaped a child we weren't tracking");
            }
        }
    }
}

impl Launcher for ProcessLauncher {
    fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn launch(&mut self) -> Result<(), SpawnError> {
        // No arguments, inherited stdio: the action script owns its own
        // output (which lands in our log via the stderr redirect).
        let child = Command::new(&self.action)
            .spawn()
            .map_err(SpawnError::Spawn)?;
        let pid = Pid::from_raw(child.id() as i32);
        info!(%pid, action = %self.action.display(), "spawned the action");
        self.in_flight = Some(pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_starts_idle() {
        let launcher = ProcessLauncher::new(PathBuf::from("/bin/true"));
        assert!(!launcher.is_busy());
        assert_eq!(launcher.in_flight(), None);
    }

    #[test]
    fn test_reaping_tracked_pid_clears_in_flight() {
        let mut launcher = ProcessLauncher::new(PathBuf::from("/bin/true"));
        launcher.in_flight = Some(Pid::from_raw(4242));
        launcher.note_reaped(Pid::from_raw(4242));
        assert!(!launcher.is_busy());
    }

    #[test]
    fn test_reaping_mismatched_pid_still_clears_in_flight() {
        let mut launcher = ProcessLauncher::new(PathBuf::from("/bin/true"));
        launcher.in_flight = Some(Pid::from_raw(4242));
        launcher.note_reaped(Pid::from_raw(9999));
        assert!(!launcher.is_busy());
    }

    #[test]
    fn test_spawn_failure_leaves_launcher_idle() {
        let mut launcher = ProcessLauncher::new(PathBuf::from("/nonexistent/action"));
        let err = launcher.launch().unwrap_err();
        assert!(matches!(err, SpawnError::Spawn(_)));
        assert!(!launcher.is_busy());
    }
}
