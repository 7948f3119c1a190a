//! Daemonization and log redirection.
//!
//! udev launches us early in boot with a negative nice value and a tty-less
//! environment; we re-nice ourselves, double-fork into our own session and
//! point stderr at a logfile on the rootfs (the device partition isn't
//! necessarily mounted yet). The logfile is truncated once it outgrows
//! 1 MiB, so a chatty boot loop can't eat the rootfs.

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, fork, setsid, ForkResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Default logfile, on the rootfs next to the usual install location.
pub const DEFAULT_LOGFILE: &str = "/usr/local/kfmon/kfmon.log";

/// Truncate the logfile once it grows past this.
const LOG_SIZE_CAP: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("re-nice failed: {0}")]
    Nice(#[source] io::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("setsid failed: {0}")]
    Setsid(#[source] nix::Error),

    #[error("cannot ignore SIGHUP: {0}")]
    IgnoreHup(#[source] nix::Error),

    #[error("chdir to / failed: {0}")]
    Chdir(#[source] nix::Error),

    #[error("cannot redirect stdio to {0}: {1}")]
    Redirect(String, #[source] io::Error),
}

/// Bump our nice value back into normal territory.
pub fn renice(increment: i32) -> Result<(), DaemonError> {
    // nice(2) can legitimately return -1, so errno is the only signal.
    nix::errno::Errno::clear();
    let res = unsafe { libc::nice(increment) };
    if res == -1 && nix::errno::Errno::last_raw() != 0 {
        return Err(DaemonError::Nice(io::Error::last_os_error()));
    }
    Ok(())
}

/// Detach from the launching environment: double fork with `setsid` in
/// between (SIGHUP ignored so losing the session leader doesn't kill us),
/// `chdir("/")`, `umask(0)`, stdin/stdout to `/dev/null` and stderr to
/// `logfile`. Must run before any threads exist.
pub fn daemonize(logfile: &Path) -> Result<(), DaemonError> {
    fork_and_exit_parent()?;
    setsid().map_err(DaemonError::Setsid)?;
    // SAFETY: installing SIG_IGN, no handler code runs.
    unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }.map_err(DaemonError::IgnoreHup)?;
    fork_and_exit_parent()?;

    chdir("/").map_err(DaemonError::Chdir)?;
    umask(Mode::empty());

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| DaemonError::Redirect("/dev/null".to_string(), e))?;
    redirect_fd(devnull.as_raw_fd(), libc::STDIN_FILENO)
        .map_err(|e| DaemonError::Redirect("/dev/null".to_string(), e))?;
    redirect_fd(devnull.as_raw_fd(), libc::STDOUT_FILENO)
        .map_err(|e| DaemonError::Redirect("/dev/null".to_string(), e))?;

    let log = open_logfile(logfile)
        .map_err(|e| DaemonError::Redirect(logfile.display().to_string(), e))?;
    redirect_fd(log.as_raw_fd(), libc::STDERR_FILENO)
        .map_err(|e| DaemonError::Redirect(logfile.display().to_string(), e))?;

    Ok(())
}

fn fork_and_exit_parent() -> Result<(), DaemonError> {
    // SAFETY: single-threaded at this point; the child only continues the
    // daemonization sequence.
    match unsafe { fork() }.map_err(DaemonError::Fork)? {
        // _exit: the parent must not run atexit handlers or flush shared
        // stdio buffers on its way out.
        ForkResult::Parent { .. } => unsafe { libc::_exit(0) },
        ForkResult::Child => Ok(()),
    }
}

fn redirect_fd(from: RawFd, to: RawFd) -> io::Result<()> {
    // SAFETY: both fds are open and owned by us.
    if unsafe { libc::dup2(from, to) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open the logfile for appending, truncating first when it has grown past
/// the size cap.
fn open_logfile(logfile: &Path) -> io::Result<File> {
    let oversized = std::fs::metadata(logfile)
        .map(|m| m.is_file() && m.len() > LOG_SIZE_CAP)
        .unwrap_or(false);

    let mut opts = OpenOptions::new();
    opts.create(true).mode(0o600);
    if oversized {
        opts.write(true).truncate(true);
    } else {
        opts.append(true);
    }
    opts.open(logfile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_logfile_created_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kfmon.log");
        let mut log = open_logfile(&path).unwrap();
        writeln!(log, "hello").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_small_logfile_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kfmon.log");
        std::fs::write(&path, "first\n").unwrap();

        let mut log = open_logfile(&path).unwrap();
        writeln!(log, "second").unwrap();
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn test_oversized_logfile_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kfmon.log");
        std::fs::write(&path, vec![b'x'; (LOG_SIZE_CAP + 1) as usize]).unwrap();

        let mut log = open_logfile(&path).unwrap();
        writeln!(log, "fresh").unwrap();
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "fresh\n");
    }

    #[test]
    fn test_renice_is_best_effort_noop_for_zero() {
        renice(0).unwrap();
    }
}
