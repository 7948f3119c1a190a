//! Mount readiness monitoring.
//!
//! The device partition we care about shows up a short while after boot,
//! once the kernel and Nickel are done with it. `/proc/mounts` signals
//! mount-table changes as exceptional poll conditions on its fd, so we
//! poll it and re-scan the table on every change until our mountpoint
//! appears, with a hard cap on how many changes we tolerate without a
//! match.

use nix::poll::{poll, PollFd, PollFlags};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::info;

const PROC_MOUNTS: &str = "/proc/mounts";

/// Mount-table changes tolerated without a match before giving up.
pub const MAX_UNMATCHED_CHANGES: u32 = 15;

/// Poll cadence on the `/proc/mounts` fd, in milliseconds.
const POLL_INTERVAL_MS: u8 = 5;

#[derive(Debug, thiserror::Error)]
pub enum MountWaitError {
    #[error("cannot read {PROC_MOUNTS}: {0}")]
    Io(#[from] io::Error),

    #[error("poll on {PROC_MOUNTS} failed: {0}")]
    Poll(#[from] nix::Error),

    /// The mount table churned past the budget without our target showing up.
    #[error("mount table changed {0} times without the target appearing")]
    TooManyChanges(u32),
}

/// Counts mount-table changes that did not reveal the target.
///
/// The budget allows [`MAX_UNMATCHED_CHANGES`] misses; the next one trips.
/// A change that *does* reveal the target never reaches the budget, so a
/// match on the final change still succeeds.
#[derive(Debug, Default)]
pub(crate) struct ChangeBudget {
    changes: u32,
}

impl ChangeBudget {
    pub(crate) fn record_miss(&mut self) -> Result<(), MountWaitError> {
        self.changes += 1;
        if self.changes > MAX_UNMATCHED_CHANGES {
            return Err(MountWaitError::TooManyChanges(self.changes));
        }
        Ok(())
    }

    pub(crate) fn changes(&self) -> u32 {
        self.changes
    }
}

/// True if `mountpoint` appears as a mount directory in `table`
/// (a `/proc/mounts`-format mount table).
///
/// Mount directories containing spaces, tabs, newlines or backslashes are
/// octal-escaped in `/proc/mounts`; they are unescaped before comparison.
pub(crate) fn table_contains(table: &str, mountpoint: &Path) -> bool {
    table.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|dir| Path::new(OsStr::from_bytes(&unescape_mount_dir(dir))) == mountpoint)
    })
}

/// Reverses the octal escaping applied to `/proc/mounts` fields
/// (`\040` space, `\011` tab, `\012` newline, `\134` backslash).
///
/// Works on raw bytes: mount directories are arbitrary byte strings, and
/// multibyte UTF-8 must pass through untouched.
fn unescape_mount_dir(raw: &str) -> Vec<u8> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Some(value) = octal_code(&bytes[i + 1..i + 4]) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Three octal digits to a byte; `None` on non-octal input or overflow,
/// which the caller passes through literally.
fn octal_code(digits: &[u8]) -> Option<u8> {
    let mut value: u32 = 0;
    for &d in digits {
        if !d.is_ascii_digit() || d > b'7' {
            return None;
        }
        value = value * 8 + u32::from(d - b'0');
    }
    u8::try_from(value).ok()
}

/// Scan the system mount table for `mountpoint`.
pub fn is_mounted(mountpoint: &Path) -> io::Result<bool> {
    let table = std::fs::read_to_string(PROC_MOUNTS)?;
    Ok(table_contains(&table, mountpoint))
}

/// Block until `mountpoint` is present in the mount table.
///
/// Returns immediately if it already is. Otherwise polls the
/// `/proc/mounts` fd for `POLLERR | POLLPRI` (the kernel's change
/// notification) and re-scans the table on every change. More than
/// [`MAX_UNMATCHED_CHANGES`] changes without a match is fatal: at that
/// point the boot sequence has clearly gone somewhere we don't understand.
pub fn wait_for_mountpoint(mountpoint: &Path) -> Result<(), MountWaitError> {
    if is_mounted(mountpoint)? {
        return Ok(());
    }
    info!(mountpoint = %mountpoint.display(), "waiting for mountpoint");

    let mut mounts = File::open(PROC_MOUNTS)?;
    let mut budget = ChangeBudget::default();
    let mut table = String::new();

    loop {
        let mut fds = [PollFd::new(
            mounts.as_fd(),
            PollFlags::POLLERR | PollFlags::POLLPRI,
        )];
        match poll(&mut fds, POLL_INTERVAL_MS) {
            Ok(_) => {}
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(MountWaitError::Poll(e)),
        }

        let changed = fds[0]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLERR | PollFlags::POLLPRI));
        if !changed {
            continue;
        }

        info!(iteration = budget.changes(), "mount table changed");
        table.clear();
        mounts.seek(SeekFrom::Start(0))?;
        mounts.read_to_string(&mut table)?;
        if table_contains(&table, mountpoint) {
            info!(mountpoint = %mountpoint.display(), "target mountpoint is available");
            return Ok(());
        }
        budget.record_miss()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TABLE: &str = "\
rootfs / rootfs rw 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
tmpfs /tmp tmpfs rw,relatime,size=16384k 0 0
/dev/mmcblk0p3 /mnt/onboard vfat rw,noatime,fmask=0022 0 0
/dev/mmcblk1p1 /mnt/sd vfat rw,noatime 0 0
";

    #[test]
    fn test_table_contains_target() {
        assert!(table_contains(TABLE, Path::new("/mnt/onboard")));
        assert!(table_contains(TABLE, Path::new("/proc")));
        assert!(!table_contains(TABLE, Path::new("/mnt/offboard")));
        // Prefix of a real entry, not an entry itself.
        assert!(!table_contains(TABLE, Path::new("/mnt")));
    }

    #[test]
    fn test_table_contains_unescapes_octal() {
        let table = "/dev/sdb1 /mnt/usb\\040drive vfat rw 0 0\n";
        assert!(table_contains(table, Path::new("/mnt/usb drive")));
    }

    #[test]
    fn test_table_contains_non_ascii_mountpoint() {
        let table = "/dev/sdb1 /mnt/café vfat rw 0 0\n";
        assert!(table_contains(table, Path::new("/mnt/café")));
    }

    #[test]
    fn test_unescape_passthrough() {
        assert_eq!(unescape_mount_dir("/mnt/onboard"), b"/mnt/onboard");
        assert_eq!(unescape_mount_dir("a\\04"), b"a\\04");
        // Multibyte UTF-8 passes through byte for byte.
        assert_eq!(unescape_mount_dir("/mnt/café"), "/mnt/café".as_bytes());
        // A backslash right before multibyte text stays literal.
        assert_eq!(unescape_mount_dir("\\é"), "\\é".as_bytes());
    }

    #[test]
    fn test_unescape_known_codes() {
        assert_eq!(unescape_mount_dir("a\\040b"), b"a b");
        assert_eq!(unescape_mount_dir("a\\011b"), b"a\tb");
        assert_eq!(unescape_mount_dir("a\\012b"), b"a\nb");
        assert_eq!(unescape_mount_dir("a\\134b"), b"a\\b");
        // \777 overflows a byte and stays literal, like any non-code.
        assert_eq!(unescape_mount_dir("a\\777b"), b"a\\777b");
    }

    #[test]
    fn test_change_budget_trips_on_sixteenth_miss() {
        let mut budget = ChangeBudget::default();
        for _ in 0..MAX_UNMATCHED_CHANGES {
            budget.record_miss().unwrap();
        }
        let err = budget.record_miss().unwrap_err();
        assert!(matches!(err, MountWaitError::TooManyChanges(16)));
    }

    #[test]
    fn test_is_mounted_reads_proc_mounts() {
        // The root filesystem is always mounted.
        assert!(is_mounted(Path::new("/")).unwrap());
        assert!(!is_mounted(&PathBuf::from("/definitely/not/mounted/here")).unwrap());
    }
}
