//! Inotify watch on the target file and the per-event dispatch logic.
//!
//! One kernel watch, one file, two interesting masks: open and close.
//! The dispatch rules around them are where most of the subtlety lives,
//! so they are kept in a pure state machine ([`EventDispatcher`]) behind
//! trait seams for the oracle and the launcher, with the raw inotify
//! plumbing isolated in [`KernelWatch`].

use crate::launcher::Launcher;
use crate::oracle::{CheckOptions, OracleError, ReadinessOracle};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("cannot initialize inotify: {0}")]
    Init(#[source] nix::Error),

    /// The target cannot be watched (missing file, permissions). Fatal:
    /// without a watch the daemon has no reason to exist.
    #[error("cannot watch {0}: {1}")]
    Register(PathBuf, #[source] nix::Error),

    #[error("cannot read inotify events: {0}")]
    Read(#[source] nix::Error),
}

/// What one inotify event said about the target, mask bits decoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventKinds {
    pub opened: bool,
    pub closed: bool,
    pub unmounted: bool,
    pub watch_dropped: bool,
    pub overflowed: bool,
}

impl EventKinds {
    fn from_mask(mask: AddWatchFlags) -> Self {
        Self {
            opened: mask.contains(AddWatchFlags::IN_OPEN),
            closed: mask
                .intersects(AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_CLOSE_NOWRITE),
            unmounted: mask.contains(AddWatchFlags::IN_UNMOUNT),
            watch_dropped: mask.contains(AddWatchFlags::IN_IGNORED),
            overflowed: mask.contains(AddWatchFlags::IN_Q_OVERFLOW),
        }
    }
}

/// What the orchestrator should do after dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepWatching,
    /// The kernel already dropped the watch (file deleted, unmounted).
    WatchGone,
    /// The event queue overflowed; tear the watch down and start over.
    Overflowed,
}

/// The single inotify watch for one cycle.
#[derive(Debug)]
pub struct KernelWatch {
    inotify: Inotify,
    wd: WatchDescriptor,
}

impl KernelWatch {
    /// Init inotify (nonblocking) and register the target with
    /// `IN_OPEN | IN_CLOSE_WRITE | IN_CLOSE_NOWRITE`.
    pub fn register(target: &Path) -> Result<Self, WatchError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(WatchError::Init)?;
        let mask = AddWatchFlags::IN_OPEN
            | AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_CLOSE_NOWRITE;
        let wd = inotify
            .add_watch(target, mask)
            .map_err(|e| WatchError::Register(target.to_path_buf(), e))?;
        info!(target = %target.display(), "watching target");
        Ok(Self { inotify, wd })
    }

    /// Read every queued event, in kernel-delivery order, until the fd
    /// runs dry.
    pub fn read_batch(&self) -> Result<Vec<EventKinds>, WatchError> {
        let mut batch = Vec::new();
        loop {
            match self.inotify.read_events() {
                Ok(events) => {
                    if events.is_empty() {
                        break;
                    }
                    batch.extend(events.iter().map(|e| EventKinds::from_mask(e.mask)));
                }
                Err(Errno::EAGAIN) => break,
                Err(e) => return Err(WatchError::Read(e)),
            }
        }
        Ok(batch)
    }

    /// Drop the watch explicitly (queue-overflow teardown). Failure is a
    /// warning: the cycle is ending either way.
    pub fn remove(&self) {
        if let Err(e) = self.inotify.rm_watch(self.wd) {
            warn!(error = %e, "rm_watch failed");
        }
    }
}

impl AsFd for KernelWatch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inotify.as_fd()
    }
}

/// Seam between event dispatch and the content database, so the dispatch
/// rules are testable without a device image.
pub trait ReadinessProbe {
    fn is_processed(&self, opts: CheckOptions) -> Result<bool, OracleError>;
}

impl ReadinessProbe for ReadinessOracle {
    fn is_processed(&self, opts: CheckOptions) -> Result<bool, OracleError> {
        ReadinessOracle::is_processed(self, opts)
    }
}

/// Per-cycle dispatch state. A new cycle gets a fresh dispatcher, which
/// resets the pending-processing flag.
pub struct EventDispatcher<'a, P: ReadinessProbe + ?Sized> {
    probe: &'a P,
    target: &'a Path,
    pending_processing: bool,
}

impl<'a, P: ReadinessProbe + ?Sized> EventDispatcher<'a, P> {
    pub fn new(probe: &'a P, target: &'a Path) -> Self {
        Self {
            probe,
            target,
            pending_processing: false,
        }
    }

    /// Dispatch one event's mask bits, in kernel order: open, close,
    /// unmount, watch-dropped, overflow. Oracle failures bubble up and
    /// kill the daemon; everything else is logged and absorbed.
    pub fn handle(
        &mut self,
        event: EventKinds,
        launcher: &mut dyn Launcher,
    ) -> Result<Disposition, OracleError> {
        let mut disposition = Disposition::KeepWatching;
        if event.opened {
            self.on_open(launcher)?;
        }
        if event.closed {
            self.on_close(launcher)?;
        }
        if event.unmounted {
            info!(target = %self.target.display(), "target was unmounted");
        }
        if event.watch_dropped {
            info!(target = %self.target.display(), "watch was dropped by the kernel");
            disposition = Disposition::WatchGone;
        }
        if event.overflowed {
            warn!("inotify queue overflowed");
            disposition = Disposition::Overflowed;
        }
        Ok(disposition)
    }

    /// Open: probe cheaply (no journal drain) and remember the verdict in
    /// the pending flag, so the close handler can skip a doomed check.
    /// While a spawn is in flight the open is ignored outright.
    fn on_open(&mut self, launcher: &mut dyn Launcher) -> Result<(), OracleError> {
        info!(target = %self.target.display(), "target was opened");
        if launcher.is_busy() {
            return Ok(());
        }
        if self.probe.is_processed(CheckOptions::default())? {
            self.pending_processing = false;
        } else {
            self.pending_processing = true;
            info!(target = %self.target.display(), "flagged target as pending processing");
        }
        Ok(())
    }

    /// Close: the launch decision. Requires an idle launcher, a clear
    /// pending flag, and a fresh processed verdict with the journal
    /// drained. The pending check comes first so a known-unprocessed
    /// target doesn't cost another database round-trip.
    fn on_close(&mut self, launcher: &mut dyn Launcher) -> Result<(), OracleError> {
        info!(target = %self.target.display(), "target was closed");
        if launcher.is_busy() {
            info!("our last spawn is still alive, not launching");
            return Ok(());
        }
        let opts = CheckOptions {
            apply_metadata_update: false,
            drain_journal: true,
        };
        if !self.pending_processing && self.probe.is_processed(opts)? {
            info!("target is processed, launching");
            if let Err(e) = launcher.launch() {
                warn!(error = %e, "launch failed");
            }
        } else {
            info!(
                target = %self.target.display(),
                "target might not be fully processed yet, not launching"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::SpawnError;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;

    struct ScriptedProbe {
        answers: RefCell<VecDeque<bool>>,
        seen_opts: RefCell<Vec<CheckOptions>>,
    }

    impl ScriptedProbe {
        fn new(answers: &[bool]) -> Self {
            Self {
                answers: RefCell::new(answers.iter().copied().collect()),
                seen_opts: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen_opts.borrow().len()
        }
    }

    impl ReadinessProbe for ScriptedProbe {
        fn is_processed(&self, opts: CheckOptions) -> Result<bool, OracleError> {
            self.seen_opts.borrow_mut().push(opts);
            Ok(self.answers.borrow_mut().pop_front().unwrap_or(false))
        }
    }

    #[derive(Default)]
    struct MockLauncher {
        busy: bool,
        launches: usize,
        fail_next: bool,
    }

    impl Launcher for MockLauncher {
        fn is_busy(&self) -> bool {
            self.busy
        }

        fn launch(&mut self) -> Result<(), SpawnError> {
            if self.fail_next {
                return Err(SpawnError::Spawn(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no action",
                )));
            }
            self.launches += 1;
            self.busy = true;
            Ok(())
        }
    }

    const TARGET: &str = "/mnt/onboard/koreader.png";

    fn opened() -> EventKinds {
        EventKinds {
            opened: true,
            ..Default::default()
        }
    }

    fn closed() -> EventKinds {
        EventKinds {
            closed: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_processed_open_close_launches_once() {
        let probe = ScriptedProbe::new(&[true, true]);
        let mut launcher = MockLauncher::default();
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));

        assert_eq!(
            dispatcher.handle(opened(), &mut launcher).unwrap(),
            Disposition::KeepWatching
        );
        dispatcher.handle(closed(), &mut launcher).unwrap();
        assert_eq!(launcher.launches, 1);

        // Open check travels light; close check drains the journal.
        let opts = probe.seen_opts.borrow();
        assert!(!opts[0].drain_journal);
        assert!(opts[1].drain_journal);
        assert!(opts.iter().all(|o| !o.apply_metadata_update));
    }

    #[test]
    fn test_unprocessed_open_sets_pending_and_close_skips_oracle() {
        let probe = ScriptedProbe::new(&[false]);
        let mut launcher = MockLauncher::default();
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));

        dispatcher.handle(opened(), &mut launcher).unwrap();
        assert!(dispatcher.pending_processing);

        dispatcher.handle(closed(), &mut launcher).unwrap();
        assert_eq!(launcher.launches, 0);
        // Pending short-circuits the close check entirely.
        assert_eq!(probe.calls(), 1);
    }

    #[test]
    fn test_pending_cleared_by_later_processed_open() {
        let probe = ScriptedProbe::new(&[false, true, true]);
        let mut launcher = MockLauncher::default();
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));

        dispatcher.handle(opened(), &mut launcher).unwrap();
        dispatcher.handle(opened(), &mut launcher).unwrap();
        assert!(!dispatcher.pending_processing);

        dispatcher.handle(closed(), &mut launcher).unwrap();
        assert_eq!(launcher.launches, 1);
    }

    #[test]
    fn test_at_most_one_launch_in_flight() {
        let probe = ScriptedProbe::new(&[true, true, true, true]);
        let mut launcher = MockLauncher::default();
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));

        dispatcher.handle(opened(), &mut launcher).unwrap();
        dispatcher.handle(closed(), &mut launcher).unwrap();
        assert_eq!(launcher.launches, 1);

        // Busy: further opens and closes never reach the oracle.
        let calls_before = probe.calls();
        dispatcher.handle(opened(), &mut launcher).unwrap();
        dispatcher.handle(closed(), &mut launcher).unwrap();
        assert_eq!(launcher.launches, 1);
        assert_eq!(probe.calls(), calls_before);

        // Child reaped: the next round may launch again.
        launcher.busy = false;
        dispatcher.handle(opened(), &mut launcher).unwrap();
        dispatcher.handle(closed(), &mut launcher).unwrap();
        assert_eq!(launcher.launches, 2);
    }

    #[test]
    fn test_launch_failure_is_absorbed() {
        let probe = ScriptedProbe::new(&[true]);
        let mut launcher = MockLauncher {
            fail_next: true,
            ..Default::default()
        };
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));

        dispatcher.handle(closed(), &mut launcher).unwrap();
        assert_eq!(launcher.launches, 0);
        assert!(!launcher.is_busy());
    }

    #[test]
    fn test_watch_dropped_ends_cycle() {
        let probe = ScriptedProbe::new(&[]);
        let mut launcher = MockLauncher::default();
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));

        let event = EventKinds {
            watch_dropped: true,
            ..Default::default()
        };
        assert_eq!(
            dispatcher.handle(event, &mut launcher).unwrap(),
            Disposition::WatchGone
        );
    }

    #[test]
    fn test_overflow_requests_teardown() {
        let probe = ScriptedProbe::new(&[]);
        let mut launcher = MockLauncher::default();
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));

        let event = EventKinds {
            overflowed: true,
            ..Default::default()
        };
        assert_eq!(
            dispatcher.handle(event, &mut launcher).unwrap(),
            Disposition::Overflowed
        );
    }

    #[test]
    fn test_combined_open_close_event_handles_both() {
        // A single inotify read can carry both bits; open runs first.
        let probe = ScriptedProbe::new(&[true, true]);
        let mut launcher = MockLauncher::default();
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));

        let event = EventKinds {
            opened: true,
            closed: true,
            ..Default::default()
        };
        dispatcher.handle(event, &mut launcher).unwrap();
        assert_eq!(probe.calls(), 2);
        assert_eq!(launcher.launches, 1);
    }

    #[test]
    fn test_fresh_dispatcher_resets_pending() {
        let probe = ScriptedProbe::new(&[false]);
        let mut launcher = MockLauncher::default();
        let mut dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));
        dispatcher.handle(opened(), &mut launcher).unwrap();
        assert!(dispatcher.pending_processing);

        let dispatcher = EventDispatcher::new(&probe, Path::new(TARGET));
        assert!(!dispatcher.pending_processing);
    }
}
