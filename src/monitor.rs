//! The orchestrator: one thread, one poll set, forever.
//!
//! Each cycle waits for the device partition, arms the inotify watch and
//! then polls over two fds: the watch itself and the SIGCHLD self-pipe.
//! When the watch dies (file deleted, partition unmounted, queue overflow)
//! the cycle ends and everything is set up again from scratch, with no
//! backoff: mount waiting already paces us. Fatal errors bubble out to
//! `main`.

use crate::config::Config;
use crate::launcher::{ProcessLauncher, SigchldPipe};
use crate::mount::wait_for_mountpoint;
use crate::oracle::ReadinessOracle;
use crate::watcher::{Disposition, EventDispatcher, KernelWatch};
use anyhow::Context;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::AsFd;
use std::path::Path;
use tracing::info;

/// Run the daemon until a fatal error.
pub fn run(config: &Config, mountpoint: &Path, db_path: &Path) -> anyhow::Result<()> {
    let watch_target = config.primary_watch().context("no watch configured")?;

    let sigchld = SigchldPipe::register().context("SIGCHLD pipe setup failed")?;
    let mut launcher = ProcessLauncher::new(watch_target.action.clone());
    let oracle = ReadinessOracle::new(
        mountpoint,
        db_path,
        &watch_target.filename,
        watch_target.metadata.clone(),
        config.db_timeout_ms,
    );

    loop {
        info!("beginning the main loop");
        wait_for_mountpoint(mountpoint).context("mountpoint never became available")?;

        let watch = KernelWatch::register(&watch_target.filename)?;
        let mut dispatcher = EventDispatcher::new(&oracle, watch_target.filename.as_path());

        'cycle: loop {
            let mut fds = [
                PollFd::new(watch.as_fd(), PollFlags::POLLIN),
                PollFd::new(sigchld.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::Error::EINTR) => continue 'cycle,
                Err(e) => return Err(e).context("poll failed"),
            }

            let child_exited = fds[1]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            let watch_readable = fds[0].revents().is_some_and(|r| {
                r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
            });

            if child_exited {
                sigchld.drain();
                launcher.reap();
            }

            if watch_readable {
                // Finish the whole batch even when an event in it kills
                // the watch: later events were already queued by then.
                let mut cycle_over = false;
                for event in watch.read_batch()? {
                    match dispatcher.handle(event, &mut launcher)? {
                        Disposition::KeepWatching => {}
                        Disposition::WatchGone => cycle_over = true,
                        Disposition::Overflowed => {
                            watch.remove();
                            cycle_over = true;
                        }
                    }
                }
                if cycle_over {
                    info!("watch is gone, restarting the main loop");
                    break 'cycle;
                }
            }
        }
        // `watch` drops here, closing the inotify fd before the next cycle.
    }
}
