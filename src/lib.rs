//! KFMon: a Kobo inotify-based launcher daemon.
//!
//! Watches an icon file on the device partition and launches the
//! configured action when the file is opened from the home screen, but
//! only once Nickel (the stock content service) has fully processed the
//! icon: content row present in the Kobo database and all three thumbnail
//! artifacts parsed. Anything less means the tap came from Nickel's own
//! import machinery, not a reader.
//!
//! Single-threaded by construction: one poll loop over the inotify fd and
//! a SIGCHLD self-pipe, so launch state never races a signal handler.

pub mod config;
pub mod daemon;
pub mod launcher;
pub mod monitor;
pub mod mount;
pub mod oracle;
pub mod watcher;

pub use config::{load_config, Config, ConfigError, WatchTarget};
pub use daemon::{daemonize, renice, DaemonError};
pub use launcher::{Launcher, ProcessLauncher, SigchldPipe, SpawnError};
pub use mount::{is_mounted, wait_for_mountpoint, MountWaitError};
pub use oracle::{image_dir_components, qhash, CheckOptions, OracleError, ReadinessOracle};
pub use watcher::{
    Disposition, EventDispatcher, EventKinds, KernelWatch, ReadinessProbe, WatchError,
};
