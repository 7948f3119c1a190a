//! Daemon and watch configuration.
//!
//! Configuration lives on the device partition under the config directory:
//! `kfmon.toml` holds daemon-wide tunables, and every other `*.toml` file
//! describes one watch (the file to monitor and the action to launch when
//! Nickel is done processing it). Files are discovered in lexicographic
//! order so config loading is deterministic across boots.
//!
//! Malformed or missing configuration is startup-fatal: the daemon cannot
//! do anything useful without knowing what to watch.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Default partition the watched file, database and config live on.
pub const DEFAULT_MOUNTPOINT: &str = "/mnt/onboard";

/// Default busy-timeout baseline for content database access, in milliseconds.
pub const DEFAULT_DB_TIMEOUT_MS: u64 = 400;

/// Name of the daemon-wide config file inside the config directory.
const DAEMON_CONFIG_NAME: &str = "kfmon.toml";

const DEFAULT_DB_TITLE: &str = "KOReader";
const DEFAULT_DB_AUTHOR: &str = "KOReader Devs";
const DEFAULT_DB_COMMENT: &str = "An eBook reader application";

/// Error types for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config directory cannot be walked (missing, permission denied, ...)
    #[error("cannot read config directory {0}: {1}")]
    UnreadableDir(PathBuf, #[source] walkdir::Error),

    /// A config file exists but cannot be read
    #[error("cannot read config file {0}: {1}")]
    UnreadableFile(PathBuf, #[source] std::io::Error),

    /// A config file exists but does not parse
    #[error("cannot parse config file {0}: {1}")]
    Malformed(PathBuf, #[source] toml::de::Error),

    /// No watch config was found at all
    #[error("no watch configs found in {0}")]
    NoWatches(PathBuf),

    /// A watch path field must be absolute
    #[error("watch config {0}: `{1}` must be an absolute path")]
    RelativePath(PathBuf, &'static str),
}

/// Metadata values written by the (currently unused) database update path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
    pub comment: String,
}

impl Default for BookMetadata {
    fn default() -> Self {
        Self {
            title: DEFAULT_DB_TITLE.to_string(),
            author: DEFAULT_DB_AUTHOR.to_string(),
            comment: DEFAULT_DB_COMMENT.to_string(),
        }
    }
}

/// One watch: a file to monitor and the program to launch once the content
/// service has finished processing that file.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    /// Absolute path of the watched file.
    pub filename: PathBuf,
    /// Absolute path of the executable to spawn, launched with no arguments.
    pub action: PathBuf,
    /// Whether the metadata update path may be requested for this watch.
    /// Parsed for completeness; nothing requests the update in this version.
    pub do_db_update: bool,
    /// Title/Attribution/Description values for the metadata update path.
    pub metadata: BookMetadata,
}

/// Fully-loaded daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Busy-timeout baseline for content database access, in milliseconds.
    pub db_timeout_ms: u64,
    /// All parsed watches, in lexicographic config-file order.
    pub watches: Vec<WatchTarget>,
}

impl Config {
    /// The single watch this build arms: the first one in config order.
    /// [`load_config`] guarantees at least one, but `watches` is public,
    /// so don't assume it here.
    pub fn primary_watch(&self) -> Option<&WatchTarget> {
        self.watches.first()
    }
}

/// Default config directory for a given mountpoint.
pub fn default_config_dir(mountpoint: &Path) -> PathBuf {
    mountpoint.join(".adds/kfmon/config")
}

/// Default content database path for a given mountpoint.
pub fn default_db_path(mountpoint: &Path) -> PathBuf {
    mountpoint.join(".kobo/KoboReader.sqlite")
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonFile {
    daemon: DaemonSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonSection {
    db_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WatchFile {
    watch: WatchSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WatchSection {
    filename: PathBuf,
    action: PathBuf,
    #[serde(default)]
    do_db_update: bool,
    db_title: Option<String>,
    db_author: Option<String>,
    db_comment: Option<String>,
}

/// Load the daemon configuration from `config_dir`.
///
/// Walks the top level of the directory for `*.toml` files in lexicographic
/// order. `kfmon.toml` configures the daemon itself; every other file adds
/// one watch. At least one watch is required. Only the first watch is armed
/// by the monitor; extras are parsed, logged and ignored.
pub fn load_config(config_dir: &Path) -> Result<Config, ConfigError> {
    let mut db_timeout_ms = DEFAULT_DB_TIMEOUT_MS;
    let mut watches = Vec::new();

    for entry in WalkDir::new(config_dir).max_depth(1).sort_by_file_name() {
        let entry =
            entry.map_err(|e| ConfigError::UnreadableDir(config_dir.to_path_buf(), e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if !is_toml {
            continue;
        }

        info!(file = %path.display(), "loading config file");
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::UnreadableFile(path.to_path_buf(), e))?;

        if entry.file_name() == DAEMON_CONFIG_NAME {
            let parsed: DaemonFile = toml::from_str(&raw)
                .map_err(|e| ConfigError::Malformed(path.to_path_buf(), e))?;
            if let Some(timeout) = parsed.daemon.db_timeout {
                db_timeout_ms = timeout;
            }
            info!(db_timeout_ms, "daemon config loaded");
        } else {
            let parsed: WatchFile = toml::from_str(&raw)
                .map_err(|e| ConfigError::Malformed(path.to_path_buf(), e))?;
            let watch = validate_watch(path, parsed.watch)?;
            info!(
                filename = %watch.filename.display(),
                action = %watch.action.display(),
                do_db_update = watch.do_db_update,
                "watch config loaded"
            );
            watches.push(watch);
        }
    }

    if watches.is_empty() {
        return Err(ConfigError::NoWatches(config_dir.to_path_buf()));
    }
    if watches.len() > 1 {
        warn!(
            ignored = watches.len() - 1,
            "multiple watch configs found; only the first is armed"
        );
    }

    Ok(Config {
        db_timeout_ms,
        watches,
    })
}

fn validate_watch(source: &Path, section: WatchSection) -> Result<WatchTarget, ConfigError> {
    if !section.filename.is_absolute() {
        return Err(ConfigError::RelativePath(source.to_path_buf(), "filename"));
    }
    if !section.action.is_absolute() {
        return Err(ConfigError::RelativePath(source.to_path_buf(), "action"));
    }

    let defaults = BookMetadata::default();
    Ok(WatchTarget {
        filename: section.filename,
        action: section.action,
        do_db_update: section.do_db_update,
        metadata: BookMetadata {
            title: section.db_title.unwrap_or(defaults.title),
            author: section.db_author.unwrap_or(defaults.author),
            comment: section.db_comment.unwrap_or(defaults.comment),
        },
    })
}
