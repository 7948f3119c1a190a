//! Readiness oracle against the Kobo content database.
//!
//! Seeing the watched file opened is not enough to launch: the content
//! service itself opens it while importing and thumbnailing, and launching
//! mid-import wedges the device UI. A target counts as processed only when
//! its content row exists (ContentType '6', a book since FW 1.9.17) *and*
//! all three thumbnail artifacts have been parsed. Thumbnails live in a
//! shard directory derived from a Qt4 hash of the row's ImageID, the same
//! scheme Nickel and Calibre's Kobo driver use.

use crate::config::BookMetadata;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between rollback-journal checks.
pub const JOURNAL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Rollback-journal checks before giving up and proceeding anyway.
pub const JOURNAL_POLL_MAX_ITERATIONS: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("content database access failed: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Per-check knobs for [`ReadinessOracle::is_processed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    /// Rewrite Title/Attribution/Description once processed.
    ///
    /// Nothing sets this in the daemon: rewriting rows while the content
    /// service holds its own in-memory cache of them is asking for trouble.
    pub apply_metadata_update: bool,
    /// Wait out the database's rollback journal before reporting processed,
    /// and double the busy timeout. Used on close, where a launch decision
    /// rides on the answer.
    pub drain_journal: bool,
}

/// Qt4's qHash over raw bytes, bit-for-bit.
///
/// Nickel derives thumbnail shard directories from this hash of the
/// ImageID (cf. Calibre's Kobo driver, which reimplements the same thing).
pub fn qhash(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in bytes {
        h = (h << 4).wrapping_add(u32::from(b));
        h ^= (h & 0xf000_0000) >> 23;
        h &= 0x0fff_ffff;
    }
    h
}

/// Thumbnail shard directory components for an ImageID hash.
pub fn image_dir_components(hash: u32) -> (u32, u32) {
    (hash & 0xff, (hash & 0xff00) >> 8)
}

/// Answers "has the content service finished processing the watched file?".
pub struct ReadinessOracle {
    db_path: PathBuf,
    images_root: PathBuf,
    content_id: String,
    metadata: BookMetadata,
    busy_timeout_ms: u64,
}

impl ReadinessOracle {
    pub fn new(
        mountpoint: &Path,
        db_path: &Path,
        watched_file: &Path,
        metadata: BookMetadata,
        busy_timeout_ms: u64,
    ) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            images_root: mountpoint.join(".kobo-images"),
            content_id: format!("file://{}", watched_file.display()),
            metadata,
            busy_timeout_ms,
        }
    }

    /// One full processed check against the content database.
    ///
    /// Opens a fresh connection each time (read-only unless a metadata
    /// update was requested, always with the full mutex), so a check never
    /// holds database state across events. Row lookups that time out on a
    /// busy database are a soft "not processed yet", never an error: the
    /// content service owning its database is the normal state of the
    /// world. Everything else the database throws at us is fatal upstream.
    pub fn is_processed(&self, opts: CheckOptions) -> Result<bool, OracleError> {
        let flags = if opts.apply_metadata_update {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_FULL_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX
        };
        let conn = Connection::open_with_flags(&self.db_path, flags)?;

        // Double the budget on close checks, where a wrong "no" costs a
        // missed launch instead of a delayed flag.
        let multiplier = if opts.drain_journal { 2 } else { 1 };
        conn.busy_timeout(Duration::from_millis(self.busy_timeout_ms * multiplier))?;

        let row_exists: bool = match conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM content WHERE ContentID = ?1 AND ContentType = '6')",
            params![self.content_id],
            |row| row.get(0),
        ) {
            Ok(exists) => exists,
            Err(e) if is_busy(&e) => {
                warn!("content database is busy, treating the target as not processed");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if !row_exists {
            debug!(content_id = %self.content_id, "no content row for the target yet");
            return Ok(false);
        }

        let image_id: Option<String> = match conn
            .query_row(
                "SELECT ImageID FROM content WHERE ContentID = ?1 AND ContentType = '6'",
                params![self.content_id],
                |row| row.get(0),
            )
            .optional()
        {
            Ok(id) => id,
            Err(e) if is_busy(&e) => {
                warn!("content database is busy, treating the target as not processed");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let processed = match image_id {
            Some(ref id) => self.thumbnails_present(id),
            None => false,
        };

        if processed && opts.apply_metadata_update {
            self.update_metadata(&conn)?;
        }
        if processed && opts.drain_journal {
            drain_rollback_journal(
                &self.journal_path(),
                JOURNAL_POLL_INTERVAL,
                JOURNAL_POLL_MAX_ITERATIONS,
            );
        }

        Ok(processed)
    }

    /// All three thumbnail artifacts must exist: full-size screensaver,
    /// homescreen tile and library thumbnail. The tile only appears the
    /// first time the icon shows up as "last opened", so a fresh install
    /// typically passes this on book *exit*, not entry.
    fn thumbnails_present(&self, image_id: &str) -> bool {
        let (dir1, dir2) = image_dir_components(qhash(image_id.as_bytes()));
        let shard = self
            .images_root
            .join(dir1.to_string())
            .join(dir2.to_string());
        debug!(shard = %shard.display(), "checking for thumbnails");

        let mut found = 0;
        for (suffix, kind) in [
            ("N3_FULL", "full-size screensaver"),
            ("N3_LIBRARY_FULL", "homescreen tile"),
            ("N3_LIBRARY_GRID", "library thumbnail"),
        ] {
            if shard.join(format!("{image_id} - {suffix}.parsed")).exists() {
                found += 1;
            } else {
                info!(kind, "thumbnail hasn't been parsed yet");
            }
        }
        found == 3
    }

    /// Rewrite Title/Attribution/Description when the Title is not ours
    /// yet. Update failure is logged and swallowed: cosmetic metadata is
    /// never worth killing the daemon over.
    fn update_metadata(&self, conn: &Connection) -> Result<(), rusqlite::Error> {
        let title: Option<String> = conn
            .query_row(
                "SELECT Title FROM content WHERE ContentID = ?1 AND ContentType = '6'",
                params![self.content_id],
                |row| row.get(0),
            )
            .optional()?;
        if title.as_deref() == Some(self.metadata.title.as_str()) {
            return Ok(());
        }

        match conn.execute(
            "UPDATE content SET Title = ?1, Attribution = ?2, Description = ?3 \
             WHERE ContentID = ?4 AND ContentType = '6'",
            params![
                self.metadata.title,
                self.metadata.author,
                self.metadata.comment,
                self.content_id
            ],
        ) {
            Ok(rows) => info!(rows, "updated content metadata for the target"),
            Err(e) => warn!(error = %e, "metadata update failed"),
        }
        Ok(())
    }

    fn journal_path(&self) -> PathBuf {
        let mut path = self.db_path.clone().into_os_string();
        path.push("-journal");
        PathBuf::from(path)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Wait for the database's rollback journal to disappear, which marks the
/// content service's pending COMMIT as flushed. Assumes the default DELETE
/// journal mode. Best effort: after `max_iterations` sleeps we proceed
/// anyway. Returns whether the journal was gone by the time we stopped.
fn drain_rollback_journal(journal: &Path, interval: Duration, max_iterations: u32) -> bool {
    let mut iteration = 0;
    while journal.exists() {
        if iteration >= max_iterations {
            warn!("rollback journal won't go away, proceeding anyway");
            return false;
        }
        info!(iteration, "waiting for the rollback journal to go away");
        std::thread::sleep(interval);
        iteration += 1;
    }
    true
}
