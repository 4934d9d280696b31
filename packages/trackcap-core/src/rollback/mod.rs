//! The rollback journal.
//!
//! Every limit change the engine applies is journaled here before the
//! corresponding write is issued, so that operators can restore the
//! limits qBittorrent had before the daemon touched them.
//!
//! Persistence is implemented behind a single [`RollbackStore`] trait
//! with one driver:
//!
//! - **`Sqlite`**
//!
//! The journal is append-only. Restoration marks records instead of
//! deleting them; `restored` transitions 0→1 exactly once per record.
//! Recording is at-least-once: duplicates are harmless because restore
//! uses the earliest recorded `old_limit` per torrent.
//!
//! | Field          | Sample data                                | Description                          |
//! |----------------|--------------------------------------------|--------------------------------------|
//! | `id`           | 1                                          | Auto-increment id                    |
//! | `torrent_hash` | `c1277613db1d28709b034a017ab2cae4be07ae10` | Torrent identifier                   |
//! | `old_limit`    | -1                                         | Limit before the change (bytes/sec)  |
//! | `new_limit`    | 1048576                                    | Limit after the change (bytes/sec)   |
//! | `tracker_id`   | `priv`                                     | Tracker the torrent was matched to   |
//! | `timestamp`    | 1669397478                                 | When the change was applied          |
//! | `reason`       | `allocation`                               | Why the change was made              |
//! | `restored`     | 0                                          | Whether the change has been reversed |
pub mod error;
pub mod setup;
pub mod sqlite;

use std::collections::HashMap;

use mockall::automock;
use serde::Serialize;

use self::error::Error;
use crate::torrent::TorrentHash;

/// Reason recorded for changes made by the allocation cycle.
pub const REASON_ALLOCATION: &str = "allocation";

/// Reason recorded when a torrent leaving the active set is returned to
/// unlimited.
pub const REASON_AUTO_UNLIMIT: &str = "auto_unlimit_inactive";

/// A journaled limit change.
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct RollbackRecord {
    pub id: i64,
    pub torrent_hash: TorrentHash,
    pub old_limit: i64,
    pub new_limit: i64,
    pub tracker_id: String,
    pub timestamp: u64,
    pub reason: String,
    pub restored: bool,
}

/// A change about to be journaled.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ChangeEntry {
    pub torrent_hash: TorrentHash,
    pub old_limit: i64,
    pub new_limit: i64,
    pub tracker_id: String,
    pub reason: String,
}

/// Journal counters for the stats endpoint.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct RollbackStats {
    pub total_records: u64,
    pub unrestored_records: u64,
}

/// The journal persistence trait.
#[automock]
pub trait RollbackStore: Sync + Send {
    /// Creates the journal table and its indexes.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the schema cannot be created.
    fn create_tables(&self) -> Result<(), Error>;

    /// Drops the journal table.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the schema cannot be dropped.
    fn drop_tables(&self) -> Result<(), Error>;

    /// Journals a batch of changes at `timestamp`. No-op changes
    /// (`old_limit == new_limit`) are skipped.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the batch cannot be persisted.
    fn record_changes(&self, changes: &[ChangeEntry], timestamp: u64) -> Result<usize, Error>;

    /// Every unrestored record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the journal cannot be queried.
    fn list_unrestored(&self) -> Result<Vec<RollbackRecord>, Error>;

    /// The distinct hashes the journal has seen. With
    /// `include_restored = false`, only hashes that still have
    /// unrestored records.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the journal cannot be queried.
    fn list_touched_hashes(&self, include_restored: bool) -> Result<Vec<TorrentHash>, Error>;

    /// Marks every unrestored record of the given hashes as restored.
    ///
    /// # Returns
    ///
    /// The number of records that transitioned.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the journal cannot be updated.
    fn mark_restored(&self, hashes: &[TorrentHash]) -> Result<usize, Error>;

    /// Deletes restored records older than `before_timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the journal cannot be pruned.
    fn prune(&self, before_timestamp: u64) -> Result<usize, Error>;

    /// Journal counters.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the journal cannot be queried.
    fn stats(&self) -> Result<RollbackStats, Error>;
}

/// The limits a rollback must restore: the earliest recorded `old_limit`
/// per torrent. `records` must be ordered oldest first, as
/// [`RollbackStore::list_unrestored`] returns them.
#[must_use]
pub fn original_limits(records: &[RollbackRecord]) -> HashMap<TorrentHash, i64> {
    let mut limits = HashMap::new();
    for record in records {
        limits.entry(record.torrent_hash).or_insert(record.old_limit);
    }
    limits
}
