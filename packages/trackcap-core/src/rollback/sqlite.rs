//! The `SQLite3` rollback journal driver.
use std::str::FromStr;

use r2d2::Pool;
use r2d2_sqlite::rusqlite::params;
use r2d2_sqlite::SqliteConnectionManager;

use super::error::Error;
use super::{ChangeEntry, RollbackRecord, RollbackStats, RollbackStore};
use crate::torrent::TorrentHash;

pub struct Sqlite {
    pool: Pool<SqliteConnectionManager>,
}

impl Sqlite {
    /// It instantiates a new `SQLite3` journal driver.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if `db_path` is not able to back an
    /// `SQLite` database.
    pub fn new(db_path: &str) -> Result<Self, Error> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = r2d2::Pool::builder().build(manager)?;

        Ok(Self { pool })
    }

    /// An in-memory journal for tests and previews.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] if the pool cannot be created.
    pub fn memory() -> Result<Self, Error> {
        // A single pooled connection, otherwise every checkout would see
        // its own empty in-memory database.
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;

        Ok(Self { pool })
    }
}

impl RollbackStore for Sqlite {
    fn create_tables(&self) -> Result<(), Error> {
        let create_entries_table = "
        CREATE TABLE IF NOT EXISTS rollback_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            torrent_hash TEXT NOT NULL,
            old_limit INTEGER NOT NULL,
            new_limit INTEGER NOT NULL,
            tracker_id TEXT NOT NULL DEFAULT '',
            timestamp INTEGER NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            restored INTEGER NOT NULL DEFAULT 0
        );"
        .to_string();

        let conn = self.pool.get()?;

        conn.execute(&create_entries_table, [])?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rollback_hash ON rollback_entries(torrent_hash)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rollback_timestamp ON rollback_entries(timestamp)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rollback_restored ON rollback_entries(restored)",
            [],
        )?;

        Ok(())
    }

    fn drop_tables(&self) -> Result<(), Error> {
        let conn = self.pool.get()?;

        conn.execute("DROP TABLE rollback_entries;", [])?;

        Ok(())
    }

    fn record_changes(&self, changes: &[ChangeEntry], timestamp: u64) -> Result<usize, Error> {
        let valid_changes: Vec<&ChangeEntry> = changes
            .iter()
            .filter(|change| change.old_limit != change.new_limit)
            .collect();

        if valid_changes.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO rollback_entries
                 (torrent_hash, old_limit, new_limit, tracker_id, timestamp, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for change in &valid_changes {
                stmt.execute(params![
                    change.torrent_hash.to_string(),
                    change.old_limit,
                    change.new_limit,
                    change.tracker_id,
                    timestamp,
                    change.reason,
                ])?;
            }
        }

        tx.commit()?;

        Ok(valid_changes.len())
    }

    fn list_unrestored(&self) -> Result<Vec<RollbackRecord>, Error> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT id, torrent_hash, old_limit, new_limit, tracker_id, timestamp, reason, restored
             FROM rollback_entries
             WHERE restored = 0
             ORDER BY timestamp ASC, id ASC",
        )?;

        let record_iter = stmt.query_map([], |row| {
            let hash_string: String = row.get(1)?;
            Ok((
                hash_string,
                RowData {
                    id: row.get(0)?,
                    old_limit: row.get(2)?,
                    new_limit: row.get(3)?,
                    tracker_id: row.get(4)?,
                    timestamp: row.get(5)?,
                    reason: row.get(6)?,
                    restored: row.get::<_, i64>(7)? != 0,
                },
            ))
        })?;

        let mut records = Vec::new();
        for row in record_iter {
            let (hash_string, data) = row?;
            // A malformed row cannot be restored; skip it instead of
            // aborting the whole rollback.
            let Ok(torrent_hash) = TorrentHash::from_str(&hash_string) else {
                tracing::warn!(hash = %hash_string, "skipping rollback record with malformed hash");
                continue;
            };
            records.push(RollbackRecord {
                id: data.id,
                torrent_hash,
                old_limit: data.old_limit,
                new_limit: data.new_limit,
                tracker_id: data.tracker_id,
                timestamp: data.timestamp,
                reason: data.reason,
                restored: data.restored,
            });
        }

        Ok(records)
    }

    fn list_touched_hashes(&self, include_restored: bool) -> Result<Vec<TorrentHash>, Error> {
        let conn = self.pool.get()?;

        let query = if include_restored {
            "SELECT DISTINCT torrent_hash FROM rollback_entries"
        } else {
            "SELECT DISTINCT torrent_hash FROM rollback_entries WHERE restored = 0"
        };

        let mut stmt = conn.prepare(query)?;

        let hash_iter = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let hashes = hash_iter
            .filter_map(std::result::Result::ok)
            .filter_map(|hash_string| TorrentHash::from_str(&hash_string).ok())
            .collect();

        Ok(hashes)
    }

    fn mark_restored(&self, hashes: &[TorrentHash]) -> Result<usize, Error> {
        if hashes.is_empty() {
            return Ok(0);
        }

        let conn = self.pool.get()?;

        let placeholders = vec!["?"; hashes.len()].join(",");
        let query = format!(
            "UPDATE rollback_entries SET restored = 1 WHERE torrent_hash IN ({placeholders}) AND restored = 0"
        );

        let hash_strings: Vec<String> = hashes.iter().map(ToString::to_string).collect();
        let updated = conn.execute(&query, r2d2_sqlite::rusqlite::params_from_iter(hash_strings))?;

        Ok(updated)
    }

    fn prune(&self, before_timestamp: u64) -> Result<usize, Error> {
        let conn = self.pool.get()?;

        let deleted = conn.execute(
            "DELETE FROM rollback_entries WHERE timestamp < ?1 AND restored = 1",
            params![before_timestamp],
        )?;

        Ok(deleted)
    }

    fn stats(&self) -> Result<RollbackStats, Error> {
        let conn = self.pool.get()?;

        let total_records: u64 = conn.query_row("SELECT COUNT(*) FROM rollback_entries", [], |row| row.get(0))?;
        let unrestored_records: u64 = conn.query_row(
            "SELECT COUNT(*) FROM rollback_entries WHERE restored = 0",
            [],
            |row| row.get(0),
        )?;

        Ok(RollbackStats {
            total_records,
            unrestored_records,
        })
    }
}

struct RowData {
    id: i64,
    old_limit: i64,
    new_limit: i64,
    tracker_id: String,
    timestamp: u64,
    reason: String,
    restored: bool,
}
