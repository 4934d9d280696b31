//! The in-memory torrent cache.
use std::collections::HashMap;

use serde::Serialize;

use crate::torrent::{TorrentHash, TorrentInfo};

/// A cache entry: the latest metadata snapshot plus the time it was last
/// observed.
#[derive(Serialize, PartialEq, Debug, Clone)]
pub struct CachedTorrent {
    pub info: TorrentInfo,
    /// Unix timestamp of the last upsert.
    pub last_seen: u64,
}

/// Cache counters for the stats endpoint.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
}

/// The in-memory cache of recently active torrents.
///
/// The cycle task is the only writer. HTTP handlers and the preview
/// pipeline read cheap snapshots, so a partially applied cycle is never
/// observable.
#[derive(Debug, Default)]
pub struct InMemoryTorrentRepository {
    torrents: tokio::sync::RwLock<HashMap<TorrentHash, CachedTorrent>>,
}

impl InMemoryTorrentRepository {
    /// Inserts the torrent or refreshes an existing entry, updating its
    /// `last_seen` timestamp.
    pub async fn upsert(&self, info: TorrentInfo, now: u64) {
        let mut torrents = self.torrents.write().await;
        torrents.insert(info.hash, CachedTorrent { info, last_seen: now });
    }

    /// Overwrites the cached upload limit after a successful write.
    ///
    /// # Returns
    ///
    /// `false` when the torrent is not cached.
    pub async fn update_limit(&self, hash: &TorrentHash, limit: i64) -> bool {
        let mut torrents = self.torrents.write().await;
        match torrents.get_mut(hash) {
            Some(entry) => {
                entry.info.upload_limit = limit;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub async fn get(&self, hash: &TorrentHash) -> Option<CachedTorrent> {
        self.torrents.read().await.get(hash).cloned()
    }

    /// The cached upload limit, if the torrent is known.
    #[must_use]
    pub async fn current_limit(&self, hash: &TorrentHash) -> Option<i64> {
        self.torrents.read().await.get(hash).map(|entry| entry.info.upload_limit)
    }

    pub async fn remove(&self, hash: &TorrentHash) -> bool {
        self.torrents.write().await.remove(hash).is_some()
    }

    /// Removes entries not seen within `ttl_seconds` of `now`.
    ///
    /// # Returns
    ///
    /// The number of evicted entries.
    pub async fn evict_stale(&self, now: u64, ttl_seconds: u64) -> usize {
        let mut torrents = self.torrents.write().await;
        let before = torrents.len();
        torrents.retain(|_, entry| now.saturating_sub(entry.last_seen) <= ttl_seconds);
        before - torrents.len()
    }

    /// A consistent copy of every cached entry.
    #[must_use]
    pub async fn snapshot(&self) -> Vec<CachedTorrent> {
        self.torrents.read().await.values().cloned().collect()
    }

    /// All cached hashes, for the tracker-URL backfill step.
    #[must_use]
    pub async fn hashes(&self) -> Vec<TorrentHash> {
        self.torrents.read().await.keys().copied().collect()
    }

    #[must_use]
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.torrents.read().await.len(),
        }
    }
}
