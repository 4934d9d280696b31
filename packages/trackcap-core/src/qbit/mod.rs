//! The qBittorrent Web API adapter.
//!
//! The adapter is the only component that talks to qBittorrent. It owns
//! the authenticated session and applies the cross-cutting protections
//! the rest of the system relies on:
//!
//! - a minimum gap between outbound requests,
//! - a circuit breaker over transport failures,
//! - bounded retries for idempotent reads,
//! - batched, value-grouped limit writes.
pub mod circuit;
pub mod client;

use serde::Deserialize;

use crate::torrent::{TorrentHash, TorrentInfo, UNLIMITED};

/// Announce entry status: the tracker has been contacted and is working.
pub const TRACKER_STATUS_WORKING: i64 = 2;

/// Announce entry status: the tracker is not working.
pub const TRACKER_STATUS_ERROR: i64 = 4;

/// Errors raised by the adapter.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The circuit breaker is open; the call failed fast.
    #[error("qBittorrent API unavailable: circuit breaker is open")]
    Unavailable,

    /// The underlying HTTP client could not be constructed.
    #[error("Unable to build the qBittorrent HTTP client: {source}")]
    Initialization { source: reqwest::Error },

    /// A network-level failure (timeout, refused connection, 5xx).
    #[error("Transport error calling {endpoint}: {source}")]
    Transport { endpoint: String, source: reqwest::Error },

    /// qBittorrent rejected the configured credentials, or the session
    /// could not be re-established after expiry.
    #[error("Authentication with qBittorrent failed: {reason}")]
    Authentication { reason: String },

    /// The response had an unexpected shape or status.
    #[error("Unexpected qBittorrent response from {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },
}

/// One row of `GET /api/v2/torrents/info`.
///
/// Field names follow the qBittorrent wire format; [`TorrentEntry::into_torrent_info`]
/// converts into the domain type.
#[derive(Deserialize, Debug, Clone)]
pub struct TorrentEntry {
    pub hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub upspeed: u64,
    #[serde(default = "default_unlimited")]
    pub up_limit: i64,
    #[serde(default)]
    pub num_seeds: u32,
    #[serde(default)]
    pub num_leechs: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub added_on: u64,
}

fn default_unlimited() -> i64 {
    UNLIMITED
}

impl TorrentEntry {
    /// Converts the wire row into the domain type.
    ///
    /// Rows with unparsable hashes (e.g. v2-only torrents) are skipped by
    /// the caller; `None` marks them.
    #[must_use]
    pub fn into_torrent_info(self) -> Option<TorrentInfo> {
        let hash = match self.hash.parse::<TorrentHash>() {
            Ok(hash) => hash,
            Err(err) => {
                tracing::warn!(hash = %self.hash, %err, "skipping torrent with unsupported hash");
                return None;
            }
        };

        Some(TorrentInfo {
            hash,
            name: self.name,
            tracker_url: String::new(),
            up_speed: self.upspeed,
            upload_limit: self.up_limit,
            num_seeds: self.num_seeds,
            num_leechs: self.num_leechs,
            size: self.size,
            progress: self.progress,
            state: self.state,
            added_on: self.added_on,
        })
    }
}

/// One row of `GET /api/v2/torrents/trackers`.
#[derive(Deserialize, Debug, Clone)]
pub struct AnnounceEntry {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: i64,
}

impl AnnounceEntry {
    /// qBittorrent lists DHT/PEX/LSD as pseudo-entries with `**`-wrapped
    /// URLs; those never identify a tracker.
    #[must_use]
    fn is_real_tracker(&self) -> bool {
        !self.url.is_empty() && !self.url.starts_with("**")
    }
}

/// Selects the single representative announce URL for a torrent: the
/// first working tracker, else the first non-errored one.
#[must_use]
pub fn representative_url(entries: &[AnnounceEntry]) -> Option<String> {
    entries
        .iter()
        .find(|entry| entry.status == TRACKER_STATUS_WORKING && entry.is_real_tracker())
        .or_else(|| {
            entries
                .iter()
                .find(|entry| entry.status != TRACKER_STATUS_ERROR && entry.is_real_tracker())
        })
        .map(|entry| entry.url.clone())
}

#[cfg(test)]
mod tests {

    mod selecting_the_representative_url {

        use crate::qbit::{representative_url, AnnounceEntry, TRACKER_STATUS_ERROR, TRACKER_STATUS_WORKING};

        fn entry(url: &str, status: i64) -> AnnounceEntry {
            AnnounceEntry {
                url: url.to_string(),
                status,
            }
        }

        #[test]
        fn it_should_prefer_the_first_working_tracker() {
            let entries = vec![
                entry("** [DHT] **", TRACKER_STATUS_WORKING),
                entry("http://a.example.org/announce", 1),
                entry("http://b.example.org/announce", TRACKER_STATUS_WORKING),
            ];

            assert_eq!(
                representative_url(&entries),
                Some(String::from("http://b.example.org/announce"))
            );
        }

        #[test]
        fn it_should_fall_back_to_the_first_non_errored_tracker() {
            let entries = vec![
                entry("http://a.example.org/announce", TRACKER_STATUS_ERROR),
                entry("http://b.example.org/announce", 1),
            ];

            assert_eq!(
                representative_url(&entries),
                Some(String::from("http://b.example.org/announce"))
            );
        }

        #[test]
        fn it_should_skip_pseudo_entries() {
            let entries = vec![entry("** [PeX] **", TRACKER_STATUS_WORKING)];

            assert_eq!(representative_url(&entries), None);
        }

        #[test]
        fn it_should_return_none_for_an_empty_list() {
            assert_eq!(representative_url(&[]), None);
        }
    }

    mod deserializing_torrent_entries {

        use crate::qbit::TorrentEntry;
        use crate::torrent::UNLIMITED;

        #[test]
        fn it_should_convert_a_wire_row_into_the_domain_type() {
            let json = r#"{
                "hash": "3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0",
                "name": "ubuntu-24.04-desktop-amd64.iso",
                "upspeed": 512000,
                "up_limit": -1,
                "num_seeds": 4,
                "num_leechs": 12,
                "size": 4294967296,
                "progress": 1.0,
                "state": "uploading",
                "added_on": 1669397478
            }"#;

            let entry: TorrentEntry = serde_json::from_str(json).unwrap();
            let info = entry.into_torrent_info().unwrap();

            assert_eq!(info.hash.to_string(), "3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0");
            assert_eq!(info.up_speed, 512_000);
            assert_eq!(info.upload_limit, UNLIMITED);
            assert!(info.tracker_url.is_empty());
        }

        #[test]
        fn it_should_skip_rows_with_unsupported_hashes() {
            let json = r#"{"hash": "not-a-hash"}"#;

            let entry: TorrentEntry = serde_json::from_str(json).unwrap();

            assert!(entry.into_torrent_info().is_none());
        }

        #[test]
        fn it_should_default_a_missing_limit_to_unlimited() {
            let json = r#"{"hash": "3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0"}"#;

            let entry: TorrentEntry = serde_json::from_str(json).unwrap();

            assert_eq!(entry.into_torrent_info().unwrap().upload_limit, UNLIMITED);
        }
    }
}
