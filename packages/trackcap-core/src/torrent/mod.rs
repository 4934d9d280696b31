//! Torrent identity and metadata.
//!
//! A torrent is identified by its 20-byte v1 info-hash, carried everywhere
//! as [`TorrentHash`]. [`TorrentInfo`] is the per-cycle metadata snapshot
//! the adapter refreshes from qBittorrent.
pub mod repository;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// `-1` marks an unlimited per-torrent upload limit.
pub const UNLIMITED: i64 = -1;

/// A 20-byte torrent identifier, rendered as 40 lowercase hex characters.
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct TorrentHash([u8; 20]);

/// Errors raised when parsing a [`TorrentHash`] from its hex form.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseTorrentHashError {
    #[error("Torrent hash must be 40 hex characters, got {len}")]
    InvalidLength { len: usize },

    #[error("Torrent hash contains a non-hex character")]
    InvalidCharacter,
}

impl TorrentHash {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; 20] {
        self.0
    }

    /// The deterministic 0-99 bucket used by the rollout gate.
    ///
    /// Derived from the CRC32 of the lowercase hex rendering, so that
    /// membership of the managed set is stable across restarts for a
    /// given rollout percentage.
    #[must_use]
    pub fn rollout_bucket(&self) -> u8 {
        let digest = crc32fast::hash(self.to_string().as_bytes());
        u8::try_from(digest % 100).expect("value below 100 fits in a u8")
    }
}

impl fmt::Display for TorrentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TorrentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TorrentHash({self})")
    }
}

impl FromStr for TorrentHash {
    type Err = ParseTorrentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(ParseTorrentHashError::InvalidLength { len: s.len() });
        }

        let mut bytes = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ParseTorrentHashError::InvalidCharacter)?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| ParseTorrentHashError::InvalidCharacter)?;
        }

        Ok(Self(bytes))
    }
}

impl Serialize for TorrentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TorrentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-torrent metadata as observed from qBittorrent.
///
/// Refreshed by the adapter each cycle; destroyed when the cache entry
/// expires.
#[derive(Serialize, PartialEq, Debug, Clone)]
pub struct TorrentInfo {
    pub hash: TorrentHash,
    pub name: String,
    /// The single representative announce URL (first working, else first
    /// non-errored). Empty when no tracker could be determined.
    pub tracker_url: String,
    /// Current upload speed in bytes/sec.
    pub up_speed: u64,
    /// Current per-torrent upload limit in bytes/sec; [`UNLIMITED`] when
    /// no cap is set.
    pub upload_limit: i64,
    pub num_seeds: u32,
    pub num_leechs: u32,
    pub size: u64,
    pub progress: f64,
    pub state: String,
    /// Unix timestamp the torrent was added to the client.
    pub added_on: u64,
}

impl TorrentInfo {
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.upload_limit < 0
    }
}

#[cfg(test)]
mod tests {

    mod the_torrent_hash {
        use std::str::FromStr;

        use crate::torrent::{ParseTorrentHashError, TorrentHash};

        #[test]
        fn it_should_round_trip_through_its_hex_representation() {
            let hex = "3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0";

            let hash = TorrentHash::from_str(hex).unwrap();

            assert_eq!(hash.to_string(), hex);
        }

        #[test]
        fn it_should_reject_a_hash_with_the_wrong_length() {
            let err = TorrentHash::from_str("3b2455").unwrap_err();

            assert_eq!(err, ParseTorrentHashError::InvalidLength { len: 6 });
        }

        #[test]
        fn it_should_reject_a_hash_with_non_hex_characters() {
            let err = TorrentHash::from_str("zz245504cf5f11bbdbe1201cea6a6bf45aee1bc0").unwrap_err();

            assert_eq!(err, ParseTorrentHashError::InvalidCharacter);
        }

        #[test]
        fn it_should_produce_a_stable_rollout_bucket() {
            let hash = TorrentHash::from_str("3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0").unwrap();

            let bucket = hash.rollout_bucket();

            assert_eq!(bucket, hash.rollout_bucket());
            assert!(bucket < 100);
        }

        #[test]
        fn it_should_serialize_as_a_hex_string() {
            let hash = TorrentHash::from_str("3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0").unwrap();

            let json = serde_json::to_string(&hash).unwrap();

            assert_eq!(json, "\"3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0\"");
        }

        #[test]
        fn it_should_deserialize_from_a_hex_string() {
            let hash: TorrentHash =
                serde_json::from_str("\"3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0\"").unwrap();

            assert_eq!(hash.to_string(), "3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0");
        }
    }
}
