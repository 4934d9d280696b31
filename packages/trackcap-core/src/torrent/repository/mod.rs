//! Torrent repositories.
//!
//! Only the in-memory repository exists: peer-visible state lives in
//! qBittorrent, so nothing here needs to survive a restart. Limit changes
//! that must be reversible are journaled by the rollback store instead.
pub mod in_memory;
