//! The gradual rollout gate.
//!
//! Management can be limited to a deterministic share of torrents while
//! an operator gains confidence in a configuration. Selection is keyed
//! on the torrent hash, so membership is stable across cycles and
//! restarts, and monotone: raising the percentage only adds torrents.
use std::sync::atomic::{AtomicU8, Ordering::Relaxed};

use crate::torrent::TorrentHash;

#[derive(Debug)]
pub struct RolloutGate {
    percentage: AtomicU8,
}

impl RolloutGate {
    #[must_use]
    pub fn new(percentage: u8) -> Self {
        Self {
            percentage: AtomicU8::new(percentage.min(100)),
        }
    }

    #[must_use]
    pub fn percentage(&self) -> u8 {
        self.percentage.load(Relaxed)
    }

    pub fn set_percentage(&self, percentage: u8) {
        self.percentage.store(percentage.min(100), Relaxed);
    }

    /// Whether the hash falls inside the rolled-out share.
    #[must_use]
    pub fn is_selected(&self, hash: &TorrentHash) -> bool {
        let percentage = self.percentage();
        if percentage >= 100 {
            return true;
        }
        hash.rollout_bucket() < percentage
    }
}
