//! The allocation strategies.
//!
//! The fetch/select/diff/write skeleton is shared; only the computation
//! of proposed limits varies. All three strategies produce a full
//! per-hash limit map for the managed set:
//!
//! - [`equal`]: every torrent gets the same share of its tracker's cap.
//! - [`weighted`]: shares proportional to the activity score, bounded
//!   per torrent.
//! - [`soft`]: weighted distribution over effective caps that borrow
//!   headroom from underused trackers, smoothed with an EMA.
//!
//! Bandwidth is integer bytes/sec throughout; floats appear only inside
//! the computations and are truncated at the boundary.
pub mod equal;
pub mod soft;
pub mod weighted;

use std::collections::HashMap;

use serde::Serialize;
use trackcap_configuration::{AllocationStrategy, GlobalSettings};

use self::soft::SmoothingState;
use crate::torrent::TorrentHash;

/// No torrent is ever assigned less than this (10 KiB/s), even when the
/// cap divided by the torrent count falls below it. The resulting
/// overshoot is bounded by the floor times the torrent count.
pub const FLOOR_BYTES: i64 = 10 * 1024;

/// No torrent is ever assigned more than this fraction of its tracker's
/// cap (weighted and soft strategies).
pub const MAX_SHARE_FRACTION: f64 = 0.6;

/// Per-torrent strategy input.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct TorrentSample {
    pub hash: TorrentHash,
    pub up_speed: u64,
    pub num_leechs: u32,
}

/// Per-tracker strategy input: the configured cap plus the managed
/// torrents announcing to it.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct TrackerGroup {
    pub id: String,
    /// Base cap in bytes/sec; `-1` means unlimited.
    pub cap: i64,
    pub priority: u8,
    pub torrents: Vec<TorrentSample>,
}

impl TrackerGroup {
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.cap < 0
    }

    /// The summed upload speed of the group's torrents.
    #[must_use]
    pub fn current_usage(&self) -> u64 {
        self.torrents.iter().map(|torrent| torrent.up_speed).sum()
    }
}

/// Tunables for the soft strategy, lifted from the global settings.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct SoftParams {
    pub borrow_threshold_ratio: f64,
    pub max_borrow_fraction: f64,
    pub smoothing_alpha: f64,
    pub min_effective_delta: f64,
}

impl From<&GlobalSettings> for SoftParams {
    fn from(settings: &GlobalSettings) -> Self {
        Self {
            borrow_threshold_ratio: settings.borrow_threshold_ratio,
            max_borrow_fraction: settings.max_borrow_fraction,
            smoothing_alpha: settings.smoothing_alpha,
            min_effective_delta: settings.min_effective_delta,
        }
    }
}

/// Per-tracker values derived during one computation.
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct TrackerAllocation {
    pub id: String,
    pub base_cap: i64,
    /// The cap actually distributed: base plus borrow, after smoothing.
    pub effective_cap: i64,
    pub borrowed: i64,
    pub current_usage: u64,
    pub active_torrents: usize,
}

impl TrackerAllocation {
    fn without_borrowing(group: &TrackerGroup) -> Self {
        Self {
            id: group.id.clone(),
            base_cap: group.cap,
            effective_cap: group.cap,
            borrowed: 0,
            current_usage: group.current_usage(),
            active_torrents: group.torrents.len(),
        }
    }
}

/// The result of one strategy computation.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct AllocationOutcome {
    pub limits: HashMap<TorrentHash, i64>,
    pub trackers: Vec<TrackerAllocation>,
}

/// Computes proposed limits for every group under the given strategy.
///
/// The smoothing state is only consulted and advanced by the soft
/// strategy; it persists across cycles on the engine.
#[must_use]
pub fn compute(
    strategy: AllocationStrategy,
    groups: &[TrackerGroup],
    params: &SoftParams,
    smoothing: &mut SmoothingState,
) -> AllocationOutcome {
    match strategy {
        AllocationStrategy::Equal => {
            let mut outcome = AllocationOutcome::default();
            for group in groups {
                outcome.limits.extend(equal::allocate(group));
                outcome.trackers.push(TrackerAllocation::without_borrowing(group));
            }
            outcome
        }
        AllocationStrategy::Weighted => {
            let mut outcome = AllocationOutcome::default();
            for group in groups {
                outcome.limits.extend(weighted::distribute(group.cap, &group.torrents));
                outcome.trackers.push(TrackerAllocation::without_borrowing(group));
            }
            outcome
        }
        AllocationStrategy::Soft => soft::allocate(groups, params, smoothing),
    }
}
