//! Weighted distribution: shares proportional to the activity score,
//! with per-torrent bounds.
use std::collections::HashMap;

use super::{TorrentSample, FLOOR_BYTES, MAX_SHARE_FRACTION};
use crate::allocation::scoring::activity_score;
use crate::torrent::{TorrentHash, UNLIMITED};

/// Distributes `cap` across the torrents proportionally to their scores.
///
/// Per-torrent bounds are `[FLOOR_BYTES, MAX_SHARE_FRACTION × cap]`.
/// Excess trimmed by the upper bound is redistributed to torrents with
/// headroom in at most two passes; an unscored group falls back to an
/// equal split.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub(crate) fn distribute(cap: i64, torrents: &[TorrentSample]) -> HashMap<TorrentHash, i64> {
    if torrents.is_empty() {
        return HashMap::new();
    }

    if cap < 0 {
        return torrents.iter().map(|torrent| (torrent.hash, UNLIMITED)).collect();
    }

    if torrents.len() == 1 {
        return HashMap::from([(torrents[0].hash, cap)]);
    }

    let scores: Vec<f64> = torrents
        .iter()
        .map(|torrent| activity_score(torrent.num_leechs, torrent.up_speed))
        .collect();
    let total_score: f64 = scores.iter().sum();

    let cap_f = cap as f64;
    let max_share = MAX_SHARE_FRACTION * cap_f;
    let floor = FLOOR_BYTES as f64;

    let mut shares: Vec<f64> = if total_score <= 0.0 {
        vec![cap_f / torrents.len() as f64; torrents.len()]
    } else {
        scores.iter().map(|score| cap_f * score / total_score).collect()
    };

    for share in &mut shares {
        *share = share.clamp(floor, max_share);
    }

    for _ in 0..2 {
        let assigned: f64 = shares.iter().sum();
        let leftover = cap_f - assigned;
        if leftover.abs() < 1.0 {
            break;
        }

        if leftover > 0.0 {
            let headrooms: Vec<f64> = shares.iter().map(|share| (max_share - share).max(0.0)).collect();
            let total_headroom: f64 = headrooms.iter().sum();
            if total_headroom <= 0.0 {
                break;
            }
            let granted = leftover.min(total_headroom);
            for (share, headroom) in shares.iter_mut().zip(&headrooms) {
                *share += granted * headroom / total_headroom;
            }
        } else {
            let slacks: Vec<f64> = shares.iter().map(|share| (share - floor).max(0.0)).collect();
            let total_slack: f64 = slacks.iter().sum();
            if total_slack <= 0.0 {
                break;
            }
            let cut = (-leftover).min(total_slack);
            for (share, slack) in shares.iter_mut().zip(&slacks) {
                *share -= cut * slack / total_slack;
            }
        }
    }

    torrents
        .iter()
        .zip(shares)
        .map(|(torrent, share)| (torrent.hash, share as i64))
        .collect()
}
