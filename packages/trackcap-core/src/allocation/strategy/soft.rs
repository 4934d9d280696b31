//! Soft caps: borrowing between trackers plus EMA smoothing.
//!
//! Trackers running close to their cap borrow unused headroom from idle
//! trackers for one cycle. The resulting effective cap is smoothed with
//! an exponential moving average and only committed when it moved enough,
//! so limits do not churn under noisy upload speeds.
use std::collections::HashMap;

use super::weighted;
use super::{AllocationOutcome, SoftParams, TrackerAllocation, TrackerGroup};

/// The per-tracker EMA state. Owned by the engine; persists across
/// cycles, resettable per tracker or wholesale.
#[derive(Debug, Clone, Default)]
pub struct SmoothingState {
    effective: HashMap<String, f64>,
}

impl SmoothingState {
    #[must_use]
    pub fn previous(&self, tracker_id: &str) -> Option<f64> {
        self.effective.get(tracker_id).copied()
    }

    pub fn commit(&mut self, tracker_id: &str, effective: f64) {
        self.effective.insert(tracker_id.to_string(), effective);
    }

    /// Clears the state for one tracker, or all of it.
    ///
    /// # Returns
    ///
    /// The number of cleared entries.
    pub fn reset(&mut self, tracker_id: Option<&str>) -> usize {
        match tracker_id {
            Some(tracker_id) => usize::from(self.effective.remove(tracker_id).is_some()),
            None => {
                let cleared = self.effective.len();
                self.effective.clear();
                cleared
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.effective.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.effective.is_empty()
    }
}

/// Computes limits for every group under borrowing + smoothing, then
/// distributes each tracker's effective cap with the weighted rule.
///
/// Unlimited trackers bypass borrowing entirely: they neither lend nor
/// borrow, and their torrents stay unlimited.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub(crate) fn allocate(
    groups: &[TrackerGroup],
    params: &SoftParams,
    smoothing: &mut SmoothingState,
) -> AllocationOutcome {
    let borrows = compute_borrows(groups, params);

    let mut outcome = AllocationOutcome::default();

    for group in groups {
        if group.is_unlimited() {
            outcome.limits.extend(weighted::distribute(group.cap, &group.torrents));
            outcome.trackers.push(TrackerAllocation::without_borrowing(group));
            continue;
        }

        let borrowed = borrows.get(&group.id).copied().unwrap_or(0);
        let raw_effective = (group.cap + borrowed) as f64;
        let effective_cap = smooth(smoothing, &group.id, raw_effective, params) as i64;

        outcome.limits.extend(weighted::distribute(effective_cap, &group.torrents));
        outcome.trackers.push(TrackerAllocation {
            id: group.id.clone(),
            base_cap: group.cap,
            effective_cap,
            borrowed,
            current_usage: group.current_usage(),
            active_torrents: group.torrents.len(),
        });
    }

    outcome
}

/// Applies the EMA and the commit gate.
///
/// The first observation for a tracker is committed as-is. Afterwards
/// the smoothed value replaces the previous one only when it moved by at
/// least `min_effective_delta` relative to it; otherwise the previous
/// cap is kept, which is what stops write churn under steady load.
fn smooth(state: &mut SmoothingState, tracker_id: &str, raw_effective: f64, params: &SoftParams) -> f64 {
    match state.previous(tracker_id) {
        None => {
            state.commit(tracker_id, raw_effective);
            raw_effective
        }
        Some(previous) => {
            let smoothed = params.smoothing_alpha * raw_effective + (1.0 - params.smoothing_alpha) * previous;
            let relative_change = if previous > 0.0 {
                (smoothed - previous).abs() / previous
            } else {
                1.0
            };

            if relative_change >= params.min_effective_delta {
                state.commit(tracker_id, smoothed);
                smoothed
            } else {
                previous
            }
        }
    }
}

/// One-pass borrow distribution.
///
/// A tracker qualifies when its usage reaches
/// `borrow_threshold_ratio × base_cap`. The pool is the summed headroom
/// of every finite-cap tracker. Qualifiers are visited by priority
/// (ties broken by id) and each takes its weight-proportional claim,
/// capped by `max_borrow_fraction × base_cap` and by what is left of the
/// pool.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn compute_borrows(groups: &[TrackerGroup], params: &SoftParams) -> HashMap<String, i64> {
    struct Borrower<'a> {
        group: &'a TrackerGroup,
        weight: f64,
    }

    let mut pool = 0.0_f64;
    let mut borrowers = Vec::new();

    for group in groups {
        if group.is_unlimited() {
            continue;
        }

        let cap = group.cap as f64;
        let used = group.current_usage() as f64;

        pool += (cap - used).max(0.0);

        let threshold = params.borrow_threshold_ratio * cap;
        if used >= threshold {
            borrowers.push(Borrower {
                group,
                weight: f64::from(group.priority) * (used - threshold).max(0.0),
            });
        }
    }

    let total_weight: f64 = borrowers.iter().map(|borrower| borrower.weight).sum();
    if pool <= 0.0 || total_weight <= 0.0 {
        return HashMap::new();
    }

    borrowers.sort_by(|a, b| {
        b.group
            .priority
            .cmp(&a.group.priority)
            .then_with(|| a.group.id.cmp(&b.group.id))
    });

    let mut borrows = HashMap::new();
    let mut remaining = pool;

    for borrower in borrowers {
        let claim = pool * borrower.weight / total_weight;
        let cap_bound = params.max_borrow_fraction * borrower.group.cap as f64;
        let share = claim.min(cap_bound).min(remaining).max(0.0);

        remaining -= share;
        borrows.insert(borrower.group.id.clone(), share as i64);
    }

    borrows
}
