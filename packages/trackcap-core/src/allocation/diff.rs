//! The differential write gate.
//!
//! Writing every computed limit back each cycle would flood the client
//! API with no-op changes. A write is only emitted when the proposal
//! crosses the unlimited boundary, or when the change is large both
//! relatively and absolutely.
/// Changes below this many bytes/sec never produce a write.
pub const MIN_ABSOLUTE_DELTA: i64 = 1024;

/// Whether a proposed limit differs enough from the current one to be
/// worth a write.
///
/// `-1` (unlimited) compares as different from every finite value, so
/// crossing the boundary in either direction always writes. For finite
/// pairs the change must reach
/// `max(differential_threshold × current, 1 KiB)`.
#[must_use]
pub fn needs_update(current: i64, proposed: i64, differential_threshold: f64) -> bool {
    if current == proposed {
        return false;
    }

    let current_is_unlimited = current < 0;
    let proposed_is_unlimited = proposed < 0;
    if current_is_unlimited || proposed_is_unlimited {
        return true;
    }

    let delta = (proposed - current).abs();

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let relative_gate = (differential_threshold * current as f64) as i64;

    delta >= relative_gate.max(MIN_ABSOLUTE_DELTA)
}
