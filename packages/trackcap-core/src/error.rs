//! Core engine errors.
//!
//! These errors cover a full allocation cycle: failures talking to
//! qBittorrent, failures journaling changes, and detected invariant
//! violations. The cycle task logs them, increments failure counters and
//! returns the engine to idle without committing partial state.
use std::panic::Location;

/// Errors raised while running an allocation cycle or an on-demand
/// operation (rollback, reset, preview).
#[derive(thiserror::Error, Debug)]
pub enum CycleError {
    /// The qBittorrent adapter failed.
    #[error("qBittorrent client error: {source}")]
    Client {
        #[from]
        source: crate::qbit::Error,
    },

    /// The rollback journal failed.
    #[error("Rollback store error: {source}")]
    Rollback {
        #[from]
        source: crate::rollback::error::Error,
    },

    /// An invariant the engine relies on was violated; the cycle is
    /// abandoned without committing.
    #[error("Engine state error: {reason}, {location}")]
    State {
        reason: String,
        location: &'static Location<'static>,
    },
}

impl CycleError {
    #[track_caller]
    #[must_use]
    pub fn state(reason: String) -> Self {
        Self::State {
            reason,
            location: Location::caller(),
        }
    }
}
