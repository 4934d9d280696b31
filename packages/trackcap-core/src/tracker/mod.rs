//! Tracker classification.
//!
//! A tracker is an announce server identified by URL. Operators configure
//! trackers as an ordered list of regex patterns; the matcher maps each
//! torrent's representative announce URL to the id of the first pattern
//! that matches it.
pub mod matcher;

/// Errors raised while compiling the configured tracker patterns.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured list lacks the unconditional trailing pattern, so
    /// some URLs would be unclassifiable.
    #[error("The trackers list must end with a catch-all pattern (.*)")]
    MissingCatchAll,

    #[error("Invalid regex pattern for tracker {tracker_id} (normalized to {normalized}): {source}")]
    InvalidPattern {
        tracker_id: String,
        normalized: String,
        source: regex::Error,
    },
}
