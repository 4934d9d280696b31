//! The allocation engine.
//!
//! Each cycle the engine fetches the actively uploading torrents,
//! classifies them by tracker, selects the managed subset, computes new
//! per-torrent limits under the configured strategy, and writes only the
//! changes that pass the differential gate. Applied changes are journaled
//! for rollback; torrents that leave the active set can be returned to
//! unlimited.
pub mod diff;
pub mod engine;
pub mod rollout;
pub mod scoring;
pub mod strategy;
