//! The core `trackcap-core` crate contains the per-tracker upload cap
//! logic which is independent of the delivery layer.
//!
//! It contains the allocation engine and its dependencies. It's a domain
//! layer which does not specify how operators interact with the daemon.
//!
//! ```text
//!  Delivery layer  |  Domain layer
//! --------------------------------
//!     HTTP surface |
//!   Webhook intake |-> Core engine
//!      Cycle task  |
//! ```
//!
//! # Introduction
//!
//! The crate's responsibility is to keep the sum of per-torrent upload
//! limits below each configured tracker's cap. Every cycle it:
//!
//! - fetches the actively uploading torrents from qBittorrent,
//! - classifies each torrent by its representative announce URL,
//! - selects the managed subset (rollout gate plus scoring),
//! - computes new limits under the configured strategy,
//! - writes only meaningfully-changed limits, in batches,
//! - journals every applied change for later rollback.
//!
//! # Modules
//!
//! - [`tracker`]: ordered regex matching of announce URLs to tracker ids.
//! - [`torrent`]: torrent identity and the in-memory torrent cache.
//! - [`qbit`]: the qBittorrent Web API adapter (session, rate limit,
//!   circuit breaker, batched writes).
//! - [`rollback`]: the persistent change journal.
//! - [`allocation`]: the cycle state machine and the three strategies.
//! - [`dry_run`]: the store for simulated limits.
pub mod allocation;
pub mod dry_run;
pub mod error;
pub mod qbit;
pub mod rollback;
pub mod torrent;
pub mod tracker;

pub mod test_helpers;

/// Seconds since the Unix epoch.
///
/// # Panics
///
/// Panics if the system clock is set before the Unix epoch.
#[must_use]
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is set before the Unix epoch")
        .as_secs()
}
