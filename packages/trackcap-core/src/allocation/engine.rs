//! The allocation engine: one cycle task drives fetch → classify →
//! select → compute → diff → write → record → postprocess.
//!
//! Cycles never overlap: both the periodic task and force-cycle requests
//! serialize on an internal gate. Shared maps (cache, managed set,
//! smoothing state) are written only from within a cycle; readers get
//! snapshots.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use trackcap_configuration::GlobalSettings;

use super::diff::needs_update;
use super::rollout::RolloutGate;
use super::scoring::{activity_score, ScoreDistribution};
use super::strategy::soft::SmoothingState;
use super::strategy::{self, SoftParams, TorrentSample, TrackerAllocation, TrackerGroup};
use crate::dry_run::DryRunStore;
use crate::error::CycleError;
use crate::now_unix;
use crate::qbit::client::{batch_writes, QbitClient, BACKFILL_HASH_CAP};
use crate::rollback::{
    original_limits, ChangeEntry, RollbackStore, REASON_ALLOCATION, REASON_AUTO_UNLIMIT,
};
use crate::torrent::repository::in_memory::InMemoryTorrentRepository;
use crate::torrent::{TorrentHash, TorrentInfo, UNLIMITED};
use crate::tracker::matcher::TrackerMatcher;

/// Where the cycle state machine currently is.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    #[display("idle")]
    Idle,
    #[display("fetching")]
    Fetching,
    #[display("classifying")]
    Classifying,
    #[display("selecting")]
    Selecting,
    #[display("computing")]
    Computing,
    #[display("diffing")]
    Diffing,
    #[display("writing")]
    Writing,
    #[display("postprocess")]
    Postprocess,
}

/// Book-keeping for a torrent under engine-assigned limits.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct ManagedEntry {
    pub added_at: u64,
    pub last_seen: u64,
    pub current_limit: i64,
}

/// A managed torrent as listed by the stats surface.
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct ManagedTorrent {
    pub hash: TorrentHash,
    pub tracker_id: String,
    pub added_at: u64,
    pub last_seen: u64,
    pub current_limit: i64,
}

/// Engine counters for the stats surface.
#[derive(Serialize, PartialEq, Debug, Clone, Default)]
pub struct EngineStats {
    pub cycles: u64,
    pub cycle_errors: u64,
    pub last_cycle_at: Option<u64>,
    pub last_cycle_duration_ms: Option<u64>,
    pub last_cycle_succeeded: Option<bool>,
    pub active_torrents: usize,
    pub managed_torrents: usize,
    pub limits_applied: u64,
    pub writes_deferred: u64,
    pub api_calls_last_cycle: u64,
    pub score_distribution: ScoreDistribution,
}

/// The outcome of one completed cycle.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct CycleReport {
    pub active_torrents: usize,
    pub managed_torrents: usize,
    pub changes_applied: usize,
    pub changes_failed: usize,
    pub changes_deferred: usize,
    pub cache_entries_evicted: usize,
    pub duration_ms: u64,
    pub dry_run: bool,
}

/// One row of the dry-run computation returned by the preview surface.
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct ProposedChange {
    pub hash: TorrentHash,
    pub tracker_id: String,
    pub current_limit: Option<i64>,
    pub proposed_limit: i64,
}

/// The full preview payload: proposed writes plus per-tracker summaries.
#[derive(Serialize, PartialEq, Debug, Clone)]
pub struct CyclePreview {
    pub strategy: String,
    pub changes: Vec<ProposedChange>,
    pub trackers: Vec<TrackerAllocation>,
}

/// The outcome of an on-demand rollback or reset.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub torrents_restored: usize,
    pub torrents_failed: usize,
    pub records_marked: usize,
    pub dry_run: bool,
}

/// Per-tracker usage as reported by the stats surface.
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct TrackerUsage {
    pub id: String,
    pub name: String,
    pub max_upload_speed: i64,
    pub priority: u8,
    pub active_torrents: usize,
    pub managed_torrents: usize,
    pub current_usage: u64,
}

/// Webhook-driven hints consumed by the next cycle's selection.
#[derive(Debug, Default)]
struct PendingBias {
    hashes: HashSet<TorrentHash>,
    trackers: HashSet<String>,
}

struct AppliedChanges {
    applied: usize,
    failed: usize,
    deferred: usize,
}

pub struct AllocationEngine {
    settings: GlobalSettings,
    qbit: Arc<QbitClient>,
    matcher: Arc<TrackerMatcher>,
    rollback: Arc<Box<dyn RollbackStore>>,
    /// When disabled, changes are applied without being journaled.
    track_changes: bool,
    cache: Arc<InMemoryTorrentRepository>,
    dry_run_store: Option<Arc<DryRunStore>>,
    rollout: RolloutGate,
    managed: RwLock<HashMap<TorrentHash, ManagedEntry>>,
    smoothing: Mutex<SmoothingState>,
    pending: std::sync::Mutex<PendingBias>,
    cycle_gate: Mutex<()>,
    phase: std::sync::RwLock<CyclePhase>,
    stats: std::sync::RwLock<EngineStats>,
}

impl AllocationEngine {
    #[must_use]
    pub fn new(
        settings: &GlobalSettings,
        qbit: &Arc<QbitClient>,
        matcher: &Arc<TrackerMatcher>,
        rollback: &Arc<Box<dyn RollbackStore>>,
        track_changes: bool,
        cache: &Arc<InMemoryTorrentRepository>,
        dry_run_store: Option<Arc<DryRunStore>>,
    ) -> Self {
        Self {
            settings: settings.clone(),
            qbit: qbit.clone(),
            matcher: matcher.clone(),
            rollback: rollback.clone(),
            track_changes,
            cache: cache.clone(),
            dry_run_store,
            rollout: RolloutGate::new(settings.rollout_percentage),
            managed: RwLock::new(HashMap::new()),
            smoothing: Mutex::new(SmoothingState::default()),
            pending: std::sync::Mutex::new(PendingBias::default()),
            cycle_gate: Mutex::new(()),
            phase: std::sync::RwLock::new(CyclePhase::Idle),
            stats: std::sync::RwLock::new(EngineStats::default()),
        }
    }

    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run_store.is_some()
    }

    #[must_use]
    pub fn phase(&self) -> CyclePhase {
        *self.phase.read().expect("phase lock is not poisoned")
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats.read().expect("stats lock is not poisoned").clone()
    }

    #[must_use]
    pub fn rollout_percentage(&self) -> u8 {
        self.rollout.percentage()
    }

    pub fn set_rollout_percentage(&self, percentage: u8) {
        self.rollout.set_percentage(percentage);
        tracing::info!(percentage = self.rollout.percentage(), "rollout percentage updated");
    }

    /// Runs one full allocation cycle. Cycles serialize on an internal
    /// gate, so a force-cycle request issued while a cycle is in flight
    /// waits for it instead of overlapping it.
    ///
    /// # Errors
    ///
    /// Returns a [`CycleError`] when fetching, journaling or an engine
    /// invariant fails; the engine returns to idle and the next cycle
    /// reconciles.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let _cycle = self.cycle_gate.lock().await;

        let started = std::time::Instant::now();
        let api_calls_before = self.qbit.stats().api_calls;

        let result = self.cycle_inner().await;

        self.set_phase(CyclePhase::Idle);

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let api_calls = self.qbit.stats().api_calls.saturating_sub(api_calls_before);

        let mut stats = self.stats.write().expect("stats lock is not poisoned");
        stats.cycles += 1;
        stats.last_cycle_at = Some(now_unix());
        stats.last_cycle_duration_ms = Some(duration_ms);
        stats.api_calls_last_cycle = api_calls;

        match result {
            Ok(mut report) => {
                report.duration_ms = duration_ms;
                stats.last_cycle_succeeded = Some(true);
                stats.active_torrents = report.active_torrents;
                stats.managed_torrents = report.managed_torrents;
                stats.limits_applied += report.changes_applied as u64;
                stats.writes_deferred += report.changes_deferred as u64;

                tracing::info!(
                    managed = report.managed_torrents,
                    applied = report.changes_applied,
                    deferred = report.changes_deferred,
                    duration_ms,
                    "allocation cycle completed"
                );
                Ok(report)
            }
            Err(err) => {
                stats.cycle_errors += 1;
                stats.last_cycle_succeeded = Some(false);
                tracing::error!(%err, "allocation cycle failed");
                Err(err)
            }
        }
    }

    async fn cycle_inner(&self) -> Result<CycleReport, CycleError> {
        let now = now_unix();
        let bias = self.take_pending();

        // Fetching.
        self.set_phase(CyclePhase::Fetching);
        let min_up_bps = self.settings.active_torrent_threshold_kb * 1024;
        let mut torrents = self.qbit.active_torrents(min_up_bps).await?;

        let fetched: HashSet<TorrentHash> = torrents.iter().map(|torrent| torrent.hash).collect();
        let backfill: Vec<TorrentHash> = self
            .cache
            .hashes()
            .await
            .into_iter()
            .filter(|hash| !fetched.contains(hash))
            .take(BACKFILL_HASH_CAP)
            .collect();

        if !backfill.is_empty() {
            match self.qbit.torrents_by_hashes(&backfill).await {
                Ok(mut cached_torrents) => torrents.append(&mut cached_torrents),
                Err(err) => {
                    tracing::warn!(%err, "tracker backfill failed, continuing with the active set");
                }
            }
        }

        self.resolve_tracker_urls(&mut torrents).await;

        for torrent in &torrents {
            self.cache.upsert(torrent.clone(), now).await;
        }
        let cache_entries_evicted = self.cache.evict_stale(now, self.settings.cache_ttl_seconds).await;

        let seen_this_cycle: HashSet<TorrentHash> = torrents.iter().map(|torrent| torrent.hash).collect();

        // Classifying.
        self.set_phase(CyclePhase::Classifying);
        let classified: Vec<(TorrentInfo, String)> = torrents
            .into_iter()
            .map(|torrent| {
                let tracker_id = self.matcher.match_url(&torrent.tracker_url);
                (torrent, tracker_id)
            })
            .collect();

        // Selecting.
        self.set_phase(CyclePhase::Selecting);
        let sticky: HashSet<TorrentHash> = self.managed.read().await.keys().copied().collect();
        let mut distribution = ScoreDistribution::default();
        let selected = self.select(&classified, &sticky, &bias, &mut distribution);
        self.stats.write().expect("stats lock is not poisoned").score_distribution = distribution;

        // Computing.
        self.set_phase(CyclePhase::Computing);
        let groups = self.build_groups(&selected);
        let outcome = {
            let mut smoothing = self.smoothing.lock().await;
            strategy::compute(
                self.settings.allocation_strategy,
                &groups,
                &SoftParams::from(&self.settings),
                &mut smoothing,
            )
        };

        // Diffing.
        self.set_phase(CyclePhase::Diffing);
        let mut to_write: HashMap<TorrentHash, i64> = HashMap::new();
        for (hash, proposed) in &outcome.limits {
            match self.cache.current_limit(hash).await {
                None => {
                    to_write.insert(*hash, *proposed);
                }
                Some(current) => {
                    if needs_update(current, *proposed, self.settings.differential_threshold) {
                        to_write.insert(*hash, *proposed);
                    }
                }
            }
        }

        // Writing (records each batch just before issuing it).
        self.set_phase(CyclePhase::Writing);
        let tracker_of: HashMap<TorrentHash, String> = selected
            .iter()
            .map(|(torrent, tracker_id)| (torrent.hash, tracker_id.clone()))
            .collect();
        let mut budget = self.settings.max_api_calls_per_cycle;
        let changes = self
            .apply_changes(&to_write, &tracker_of, REASON_ALLOCATION, &mut budget, now)
            .await?;

        // Postprocess: refresh the managed set, then return inactive
        // managed torrents to unlimited.
        self.set_phase(CyclePhase::Postprocess);
        self.refresh_managed_entries(&selected, now).await;
        let unlimited = self.auto_unlimit_inactive(&seen_this_cycle, &mut budget, now).await?;

        Ok(CycleReport {
            active_torrents: classified.len(),
            managed_torrents: selected.len(),
            changes_applied: changes.applied + unlimited.applied,
            changes_failed: changes.failed + unlimited.failed,
            changes_deferred: changes.deferred + unlimited.deferred,
            cache_entries_evicted,
            duration_ms: 0,
            dry_run: self.is_dry_run(),
        })
    }

    /// Fills missing representative URLs, reusing cached ones before
    /// asking the client.
    async fn resolve_tracker_urls(&self, torrents: &mut [TorrentInfo]) {
        for torrent in torrents {
            if !torrent.tracker_url.is_empty() {
                continue;
            }

            if let Some(cached) = self.cache.get(&torrent.hash).await {
                if !cached.info.tracker_url.is_empty() {
                    torrent.tracker_url = cached.info.tracker_url;
                    continue;
                }
            }

            match self.qbit.tracker_url_for(&torrent.hash).await {
                Ok(Some(url)) => torrent.tracker_url = url,
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(hash = %torrent.hash, %err, "unable to resolve tracker URL");
                }
            }
        }
    }

    /// Applies the rollout gate and the managed-set bound.
    ///
    /// Already-managed torrents stay eligible regardless of the gate so
    /// their limits are not orphaned. Webhook-flagged torrents and
    /// trackers are served first; the rest is ordered by score.
    fn select(
        &self,
        classified: &[(TorrentInfo, String)],
        sticky: &HashSet<TorrentHash>,
        bias: &PendingBias,
        distribution: &mut ScoreDistribution,
    ) -> Vec<(TorrentInfo, String)> {
        let mut eligible: Vec<(bool, f64, &(TorrentInfo, String))> = Vec::new();

        for entry in classified {
            let (torrent, tracker_id) = entry;
            let score = activity_score(torrent.num_leechs, torrent.up_speed);
            distribution.record(score);

            if !sticky.contains(&torrent.hash) && !self.rollout.is_selected(&torrent.hash) {
                continue;
            }

            let prioritized = bias.hashes.contains(&torrent.hash) || bias.trackers.contains(tracker_id);
            eligible.push((prioritized, score, entry));
        }

        eligible.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.total_cmp(&a.1))
                .then_with(|| a.2 .0.hash.cmp(&b.2 .0.hash))
        });
        eligible.truncate(self.settings.max_managed_torrents);

        eligible.into_iter().map(|(_, _, entry)| entry.clone()).collect()
    }

    /// Groups the selected torrents by tracker, in declared tracker
    /// order so the strategies see deterministic input.
    fn build_groups(&self, selected: &[(TorrentInfo, String)]) -> Vec<TrackerGroup> {
        let mut by_id: HashMap<&str, Vec<TorrentSample>> = HashMap::new();
        for (torrent, tracker_id) in selected {
            by_id.entry(tracker_id.as_str()).or_default().push(TorrentSample {
                hash: torrent.hash,
                up_speed: torrent.up_speed,
                num_leechs: torrent.num_leechs,
            });
        }

        let mut groups = Vec::new();
        for tracker in self.matcher.all_trackers() {
            if let Some(mut torrents) = by_id.remove(tracker.id.as_str()) {
                torrents.sort_by_key(|torrent| torrent.hash);
                groups.push(TrackerGroup {
                    id: tracker.id,
                    cap: tracker.max_upload_speed,
                    priority: tracker.priority,
                    torrents,
                });
            }
        }
        groups
    }

    /// Records and applies a set of limit changes in value-grouped
    /// batches. Each batch is journaled immediately before its write so
    /// a crash can never leave an unjournaled change; a failed batch is
    /// skipped and reattempted next cycle.
    async fn apply_changes(
        &self,
        limits: &HashMap<TorrentHash, i64>,
        tracker_of: &HashMap<TorrentHash, String>,
        reason: &str,
        budget: &mut usize,
        now: u64,
    ) -> Result<AppliedChanges, CycleError> {
        let mut changes = AppliedChanges {
            applied: 0,
            failed: 0,
            deferred: 0,
        };

        for batch in batch_writes(limits) {
            if !self.is_dry_run() && *budget == 0 {
                changes.deferred += batch.hashes.len();
                continue;
            }

            let mut entries = Vec::with_capacity(batch.hashes.len());
            for hash in &batch.hashes {
                let old_limit = self.cache.current_limit(hash).await.unwrap_or(UNLIMITED);
                entries.push(ChangeEntry {
                    torrent_hash: *hash,
                    old_limit,
                    new_limit: batch.limit,
                    tracker_id: tracker_of.get(hash).cloned().unwrap_or_else(|| String::from("unknown")),
                    reason: reason.to_string(),
                });
            }

            // Journal first: a change must be recoverable before it is
            // observable in qBittorrent.
            if self.track_changes {
                self.rollback.record_changes(&entries, now)?;
            }

            if let Some(store) = &self.dry_run_store {
                let simulated: HashMap<TorrentHash, i64> =
                    batch.hashes.iter().map(|hash| (*hash, batch.limit)).collect();
                if let Err(err) = store.set_many(&simulated) {
                    tracing::warn!(%err, "dry-run store write failed");
                }
                for hash in &batch.hashes {
                    self.cache.update_limit(hash, batch.limit).await;
                }
                changes.applied += batch.hashes.len();
                tracing::debug!(
                    limit = batch.limit,
                    torrents = batch.hashes.len(),
                    "dry run: simulated limit change"
                );
                continue;
            }

            match self.qbit.set_upload_limit(&batch.hashes, batch.limit).await {
                Ok(()) => {
                    *budget = budget.saturating_sub(1);
                    changes.applied += batch.hashes.len();
                    for hash in &batch.hashes {
                        self.cache.update_limit(hash, batch.limit).await;
                    }
                }
                Err(err) => {
                    changes.failed += batch.hashes.len();
                    tracing::warn!(limit = batch.limit, torrents = batch.hashes.len(), %err, "limit batch failed");
                }
            }
        }

        Ok(changes)
    }

    async fn refresh_managed_entries(&self, selected: &[(TorrentInfo, String)], now: u64) {
        let mut managed = self.managed.write().await;
        for (torrent, _) in selected {
            let current_limit = self.cache.current_limit(&torrent.hash).await.unwrap_or(UNLIMITED);
            managed
                .entry(torrent.hash)
                .and_modify(|entry| {
                    entry.last_seen = now;
                    entry.current_limit = current_limit;
                })
                .or_insert(ManagedEntry {
                    added_at: now,
                    last_seen: now,
                    current_limit,
                });
        }
    }

    /// Returns managed torrents that left the active set to unlimited
    /// and drops their entries.
    async fn auto_unlimit_inactive(
        &self,
        seen_this_cycle: &HashSet<TorrentHash>,
        budget: &mut usize,
        now: u64,
    ) -> Result<AppliedChanges, CycleError> {
        let mut changes = AppliedChanges {
            applied: 0,
            failed: 0,
            deferred: 0,
        };

        if !self.settings.auto_unlimit_on_inactive {
            return Ok(changes);
        }

        let inactive: Vec<TorrentHash> = {
            let managed = self.managed.read().await;
            managed.keys().filter(|hash| !seen_this_cycle.contains(hash)).copied().collect()
        };

        if inactive.is_empty() {
            return Ok(changes);
        }

        let mut tracker_of = HashMap::new();
        let mut limits = HashMap::new();
        for hash in &inactive {
            limits.insert(*hash, UNLIMITED);
            if let Some(cached) = self.cache.get(hash).await {
                tracker_of.insert(*hash, self.matcher.match_url(&cached.info.tracker_url));
            }
        }

        changes = self
            .apply_changes(&limits, &tracker_of, REASON_AUTO_UNLIMIT, budget, now)
            .await?;

        let mut managed = self.managed.write().await;
        for hash in &inactive {
            managed.remove(hash);
        }

        tracing::info!(torrents = inactive.len(), "returned inactive torrents to unlimited");
        Ok(changes)
    }

    /// Runs the computation pipeline against a cache snapshot and
    /// reports what the next cycle would write, applying nothing. The
    /// persistent smoothing state is cloned, not advanced.
    pub async fn preview(&self) -> CyclePreview {
        let min_up_bps = self.settings.active_torrent_threshold_kb * 1024;

        let snapshot = self.cache.snapshot().await;
        let classified: Vec<(TorrentInfo, String)> = snapshot
            .into_iter()
            .filter(|entry| entry.info.up_speed >= min_up_bps)
            .map(|entry| {
                let tracker_id = self.matcher.match_url(&entry.info.tracker_url);
                (entry.info, tracker_id)
            })
            .collect();

        let sticky: HashSet<TorrentHash> = self.managed.read().await.keys().copied().collect();
        let mut distribution = ScoreDistribution::default();
        let selected = self.select(&classified, &sticky, &PendingBias::default(), &mut distribution);

        let groups = self.build_groups(&selected);
        let outcome = {
            let mut smoothing = self.smoothing.lock().await.clone();
            strategy::compute(
                self.settings.allocation_strategy,
                &groups,
                &SoftParams::from(&self.settings),
                &mut smoothing,
            )
        };

        let tracker_of: HashMap<TorrentHash, String> = selected
            .iter()
            .map(|(torrent, tracker_id)| (torrent.hash, tracker_id.clone()))
            .collect();

        let mut proposed_changes = Vec::new();
        for (hash, proposed) in &outcome.limits {
            let current = self.cache.current_limit(hash).await;
            let would_write = match current {
                None => true,
                Some(current) => needs_update(current, *proposed, self.settings.differential_threshold),
            };

            if would_write {
                proposed_changes.push(ProposedChange {
                    hash: *hash,
                    tracker_id: tracker_of.get(hash).cloned().unwrap_or_else(|| String::from("unknown")),
                    current_limit: current,
                    proposed_limit: *proposed,
                });
            }
        }
        proposed_changes.sort_by_key(|change| change.hash);

        CyclePreview {
            strategy: self.settings.allocation_strategy.to_string(),
            changes: proposed_changes,
            trackers: outcome.trackers,
        }
    }

    /// Restores the earliest journaled limit for every torrent with
    /// unrestored records, then marks those records restored.
    ///
    /// All-or-continue: a failed batch leaves its records unrestored for
    /// a later attempt while the rest proceeds.
    ///
    /// # Errors
    ///
    /// Returns a [`CycleError`] when the journal cannot be read or
    /// updated.
    pub async fn rollback_all(&self) -> Result<RestoreOutcome, CycleError> {
        let records = self.rollback.list_unrestored()?;
        let limits = original_limits(&records);

        if limits.is_empty() {
            return Ok(RestoreOutcome {
                dry_run: self.is_dry_run(),
                ..RestoreOutcome::default()
            });
        }

        let mut outcome = RestoreOutcome {
            dry_run: self.is_dry_run(),
            ..RestoreOutcome::default()
        };

        for batch in batch_writes(&limits) {
            if let Some(store) = &self.dry_run_store {
                let simulated: HashMap<TorrentHash, i64> =
                    batch.hashes.iter().map(|hash| (*hash, batch.limit)).collect();
                if let Err(err) = store.set_many(&simulated) {
                    tracing::warn!(%err, "dry-run store write failed during rollback");
                }
            } else if let Err(err) = self.qbit.set_upload_limit(&batch.hashes, batch.limit).await {
                outcome.torrents_failed += batch.hashes.len();
                tracing::warn!(limit = batch.limit, %err, "rollback batch failed, leaving records unrestored");
                continue;
            }

            for hash in &batch.hashes {
                self.cache.update_limit(hash, batch.limit).await;
            }
            outcome.torrents_restored += batch.hashes.len();
            outcome.records_marked += self.rollback.mark_restored(&batch.hashes)?;
        }

        tracing::warn!(
            restored = outcome.torrents_restored,
            failed = outcome.torrents_failed,
            "rollback completed"
        );

        Ok(outcome)
    }

    /// Sets every journal-touched torrent back to unlimited.
    ///
    /// With `scope_all = false` only torrents with unrestored records are
    /// affected. When `mark_restored` is set, the affected records are
    /// marked so a later rollback will not revisit them.
    ///
    /// # Errors
    ///
    /// Returns a [`CycleError`] when the journal cannot be read or
    /// updated.
    pub async fn reset_to_unlimited(&self, scope_all: bool, mark_restored: bool) -> Result<RestoreOutcome, CycleError> {
        let hashes = self.rollback.list_touched_hashes(scope_all)?;

        let mut outcome = RestoreOutcome {
            dry_run: self.is_dry_run(),
            ..RestoreOutcome::default()
        };

        if hashes.is_empty() {
            return Ok(outcome);
        }

        let limits: HashMap<TorrentHash, i64> = hashes.iter().map(|hash| (*hash, UNLIMITED)).collect();

        for batch in batch_writes(&limits) {
            if let Some(store) = &self.dry_run_store {
                let simulated: HashMap<TorrentHash, i64> =
                    batch.hashes.iter().map(|hash| (*hash, batch.limit)).collect();
                if let Err(err) = store.set_many(&simulated) {
                    tracing::warn!(%err, "dry-run store write failed during reset");
                }
            } else if let Err(err) = self.qbit.set_upload_limit(&batch.hashes, batch.limit).await {
                outcome.torrents_failed += batch.hashes.len();
                tracing::warn!(%err, "reset batch failed");
                continue;
            }

            for hash in &batch.hashes {
                self.cache.update_limit(hash, UNLIMITED).await;
            }
            outcome.torrents_restored += batch.hashes.len();

            if mark_restored {
                outcome.records_marked += self.rollback.mark_restored(&batch.hashes)?;
            }
        }

        let mut managed = self.managed.write().await;
        for hash in &hashes {
            managed.remove(hash);
        }

        Ok(outcome)
    }

    /// Clears the EMA state for one tracker or all of them.
    pub async fn reset_smoothing(&self, tracker_id: Option<&str>) -> usize {
        self.smoothing.lock().await.reset(tracker_id)
    }

    /// Per-tracker usage derived from the current cache contents.
    pub async fn tracker_usage(&self) -> Vec<TrackerUsage> {
        let snapshot = self.cache.snapshot().await;
        let managed = self.managed.read().await;

        let mut usage: Vec<TrackerUsage> = self
            .matcher
            .all_trackers()
            .into_iter()
            .map(|tracker| TrackerUsage {
                id: tracker.id,
                name: tracker.name,
                max_upload_speed: tracker.max_upload_speed,
                priority: tracker.priority,
                active_torrents: 0,
                managed_torrents: 0,
                current_usage: 0,
            })
            .collect();

        for entry in snapshot {
            let tracker_id = self.matcher.match_url(&entry.info.tracker_url);
            if let Some(row) = usage.iter_mut().find(|row| row.id == tracker_id) {
                row.active_torrents += 1;
                row.current_usage += entry.info.up_speed;
                if managed.contains_key(&entry.info.hash) {
                    row.managed_torrents += 1;
                }
            }
        }

        usage
    }

    /// The currently managed torrents, for the stats surface.
    pub async fn managed_torrents(&self) -> Vec<ManagedTorrent> {
        let managed = self.managed.read().await;

        let mut rows = Vec::with_capacity(managed.len());
        for (hash, entry) in managed.iter() {
            let tracker_id = match self.cache.get(hash).await {
                Some(cached) => self.matcher.match_url(&cached.info.tracker_url),
                None => self.matcher.catch_all_id(),
            };
            rows.push(ManagedTorrent {
                hash: *hash,
                tracker_id,
                added_at: entry.added_at,
                last_seen: entry.last_seen,
                current_limit: entry.current_limit,
            });
        }

        rows.sort_by_key(|row| row.hash);
        rows
    }

    /// Flags a torrent for prioritized handling in the next cycle.
    pub fn mark_for_check(&self, hash: TorrentHash) {
        self.pending.lock().expect("pending lock is not poisoned").hashes.insert(hash);
    }

    /// Flags a tracker so its torrents are prioritized next cycle.
    pub fn schedule_tracker_update(&self, tracker_url: &str) {
        let tracker_id = self.matcher.match_url(tracker_url);
        self.pending
            .lock()
            .expect("pending lock is not poisoned")
            .trackers
            .insert(tracker_id);
    }

    /// Drops all engine state for a deleted torrent.
    pub async fn handle_torrent_deletion(&self, hash: TorrentHash) {
        self.cache.remove(&hash).await;
        self.managed.write().await.remove(&hash);
        let mut pending = self.pending.lock().expect("pending lock is not poisoned");
        pending.hashes.remove(&hash);
    }

    fn take_pending(&self) -> PendingBias {
        std::mem::take(&mut *self.pending.lock().expect("pending lock is not poisoned"))
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write().expect("phase lock is not poisoned") = phase;
    }
}

#[cfg(test)]
mod tests {

    use std::sync::Arc;

    use trackcap_configuration::{AllocationStrategy, GlobalSettings, QBittorrentSettings};

    use crate::allocation::engine::AllocationEngine;
    use crate::dry_run::DryRunStore;
    use crate::qbit::client::QbitClient;
    use crate::rollback::setup::initialize_rollback_store;
    use crate::rollback::RollbackStore;
    use crate::test_helpers::tests::{sample_torrent_on_tracker, sample_trackers};
    use crate::torrent::repository::in_memory::InMemoryTorrentRepository;
    use crate::tracker::matcher::TrackerMatcher;

    struct EngineDeps {
        cache: Arc<InMemoryTorrentRepository>,
        rollback: Arc<Box<dyn RollbackStore>>,
        dry_run_store: Arc<DryRunStore>,
        _temp_dir: tempfile::TempDir,
    }

    fn settings_for(strategy: AllocationStrategy) -> GlobalSettings {
        GlobalSettings {
            allocation_strategy: strategy,
            ..GlobalSettings::default()
        }
    }

    /// A dry-run engine wired against an offline client; only the paths
    /// that never reach qBittorrent are exercised here.
    fn initialize_engine(settings: &GlobalSettings) -> (Arc<AllocationEngine>, EngineDeps) {
        let temp_dir = tempfile::tempdir().unwrap();

        let qbit_settings = QBittorrentSettings {
            host: String::from("localhost"),
            port: 8080,
            username: String::from("admin"),
            password: String::from("adminadmin"),
            timeout_secs: 5,
        };
        let qbit = Arc::new(QbitClient::new(&qbit_settings).unwrap());

        let matcher = Arc::new(TrackerMatcher::new(sample_trackers()).unwrap());
        let cache = Arc::new(InMemoryTorrentRepository::default());

        let rollback_settings = trackcap_configuration::RollbackSettings {
            database_path: temp_dir.path().join("rollback.db").to_str().unwrap().to_string(),
            track_all_changes: true,
        };
        let rollback = initialize_rollback_store(&rollback_settings).unwrap();

        let dry_run_store = Arc::new(DryRunStore::open(&temp_dir.path().join("dry_run.json")).unwrap());

        let engine = Arc::new(AllocationEngine::new(
            settings,
            &qbit,
            &matcher,
            &rollback,
            true,
            &cache,
            Some(dry_run_store.clone()),
        ));

        (
            engine,
            EngineDeps {
                cache,
                rollback,
                dry_run_store,
                _temp_dir: temp_dir,
            },
        )
    }

    mod previewing_the_next_cycle {

        use crate::allocation::engine::tests::{initialize_engine, settings_for};
        use crate::test_helpers::tests::sample_torrent_on_tracker;
        use crate::torrent::UNLIMITED;
        use trackcap_configuration::AllocationStrategy;

        const PRIVATE_TRACKER: &str = "http://tracker.private.example.org/announce";
        const OTHER_TRACKER: &str = "http://other.example.net/announce";

        #[tokio::test]
        async fn it_should_propose_an_equal_split_for_a_capped_tracker() {
            // The private tracker caps at 4 MiB/s; four torrents should
            // each be proposed 1 MiB/s, and the catch-all torrents stay
            // unlimited (no write proposed for them).
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));

            for (index, hex) in [
                "1111111111111111111111111111111111111111",
                "2222222222222222222222222222222222222222",
                "3333333333333333333333333333333333333333",
                "4444444444444444444444444444444444444444",
            ]
            .into_iter()
            .enumerate()
            {
                let mut torrent = sample_torrent_on_tracker(hex, PRIVATE_TRACKER, 500 * 1024);
                torrent.upload_limit = 256_000 + index as i64;
                deps.cache.upsert(torrent, 100).await;
            }
            for hex in [
                "5555555555555555555555555555555555555555",
                "6666666666666666666666666666666666666666",
            ] {
                deps.cache
                    .upsert(sample_torrent_on_tracker(hex, OTHER_TRACKER, 200 * 1024), 100)
                    .await;
            }

            let preview = engine.preview().await;

            let proposed_to_private: Vec<_> = preview
                .changes
                .iter()
                .filter(|change| change.tracker_id == "priv")
                .collect();
            assert_eq!(proposed_to_private.len(), 4);
            assert!(proposed_to_private.iter().all(|change| change.proposed_limit == 1_048_576));

            // Catch-all torrents are already unlimited; nothing to write.
            assert!(preview.changes.iter().all(|change| change.tracker_id == "priv"));
        }

        #[tokio::test]
        async fn it_should_propose_unlimited_for_torrents_on_an_unlimited_tracker() {
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));

            let mut torrent = sample_torrent_on_tracker(
                "5555555555555555555555555555555555555555",
                OTHER_TRACKER,
                200 * 1024,
            );
            torrent.upload_limit = 512_000;
            deps.cache.upsert(torrent, 100).await;

            let preview = engine.preview().await;

            assert_eq!(preview.changes.len(), 1);
            assert_eq!(preview.changes[0].proposed_limit, UNLIMITED);
        }

        #[tokio::test]
        async fn it_should_suppress_proposals_below_the_differential_gate() {
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));

            // Current limit already within 20% of the 4 MiB/s proposal.
            let mut torrent = sample_torrent_on_tracker(
                "1111111111111111111111111111111111111111",
                PRIVATE_TRACKER,
                500 * 1024,
            );
            torrent.upload_limit = 4 * 1024 * 1024 - 1024;
            deps.cache.upsert(torrent, 100).await;

            let preview = engine.preview().await;

            assert!(preview.changes.is_empty());
        }

        #[tokio::test]
        async fn it_should_report_per_tracker_summaries() {
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Soft));

            deps.cache
                .upsert(
                    sample_torrent_on_tracker(
                        "1111111111111111111111111111111111111111",
                        PRIVATE_TRACKER,
                        512 * 1024,
                    ),
                    100,
                )
                .await;

            let preview = engine.preview().await;

            assert_eq!(preview.strategy, "soft");
            let private = preview.trackers.iter().find(|tracker| tracker.id == "priv").unwrap();
            assert_eq!(private.base_cap, 4 * 1024 * 1024);
            assert_eq!(private.current_usage, 512 * 1024);
        }

        #[tokio::test]
        async fn it_should_not_advance_the_smoothing_state() {
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Soft));
            deps.cache
                .upsert(
                    sample_torrent_on_tracker(
                        "1111111111111111111111111111111111111111",
                        PRIVATE_TRACKER,
                        512 * 1024,
                    ),
                    100,
                )
                .await;

            let _ = engine.preview().await;

            assert_eq!(engine.reset_smoothing(None).await, 0);
        }
    }

    mod selecting_with_the_rollout_gate {

        use crate::allocation::engine::tests::{initialize_engine, settings_for};
        use crate::test_helpers::tests::sample_torrent_on_tracker;
        use trackcap_configuration::AllocationStrategy;

        #[tokio::test]
        async fn it_should_produce_a_deterministic_managed_set() {
            let mut settings = settings_for(AllocationStrategy::Weighted);
            settings.rollout_percentage = 50;
            let (engine, deps) = initialize_engine(&settings);

            for seed in 0..20u8 {
                let hex: String = format!("{seed:02x}").repeat(20);
                deps.cache
                    .upsert(
                        sample_torrent_on_tracker(&hex, "http://tracker.private.example.org/announce", 256 * 1024),
                        100,
                    )
                    .await;
            }

            let first: Vec<_> = engine.preview().await.changes.iter().map(|change| change.hash).collect();
            let second: Vec<_> = engine.preview().await.changes.iter().map(|change| change.hash).collect();

            assert_eq!(first, second);
        }

        #[tokio::test]
        async fn it_should_select_nothing_at_zero_percent_rollout() {
            let mut settings = settings_for(AllocationStrategy::Equal);
            settings.rollout_percentage = 0;
            let (engine, deps) = initialize_engine(&settings);

            deps.cache
                .upsert(
                    sample_torrent_on_tracker(
                        "1111111111111111111111111111111111111111",
                        "http://tracker.private.example.org/announce",
                        256 * 1024,
                    ),
                    100,
                )
                .await;

            assert!(engine.preview().await.changes.is_empty());
        }
    }

    mod rolling_back {

        use crate::allocation::engine::tests::{initialize_engine, settings_for};
        use crate::rollback::ChangeEntry;
        use crate::test_helpers::tests::{sample_hash, sample_hash_two, sample_torrent_on_tracker};
        use trackcap_configuration::AllocationStrategy;

        fn change(hash: crate::torrent::TorrentHash, old_limit: i64, new_limit: i64) -> ChangeEntry {
            ChangeEntry {
                torrent_hash: hash,
                old_limit,
                new_limit,
                tracker_id: String::from("priv"),
                reason: String::from("allocation"),
            }
        }

        #[tokio::test]
        async fn it_should_restore_the_earliest_recorded_limits() {
            // h1 started unlimited (client form 0 is journaled as
            // observed), h2 at 1 MiB/s; both were changed by cycles.
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));

            deps.cache
                .upsert(
                    sample_torrent_on_tracker(
                        &sample_hash().to_string(),
                        "http://tracker.private.example.org/announce",
                        256 * 1024,
                    ),
                    100,
                )
                .await;

            deps.rollback
                .record_changes(&[change(sample_hash(), 0, 2_097_152)], 100)
                .unwrap();
            deps.rollback
                .record_changes(&[change(sample_hash_two(), 1_048_576, 512_000)], 110)
                .unwrap();
            deps.rollback
                .record_changes(&[change(sample_hash(), 2_097_152, 700_000)], 120)
                .unwrap();

            let outcome = engine.rollback_all().await.unwrap();

            assert_eq!(outcome.torrents_restored, 2);
            assert!(outcome.dry_run);
            assert_eq!(deps.dry_run_store.get(&sample_hash()), Some(0));
            assert_eq!(deps.dry_run_store.get(&sample_hash_two()), Some(1_048_576));
            assert_eq!(deps.cache.current_limit(&sample_hash()).await, Some(0));
        }

        #[tokio::test]
        async fn it_should_be_a_no_op_the_second_time() {
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));

            deps.rollback
                .record_changes(&[change(sample_hash(), 0, 2_097_152)], 100)
                .unwrap();

            let first = engine.rollback_all().await.unwrap();
            let second = engine.rollback_all().await.unwrap();

            assert_eq!(first.torrents_restored, 1);
            assert_eq!(first.records_marked, 1);
            assert_eq!(second.torrents_restored, 0);
            assert_eq!(second.records_marked, 0);
        }

        #[tokio::test]
        async fn it_should_reset_touched_torrents_to_unlimited() {
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));

            deps.rollback
                .record_changes(&[change(sample_hash(), 512_000, 2_097_152)], 100)
                .unwrap();

            let outcome = engine.reset_to_unlimited(false, true).await.unwrap();

            assert_eq!(outcome.torrents_restored, 1);
            assert_eq!(outcome.records_marked, 1);
            assert_eq!(deps.dry_run_store.get(&sample_hash()), Some(-1));

            // Marked restored, so a rollback afterwards has nothing to do.
            let rollback = engine.rollback_all().await.unwrap();
            assert_eq!(rollback.torrents_restored, 0);
        }
    }

    mod reacting_to_webhook_events {

        use crate::allocation::engine::tests::{initialize_engine, settings_for};
        use crate::test_helpers::tests::{sample_hash, sample_torrent_on_tracker};
        use trackcap_configuration::AllocationStrategy;

        #[tokio::test]
        async fn it_should_drop_all_state_for_a_deleted_torrent() {
            let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));
            deps.cache
                .upsert(
                    sample_torrent_on_tracker(
                        &sample_hash().to_string(),
                        "http://tracker.private.example.org/announce",
                        256 * 1024,
                    ),
                    100,
                )
                .await;
            engine.mark_for_check(sample_hash());

            engine.handle_torrent_deletion(sample_hash()).await;

            assert!(deps.cache.get(&sample_hash()).await.is_none());
            assert!(engine.managed_torrents().await.is_empty());
        }
    }

    mod adjusting_the_rollout {

        use crate::allocation::engine::tests::{initialize_engine, settings_for};
        use trackcap_configuration::AllocationStrategy;

        #[tokio::test]
        async fn it_should_clamp_and_expose_the_rollout_percentage() {
            let (engine, _deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));

            engine.set_rollout_percentage(42);
            assert_eq!(engine.rollout_percentage(), 42);

            engine.set_rollout_percentage(200);
            assert_eq!(engine.rollout_percentage(), 100);
        }
    }

    #[tokio::test]
    async fn it_should_report_tracker_usage_from_the_cache() {
        let (engine, deps) = initialize_engine(&settings_for(AllocationStrategy::Equal));

        deps.cache
            .upsert(
                sample_torrent_on_tracker(
                    "1111111111111111111111111111111111111111",
                    "http://tracker.private.example.org/announce",
                    512 * 1024,
                ),
                100,
            )
            .await;
        deps.cache
            .upsert(
                sample_torrent_on_tracker(
                    "2222222222222222222222222222222222222222",
                    "http://other.example.net/announce",
                    100 * 1024,
                ),
                100,
            )
            .await;

        let usage = engine.tracker_usage().await;

        let private = usage.iter().find(|row| row.id == "priv").unwrap();
        assert_eq!(private.active_torrents, 1);
        assert_eq!(private.current_usage, 512 * 1024);

        let default = usage.iter().find(|row| row.id == "default").unwrap();
        assert_eq!(default.active_torrents, 1);
    }
}
