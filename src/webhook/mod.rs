//! Webhook intake.
//!
//! qBittorrent notifies the daemon about added, completed and deleted
//! torrents through `/webhook`. The handler only parses and queues the
//! event; all processing happens later, so the response stays well under
//! the 10 ms budget. The queue is bounded and drops its oldest event on
//! overflow. The engine drains it at the start of each cycle.
pub mod cross_seed;

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Mutex;

use serde::Serialize;
use trackcap_core::allocation::engine::AllocationEngine;
use trackcap_core::torrent::TorrentHash;

/// Events beyond this bound push the oldest one out.
pub const QUEUE_CAPACITY: usize = 1000;

/// The notification kinds qBittorrent sends.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Complete,
    Delete,
}

/// Error raised for an unrecognized event kind.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown webhook event kind: {kind}")]
pub struct ParseEventKindError {
    kind: String,
}

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "complete" => Ok(Self::Complete),
            "delete" => Ok(Self::Delete),
            other => Err(ParseEventKindError {
                kind: other.to_string(),
            }),
        }
    }
}

/// One queued notification.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct WebhookEvent {
    pub kind: EventKind,
    pub hash: TorrentHash,
    pub name: Option<String>,
    pub tracker_url: Option<String>,
    pub received_at: u64,
}

/// Intake counters for the stats endpoint.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct IntakeStats {
    pub received: u64,
    pub dropped: u64,
    pub drained: u64,
    pub queue_len: usize,
}

/// The bounded event queue between the HTTP handler and the cycle task.
pub struct WebhookIntake {
    queue: Mutex<VecDeque<WebhookEvent>>,
    received: AtomicU64,
    dropped: AtomicU64,
    drained: AtomicU64,
    /// Completion events are additionally handed to the cross-seed
    /// forwarder task, which retries on its own schedule.
    cross_seed_tx: Option<tokio::sync::mpsc::Sender<WebhookEvent>>,
}

impl WebhookIntake {
    #[must_use]
    pub fn new(cross_seed_tx: Option<tokio::sync::mpsc::Sender<WebhookEvent>>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            cross_seed_tx,
        }
    }

    /// Queues an event without blocking. The only lock taken is held for
    /// one push; there is no I/O on this path.
    pub fn enqueue(&self, event: WebhookEvent) {
        {
            let mut queue = self.queue.lock().expect("intake lock is not poisoned");
            if queue.len() >= QUEUE_CAPACITY {
                queue.pop_front();
                self.dropped.fetch_add(1, Relaxed);
            }
            queue.push_back(event.clone());
        }
        self.received.fetch_add(1, Relaxed);

        if event.kind == EventKind::Complete {
            if let Some(tx) = &self.cross_seed_tx {
                // The forwarder lagging must not back-pressure intake.
                let _ = tx.try_send(event);
            }
        }
    }

    /// Takes every queued event, in arrival order.
    #[must_use]
    pub fn drain(&self) -> Vec<WebhookEvent> {
        let events: Vec<WebhookEvent> = {
            let mut queue = self.queue.lock().expect("intake lock is not poisoned");
            queue.drain(..).collect()
        };
        self.drained.fetch_add(events.len() as u64, Relaxed);
        events
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("intake lock is not poisoned").len()
    }

    #[must_use]
    pub fn stats(&self) -> IntakeStats {
        IntakeStats {
            received: self.received.load(Relaxed),
            dropped: self.dropped.load(Relaxed),
            drained: self.drained.load(Relaxed),
            queue_len: self.queue_len(),
        }
    }
}

/// The cycle-start drain step: feeds queued events into the engine so
/// the affected trackers and torrents are prioritized this cycle.
pub async fn apply_events(engine: &AllocationEngine, events: Vec<WebhookEvent>) {
    for event in events {
        tracing::debug!(kind = ?event.kind, hash = %event.hash, received_at = event.received_at, "applying webhook event");
        match event.kind {
            EventKind::Add | EventKind::Complete => {
                engine.mark_for_check(event.hash);
                if let Some(tracker_url) = &event.tracker_url {
                    engine.schedule_tracker_update(tracker_url);
                }
            }
            EventKind::Delete => {
                engine.handle_torrent_deletion(event.hash).await;
            }
        }
    }
}
