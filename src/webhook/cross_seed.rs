//! Cross-seed completion forwarding.
//!
//! Completed torrents are announced to a cross-seed instance so it can
//! look for matching releases on other trackers. Forwarding runs as its
//! own task fed by a channel; its failures never touch the allocation
//! cycle.
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Duration;

use serde::Serialize;
use trackcap_configuration::CrossSeedSettings;

use super::WebhookEvent;

const FORWARD_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Forwarder counters for the stats endpoint.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct ForwarderStats {
    pub forwarded: u64,
    pub failed: u64,
}

#[derive(Serialize)]
struct CompletionPayload<'a> {
    #[serde(rename = "infoHash")]
    info_hash: String,
    name: &'a str,
}

/// Forwards completion events to the configured cross-seed endpoint.
pub struct CrossSeedForwarder {
    url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl CrossSeedForwarder {
    /// Builds the forwarder, or `None` when forwarding is disabled or
    /// not fully configured.
    #[must_use]
    pub fn from_settings(settings: &CrossSeedSettings) -> Option<Self> {
        if !settings.enabled {
            tracing::info!("cross-seed forwarding disabled");
            return None;
        }

        let Some(url) = settings.url.clone() else {
            tracing::warn!("cross-seed forwarding enabled without a URL, disabling");
            return None;
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .ok()?;

        Some(Self {
            url,
            api_key: settings.api_key.clone(),
            http,
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Consumes completion events until the channel closes.
    pub async fn run(&self, mut events: tokio::sync::mpsc::Receiver<WebhookEvent>) {
        tracing::info!(url = %self.url, "cross-seed forwarder started");

        while let Some(event) = events.recv().await {
            self.forward_with_retry(&event).await;
        }

        tracing::info!("cross-seed forwarder stopped");
    }

    #[must_use]
    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            forwarded: self.forwarded.load(Relaxed),
            failed: self.failed.load(Relaxed),
        }
    }

    async fn forward_with_retry(&self, event: &WebhookEvent) {
        for attempt in 0..FORWARD_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }

            match self.forward(event).await {
                Ok(()) => {
                    self.forwarded.fetch_add(1, Relaxed);
                    tracing::debug!(hash = %event.hash, "completion forwarded to cross-seed");
                    return;
                }
                Err(err) => {
                    tracing::warn!(hash = %event.hash, attempt, %err, "cross-seed forward failed");
                }
            }
        }

        self.failed.fetch_add(1, Relaxed);
    }

    async fn forward(&self, event: &WebhookEvent) -> Result<(), reqwest::Error> {
        let payload = CompletionPayload {
            info_hash: event.hash.to_string(),
            name: event.name.as_deref().unwrap_or_default(),
        };

        let mut request = self.http.post(&self.url).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.header("X-Api-Key", api_key);
        }

        request.send().await?.error_for_status()?;
        Ok(())
    }
}
