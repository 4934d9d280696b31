//! The session-authenticated qBittorrent Web API client.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use trackcap_configuration::QBittorrentSettings;

use super::circuit::{CircuitBreaker, State};
use super::{representative_url, AnnounceEntry, Error, TorrentEntry};
use crate::torrent::{TorrentHash, TorrentInfo};

/// Upper bound on hashes per mutating API call.
pub const WRITE_BATCH_SIZE: usize = 50;

/// Upper bound on hashes per backfill query.
pub const BACKFILL_HASH_CAP: usize = 1000;

/// Minimum gap between outbound requests.
const MIN_REQUEST_GAP: Duration = Duration::from_millis(100);

const GET_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Client counters for the stats endpoint.
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct ClientStats {
    pub api_calls: u64,
    pub api_failures: u64,
    pub circuit: State,
    pub authenticated: bool,
}

/// One mutating API call: every hash in the batch receives `limit`.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct WriteBatch {
    pub limit: i64,
    pub hashes: Vec<TorrentHash>,
}

/// Groups proposed limits by target value and chunks them into API-call
/// sized batches. Deterministic: values ascend, hashes are sorted.
#[must_use]
pub fn batch_writes(limits: &HashMap<TorrentHash, i64>) -> Vec<WriteBatch> {
    let mut by_value: BTreeMap<i64, Vec<TorrentHash>> = BTreeMap::new();
    for (hash, limit) in limits {
        by_value.entry(*limit).or_default().push(*hash);
    }

    let mut batches = Vec::new();
    for (limit, mut hashes) in by_value {
        hashes.sort_unstable();
        for chunk in hashes.chunks(WRITE_BATCH_SIZE) {
            batches.push(WriteBatch {
                limit,
                hashes: chunk.to_vec(),
            });
        }
    }
    batches
}

fn join_hashes(hashes: &[TorrentHash]) -> String {
    hashes.iter().map(ToString::to_string).collect::<Vec<_>>().join("|")
}

/// The qBittorrent Web API client.
///
/// Holds the authenticated session cookie; a mutex over re-login prevents
/// concurrent re-authentication. All outbound requests are paced and run
/// through the circuit breaker.
pub struct QbitClient {
    http: reqwest::Client,
    base_url: String,
    settings: QBittorrentSettings,
    circuit: CircuitBreaker,
    last_request: Mutex<Option<Instant>>,
    relogin_gate: Mutex<()>,
    authenticated: AtomicBool,
    api_calls: AtomicU64,
    api_failures: AtomicU64,
}

impl QbitClient {
    /// # Errors
    ///
    /// Returns [`Error::Initialization`] when the underlying HTTP client
    /// cannot be built.
    pub fn new(settings: &QBittorrentSettings) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .cookie_store(true)
            .build()
            .map_err(|source| Error::Initialization { source })?;

        Ok(Self {
            http,
            base_url: format!("http://{}:{}", settings.host, settings.port),
            settings: settings.clone(),
            circuit: CircuitBreaker::default(),
            last_request: Mutex::new(None),
            relogin_gate: Mutex::new(()),
            authenticated: AtomicBool::new(false),
            api_calls: AtomicU64::new(0),
            api_failures: AtomicU64::new(0),
        })
    }

    /// Authenticates with the configured credential pair. No alternate
    /// credentials are ever tried, and the password is never logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] when qBittorrent rejects the
    /// credentials, [`Error::Transport`] on network failure, or
    /// [`Error::Unavailable`] while the circuit is open.
    pub async fn login(&self) -> Result<(), Error> {
        if !self.circuit.can_execute() {
            return Err(Error::Unavailable);
        }

        let endpoint = "/api/v2/auth/login";
        self.pace().await;
        self.api_calls.fetch_add(1, Relaxed);

        let response = self
            .http
            .post(format!("{}{endpoint}", self.base_url))
            .form(&[
                ("username", self.settings.username.as_str()),
                ("password", self.settings.password.as_str()),
            ])
            .send()
            .await
            .map_err(|source| {
                self.circuit.on_failure();
                self.api_failures.fetch_add(1, Relaxed);
                Error::Transport {
                    endpoint: endpoint.to_string(),
                    source,
                }
            })?;

        self.circuit.on_success();

        let body = response.text().await.map_err(|source| Error::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;

        if body.trim() == "Ok." {
            self.authenticated.store(true, Relaxed);
            tracing::info!(username = %self.settings.username, "authenticated with qBittorrent");
            Ok(())
        } else {
            Err(Error::Authentication {
                reason: String::from("qBittorrent rejected the configured credentials"),
            })
        }
    }

    /// The actively uploading torrents: server-side `filter=active`, then
    /// a client-side floor on the upload speed. Tracker URLs are not
    /// resolved here; callers fetch them for the subset they manage.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the request or decoding fails.
    pub async fn active_torrents(&self, min_up_bps: u64) -> Result<Vec<TorrentInfo>, Error> {
        let endpoint = "/api/v2/torrents/info";
        let response = self
            .get_with_retries(endpoint, &[("filter", String::from("active"))])
            .await?;

        let entries: Vec<TorrentEntry> = decode_json(endpoint, response).await?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.upspeed >= min_up_bps)
            .filter_map(TorrentEntry::into_torrent_info)
            .collect())
    }

    /// Metadata for a specific set of hashes (tracker-URL backfill). The
    /// query is capped at [`BACKFILL_HASH_CAP`] hashes.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the request or decoding fails.
    pub async fn torrents_by_hashes(&self, hashes: &[TorrentHash]) -> Result<Vec<TorrentInfo>, Error> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let capped = &hashes[..hashes.len().min(BACKFILL_HASH_CAP)];
        let endpoint = "/api/v2/torrents/info";
        let response = self
            .get_with_retries(endpoint, &[("hashes", join_hashes(capped))])
            .await?;

        let entries: Vec<TorrentEntry> = decode_json(endpoint, response).await?;

        Ok(entries
            .into_iter()
            .filter_map(TorrentEntry::into_torrent_info)
            .collect())
    }

    /// The announce entries for a torrent.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the request or decoding fails.
    pub async fn announce_entries(&self, hash: &TorrentHash) -> Result<Vec<AnnounceEntry>, Error> {
        let endpoint = "/api/v2/torrents/trackers";
        let response = self
            .get_with_retries(endpoint, &[("hash", hash.to_string())])
            .await?;

        decode_json(endpoint, response).await
    }

    /// The representative announce URL for a torrent, per the
    /// first-working-else-first-non-errored rule.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the request or decoding fails.
    pub async fn tracker_url_for(&self, hash: &TorrentHash) -> Result<Option<String>, Error> {
        Ok(representative_url(&self.announce_entries(hash).await?))
    }

    /// Applies one limit to a batch of hashes in a single API call.
    ///
    /// Mutating calls are never retried on ambiguous errors; a failed
    /// batch is reported to the caller and reattempted next cycle.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the request fails.
    pub async fn set_upload_limit(&self, hashes: &[TorrentHash], limit: i64) -> Result<(), Error> {
        let endpoint = "/api/v2/torrents/setUploadLimit";
        let form = [("hashes", join_hashes(hashes)), ("limit", limit.to_string())];

        self.send_once(Method::POST, endpoint, &[], Some(form.as_slice())).await?;
        Ok(())
    }

    /// The client preferences blob; used for session checks only.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the request or decoding fails.
    pub async fn preferences(&self) -> Result<serde_json::Value, Error> {
        let endpoint = "/api/v2/app/preferences";
        let response = self.get_with_retries(endpoint, &[]).await?;

        decode_json(endpoint, response).await
    }

    #[must_use]
    pub fn circuit_state(&self) -> State {
        self.circuit.state()
    }

    #[must_use]
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            api_calls: self.api_calls.load(Relaxed),
            api_failures: self.api_failures.load(Relaxed),
            circuit: self.circuit.state(),
            authenticated: self.authenticated.load(Relaxed),
        }
    }

    /// Idempotent GETs are retried with exponential backoff; an open
    /// circuit fails fast instead of burning retries.
    async fn get_with_retries(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, Error> {
        let mut last_err = None;

        for attempt in 0..GET_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }

            match self.send_once(Method::GET, endpoint, query, None).await {
                Ok(response) => return Ok(response),
                Err(err @ Error::Transport { .. }) => {
                    tracing::debug!(%endpoint, attempt, "retrying qBittorrent read after transport error");
                    last_err = Some(err);
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_err.unwrap_or(Error::Unavailable))
    }

    async fn send_once(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<reqwest::Response, Error> {
        let response = self.dispatch(method.clone(), endpoint, query, form).await?;

        // A 403 marks an expired session: one re-login, one replay.
        if response.status() == StatusCode::FORBIDDEN {
            self.relogin().await?;
            let response = self.dispatch(method, endpoint, query, form).await?;
            return self.grade(endpoint, response);
        }

        self.grade(endpoint, response)
    }

    async fn dispatch(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<reqwest::Response, Error> {
        if !self.circuit.can_execute() {
            return Err(Error::Unavailable);
        }

        self.pace().await;
        self.api_calls.fetch_add(1, Relaxed);

        let mut request = self.http.request(method, format!("{}{endpoint}", self.base_url));
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(form) = form {
            request = request.form(form);
        }

        request.send().await.map_err(|source| {
            self.circuit.on_failure();
            self.api_failures.fetch_add(1, Relaxed);
            Error::Transport {
                endpoint: endpoint.to_string(),
                source,
            }
        })
    }

    /// Grades a response for the circuit breaker: 5xx and transport
    /// failures count against it, other statuses do not.
    fn grade(&self, endpoint: &str, response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();

        match response.error_for_status() {
            Ok(response) => {
                self.circuit.on_success();
                Ok(response)
            }
            Err(source) => {
                if status.is_server_error() {
                    self.circuit.on_failure();
                    self.api_failures.fetch_add(1, Relaxed);
                    Err(Error::Transport {
                        endpoint: endpoint.to_string(),
                        source,
                    })
                } else {
                    Err(Error::Protocol {
                        endpoint: endpoint.to_string(),
                        reason: format!("unexpected status {status}"),
                    })
                }
            }
        }
    }

    async fn relogin(&self) -> Result<(), Error> {
        let _gate = self.relogin_gate.lock().await;
        self.authenticated.store(false, Relaxed);
        tracing::warn!("qBittorrent session expired, re-authenticating");
        self.login().await
    }

    /// Enforces the minimum request gap. The lock is held across the
    /// sleep so concurrent callers queue instead of stampeding.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < MIN_REQUEST_GAP {
                tokio::time::sleep(MIN_REQUEST_GAP - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<T, Error> {
    response.json().await.map_err(|source| Error::Protocol {
        endpoint: endpoint.to_string(),
        reason: format!("invalid JSON payload: {source}"),
    })
}
