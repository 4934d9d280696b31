//! HTTP request handlers.
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use trackcap_configuration::Configuration;
use trackcap_core::now_unix;
use trackcap_core::qbit::circuit::State as CircuitState;
use trackcap_core::rollback::RollbackStore;
use trackcap_core::torrent::TorrentHash;

use crate::app::{AppState, VERSION};
use crate::webhook::{EventKind, WebhookEvent};

/// API error payload; converts into a JSON response with the matching
/// status code.
#[derive(Serialize, Debug)]
pub struct ApiError {
    pub error: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    fn bad_request(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    fn not_ready() -> Self {
        Self {
            error: String::from("Service not ready"),
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn internal(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.error }))).into_response()
    }
}

fn require_ready(state: &AppState) -> Result<(), ApiError> {
    if state.is_ready() {
        Ok(())
    } else {
        Err(ApiError::not_ready())
    }
}

/// GET `/`
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "trackcap",
        "version": VERSION,
        "description": "Per-tracker aggregate upload caps for qBittorrent",
        "endpoints": {
            "health": "/health",
            "stats": "/stats",
            "stats_trackers": "/stats/trackers",
            "stats_managed": "/stats/managed",
            "config": "/config",
            "preview_next_cycle": "/preview/next-cycle",
            "match_test": "/match/test",
            "cycle_force": "/cycle/force",
            "rollout": "/rollout",
            "rollback": "/rollback",
            "limits_reset": "/limits/reset",
            "smoothing_reset": "/smoothing/reset",
            "config_reload": "/config/reload",
            "webhook": "/webhook",
        },
    }))
}

/// GET `/health`
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    require_ready(&state)?;

    let engine_stats = state.engine.stats();
    let circuit = state.qbit.circuit_state();

    let degraded = circuit != CircuitState::Closed || engine_stats.last_cycle_succeeded == Some(false);
    let status = if degraded { "degraded" } else { "healthy" };

    let (rollout_percentage, update_interval, dry_run) = {
        let config = state.config.read().expect("config lock is not poisoned");
        (
            state.engine.rollout_percentage(),
            config.global.update_interval,
            config.global.dry_run,
        )
    };

    Ok(Json(json!({
        "status": status,
        "version": VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "circuit": circuit,
        "cycle_phase": state.engine.phase(),
        "rollout_percentage": rollout_percentage,
        "update_interval": update_interval,
        "dry_run": dry_run,
        "active_torrents": engine_stats.active_torrents,
        "managed_torrents": engine_stats.managed_torrents,
        "last_cycle_at": engine_stats.last_cycle_at,
        "last_cycle_duration_ms": engine_stats.last_cycle_duration_ms,
    })))
}

/// GET `/stats`
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    require_ready(&state)?;

    let rollback_stats = state
        .rollback
        .stats()
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(Json(json!({
        "engine": state.engine.stats(),
        "cache": state.cache.stats().await,
        "matcher": state.matcher.stats(),
        "client": state.qbit.stats(),
        "rollback": rollback_stats,
        "webhook": state.intake.stats(),
        "cross_seed": state.cross_seed.as_ref().map(|forwarder| forwarder.stats()),
    })))
}

/// GET `/stats/trackers`
pub async fn tracker_stats(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    require_ready(&state)?;

    Ok(Json(state.engine.tracker_usage().await).into_response())
}

/// GET `/stats/managed`
pub async fn managed_torrents(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    require_ready(&state)?;

    Ok(Json(state.engine.managed_torrents().await).into_response())
}

/// GET `/config` — the loaded configuration with secrets masked.
pub async fn config(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    require_ready(&state)?;

    let config = state.config.read().expect("config lock is not poisoned").clone();
    let mut value = serde_json::to_value(&config).map_err(|err| ApiError::internal(err.to_string()))?;

    if let Some(password) = value.pointer_mut("/qbittorrent/password") {
        *password = json!("***");
    }
    if let Some(api_key) = value.pointer_mut("/cross_seed/api_key") {
        if !api_key.is_null() {
            *api_key = json!("***");
        }
    }

    Ok(Json(value))
}

/// GET `/preview/next-cycle` — the full computation pipeline against a
/// cache snapshot; applies nothing.
pub async fn preview_next_cycle(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    require_ready(&state)?;

    Ok(Json(state.engine.preview().await).into_response())
}

#[derive(Deserialize, Debug)]
pub struct MatchTestParams {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub detailed: bool,
}

/// GET `/match/test?url=…&detailed=…`
pub async fn match_test(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MatchTestParams>,
) -> Result<Response, ApiError> {
    require_ready(&state)?;

    if params.url.is_empty() {
        return Err(ApiError::bad_request("The url query parameter is required"));
    }

    Ok(Json(state.matcher.test(&params.url, params.detailed)).into_response())
}

/// POST `/cycle/force` — runs a cycle now. Waits for an in-flight cycle
/// instead of overlapping it.
pub async fn force_cycle(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    require_ready(&state)?;

    match state.engine.run_cycle().await {
        Ok(report) => Ok(Json(report).into_response()),
        Err(err) => Err(ApiError::internal(err.to_string())),
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct RolloutRequest {
    pub percentage: Option<i64>,
}

/// POST `/rollout` — adjusts the rollout percentage (0-100).
pub async fn update_rollout(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RolloutRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_ready(&state)?;

    let request = body.map(|Json(request)| request).unwrap_or_default();
    let percentage = match request.percentage {
        Some(percentage) if (0..=100).contains(&percentage) => {
            u8::try_from(percentage).expect("value within 0..=100 fits in a u8")
        }
        _ => {
            return Err(ApiError::bad_request(
                "percentage must be an integer between 0 and 100",
            ))
        }
    };

    state.engine.set_rollout_percentage(percentage);
    state
        .config
        .write()
        .expect("config lock is not poisoned")
        .global
        .rollout_percentage = percentage;

    Ok(Json(json!({
        "status": "updated",
        "rollout_percentage": percentage,
        "timestamp": now_unix(),
    })))
}

#[derive(Deserialize, Debug, Default)]
pub struct RollbackRequest {
    #[serde(default)]
    pub confirm: bool,
    pub reason: Option<String>,
}

/// POST `/rollback` — restores the earliest journaled limits.
pub async fn rollback(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RollbackRequest>>,
) -> Result<Response, ApiError> {
    require_ready(&state)?;

    let request = body.map(|Json(request)| request).unwrap_or_default();
    if !request.confirm {
        return Err(ApiError::bad_request(
            "Rollback requires confirmation: set 'confirm': true in the request body",
        ));
    }

    let reason = request.reason.unwrap_or_else(|| String::from("manual rollback"));
    tracing::warn!(%reason, "rollback requested");

    match state.engine.rollback_all().await {
        Ok(outcome) => Ok(Json(outcome).into_response()),
        Err(err) => Err(ApiError::internal(err.to_string())),
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ResetLimitsRequest {
    #[serde(default)]
    pub confirm: bool,
    pub scope: Option<String>,
    #[serde(default)]
    pub mark_restored: bool,
}

/// POST `/limits/reset` — sets journal-touched torrents back to
/// unlimited.
pub async fn reset_limits(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ResetLimitsRequest>>,
) -> Result<Response, ApiError> {
    require_ready(&state)?;

    let request = body.map(|Json(request)| request).unwrap_or_default();
    if !request.confirm {
        return Err(ApiError::bad_request(
            "Reset requires confirmation: set 'confirm': true in the request body",
        ));
    }

    let scope_all = match request.scope.as_deref() {
        None | Some("unrestored") => false,
        Some("all") => true,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "scope must be 'unrestored' or 'all', got '{other}'"
            )))
        }
    };

    match state.engine.reset_to_unlimited(scope_all, request.mark_restored).await {
        Ok(outcome) => Ok(Json(outcome).into_response()),
        Err(err) => Err(ApiError::internal(err.to_string())),
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct SmoothingResetRequest {
    pub tracker_id: Option<String>,
    #[serde(default)]
    pub all: bool,
}

/// POST `/smoothing/reset` — clears EMA state for one tracker or all.
pub async fn reset_smoothing(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SmoothingResetRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_ready(&state)?;

    let request = body.map(|Json(request)| request).unwrap_or_default();

    let (cleared, tracker) = if request.all {
        (state.engine.reset_smoothing(None).await, String::from("all"))
    } else if let Some(tracker_id) = request.tracker_id {
        (state.engine.reset_smoothing(Some(&tracker_id)).await, tracker_id)
    } else {
        return Err(ApiError::bad_request("Provide 'tracker_id' or set 'all': true"));
    };

    let strategy = state
        .config
        .read()
        .expect("config lock is not poisoned")
        .global
        .allocation_strategy;

    Ok(Json(json!({
        "status": "ok",
        "cleared_count": cleared,
        "tracker": tracker,
        "strategy": strategy,
        "timestamp": now_unix(),
    })))
}

/// POST `/config/reload` — re-reads the configuration file and applies
/// the parts that can change at runtime: tracker patterns and the
/// rollout percentage. Engine tunables and bind addresses take effect
/// on restart.
pub async fn reload_config(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    require_ready(&state)?;

    let config = Configuration::load(&state.config_path)
        .map_err(|err| ApiError::bad_request(format!("Configuration reload failed: {err}")))?;

    state
        .matcher
        .reload(config.trackers.clone())
        .map_err(|err| ApiError::bad_request(format!("Configuration reload failed: {err}")))?;

    state.engine.set_rollout_percentage(config.global.rollout_percentage);

    let trackers = config.trackers.len();
    *state.config.write().expect("config lock is not poisoned") = config;

    Ok(Json(json!({
        "status": "reloaded",
        "trackers": trackers,
        "timestamp": now_unix(),
    })))
}

#[derive(Deserialize, Debug)]
pub struct WebhookForm {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub hash: String,
    pub name: Option<String>,
    pub tracker: Option<String>,
}

/// POST `/webhook` — parses and queues the event, nothing more, so the
/// response stays within the latency budget.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Form(form): Form<WebhookForm>,
) -> Result<Response, ApiError> {
    require_ready(&state)?;

    let kind = EventKind::from_str(&form.event)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let hash = TorrentHash::from_str(&form.hash)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    state.intake.enqueue(WebhookEvent {
        kind,
        hash,
        name: form.name,
        tracker_url: form.tracker,
        received_at: now_unix(),
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "queued",
            "queue_len": state.intake.queue_len(),
        })),
    )
        .into_response())
}

#[cfg(test)]
mod tests {

    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Instant;

    use trackcap_configuration::Configuration;
    use trackcap_core::allocation::engine::AllocationEngine;
    use trackcap_core::qbit::client::QbitClient;
    use trackcap_core::rollback::setup::initialize_rollback_store;
    use trackcap_core::torrent::repository::in_memory::InMemoryTorrentRepository;
    use trackcap_core::tracker::matcher::TrackerMatcher;

    use crate::app::AppState;
    use crate::webhook::WebhookIntake;

    fn sample_configuration() -> Configuration {
        Configuration::load_from_str(
            r#"
qbittorrent:
  username: admin
  password: adminadmin
trackers:
  - id: priv
    name: Private tracker
    pattern: ".*private\\.example\\.org.*"
    max_upload_speed: 4194304
    priority: 5
  - id: default
    name: Everything else
    pattern: ".*"
    max_upload_speed: -1
"#,
        )
        .unwrap()
    }

    fn initialize_state(ready: bool) -> (Arc<AppState>, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = sample_configuration();

        let matcher = Arc::new(TrackerMatcher::new(config.trackers.clone()).unwrap());
        let qbit = Arc::new(QbitClient::new(&config.qbittorrent).unwrap());
        let cache = Arc::new(InMemoryTorrentRepository::default());

        let rollback_settings = trackcap_configuration::RollbackSettings {
            database_path: temp_dir.path().join("rollback.db").to_str().unwrap().to_string(),
            track_all_changes: true,
        };
        let rollback = initialize_rollback_store(&rollback_settings).unwrap();

        let engine = Arc::new(AllocationEngine::new(
            &config.global,
            &qbit,
            &matcher,
            &rollback,
            true,
            &cache,
            None,
        ));

        let state = Arc::new(AppState {
            config: std::sync::RwLock::new(config),
            config_path: PathBuf::from("/nonexistent/trackcap.yaml"),
            engine,
            matcher,
            cache,
            rollback,
            qbit,
            intake: Arc::new(WebhookIntake::new(None)),
            cross_seed: None,
            started_at: Instant::now(),
            ready: AtomicBool::new(ready),
        });

        (state, temp_dir)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    mod before_initialization {

        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        use crate::servers::http::handlers::tests::initialize_state;
        use crate::servers::http::router;

        #[tokio::test]
        async fn it_should_return_503_until_the_application_is_ready() {
            let (state, _temp_dir) = initialize_state(false);
            let app = router(state);

            let response = app
                .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    mod the_health_endpoint {

        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        use crate::servers::http::handlers::tests::{body_json, initialize_state};
        use crate::servers::http::router;

        #[tokio::test]
        async fn it_should_report_a_healthy_status_with_a_closed_circuit() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["status"], "healthy");
        }
    }

    mod the_config_endpoint {

        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        use crate::servers::http::handlers::tests::{body_json, initialize_state};
        use crate::servers::http::router;

        #[tokio::test]
        async fn it_should_mask_the_qbittorrent_password() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(Request::builder().uri("/config").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["qbittorrent"]["password"], "***");
        }
    }

    mod the_match_test_endpoint {

        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        use crate::servers::http::handlers::tests::{body_json, initialize_state};
        use crate::servers::http::router;

        #[tokio::test]
        async fn it_should_report_the_first_matching_tracker() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/match/test?url=http://tracker.private.example.org/announce&detailed=true")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["matched_tracker"], "priv");
            assert!(body["trace"].is_array());
        }

        #[tokio::test]
        async fn it_should_reject_a_missing_url() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(Request::builder().uri("/match/test").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    mod the_rollout_endpoint {

        use axum::body::Body;
        use axum::http::{header, Request, StatusCode};
        use tower::ServiceExt;

        use crate::servers::http::handlers::tests::initialize_state;
        use crate::servers::http::router;

        #[tokio::test]
        async fn it_should_update_the_rollout_percentage() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state.clone());

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/rollout")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(r#"{"percentage": 42}"#))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(state.engine.rollout_percentage(), 42);
        }

        #[tokio::test]
        async fn it_should_reject_an_out_of_range_percentage() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/rollout")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(r#"{"percentage": 150}"#))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    mod the_rollback_endpoint {

        use axum::body::Body;
        use axum::http::{header, Request, StatusCode};
        use tower::ServiceExt;

        use crate::servers::http::handlers::tests::initialize_state;
        use crate::servers::http::router;

        #[tokio::test]
        async fn it_should_require_confirmation() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/rollback")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(r"{}"))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    mod the_webhook_endpoint {

        use axum::body::Body;
        use axum::http::{header, Request, StatusCode};
        use tower::ServiceExt;

        use crate::servers::http::handlers::tests::{body_json, initialize_state};
        use crate::servers::http::router;

        #[tokio::test]
        async fn it_should_queue_a_valid_event_and_respond_202() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state.clone());

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/webhook")
                        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                        .body(Body::from(
                            "event=complete&hash=3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0&name=test",
                        ))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::ACCEPTED);
            let body = body_json(response).await;
            assert_eq!(body["status"], "queued");
            assert_eq!(state.intake.queue_len(), 1);
        }

        #[tokio::test]
        async fn it_should_reject_an_unknown_event_kind() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/webhook")
                        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                        .body(Body::from(
                            "event=paused&hash=3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0",
                        ))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn it_should_reject_a_malformed_hash() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/webhook")
                        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                        .body(Body::from("event=add&hash=nope"))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    mod the_smoothing_reset_endpoint {

        use axum::body::Body;
        use axum::http::{header, Request, StatusCode};
        use tower::ServiceExt;

        use crate::servers::http::handlers::tests::{body_json, initialize_state};
        use crate::servers::http::router;

        #[tokio::test]
        async fn it_should_reset_all_smoothing_state() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/smoothing/reset")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(r#"{"all": true}"#))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["tracker"], "all");
        }

        #[tokio::test]
        async fn it_should_require_a_target() {
            let (state, _temp_dir) = initialize_state(true);
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/smoothing/reset")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(r"{}"))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }
}
