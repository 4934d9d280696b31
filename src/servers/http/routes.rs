//! Route definitions for the HTTP surface.
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::app::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/stats/trackers", get(handlers::tracker_stats))
        .route("/stats/managed", get(handlers::managed_torrents))
        .route("/config", get(handlers::config))
        .route("/preview/next-cycle", get(handlers::preview_next_cycle))
        .route("/match/test", get(handlers::match_test))
        .route("/cycle/force", post(handlers::force_cycle))
        .route("/rollout", post(handlers::update_rollout))
        .route("/rollback", post(handlers::rollback))
        .route("/limits/reset", post(handlers::reset_limits))
        .route("/smoothing/reset", post(handlers::reset_smoothing))
        .route("/config/reload", post(handlers::reload_config))
        .route("/webhook", post(handlers::webhook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
