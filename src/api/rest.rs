// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Everything lives under `/api/v1/` and is read-only: the pipeline is driven
// entirely by its config file, so the HTTP surface only observes. CORS is
// permissive for development dashboards; tighten `allow_origin` when exposed
// beyond localhost.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .layer(cors)
        .with_state(state)
}

/// GET /api/v1/health — component freshness and liveness.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health.snapshot())
}

/// GET /api/v1/state — the full engine snapshot.
async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}
