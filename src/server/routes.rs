//! Axum route handlers for the collaboration core's HTTP/WS server.
//!
//! # Routes
//!
//! - `GET  /health`                       — Liveness probe
//! - `GET  /ws`                           — WebSocket upgrade (session join)
//! - `POST /api/sessions/{id}/ai/check`   — Paste-lock gate for the AI assistant

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::gateway;
use crate::hub::Hub;
use crate::paste::Detector;
use crate::repo::SessionRepository;

/// Shared application state for the HTTP/WS server.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub repo: Arc<dyn SessionRepository>,
    pub detector: Arc<Detector>,
    pub config: Arc<AppConfig>,
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(gateway::ws_upgrade))
        .route("/api/sessions/{id}/ai/check", post(gateway::ai_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health — liveness probe.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "collab-core",
    }))
}
