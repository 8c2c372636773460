//! HTTP/WS surface for the collaboration core.
//!
//! # Endpoints
//!
//! - `GET  /health`                          — Liveness probe
//! - `GET  /ws`                               — WebSocket upgrade (the gateway)
//! - `POST /api/sessions/:id/ai/check`        — Paste-lock gate for the AI assistant

pub mod routes;

pub use routes::{app_router, AppState};
