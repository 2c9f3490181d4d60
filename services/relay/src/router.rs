//! Axum Router Configuration
//!
//! Defines the HTTP routes: the realtime relay endpoint and a health check.

use crate::{listener::REALTIME_PATH, relay::realtime_handler, state::AppState};
use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route(REALTIME_PATH, get(realtime_handler))
        .route("/api/health", get(health))
        .with_state(app_state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
