//! Health check endpoint

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "configPath": state.store.config_path().display().to_string(),
        "proxyRunning": state.manager.is_running(),
    }))
}
