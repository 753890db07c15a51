//! Reload endpoint

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;

use super::rejected;

/// Re-read the configuration file and apply it
pub async fn reload_config(State(state): State<AppState>) -> Response {
    match state.reload().await {
        Ok(_) => Json(json!({ "status": "reloaded" })).into_response(),
        Err(err) => rejected(err),
    }
}
