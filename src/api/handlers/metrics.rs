//! Metrics endpoint

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;

pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.manager.status();
    let metrics = status.as_ref().map(|s| s.metrics.clone());

    Json(json!({
        "status": status,
        "metrics": metrics,
    }))
}
