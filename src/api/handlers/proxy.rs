//! Proxy section handlers

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::api::server::AppState;
use crate::config::{ConfigFile, ProxyConfigInput};
use crate::error::RouterError;

use super::rejected;

/// Current proxy section and instance status
pub async fn get_proxy(State(state): State<AppState>) -> Result<impl IntoResponse, RouterError> {
    let config = state.store.config()?;

    Ok(Json(json!({
        "config": config.proxy,
        "status": state.manager.status(),
    })))
}

/// Replace the proxy section. Routes are managed separately and kept.
pub async fn update_proxy(State(state): State<AppState>, body: Bytes) -> Response {
    match apply(&state, &body).await {
        Ok(proxy) => {
            info!(port = proxy.listen.port, "Proxy configuration updated");
            Json(json!({
                "config": proxy,
                "status": state.manager.status(),
            }))
            .into_response()
        }
        Err(err) => rejected(err),
    }
}

async fn apply(state: &AppState, body: &[u8]) -> Result<ProxyConfigInput, RouterError> {
    let input: ProxyConfigInput = serde_json::from_slice(body)?;
    let current = state.store.config()?;

    let candidate = ConfigFile {
        api: current.api,
        proxy: ProxyConfigInput {
            routes: current.proxy.routes,
            ..input
        },
    };

    let snapshot = state.commit(candidate).await?;
    Ok(snapshot.config.proxy.clone())
}
