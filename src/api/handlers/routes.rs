//! Route list handlers

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::api::server::AppState;
use crate::config::{ConfigFile, ProxyConfigInput, RouteRuleInput};
use crate::error::RouterError;

use super::rejected;

pub async fn get_routes(State(state): State<AppState>) -> Result<impl IntoResponse, RouterError> {
    let config = state.store.config()?;
    Ok(Json(json!({ "routes": config.proxy.routes })))
}

/// Replace the route list. An empty body or `null` clears it.
pub async fn update_routes(State(state): State<AppState>, body: Bytes) -> Response {
    match apply(&state, &body).await {
        Ok(routes) => {
            info!(routes = routes.len(), "Routes updated");
            Json(json!({ "routes": routes })).into_response()
        }
        Err(err) => rejected(err),
    }
}

async fn apply(state: &AppState, body: &[u8]) -> Result<Vec<RouteRuleInput>, RouterError> {
    let routes: Option<Vec<RouteRuleInput>> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice(body)?
    };

    let current = state.store.config()?;
    let candidate = ConfigFile {
        api: current.api,
        proxy: ProxyConfigInput {
            routes: routes.unwrap_or_default(),
            ..current.proxy
        },
    };

    let snapshot = state.commit(candidate).await?;
    Ok(snapshot.config.proxy.routes.clone())
}
