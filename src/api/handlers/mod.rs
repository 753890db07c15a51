//! API request handlers

pub mod health;
pub mod metrics;
pub mod proxy;
pub mod reload;
pub mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::RouterError;

/// Configuration changes answer 400 whatever the cause
pub(crate) fn rejected(err: RouterError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
