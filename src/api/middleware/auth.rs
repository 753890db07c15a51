//! API token authentication middleware

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use crate::api::server::AppState;

pub const API_TOKEN_HEADER: &str = "x-api-token";

/// Reject requests without the configured API token.
///
/// The token is read from the current configuration on every request, so a
/// reload that changes it takes effect immediately.
pub async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let expected = match state.store.snapshot() {
        Ok(snapshot) => snapshot.runtime.api.token.clone(),
        Err(_) => return unauthorized(),
    };

    let authorized = extract_token(request.headers()) == Some(expected.as_str());
    if authorized {
        return next.run(request).await;
    }

    debug!(path = %request.uri().path(), "Rejected unauthenticated API request");
    unauthorized()
}

/// `Authorization: Bearer <token>`, falling back to `x-api-token`
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });

    bearer.or_else(|| {
        headers
            .get(API_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
    })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}
