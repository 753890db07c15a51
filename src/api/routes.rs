//! API route definitions

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::middleware::require_token;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check (no auth required)
        .route("/health", get(handlers::health::health_check))
        .nest("/v1", protected_routes(state.clone()))
        .with_state(state)
}

/// Routes that require the API token
fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/proxy",
            get(handlers::proxy::get_proxy).put(handlers::proxy::update_proxy),
        )
        .route(
            "/routes",
            get(handlers::routes::get_routes).put(handlers::routes::update_routes),
        )
        .route("/reload", post(handlers::reload::reload_config))
        .route("/metrics", get(handlers::metrics::get_metrics))
        .route_layer(from_fn_with_state(state, require_token))
}
