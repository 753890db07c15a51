//! API server implementation
//!
//! Provides the REST control plane for the proxy: status, configuration
//! updates, reload and metrics.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
