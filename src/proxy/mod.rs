//! Proxy data plane and lifecycle
//!
//! This module provides:
//! - rule matching and round-robin upstream selection
//! - the proxy instance state machine and its manager
//! - a hyper listener with CONNECT tunnelling and HTTP forwarding,
//!   directly or through HTTP/SOCKS5 upstream proxies

pub mod auth;
pub mod handler;
pub mod instance;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod rotation;
pub mod routing;
pub mod server;
pub mod tls;
pub mod tunnel;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use handler::{ProxyHandler, ProxyHandlerConfig};
pub use instance::ProxyInstance;
pub use listener::{ListenerFactory, ListenerHandle, ListenerOptions, PrepareRequest, RequestHook};
pub use manager::ProxyManager;
pub use server::{HyperListenerFactory, ProxyServer};
