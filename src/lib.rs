//! Proxy Router - rule-based upstream routing for a forward proxy
//!
//! Routes every proxied request (HTTP or CONNECT) through an upstream proxy
//! chosen by the first matching rule, and manages the proxy listener's
//! lifecycle behind a small REST control plane.
//!
//! ## Features
//!
//! - First-match routing on domain, hostname, port, request kind and method
//! - Round-robin rotation over upstream lists, per rule
//! - HTTP and SOCKS5 upstream proxies, or direct connections
//! - Hot route updates; listener restarts only when bind settings change
//! - Serialized configuration changes with rollback on failure
//! - HTTP or HTTPS (rustls) listener

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod queue;
pub mod store;

pub use config::{AppConfig, ConfigFile, RuntimeConfig};
pub use error::{Result, RouterError};
pub use proxy::{HyperListenerFactory, ProxyInstance, ProxyManager};
pub use queue::ExclusiveQueue;
pub use store::ConfigStore;
