use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::route::RouteRule;

/// Listener protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Http,
    Https,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// PEM-encoded TLS material, already read from disk
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
    pub ca: Option<Vec<u8>>,
    pub passphrase: Option<String>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .field("cert", &format_args!("<{} bytes>", self.cert.len()))
            .field("ca", &self.ca.as_ref().map(|ca| ca.len()))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Bind parameters of the proxy listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyListenOptions {
    pub host: String,
    pub port: u16,
    pub server_type: ServerType,
    #[serde(skip)]
    pub tls: Option<Arc<TlsMaterial>>,
}

/// Fully resolved proxy configuration. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct ProxyRuntimeConfig {
    pub listen: ProxyListenOptions,
    pub routes: Arc<[RouteRule]>,
    pub verbose: bool,
    pub auth_realm: Option<String>,
}

impl ProxyRuntimeConfig {
    /// Whether switching to `next` requires rebinding the listener
    pub fn requires_restart(&self, next: &ProxyRuntimeConfig) -> bool {
        self.listen.host != next.listen.host
            || self.listen.port != next.listen.port
            || self.listen.server_type != next.listen.server_type
            || self.listen.tls != next.listen.tls
            || self.verbose != next.verbose
            || self.auth_realm != next.auth_realm
    }
}

/// Request counters of a proxy instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMetrics {
    pub total_requests: u64,
    pub total_errors: u64,
    /// Requests per redacted upstream URL, or `direct`
    pub upstream_requests: BTreeMap<String, u64>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Read-only snapshot of a proxy instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub running: bool,
    pub listen: ProxyListenOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub metrics: ProxyMetrics,
}
