//! Listener boundary
//!
//! A proxy instance drives its network listener only through these traits.
//! The listener calls back into the instance once per request to obtain an
//! upstream decision, and again when forwarding fails.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{normalize_method, ProxyListenOptions, RequestInfo, UpstreamDecision};

/// Raw request descriptor handed to [`RequestHook::on_prepare_request`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareRequest {
    pub connection_id: u64,
    pub hostname: String,
    pub port: u16,
    pub is_http: bool,
    pub method: Option<String>,
    pub url: String,
    pub username: String,
    pub password: String,
}

impl PrepareRequest {
    /// Routing view of this request, with the method normalized
    pub fn to_request_info(&self) -> RequestInfo {
        RequestInfo {
            connection_id: self.connection_id,
            hostname: self.hostname.clone(),
            port: self.port,
            is_http: self.is_http,
            method: normalize_method(self.method.as_deref()),
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Callbacks a listener invokes while serving requests
pub trait RequestHook: Send + Sync {
    fn on_prepare_request(&self, request: &PrepareRequest) -> UpstreamDecision;

    fn on_request_failed(&self, error: &str);
}

/// Everything a listener needs to start serving
#[derive(Clone)]
pub struct ListenerOptions {
    pub listen: ProxyListenOptions,
    pub verbose: bool,
    pub auth_realm: Option<String>,
    pub hook: Arc<dyn RequestHook>,
}

/// Creates bound listeners
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    /// Bind and start accepting. Fails if the address cannot be bound.
    async fn bind(&self, options: ListenerOptions) -> Result<Box<dyn ListenerHandle>>;
}

/// A running listener
#[async_trait]
pub trait ListenerHandle: Send + Sync {
    /// Address actually bound, with the OS-assigned port when 0 was requested
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting. With `force`, live connections are torn down too.
    async fn close(self: Box<Self>, force: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_request_info_defaults_method_to_connect() {
        let request = PrepareRequest {
            connection_id: 3,
            hostname: "example.com".to_string(),
            port: 443,
            url: "example.com:443".to_string(),
            ..PrepareRequest::default()
        };

        let info = request.to_request_info();
        assert_eq!(info.method, "CONNECT");
        assert_eq!(info.connection_id, 3);
        assert!(!info.is_http);

        let info = PrepareRequest {
            method: Some("get".to_string()),
            is_http: true,
            ..request
        }
        .to_request_info();
        assert_eq!(info.method, "GET");
        assert!(info.is_http);
    }
}
