//! Proxy request handler
//!
//! Asks the request hook where each request should go, then forwards plain
//! HTTP requests or opens CONNECT tunnels directly or through the chosen
//! upstream proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, PROXY_AUTHORIZATION};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, RouterError};
use crate::models::UpstreamDecision;
use crate::proxy::auth::{challenge_response, ProxyCredentials};
use crate::proxy::listener::{PrepareRequest, RequestHook};
use crate::proxy::server::force_closed;
use crate::proxy::tunnel;
use crate::proxy::upstream::{self, format_tcp_addr, Upstream, UpstreamProtocol};

/// Timeouts applied while forwarding
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Timeout for establishing the outbound connection
    pub connect_timeout: Duration,
    /// Timeout for a forwarded request/response exchange
    pub request_timeout: Duration,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-listener request handler
pub struct ProxyHandler {
    hook: Arc<dyn RequestHook>,
    config: ProxyHandlerConfig,
    verbose: bool,
    auth_realm: Option<String>,
    force_close: watch::Receiver<bool>,
}

impl ProxyHandler {
    pub fn new(
        hook: Arc<dyn RequestHook>,
        config: ProxyHandlerConfig,
        verbose: bool,
        auth_realm: Option<String>,
        force_close: watch::Receiver<bool>,
    ) -> Self {
        Self {
            hook,
            config,
            verbose,
            auth_realm,
            force_close,
        }
    }

    /// Handle one request from a client connection. Failures are turned
    /// into error responses; this never returns an error itself.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        connection_id: u64,
        client_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let credentials = match ProxyCredentials::from_headers(req.headers()) {
            Ok(credentials) => credentials.unwrap_or_default(),
            Err(_) => {
                debug!(%client_addr, "Malformed Proxy-Authorization header");
                return challenge_response(self.auth_realm.as_deref());
            }
        };

        if req.method() == Method::CONNECT {
            return self.handle_connect(req, connection_id, credentials).await;
        }

        self.handle_http(req, connection_id, client_addr, credentials)
            .await
    }

    /// Handle HTTP CONNECT (tunnelling)
    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        connection_id: u64,
        credentials: ProxyCredentials,
    ) -> Response<Full<Bytes>> {
        let Some((host, port)) = split_authority(req.uri(), 443) else {
            return error_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        };
        let authority = format_tcp_addr(&host, port);

        let prepare = PrepareRequest {
            connection_id,
            hostname: host.clone(),
            port,
            is_http: false,
            method: Some(Method::CONNECT.to_string()),
            url: authority.clone(),
            username: credentials.username,
            password: credentials.password,
        };
        let decision = self.hook.on_prepare_request(&prepare);
        self.log_decision(connection_id, "CONNECT", &authority, &decision);

        let server = match self.open_tunnel(&decision, &host, port).await {
            Ok(server) => server,
            Err(e) => return self.fail(e),
        };

        let on_upgrade: OnUpgrade = hyper::upgrade::on(req);
        let force_close = self.force_close.clone();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    tokio::select! {
                        _ = tunnel::copy_bidirectional(client, server) => {}
                        _ = force_closed(force_close) => {
                            debug!(connection_id, "Tunnel aborted by forced close");
                        }
                    }
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                }
            }
        });

        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::OK;
        response
    }

    /// Handle a plain HTTP request in absolute form
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        connection_id: u64,
        client_addr: SocketAddr,
        credentials: ProxyCredentials,
    ) -> Response<Full<Bytes>> {
        let uri = req.uri().clone();

        match uri.scheme_str() {
            Some("http") => {}
            Some("https") => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "https targets must be requested with CONNECT",
                );
            }
            _ => {
                debug!(%client_addr, "Rejecting non-proxy request {}", uri);
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "Proxy requests must use an absolute http:// URL",
                );
            }
        }

        let Some((host, port)) = split_authority(&uri, 80) else {
            return error_response(StatusCode::BAD_REQUEST, "Request URL has no host");
        };

        let prepare = PrepareRequest {
            connection_id,
            hostname: host.clone(),
            port,
            is_http: true,
            method: Some(req.method().to_string()),
            url: uri.to_string(),
            username: credentials.username,
            password: credentials.password,
        };
        let decision = self.hook.on_prepare_request(&prepare);
        self.log_decision(connection_id, req.method().as_str(), &prepare.url, &decision);

        match self.forward_request(req, &decision, &host, port).await {
            Ok(response) => response,
            Err(e) => self.fail(e),
        }
    }

    async fn open_tunnel(
        &self,
        decision: &UpstreamDecision,
        host: &str,
        port: u16,
    ) -> Result<TcpStream> {
        let upstream = resolve_upstream(decision)?;

        tokio::time::timeout(
            self.config.connect_timeout,
            upstream::connect_tunnel(upstream.as_ref(), host, port),
        )
        .await
        .map_err(|_| {
            RouterError::ProxyConnectionFailed(format!(
                "Connecting to {} timed out",
                format_tcp_addr(host, port)
            ))
        })?
    }

    /// Forward an HTTP request and buffer the response
    async fn forward_request(
        &self,
        req: Request<Incoming>,
        decision: &UpstreamDecision,
        host: &str,
        port: u16,
    ) -> Result<Response<Full<Bytes>>> {
        let upstream = resolve_upstream(decision)?;
        let (parts, body) = req.into_parts();

        // HTTP upstreams take the absolute form; everything else gets the
        // origin form over a tunnelled stream.
        let via_http_proxy = upstream
            .as_ref()
            .filter(|u| u.protocol == UpstreamProtocol::Http);

        let (stream, target_uri) = match via_http_proxy {
            Some(proxy) => {
                let stream = tokio::time::timeout(
                    self.config.connect_timeout,
                    upstream::connect_to_upstream(proxy),
                )
                .await
                .map_err(|_| {
                    RouterError::ProxyConnectionFailed(format!(
                        "Connecting to upstream {} timed out",
                        proxy.address()
                    ))
                })??;
                (stream, parts.uri.to_string())
            }
            None => {
                let stream = self.open_tunnel(decision, host, port).await?;
                let path = parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                (stream, path.to_string())
            }
        };

        let body_bytes = body
            .collect()
            .await
            .map_err(|e| RouterError::InvalidRequest(format!("Failed to read body: {}", e)))?
            .to_bytes();

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(&target_uri);

        // Copy headers, except hop-by-hop headers
        for (name, value) in &parts.headers {
            if !is_hop_by_hop_header(name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        if !parts.headers.contains_key(HOST) {
            builder = builder.header(HOST, host_header(host, port));
        }

        if let Some(auth) = via_http_proxy.and_then(Upstream::basic_auth) {
            builder = builder.header(PROXY_AUTHORIZATION, auth);
        }

        let request = builder
            .body(Full::new(body_bytes))
            .map_err(|e| RouterError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RouterError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection ended: {}", e);
            }
        });

        let response =
            tokio::time::timeout(self.config.request_timeout, sender.send_request(request))
                .await
                .map_err(|_| RouterError::ProxyConnectionFailed("Request timed out".to_string()))?
                .map_err(|e| RouterError::ProxyConnectionFailed(format!("Request failed: {}", e)))?;

        let (mut parts, body) = response.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| {
                RouterError::ProxyConnectionFailed(format!("Failed to read response: {}", e))
            })?
            .to_bytes();

        let hop_by_hop: Vec<_> = parts
            .headers
            .keys()
            .filter(|name| is_hop_by_hop_header(name.as_str()))
            .cloned()
            .collect();
        for name in hop_by_hop {
            parts.headers.remove(name);
        }

        Ok(Response::from_parts(parts, Full::new(body_bytes)))
    }

    /// Report a forwarding failure to the hook and answer 502
    fn fail(&self, err: RouterError) -> Response<Full<Bytes>> {
        let message = err.to_string();
        warn!("Forwarding failed: {}", message);
        self.hook.on_request_failed(&message);
        error_response(StatusCode::BAD_GATEWAY, &message)
    }

    fn log_decision(&self, connection_id: u64, method: &str, url: &str, decision: &UpstreamDecision) {
        let target = match decision {
            UpstreamDecision::Upstream(upstream) => crate::proxy::metrics::redact_upstream(upstream),
            UpstreamDecision::Direct => "direct".to_string(),
            UpstreamDecision::NoDecision => "default".to_string(),
        };

        if self.verbose {
            info!(connection_id, method, url, upstream = %target, "Proxy request");
        } else {
            debug!(connection_id, method, url, upstream = %target, "Proxy request");
        }
    }
}

/// Upstream to use for a decision; `None` means connect directly
fn resolve_upstream(decision: &UpstreamDecision) -> Result<Option<Upstream>> {
    decision.upstream().map(Upstream::parse).transpose()
}

/// Host (without IPv6 brackets) and port of a request target
fn split_authority(uri: &Uri, default_port: u16) -> Option<(String, u16)> {
    let authority = uri.authority()?;
    let host = authority.host();
    if host.is_empty() {
        return None;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host.to_string(), authority.port_u16().unwrap_or(default_port)))
}

/// `Host` header value; the port is omitted when it is 80
fn host_header(host: &str, port: u16) -> String {
    if port == 80 {
        if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        }
    } else {
        format_tcp_addr(host, port)
    }
}

/// Plain-text error response
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
