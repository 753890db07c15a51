//! Proxy listener implementation using hyper
//!
//! Accepts client connections (optionally TLS-wrapped) and serves them with
//! a [`ProxyHandler`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, RouterError};
use crate::models::ServerType;
use crate::proxy::handler::{ProxyHandler, ProxyHandlerConfig};
use crate::proxy::listener::{ListenerFactory, ListenerHandle, ListenerOptions};
use crate::proxy::tls::build_acceptor;
use crate::proxy::upstream::format_tcp_addr;

/// [`ListenerFactory`] backed by hyper
#[derive(Debug, Clone, Default)]
pub struct HyperListenerFactory {
    handler_config: ProxyHandlerConfig,
}

impl HyperListenerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(handler_config: ProxyHandlerConfig) -> Self {
        Self { handler_config }
    }
}

#[async_trait]
impl ListenerFactory for HyperListenerFactory {
    async fn bind(&self, options: ListenerOptions) -> Result<Box<dyn ListenerHandle>> {
        let server = ProxyServer::bind(options, self.handler_config.clone()).await?;
        Ok(Box::new(server))
    }
}

/// A bound, running proxy listener
pub struct ProxyServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    force_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ProxyServer {
    /// Bind the listen address and start accepting connections
    #[instrument(skip(options, handler_config), fields(host = %options.listen.host, port = options.listen.port))]
    pub async fn bind(options: ListenerOptions, handler_config: ProxyHandlerConfig) -> Result<Self> {
        let listen = &options.listen;

        let acceptor = match listen.server_type {
            ServerType::Http => None,
            ServerType::Https => {
                let material = listen.tls.as_deref().ok_or_else(|| {
                    RouterError::Tls("https listener requires a key and certificate".to_string())
                })?;
                Some(build_acceptor(material)?)
            }
        };

        let addr = format_tcp_addr(&listen.host, listen.port);
        let listener = TcpListener::bind((listen.host.as_str(), listen.port))
            .await
            .map_err(|source| RouterError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (force_tx, force_rx) = watch::channel(false);

        let handler = Arc::new(ProxyHandler::new(
            options.hook,
            handler_config,
            options.verbose,
            options.auth_realm,
            force_rx.clone(),
        ));

        info!(
            "Proxy server listening on {}://{}",
            listen.server_type.as_str(),
            local_addr
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            handler,
            shutdown_rx,
            force_rx,
        ));

        Ok(Self {
            local_addr,
            shutdown_tx,
            force_tx,
            accept_task,
        })
    }
}

#[async_trait]
impl ListenerHandle for ProxyServer {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(self: Box<Self>, force: bool) {
        if force {
            let _ = self.force_tx.send(true);
        }
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.accept_task.await {
            warn!("Proxy accept loop ended abnormally: {}", e);
        }

        info!(force, "Proxy server on {} closed", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<ProxyHandler>,
    mut shutdown: watch::Receiver<bool>,
    force: watch::Receiver<bool>,
) {
    let mut connection_id: u64 = 0;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, client_addr)) => {
                        connection_id += 1;
                        let handler = handler.clone();
                        let acceptor = acceptor.clone();
                        let force = force.clone();
                        let id = connection_id;

                        tokio::spawn(async move {
                            let connection = async move {
                                match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            serve_connection(tls_stream, client_addr, id, handler).await
                                        }
                                        Err(e) => {
                                            debug!(%client_addr, "TLS handshake failed: {}", e);
                                        }
                                    },
                                    None => serve_connection(stream, client_addr, id, handler).await,
                                }
                            };

                            tokio::select! {
                                _ = connection => {}
                                _ = force_closed(force) => {
                                    debug!(connection_id = id, "Connection aborted by forced close");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Proxy accept loop stopping");
                    break;
                }
            }
        }
    }
}

/// Serve HTTP/1.1 on one client connection
async fn serve_connection<I>(
    stream: I,
    client_addr: SocketAddr,
    connection_id: u64,
    handler: Arc<ProxyHandler>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req, connection_id, client_addr).await) }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!(connection_id, "Connection error: {}", e);
    }
}

/// Resolves once a forced close is signalled. Stays pending forever if the
/// sender goes away without signalling.
pub(crate) async fn force_closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{timeout, Duration};

    use crate::models::{ProxyListenOptions, UpstreamDecision};
    use crate::proxy::listener::{PrepareRequest, RequestHook};

    struct RecordingHook {
        decision: UpstreamDecision,
        requests: Mutex<Vec<PrepareRequest>>,
        failures: Mutex<Vec<String>>,
    }

    impl RecordingHook {
        fn new(decision: UpstreamDecision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                requests: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            })
        }
    }

    impl RequestHook for RecordingHook {
        fn on_prepare_request(&self, request: &PrepareRequest) -> UpstreamDecision {
            self.requests.lock().push(request.clone());
            self.decision.clone()
        }

        fn on_request_failed(&self, error: &str) {
            self.failures.lock().push(error.to_string());
        }
    }

    fn options(hook: Arc<RecordingHook>, auth_realm: Option<&str>) -> ListenerOptions {
        ListenerOptions {
            listen: ProxyListenOptions {
                host: "127.0.0.1".to_string(),
                port: 0,
                server_type: ServerType::Http,
                tls: None,
            },
            verbose: true,
            auth_realm: auth_realm.map(str::to_string),
            hook,
        }
    }

    async fn start(hook: Arc<RecordingHook>) -> Box<dyn ListenerHandle> {
        HyperListenerFactory::new()
            .bind(options(hook, None))
            .await
            .unwrap()
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "connection closed before end of head");
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_http_request_is_forwarded_in_origin_form() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        let origin_task = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            request
        });

        let hook = RecordingHook::new(UpstreamDecision::Direct);
        let listener = start(hook.clone()).await;

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let credentials = BASE64.encode(b"alice:secret");
        let request = format!(
            "GET http://127.0.0.1:{port}/hello?x=1 HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nProxy-Authorization: Basic {credentials}\r\nConnection: close\r\n\r\n",
            port = origin_port,
            credentials = credentials,
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("ok"));

        let forwarded = origin_task.await.unwrap();
        assert!(forwarded.starts_with("GET /hello?x=1 HTTP/1.1\r\n"), "{}", forwarded);
        assert!(!forwarded.to_lowercase().contains("proxy-authorization"));

        let requests = hook.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].is_http);
        assert_eq!(requests[0].hostname, "127.0.0.1");
        assert_eq!(requests[0].port, origin_port);
        assert_eq!(requests[0].method.as_deref(), Some("GET"));
        assert_eq!(requests[0].username, "alice");
        assert_eq!(requests[0].password, "secret");

        listener.close(false).await;
    }

    #[tokio::test]
    async fn test_connect_tunnels_bytes_directly() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let hook = RecordingHook::new(UpstreamDecision::NoDecision);
        let listener = start(hook.clone()).await;

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let request = format!(
            "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
            port = target_port
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let head = timeout(Duration::from_secs(5), read_head(&mut client))
            .await
            .unwrap();
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        client.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&out, b"ping");

        let requests = hook.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].is_http);
        assert_eq!(requests[0].method.as_deref(), Some("CONNECT"));
        assert_eq!(requests[0].url, format!("127.0.0.1:{}", target_port));

        listener.close(true).await;
    }

    #[tokio::test]
    async fn test_forwarding_failure_reports_to_hook() {
        let dead_port = refused_port().await;
        let hook = RecordingHook::new(UpstreamDecision::Upstream(format!(
            "http://127.0.0.1:{}",
            dead_port
        )));
        let listener = start(hook.clone()).await;

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let head = timeout(Duration::from_secs(5), read_head(&mut client))
            .await
            .unwrap();
        assert!(head.starts_with("HTTP/1.1 502"), "{}", head);
        assert_eq!(hook.failures.lock().len(), 1);

        listener.close(false).await;
    }

    #[tokio::test]
    async fn test_malformed_proxy_authorization_gets_challenge() {
        let hook = RecordingHook::new(UpstreamDecision::Direct);
        let listener = HyperListenerFactory::new()
            .bind(options(hook.clone(), Some("Corp")))
            .await
            .unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client
            .write_all(
                b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic !!!\r\n\r\n",
            )
            .await
            .unwrap();

        let head = timeout(Duration::from_secs(5), read_head(&mut client))
            .await
            .unwrap();
        assert!(head.starts_with("HTTP/1.1 407"), "{}", head);
        assert!(head.contains("Basic realm=\"Corp\""));
        assert!(hook.requests.lock().is_empty());

        listener.close(false).await;
    }

    #[tokio::test]
    async fn test_close_stops_accepting() {
        let hook = RecordingHook::new(UpstreamDecision::Direct);
        let listener = start(hook).await;
        let addr = listener.local_addr();

        listener.close(false).await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_forced_close_aborts_tunnels() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let target_task = tokio::spawn(async move {
            let (stream, _) = target.accept().await.unwrap();
            // Hold the connection open without sending anything.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let hook = RecordingHook::new(UpstreamDecision::Direct);
        let listener = start(hook).await;

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let request = format!(
            "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
            port = target_port
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"));

        listener.close(true).await;

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("tunnel was not torn down");
        assert!(matches!(read, Ok(0) | Err(_)));

        target_task.abort();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let hook = RecordingHook::new(UpstreamDecision::Direct);
        let mut opts = options(hook, None);
        opts.listen.port = port;

        let result = HyperListenerFactory::new().bind(opts).await;
        assert!(matches!(result, Err(RouterError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_https_requires_tls_material() {
        let hook = RecordingHook::new(UpstreamDecision::Direct);
        let mut opts = options(hook, None);
        opts.listen.server_type = ServerType::Https;

        let result = HyperListenerFactory::new().bind(opts).await;
        assert!(matches!(result, Err(RouterError::Tls(_))));
    }

    #[tokio::test]
    async fn test_force_closed_waits_for_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(force_closed(rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        // A dropped sender never resolves.
        let (tx, rx) = watch::channel(false);
        drop(tx);
        assert!(timeout(Duration::from_millis(50), force_closed(rx)).await.is_err());
    }
}
