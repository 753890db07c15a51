//! In-memory listener used by lifecycle tests

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, RouterError};
use crate::models::{ProxyListenOptions, ProxyRuntimeConfig, RouteRule, ServerType};
use crate::proxy::listener::{ListenerFactory, ListenerHandle, ListenerOptions, RequestHook};

#[derive(Default)]
struct Recorded {
    binds: Vec<ProxyListenOptions>,
    closes: Vec<bool>,
    hooks: Vec<Arc<dyn RequestHook>>,
}

/// Records binds and closes instead of touching the network
#[derive(Clone)]
pub struct MockListenerFactory {
    recorded: Arc<Mutex<Recorded>>,
    next_port: Arc<AtomicU16>,
    fail_next: Arc<AtomicBool>,
    bind_delay: Duration,
}

impl MockListenerFactory {
    pub fn new() -> Self {
        Self {
            recorded: Arc::default(),
            next_port: Arc::new(AtomicU16::new(40000)),
            fail_next: Arc::default(),
            bind_delay: Duration::ZERO,
        }
    }

    pub fn with_bind_delay(delay: Duration) -> Self {
        Self {
            bind_delay: delay,
            ..Self::new()
        }
    }

    /// Make the next bind fail with an address-in-use error
    pub fn fail_next_bind(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn binds(&self) -> Vec<ProxyListenOptions> {
        self.recorded.lock().binds.clone()
    }

    pub fn closes(&self) -> Vec<bool> {
        self.recorded.lock().closes.clone()
    }

    /// Hook registered by the most recent successful bind
    pub fn last_hook(&self) -> Arc<dyn RequestHook> {
        self.recorded
            .lock()
            .hooks
            .last()
            .cloned()
            .expect("no listener has been bound")
    }
}

#[async_trait]
impl ListenerFactory for MockListenerFactory {
    async fn bind(&self, options: ListenerOptions) -> Result<Box<dyn ListenerHandle>> {
        if !self.bind_delay.is_zero() {
            tokio::time::sleep(self.bind_delay).await;
        }

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RouterError::Bind {
                addr: format!("{}:{}", options.listen.host, options.listen.port),
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            });
        }

        let port = match options.listen.port {
            0 => self.next_port.fetch_add(1, Ordering::SeqCst),
            port => port,
        };

        let mut recorded = self.recorded.lock();
        recorded.binds.push(options.listen.clone());
        recorded.hooks.push(options.hook.clone());

        Ok(Box::new(MockListener {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            recorded: self.recorded.clone(),
        }))
    }
}

struct MockListener {
    addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl ListenerHandle for MockListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(self: Box<Self>, force: bool) {
        self.recorded.lock().closes.push(force);
    }
}

/// Plain-HTTP runtime config on 127.0.0.1
pub fn runtime_config(port: u16, routes: Vec<RouteRule>) -> ProxyRuntimeConfig {
    ProxyRuntimeConfig {
        listen: ProxyListenOptions {
            host: "127.0.0.1".to_string(),
            port,
            server_type: ServerType::Http,
            tls: None,
        },
        routes: Arc::from(routes),
        verbose: false,
        auth_realm: None,
    }
}
