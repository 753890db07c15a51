//! Proxy instance lifecycle
//!
//! A [`ProxyInstance`] owns one listener at a time and is either stopped or
//! running. Route-only changes are swapped in without touching the
//! listener; bind-level changes rebind it.

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::models::{ProxyRuntimeConfig, ProxyStatus, RouteRule, UpstreamDecision};
use crate::proxy::listener::{
    ListenerFactory, ListenerHandle, ListenerOptions, PrepareRequest, RequestHook,
};
use crate::proxy::metrics::Metrics;
use crate::proxy::rotation::{select_upstream, RotationState};
use crate::proxy::routing::select_route;

/// Rules and their rotation cursors, swapped as one unit
struct RoutingTable {
    routes: Arc<[RouteRule]>,
    rotation: RotationState,
}

impl RoutingTable {
    fn new(routes: Arc<[RouteRule]>) -> Self {
        let rotation = RotationState::for_rules(&routes);
        Self { routes, rotation }
    }
}

/// State reachable from the listener's request callbacks
struct InstanceShared {
    config: ArcSwap<ProxyRuntimeConfig>,
    table: ArcSwap<RoutingTable>,
    metrics: Metrics,
}

impl InstanceShared {
    fn install_routes(&self, routes: Arc<[RouteRule]>) {
        self.table.store(Arc::new(RoutingTable::new(routes)));
    }
}

impl RequestHook for InstanceShared {
    fn on_prepare_request(&self, request: &PrepareRequest) -> UpstreamDecision {
        let info = request.to_request_info();
        self.metrics.record_request();

        let table = self.table.load();
        let rule = select_route(&table.routes, &info);
        let decision = select_upstream(rule, &table.rotation);
        self.metrics.record_decision(&decision);

        let rule_label = rule.map(RouteRule::label);
        debug!(
            connection_id = info.connection_id,
            host = %info.hostname,
            port = info.port,
            rule = rule_label.as_deref().unwrap_or("-"),
            "Routing decision: {:?}",
            decision
        );

        decision
    }

    fn on_request_failed(&self, error: &str) {
        self.metrics.record_error(error);
    }
}

/// One proxy listener plus its routing state and metrics
pub struct ProxyInstance {
    factory: Arc<dyn ListenerFactory>,
    shared: Arc<InstanceShared>,
    listener: Mutex<Option<Box<dyn ListenerHandle>>>,
    address: ArcSwapOption<String>,
}

impl ProxyInstance {
    /// Create a stopped instance
    pub fn new(config: ProxyRuntimeConfig, factory: Arc<dyn ListenerFactory>) -> Self {
        let table = RoutingTable::new(config.routes.clone());
        Self {
            factory,
            shared: Arc::new(InstanceShared {
                config: ArcSwap::from_pointee(config),
                table: ArcSwap::from_pointee(table),
                metrics: Metrics::new(),
            }),
            listener: Mutex::new(None),
            address: ArcSwapOption::empty(),
        }
    }

    /// Bind the listener with the current configuration. No-op if running.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        self.start_locked(&mut slot).await
    }

    /// Switch to `next`, rebinding only when a bind-level setting changed
    #[instrument(skip(self, next), fields(host = %next.listen.host, port = next.listen.port, routes = next.routes.len()))]
    pub async fn update(&self, next: ProxyRuntimeConfig) -> Result<()> {
        let mut slot = self.listener.lock().await;

        let current = self.shared.config.load_full();
        let restart = slot.is_none() || current.requires_restart(&next);
        let routes = next.routes.clone();
        self.shared.config.store(Arc::new(next));

        if restart {
            if slot.is_some() {
                info!("Bind settings changed, restarting proxy listener");
                self.stop_locked(&mut slot, true).await;
            }
            return self.start_locked(&mut slot).await;
        }

        self.shared.install_routes(routes);
        info!("Route table updated in place");
        Ok(())
    }

    /// Close the listener. No-op if stopped.
    #[instrument(skip(self))]
    pub async fn stop(&self, force: bool) {
        let mut slot = self.listener.lock().await;
        self.stop_locked(&mut slot, force).await;
    }

    /// Snapshot of the current state. Never waits on lifecycle operations.
    pub fn status(&self) -> ProxyStatus {
        let config = self.shared.config.load();
        let address = self.address.load_full();
        ProxyStatus {
            running: address.is_some(),
            listen: config.listen.clone(),
            address: address.map(|a| a.as_ref().clone()),
            metrics: self.shared.metrics.snapshot(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.address.load().is_some()
    }

    async fn start_locked(&self, slot: &mut Option<Box<dyn ListenerHandle>>) -> Result<()> {
        let config = self.shared.config.load_full();

        self.shared.install_routes(config.routes.clone());
        self.shared.metrics.restart();

        let options = ListenerOptions {
            listen: config.listen.clone(),
            verbose: config.verbose,
            auth_realm: config.auth_realm.clone(),
            hook: self.shared.clone(),
        };

        let handle = match self.factory.bind(options).await {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.metrics.mark_stopped();
                return Err(e);
            }
        };

        let address = format!(
            "{}://{}:{}",
            config.listen.server_type.as_str(),
            config.listen.host,
            handle.local_addr().port()
        );
        info!(address = %address, routes = config.routes.len(), "Proxy started");

        self.address.store(Some(Arc::new(address)));
        *slot = Some(handle);
        Ok(())
    }

    async fn stop_locked(&self, slot: &mut Option<Box<dyn ListenerHandle>>, force: bool) {
        let Some(handle) = slot.take() else {
            return;
        };

        handle.close(force).await;
        self.address.store(None);
        self.shared.metrics.mark_stopped();
        info!(force, "Proxy stopped");
    }
}
