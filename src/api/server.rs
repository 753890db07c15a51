//! API server using Axum
//!
//! Serves the control plane over the shared [`AppState`]. Configuration
//! changes are committed one at a time on a control-plane queue so that a
//! save and the matching proxy update never interleave with another change.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

use crate::config::{ApiRuntimeConfig, ConfigFile};
use crate::error::{Result, RouterError};
use crate::proxy::ProxyManager;
use crate::queue::ExclusiveQueue;
use crate::store::{ConfigSnapshot, ConfigStore};

use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ProxyManager>,
    pub store: Arc<ConfigStore>,
    control: ExclusiveQueue,
}

impl AppState {
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(manager: Arc<ProxyManager>, store: Arc<ConfigStore>) -> Self {
        Self {
            manager,
            store,
            control: ExclusiveQueue::new(),
        }
    }

    /// Save `next` and apply its proxy section.
    ///
    /// A rejected save changes nothing. If the proxy update fails, the
    /// previous file and runtime are restored and re-applied.
    #[instrument(skip(self, next))]
    pub async fn commit(&self, next: ConfigFile) -> Result<Arc<ConfigSnapshot>> {
        let store = self.store.clone();
        let manager = self.manager.clone();

        self.control
            .run_exclusive(async move {
                let previous = store.snapshot()?;
                let snapshot = store.save(next).await?;

                if let Err(err) = manager.apply_config(snapshot.runtime.proxy.clone()).await {
                    warn!(error = %err, "Proxy update failed, rolling back");
                    roll_back(&store, &manager, previous, true).await;
                    return Err(err);
                }

                Ok(snapshot)
            })
            .await
    }

    /// Re-read the configuration file and apply it.
    ///
    /// On failure the previous runtime is restored in memory; the file on
    /// disk is left as found.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<Arc<ConfigSnapshot>> {
        let store = self.store.clone();
        let manager = self.manager.clone();

        self.control
            .run_exclusive(async move {
                let previous = store.snapshot()?;
                let snapshot = store.reload().await?;

                if let Err(err) = manager.apply_config(snapshot.runtime.proxy.clone()).await {
                    warn!(error = %err, "Proxy update after reload failed, rolling back");
                    roll_back(&store, &manager, previous, false).await;
                    return Err(err);
                }

                info!("Configuration reloaded");
                Ok(snapshot)
            })
            .await
    }
}

async fn roll_back(
    store: &ConfigStore,
    manager: &ProxyManager,
    previous: Arc<ConfigSnapshot>,
    persist: bool,
) {
    let restored = if persist {
        store.restore(previous.clone()).await
    } else {
        store.restore_in_memory(previous.clone()).await
    };
    if let Err(e) = restored {
        error!(error = %e, "Failed to restore previous configuration");
    }

    if let Err(e) = manager.apply_config(previous.runtime.proxy.clone()).await {
        error!(error = %e, "Failed to re-apply previous proxy configuration");
    }
}

/// API server
pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        routes::create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Bind the API address and serve until `shutdown` resolves
    #[instrument(skip(self, config, shutdown), fields(addr = %config.addr()))]
    pub async fn run<F>(&self, config: &ApiRuntimeConfig, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| RouterError::Bind {
                addr: config.addr(),
                source,
            })?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!("API server listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RouterError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
