//! Proxy manager
//!
//! Owns at most one [`ProxyInstance`] and serializes every lifecycle change
//! through an [`ExclusiveQueue`]. Status reads go around the queue.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{info, instrument};

use crate::error::Result;
use crate::models::{ProxyRuntimeConfig, ProxyStatus};
use crate::proxy::instance::ProxyInstance;
use crate::proxy::listener::ListenerFactory;
use crate::queue::ExclusiveQueue;

pub struct ProxyManager {
    factory: Arc<dyn ListenerFactory>,
    queue: ExclusiveQueue,
    instance: Arc<ArcSwapOption<ProxyInstance>>,
}

impl ProxyManager {
    /// Create a manager with no instance
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(factory: Arc<dyn ListenerFactory>) -> Self {
        Self {
            factory,
            queue: ExclusiveQueue::new(),
            instance: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Start the proxy with `config`, or update the running one.
    ///
    /// Start and update failures are returned as is; the previous
    /// configuration is not restored here.
    #[instrument(skip(self, config), fields(port = config.listen.port, routes = config.routes.len()))]
    pub async fn apply_config(&self, config: ProxyRuntimeConfig) -> Result<()> {
        let factory = self.factory.clone();
        let slot = self.instance.clone();

        self.queue
            .run_exclusive(async move {
                if let Some(instance) = slot.load_full() {
                    return instance.update(config).await;
                }

                let instance = Arc::new(ProxyInstance::new(config, factory));
                slot.store(Some(instance.clone()));
                instance.start().await
            })
            .await
    }

    /// Status of the current instance, `None` if there is none
    pub fn status(&self) -> Option<ProxyStatus> {
        self.instance.load().as_ref().map(|instance| instance.status())
    }

    pub fn is_running(&self) -> bool {
        self.instance
            .load()
            .as_ref()
            .is_some_and(|instance| instance.is_running())
    }

    /// Force-stop and discard the current instance
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let slot = self.instance.clone();

        self.queue
            .run_exclusive(async move {
                if let Some(instance) = slot.load_full() {
                    instance.stop(true).await;
                    info!("Proxy instance discarded");
                }
                slot.store(None);
                Ok(())
            })
            .await
    }
}
