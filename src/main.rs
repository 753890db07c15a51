//! Proxy Router - Entry Point
//!
//! Loads the configuration, starts the proxy and serves the control API
//! until Ctrl+C or SIGTERM.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxy_router::api::{ApiServer, AppState};
use proxy_router::config::{AppConfig, Cli, EnvOverrides, LogConfig, LogFormat};
use proxy_router::{ConfigStore, HyperListenerFactory, ProxyManager};

#[tokio::main]
async fn main() -> proxy_router::Result<()> {
    let app = AppConfig::from(Cli::parse());
    init_tracing(&app.log);

    info!(config = %app.config_path.display(), "Starting Proxy Router");

    let store = Arc::new(ConfigStore::new(&app.config_path, EnvOverrides::from_env()));
    let snapshot = store.load().await?;

    let manager = Arc::new(ProxyManager::new(Arc::new(HyperListenerFactory::default())));
    manager.apply_config(snapshot.runtime.proxy.clone()).await?;

    let api = ApiServer::new(AppState::new(manager.clone(), store.clone()));
    let served = api.run(&snapshot.runtime.api, shutdown_signal()).await;
    if let Err(e) = &served {
        error!("API server error: {}", e);
    }

    info!("Shutting down proxy");
    manager.stop().await?;

    info!("Proxy Router stopped");
    served
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| EnvFilter::try_new(&log.level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == LogFormat::Json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
