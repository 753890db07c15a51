//! Configuration persistence
//!
//! [`ConfigStore`] owns the configuration file. Loads and saves run one at a
//! time on the store's own [`ExclusiveQueue`]; reads return the last
//! successfully resolved snapshot without waiting.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, info, instrument};

use crate::config::{build_runtime_config, ConfigFile, EnvOverrides, RuntimeConfig};
use crate::error::{Result, RouterError};
use crate::queue::ExclusiveQueue;

/// A configuration file together with its resolved runtime form
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub config: ConfigFile,
    pub runtime: RuntimeConfig,
}

struct StoreInner {
    path: PathBuf,
    base_dir: PathBuf,
    env: EnvOverrides,
    current: ArcSwapOption<ConfigSnapshot>,
}

pub struct ConfigStore {
    inner: Arc<StoreInner>,
    queue: ExclusiveQueue,
}

impl ConfigStore {
    /// Create a store for `path`. Nothing is read until [`load`](Self::load).
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(path: impl Into<PathBuf>, env: EnvOverrides) -> Self {
        let path = path.into();
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Self {
            inner: Arc::new(StoreInner {
                path,
                base_dir,
                env,
                current: ArcSwapOption::empty(),
            }),
            queue: ExclusiveQueue::new(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.path
    }

    /// Read, validate and resolve the configuration file
    #[instrument(skip(self), fields(path = %self.inner.path.display()))]
    pub async fn load(&self) -> Result<Arc<ConfigSnapshot>> {
        let inner = self.inner.clone();

        self.queue
            .run_exclusive(async move {
                let raw = tokio::fs::read_to_string(&inner.path)
                    .await
                    .map_err(|source| RouterError::ConfigFile {
                        path: inner.path.display().to_string(),
                        source,
                    })?;

                let config = ConfigFile::from_json(&raw)?;
                let runtime = build_runtime_config(&config, &inner.base_dir, &inner.env).await?;

                let snapshot = Arc::new(ConfigSnapshot { config, runtime });
                inner.current.store(Some(snapshot.clone()));

                info!(
                    routes = snapshot.runtime.proxy.routes.len(),
                    "Configuration loaded"
                );
                Ok(snapshot)
            })
            .await
    }

    /// Re-read the file from disk
    pub async fn reload(&self) -> Result<Arc<ConfigSnapshot>> {
        self.load().await
    }

    /// Validate and resolve `config`, then persist it atomically.
    ///
    /// Nothing is written when validation or resolution fails.
    #[instrument(skip(self, config), fields(path = %self.inner.path.display()))]
    pub async fn save(&self, config: ConfigFile) -> Result<Arc<ConfigSnapshot>> {
        let inner = self.inner.clone();

        self.queue
            .run_exclusive(async move {
                config.validate()?;
                let runtime = build_runtime_config(&config, &inner.base_dir, &inner.env).await?;

                write_atomic(&inner.path, &config).await?;

                let snapshot = Arc::new(ConfigSnapshot { config, runtime });
                inner.current.store(Some(snapshot.clone()));

                info!(
                    routes = snapshot.runtime.proxy.routes.len(),
                    "Configuration saved"
                );
                Ok(snapshot)
            })
            .await
    }

    /// Put a previous snapshot back, on disk and in memory
    #[instrument(skip(self, snapshot), fields(path = %self.inner.path.display()))]
    pub async fn restore(&self, snapshot: Arc<ConfigSnapshot>) -> Result<()> {
        let inner = self.inner.clone();

        self.queue
            .run_exclusive(async move {
                write_atomic(&inner.path, &snapshot.config).await?;
                inner.current.store(Some(snapshot));
                info!("Configuration restored");
                Ok(())
            })
            .await
    }

    /// Put a previous snapshot back in memory only
    pub async fn restore_in_memory(&self, snapshot: Arc<ConfigSnapshot>) -> Result<()> {
        let inner = self.inner.clone();

        self.queue
            .run_exclusive(async move {
                inner.current.store(Some(snapshot));
                Ok(())
            })
            .await
    }

    /// Last loaded or saved snapshot
    pub fn snapshot(&self) -> Result<Arc<ConfigSnapshot>> {
        self.inner
            .current
            .load_full()
            .ok_or(RouterError::ConfigNotLoaded)
    }

    pub fn config(&self) -> Result<ConfigFile> {
        Ok(self.snapshot()?.config.clone())
    }

    pub fn runtime(&self) -> Result<RuntimeConfig> {
        Ok(self.snapshot()?.runtime.clone())
    }
}

/// Write `<path>.tmp` and rename it over `path`
async fn write_atomic(path: &Path, config: &ConfigFile) -> Result<()> {
    let io_err = |source| RouterError::ConfigFile {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let mut content = serde_json::to_string_pretty(config)?;
    content.push('\n');

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, content).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;

    debug!(path = %path.display(), "Configuration written");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
