// Engine orchestration — resolve, cache lookup, deduplicated fetch.

pub mod events;
pub mod fetcher;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::resolver::{self, AssetCatalog, ImageRequest, ResolvedTarget};
use crate::source::{HttpImageSource, ImageSource};
use crate::store::DiskStore;
use events::{EventEmitter, ImageEvent};
use fetcher::Fetcher;

/// The engine: owns the asset catalog, the disk cache store and the fetch
/// pipeline. One instance serves the whole host process.
pub struct ImageEngine {
    catalog: AssetCatalog,
    store: Arc<DiskStore>,
    fetcher: Fetcher,
    events: EventEmitter,
}

impl ImageEngine {
    /// Engine backed by the real HTTP source.
    pub fn new(
        config: EngineConfig,
        catalog: AssetCatalog,
        events: EventEmitter,
    ) -> Result<Self, EngineError> {
        Self::with_source(config, catalog, events, Arc::new(HttpImageSource::new()))
    }

    /// Engine with a caller-supplied fetch backend. Tests inject counting
    /// fakes here.
    pub fn with_source(
        config: EngineConfig,
        catalog: AssetCatalog,
        events: EventEmitter,
        source: Arc<dyn ImageSource>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(
            DiskStore::open(&config.cache_dir, config.cache_capacity_bytes)
                .map_err(EngineError::write_failure)?,
        );
        info!(
            "image engine ready: cache_dir={} capacity={} bytes",
            config.cache_dir.display(),
            config.cache_capacity_bytes
        );
        let fetcher = Fetcher::new(
            source,
            store.clone(),
            events.clone(),
            config.max_concurrent_fetches,
            config.retry_limit,
            config.retry_backoff_base,
            config.fetch_timeout,
        );
        Ok(Self {
            catalog,
            store,
            fetcher,
            events,
        })
    }

    /// Resolve and load one image, returning the local filesystem path of
    /// the bundled or cached resource. Bundled assets and cache hits
    /// short-circuit without any network activity.
    pub async fn load(&self, request: &ImageRequest) -> Result<PathBuf, EngineError> {
        let target = resolver::resolve(&self.catalog, request);

        if request.log_resolution {
            let message = match &target {
                ResolvedTarget::LocalAsset { identifier } => {
                    format!("resolved to bundled asset: {}", identifier)
                }
                ResolvedTarget::RemoteResource { url, .. } => {
                    format!("resolved to remote url: {}", url)
                }
            };
            self.events.emit(ImageEvent::Log {
                id: request.id.clone(),
                message,
            });
        }

        match &target {
            ResolvedTarget::LocalAsset { identifier } => {
                let path = self.catalog.local_path(identifier);
                debug!("serving bundled asset {}", identifier);
                self.events.emit(ImageEvent::Succeeded {
                    id: request.id.clone(),
                    local_path: path.clone(),
                });
                Ok(path)
            }
            ResolvedTarget::RemoteResource { url, headers } => {
                let key = target.cache_key();

                if let Some(entry) = self.store.lookup(&key) {
                    debug!("cache hit for {}", key);
                    self.events.emit(ImageEvent::Succeeded {
                        id: request.id.clone(),
                        local_path: entry.path.clone(),
                    });
                    return Ok(entry.path);
                }

                let entry = self.fetcher.fetch(&request.id, url, headers, &key).await?;
                Ok(entry.path)
            }
        }
    }

    /// Best-effort batch load. Individual failures are reported through the
    /// event channel and do not abort the rest of the batch.
    pub async fn preload(&self, requests: &[ImageRequest]) {
        let loads = requests.iter().map(|request| async move {
            if let Err(e) = self.load(request).await {
                debug!("preload of {} failed: {}", request.id, e);
            }
        });
        futures::future::join_all(loads).await;
    }

    /// Drop the cached artifact a request would resolve to, if any.
    pub fn invalidate(&self, request: &ImageRequest) {
        let key = resolver::resolve(&self.catalog, request).cache_key();
        self.store.invalidate(&key);
    }

    /// Remove every cached artifact and its backing file.
    pub fn clear_disk_cache(&self) {
        self.store.clear();
        self.events.emit(ImageEvent::CacheCleared);
    }

    /// Cancel all in-flight fetches and reject new work.
    pub fn shutdown(&self) {
        self.fetcher.shutdown();
    }

    pub fn store(&self) -> &DiskStore {
        &self.store
    }

    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }
}

impl Drop for ImageEngine {
    fn drop(&mut self) {
        debug!("image engine dropped, cancelling in-flight fetches");
        self.fetcher.shutdown();
    }
}
