use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use image_cache_engine::source::{ImageBody, ImageSource};
use image_cache_engine::{
    AssetCatalog, EngineConfig, EngineError, EventEmitter, ImageEngine, ImageEvent, ImageRequest,
};

const REMOTE_BYTES: &[u8] = b"remote bytes";

/// Fake transport that counts fetches and records the URLs it was asked for.
/// URLs containing "bad" fail permanently.
struct CountingSource {
    fetches: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<String>>>,
}

impl CountingSource {
    fn new() -> (Arc<Self>, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let urls = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                fetches: fetches.clone(),
                urls: urls.clone(),
            }),
            fetches,
            urls,
        )
    }
}

#[async_trait]
impl ImageSource for CountingSource {
    async fn fetch(
        &self,
        url: &str,
        _headers: &BTreeMap<String, String>,
    ) -> Result<ImageBody, EngineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());
        if url.contains("bad") {
            return Err(EngineError::NetworkPermanent(format!("HTTP 404 for {url}")));
        }
        Ok(ImageBody::from_chunks(vec![Bytes::from_static(REMOTE_BYTES)]))
    }
}

fn test_config(cache_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        cache_dir: cache_dir.to_path_buf(),
        retry_backoff_base: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

fn bundled_catalog(dir: &std::path::Path) -> AssetCatalog {
    std::fs::write(dir.join("logo.png"), b"bundled logo").unwrap();
    AssetCatalog::scan(dir).unwrap()
}

#[tokio::test]
async fn test_hybrid_asset_loads_without_network() {
    let assets = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let catalog = bundled_catalog(assets.path());
    let (source, fetches, _urls) = CountingSource::new();
    let (events, mut rx) = EventEmitter::channel(16);
    let engine =
        ImageEngine::with_source(test_config(cache.path()), catalog, events, source).unwrap();

    let request = ImageRequest::new("logo.png").hybrid_assets(true);
    let path = engine.load(&request).await.unwrap();

    assert_eq!(path, assets.path().join("logo.png"));
    assert_eq!(std::fs::read(&path).unwrap(), b"bundled logo");
    assert_eq!(fetches.load(Ordering::SeqCst), 0, "bundled asset must not fetch");
    assert!(matches!(rx.recv().await, Some(ImageEvent::Succeeded { .. })));
}

#[tokio::test]
async fn test_cloud_url_join_and_second_load_hits_cache() {
    let cache = tempfile::tempdir().unwrap();
    let (source, fetches, urls) = CountingSource::new();
    let engine = ImageEngine::with_source(
        test_config(cache.path()),
        AssetCatalog::default(),
        EventEmitter::disabled(),
        source,
    )
    .unwrap();

    let request = ImageRequest::new("/banner.jpg").cloud_url("https://cdn.example.com");
    let first = engine.load(&request).await.unwrap();
    assert_eq!(std::fs::read(&first).unwrap(), REMOTE_BYTES);
    assert_eq!(urls.lock().as_slice(), ["https://cdn.example.com/banner.jpg"]);

    let second = engine.load(&request).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(fetches.load(Ordering::SeqCst), 1, "second load must be a cache hit");
}

#[tokio::test]
async fn test_fetch_emits_started_then_succeeded() {
    let cache = tempfile::tempdir().unwrap();
    let (source, _fetches, _urls) = CountingSource::new();
    let (events, mut rx) = EventEmitter::channel(32);
    let engine = ImageEngine::with_source(
        test_config(cache.path()),
        AssetCatalog::default(),
        events,
        source,
    )
    .unwrap();

    let request = ImageRequest::new("https://cdn.example.com/a.png");
    engine.load(&request).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event);
    }
    assert!(matches!(kinds.first(), Some(ImageEvent::Started { .. })));
    assert!(kinds
        .iter()
        .any(|e| matches!(e, ImageEvent::Progress { .. })));
    assert!(matches!(kinds.last(), Some(ImageEvent::Succeeded { .. })));
}

#[tokio::test]
async fn test_failed_fetch_emits_failure_event() {
    let cache = tempfile::tempdir().unwrap();
    let (source, _fetches, _urls) = CountingSource::new();
    let (events, mut rx) = EventEmitter::channel(32);
    let engine = ImageEngine::with_source(
        test_config(cache.path()),
        AssetCatalog::default(),
        events,
        source,
    )
    .unwrap();

    let request = ImageRequest::new("https://cdn.example.com/bad.png");
    let err = engine.load(&request).await.unwrap_err();
    assert!(matches!(err, EngineError::NetworkPermanent(_)));

    let mut saw_failed = false;
    while let Ok(event) = rx.try_recv() {
        if let ImageEvent::Failed { reason, .. } = event {
            assert!(reason.contains("404"));
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn test_preload_continues_past_failures() {
    let cache = tempfile::tempdir().unwrap();
    let (source, fetches, _urls) = CountingSource::new();
    let engine = ImageEngine::with_source(
        test_config(cache.path()),
        AssetCatalog::default(),
        EventEmitter::disabled(),
        source,
    )
    .unwrap();

    let requests = vec![
        ImageRequest::new("https://cdn.example.com/bad.png"),
        ImageRequest::new("https://cdn.example.com/good.png"),
    ];
    engine.preload(&requests).await;

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(engine.store().entry_count(), 1, "good image cached despite failure");
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let cache = tempfile::tempdir().unwrap();
    let (source, fetches, _urls) = CountingSource::new();
    let engine = ImageEngine::with_source(
        test_config(cache.path()),
        AssetCatalog::default(),
        EventEmitter::disabled(),
        source,
    )
    .unwrap();

    let request = ImageRequest::new("https://cdn.example.com/a.png");
    engine.load(&request).await.unwrap();
    engine.invalidate(&request);
    assert_eq!(engine.store().entry_count(), 0);

    engine.load(&request).await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_capacity_eviction_across_loads() {
    let cache = tempfile::tempdir().unwrap();
    let mut config = test_config(cache.path());
    // Room for two 12-byte payloads, not three.
    config.cache_capacity_bytes = 25;
    let (source, _fetches, _urls) = CountingSource::new();
    let engine = ImageEngine::with_source(
        config,
        AssetCatalog::default(),
        EventEmitter::disabled(),
        source,
    )
    .unwrap();

    for name in ["a.png", "b.png", "c.png"] {
        let request = ImageRequest::new(format!("https://cdn.example.com/{name}"));
        engine.load(&request).await.unwrap();
    }

    assert!(engine.store().total_bytes() <= 25);
    assert_eq!(engine.store().entry_count(), 2);
    // The oldest entry was evicted; the newest two survive.
    let survives = ImageRequest::new("https://cdn.example.com/c.png");
    assert!(engine.store().lookup(&image_cache_engine::resolver::resolve(
        engine.catalog(),
        &survives
    )
    .cache_key())
    .is_some());
}

#[tokio::test]
async fn test_clear_disk_cache_empties_store_and_notifies() {
    let cache = tempfile::tempdir().unwrap();
    let (source, _fetches, _urls) = CountingSource::new();
    let (events, mut rx) = EventEmitter::channel(32);
    let engine = ImageEngine::with_source(
        test_config(cache.path()),
        AssetCatalog::default(),
        events,
        source,
    )
    .unwrap();

    engine
        .load(&ImageRequest::new("https://cdn.example.com/a.png"))
        .await
        .unwrap();
    assert_eq!(engine.store().entry_count(), 1);

    engine.clear_disk_cache();
    assert_eq!(engine.store().entry_count(), 0);
    assert_eq!(engine.store().total_bytes(), 0);

    let mut saw_cleared = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ImageEvent::CacheCleared) {
            saw_cleared = true;
        }
    }
    assert!(saw_cleared);
}

#[tokio::test]
async fn test_resolution_logging_emits_debug_event() {
    let cache = tempfile::tempdir().unwrap();
    let (source, _fetches, _urls) = CountingSource::new();
    let (events, mut rx) = EventEmitter::channel(32);
    let engine = ImageEngine::with_source(
        test_config(cache.path()),
        AssetCatalog::default(),
        events,
        source,
    )
    .unwrap();

    let request = ImageRequest::new("https://cdn.example.com/a.png").log_resolution(true);
    engine.load(&request).await.unwrap();

    let mut saw_log = false;
    while let Ok(event) = rx.try_recv() {
        if let ImageEvent::Log { message, .. } = event {
            assert!(message.contains("remote url"));
            saw_log = true;
        }
    }
    assert!(saw_log);
}
