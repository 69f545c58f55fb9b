//! Image resolution, prefetch and disk cache engine.
//!
//! Given a logical image reference — a remote URL or a bundled ("hybrid")
//! asset identifier — the engine resolves it to a concrete target, fetches
//! remote resources through a bounded, deduplicated download pipeline, and
//! persists them in a size-bounded LRU disk cache. Lifecycle events are
//! published to the embedding host over a fire-and-forget channel.

pub mod config;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod source;
pub mod store;

pub use config::EngineConfig;
pub use engine::events::{EventEmitter, ImageEvent};
pub use engine::ImageEngine;
pub use error::EngineError;
pub use resolver::{AssetCatalog, CacheKey, ImageRequest, ResolvedTarget};
pub use store::{CacheEntry, DiskStore};
