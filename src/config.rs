use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// File extension used for cached image payloads under the cache root.
pub const CACHE_FILE_EXT: &str = "img";

/// Name of the persisted cache metadata record under the cache root.
pub const CACHE_INDEX_FILE: &str = "index.json";

/// Top-level configuration for the image engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory used for on-disk cache files.
    pub cache_dir: PathBuf,
    /// Cap on total on-disk cache usage in bytes.
    pub cache_capacity_bytes: u64,
    /// Maximum number of concurrent network fetches.
    pub max_concurrent_fetches: u32,
    /// Maximum retry attempts per fetch after the initial try.
    pub retry_limit: u32,
    /// Initial backoff duration in milliseconds; doubles on each retry.
    #[serde(with = "duration_millis")]
    pub retry_backoff_base: Duration,
    /// Per-attempt network deadline in milliseconds.
    #[serde(with = "duration_millis")]
    pub fetch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::new(),
            cache_capacity_bytes: 1024 * 1024 * 1024, // 1 GiB
            max_concurrent_fetches: 6,
            retry_limit: 3,
            retry_backoff_base: Duration::from_millis(250),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_capacity_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.max_concurrent_fetches, 6);
        assert_eq!(config.retry_limit, 3);
    }

    #[test]
    fn test_config_deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"cache_capacity_bytes": 4096, "retry_backoff_base": 100}"#)
                .unwrap();
        assert_eq!(config.cache_capacity_bytes, 4096);
        assert_eq!(config.retry_backoff_base, Duration::from_millis(100));
        // Unspecified fields keep their defaults.
        assert_eq!(config.retry_limit, 3);
    }
}
