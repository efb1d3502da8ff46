//! Cache configuration.
//!
//! Controls the memory budget, the freshness window and the eviction queue via
//! the `[cache]` table of `boardcache.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MAX_MEMORY_BYTES: usize = 128 * 1024 * 1024;
const DEFAULT_FRESHNESS_WINDOW_MS: u64 = 1000;
const DEFAULT_EVICTION_QUEUE_CAPACITY: usize = 1024;

/// Cache configuration from `boardcache.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Estimated bytes the cache may hold before LRU eviction starts.
    pub max_memory_bytes: usize,
    /// Interval (ms) after a successful check during which no counter re-check happens.
    pub freshness_window_ms: u64,
    /// Pending size changes the eviction worker can queue before updates wait.
    pub eviction_queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            freshness_window_ms: DEFAULT_FRESHNESS_WINDOW_MS,
            eviction_queue_capacity: DEFAULT_EVICTION_QUEUE_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_memory_bytes: settings.max_memory_bytes.get(),
            freshness_window_ms: settings.freshness_window.as_millis() as u64,
            eviction_queue_capacity: settings.eviction_queue_capacity.get(),
        }
    }
}

impl CacheConfig {
    /// Config with a memory budget given in megabytes.
    pub fn with_memory_mb(megabytes: usize) -> Self {
        Self {
            max_memory_bytes: megabytes.saturating_mul(1 << 20),
            ..Self::default()
        }
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }
}
