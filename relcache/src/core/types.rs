use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};

/// Value held by the cache store with its expiry metadata
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub data: JsonValue,
    /// Optional expiration time
    pub ttl: Option<Instant>,
    pub created_at: Instant,
}

impl StoredValue {
    pub fn new(data: JsonValue, ttl_secs: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            data,
            ttl: ttl_secs.map(|secs| now + Duration::from_secs(secs)),
            created_at: now,
        }
    }

    /// Check if the value has expired
    pub fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|expires| Instant::now() >= expires)
    }

    /// Get remaining TTL in seconds
    pub fn remaining_ttl_secs(&self) -> Option<u64> {
        self.ttl
            .map(|expires| expires.saturating_duration_since(Instant::now()).as_secs())
    }

    /// Rough size estimate used for the memory limit
    pub fn estimated_size(&self) -> usize {
        self.data.to_string().len() + std::mem::size_of::<Self>()
    }
}

/// Configuration for the cache store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum memory in MB
    pub max_memory_mb: usize,
    /// TTL cleanup interval in milliseconds
    pub ttl_cleanup_interval_ms: u64,
    /// TTL applied to entities when the call does not supply one
    pub default_ttl_secs: Option<u64>,
    /// TTL of negative-cache placeholders. Always bounded so a later insert becomes visible.
    pub negative_cache_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            ttl_cleanup_interval_ms: 100,
            default_ttl_secs: None,
            negative_cache_ttl_secs: 60,
        }
    }
}

/// Statistics for the cache store
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub total_keys: usize,
    /// Estimated memory usage in bytes
    pub total_memory_bytes: usize,
    pub gets: u64,
    pub sets: u64,
    pub dels: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// How a cache write treats an existing entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Write the entry, replacing any existing one
    #[default]
    CacheAndOverwrite,
    /// Write the entry only if the key is absent
    CacheIfNotExist,
    /// Do not write the entry (invalidation still happens)
    NoCache,
}

/// Per-call persistence policy. Created per call, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencyOptions {
    /// Skip the cache layer
    pub ignore_primary_layer: bool,
    /// Skip the durable store
    pub ignore_secondary_layer: bool,
    /// Legacy synonym of `ignore_primary_layer`
    pub ignore_cache: bool,
    /// Legacy inverse synonym of `ignore_secondary_layer`
    pub persist: bool,
    pub cache_mode: CacheMode,
    /// Entity TTL in seconds, `None` uses the cache default
    pub ttl: Option<u64>,
    /// On delete, write a short-lived placeholder marking the id as absent
    pub negative_cache: bool,
}

impl Default for PersistencyOptions {
    fn default() -> Self {
        Self {
            ignore_primary_layer: false,
            ignore_secondary_layer: false,
            ignore_cache: false,
            persist: true,
            cache_mode: CacheMode::default(),
            ttl: None,
            negative_cache: true,
        }
    }
}

impl PersistencyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply to the durable store only (bulk / migration writes)
    pub fn secondary_only() -> Self {
        Self {
            ignore_primary_layer: true,
            ..Self::default()
        }
    }

    /// Apply to the cache only (warm / backfill writes)
    pub fn primary_only() -> Self {
        Self {
            ignore_secondary_layer: true,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn with_negative_cache(mut self, negative_cache: bool) -> Self {
        self.negative_cache = negative_cache;
        self
    }

    /// Whether the cache step is skipped
    pub fn skip_primary(&self) -> bool {
        self.ignore_primary_layer || self.ignore_cache
    }

    /// Whether the durable-store step is skipped
    pub fn skip_secondary(&self) -> bool {
        self.ignore_secondary_layer || !self.persist
    }
}
