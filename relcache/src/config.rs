use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::CacheConfig;
use crate::persistence::{EngineCapabilities, SqlEngine};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelCacheConfig {
    pub engine: EngineConfig,
    pub cache: CacheStoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Driver name, e.g. `pg`, `mysql2`, `sqlite3`
    pub driver: SqlEngine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStoreConfig {
    pub max_memory_mb: usize,
    pub ttl_cleanup_interval_ms: u64,
    pub default_ttl_secs: Option<u64>,
    pub negative_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json`, `pretty` or `compact`
    pub format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            driver: SqlEngine::Postgres,
        }
    }
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            max_memory_mb: defaults.max_memory_mb,
            ttl_cleanup_interval_ms: defaults.ttl_cleanup_interval_ms,
            default_ttl_secs: defaults.default_ttl_secs,
            negative_cache_ttl_secs: defaults.negative_cache_ttl_secs,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl RelCacheConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let config: RelCacheConfig = serde_yaml::from_str(content)?;
        if config.cache.negative_cache_ttl_secs == 0 {
            anyhow::bail!("cache.negative_cache_ttl_secs must be greater than zero");
        }
        Ok(config)
    }

    /// Convert to CacheConfig
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_memory_mb: self.cache.max_memory_mb,
            ttl_cleanup_interval_ms: self.cache.ttl_cleanup_interval_ms,
            default_ttl_secs: self.cache.default_ttl_secs,
            negative_cache_ttl_secs: self.cache.negative_cache_ttl_secs,
        }
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.engine.driver.capabilities()
    }
}
