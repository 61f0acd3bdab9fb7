use crate::core::error::{RelCacheError, Result};
use crate::core::types::{CacheConfig, CacheStats, StoredValue};
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// In-process key-value cache backing the primary layer.
///
/// Keys live in a radix trie so every key of one model or query shares its
/// prefix path and can be scanned cheaply.
#[derive(Clone)]
pub struct CacheStore {
    data: Arc<RwLock<Trie<String, StoredValue>>>,
    stats: Arc<RwLock<CacheStats>>,
    config: CacheConfig,
}

impl CacheStore {
    /// Create a new cache store with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        info!(
            "Initializing cache store with max_memory={}MB, negative_ttl={}s",
            config.max_memory_mb, config.negative_cache_ttl_secs
        );

        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Start background TTL cleanup task
    pub fn start_ttl_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.config.ttl_cleanup_interval_ms;
        info!("Starting TTL cleanup task (interval={}ms)", interval_ms);

        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

            loop {
                interval.tick().await;
                store.cleanup_expired();
            }
        })
    }

    /// Set a key-value pair, replacing any previous value
    pub async fn set(&self, key: &str, value: JsonValue, ttl_secs: Option<u64>) -> Result<()> {
        debug!("SET key={}, ttl={:?}", key, ttl_secs);
        let stored = StoredValue::new(value, ttl_secs);
        let mut data = self.data.write();
        self.insert_locked(&mut data, key, stored)
    }

    /// Set a key only when it is absent or expired. Returns true if written.
    pub async fn set_if_absent(&self, key: &str, value: JsonValue, ttl_secs: Option<u64>) -> Result<bool> {
        let mut data = self.data.write();
        if data.get(key).is_some_and(|current| !current.is_expired()) {
            debug!("SETNX key={} skipped, key exists", key);
            return Ok(false);
        }
        debug!("SETNX key={}, ttl={:?}", key, ttl_secs);
        self.insert_locked(&mut data, key, StoredValue::new(value, ttl_secs))?;
        Ok(true)
    }

    /// Like `set_if_absent`, but a `null` placeholder counts as vacant
    pub async fn set_if_vacant(&self, key: &str, value: JsonValue, ttl_secs: Option<u64>) -> Result<bool> {
        let mut data = self.data.write();
        if data
            .get(key)
            .is_some_and(|current| !current.is_expired() && !current.data.is_null())
        {
            debug!("SETNX key={} skipped, key holds a value", key);
            return Ok(false);
        }
        debug!("SETNX key={}, ttl={:?}", key, ttl_secs);
        self.insert_locked(&mut data, key, StoredValue::new(value, ttl_secs))?;
        Ok(true)
    }

    /// Get a value by key
    pub async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        debug!("GET key={}", key);

        let mut data = self.data.write();
        let mut stats = self.stats.write();
        stats.gets += 1;

        let live = data
            .get(key)
            .map(|value| (!value.is_expired()).then(|| value.data.clone()));
        match live {
            Some(Some(found)) => {
                stats.hits += 1;
                Ok(Some(found))
            }
            Some(None) => {
                debug!("Key expired: {}", key);
                if let Some(removed) = data.remove(key) {
                    Self::forget(&mut stats, key, &removed);
                }
                stats.misses += 1;
                Ok(None)
            }
            None => {
                stats.misses += 1;
                Ok(None)
            }
        }
    }

    /// Delete a key
    pub async fn delete(&self, key: &str) -> Result<bool> {
        debug!("DELETE key={}", key);

        let mut data = self.data.write();
        match data.remove(key) {
            Some(removed) => {
                let mut stats = self.stats.write();
                stats.dels += 1;
                Self::forget(&mut stats, key, &removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Check if a key exists
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let data = self.data.read();
        Ok(data.get(key).is_some_and(|value| !value.is_expired()))
    }

    /// Get statistics
    pub async fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Get remaining TTL for a key, `None` when the key never expires
    pub async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let data = self.data.read();
        match data.get(key) {
            Some(value) if value.is_expired() => Ok(Some(0)),
            Some(value) => Ok(value.remaining_ttl_secs()),
            None => Err(RelCacheError::Cache(format!("key not found: {key}"))),
        }
    }

    /// Set multiple key-value pairs sharing one TTL
    pub async fn mset(&self, pairs: Vec<(String, JsonValue)>, ttl_secs: Option<u64>) -> Result<()> {
        debug!("MSET count={}", pairs.len());

        for (key, value) in pairs {
            self.set(&key, value, ttl_secs).await?;
        }

        Ok(())
    }

    /// Get multiple values, in key order
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<JsonValue>>> {
        debug!("MGET count={}", keys.len());

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }

        Ok(results)
    }

    /// Delete multiple keys
    pub async fn mdel(&self, keys: &[String]) -> Result<usize> {
        debug!("MDEL count={}", keys.len());

        let mut count = 0;
        for key in keys {
            if self.delete(key).await? {
                count += 1;
            }
        }

        Ok(count)
    }

    /// Scan keys with optional prefix
    pub async fn scan(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<String>> {
        debug!("SCAN prefix={:?}, limit={}", prefix, limit);

        let data = self.data.read();
        let keys: Vec<String> = if let Some(prefix) = prefix {
            data.get_raw_descendant(prefix)
                .map(|subtrie| {
                    subtrie
                        .iter()
                        .filter(|(key, value)| key.starts_with(prefix) && !value.is_expired())
                        .map(|(key, _)| key.clone())
                        .take(limit)
                        .collect()
                })
                .unwrap_or_default()
        } else {
            data.iter()
                .filter(|(_, value)| !value.is_expired())
                .map(|(key, _)| key.clone())
                .take(limit)
                .collect()
        };

        Ok(keys)
    }

    /// Add members to the string set stored at `key`
    pub async fn add_members(&self, key: &str, members: &[String]) -> Result<()> {
        debug!("SADD key={}, count={}", key, members.len());
        let mut data = self.data.write();
        let mut current = Self::members_locked(&data, key)?;
        for member in members {
            if !current.contains(member) {
                current.push(member.clone());
            }
        }
        self.insert_locked(&mut data, key, StoredValue::new(JsonValue::from(current), None))
    }

    /// Members of the string set stored at `key`
    pub async fn members(&self, key: &str) -> Result<Vec<String>> {
        let data = self.data.read();
        Self::members_locked(&data, key)
    }

    /// Remove members from the string set at `key`, dropping the key once empty
    pub async fn remove_members(&self, key: &str, members: &[String]) -> Result<usize> {
        debug!("SREM key={}, count={}", key, members.len());
        let mut data = self.data.write();
        let mut current = Self::members_locked(&data, key)?;
        let before = current.len();
        current.retain(|member| !members.contains(member));
        let removed = before - current.len();

        if current.is_empty() {
            if let Some(old) = data.remove(key) {
                Self::forget(&mut self.stats.write(), key, &old);
            }
        } else if removed > 0 {
            self.insert_locked(&mut data, key, StoredValue::new(JsonValue::from(current), None))?;
        }
        Ok(removed)
    }

    /// Clean up expired keys
    fn cleanup_expired(&self) {
        let mut data = self.data.write();
        let mut stats = self.stats.write();

        let expired_keys: Vec<String> = data
            .iter()
            .filter(|(_, v)| v.is_expired())
            .map(|(k, _)| k.clone())
            .collect();

        if !expired_keys.is_empty() {
            debug!("Cleaning up {} expired keys", expired_keys.len());
            for key in expired_keys {
                if let Some(removed) = data.remove(&key) {
                    Self::forget(&mut stats, &key, &removed);
                }
            }
        }
    }

    fn insert_locked(&self, data: &mut Trie<String, StoredValue>, key: &str, stored: StoredValue) -> Result<()> {
        let entry_size = Self::estimate_entry_size(key, &stored);
        let previous_size = data
            .get(key)
            .map_or(0, |previous| Self::estimate_entry_size(key, previous));

        let mut stats = self.stats.write();
        let max_bytes = self.config.max_memory_mb * 1024 * 1024;
        let projected = stats.total_memory_bytes.saturating_sub(previous_size) + entry_size;
        if projected > max_bytes {
            warn!(
                "Memory limit exceeded: {}/{}",
                stats.total_memory_bytes, max_bytes
            );
            return Err(RelCacheError::MemoryLimitExceeded);
        }

        let is_new = data.insert(key.to_string(), stored).is_none();
        stats.sets += 1;
        stats.total_memory_bytes = projected;
        if is_new {
            stats.total_keys += 1;
        }
        Ok(())
    }

    fn members_locked(data: &Trie<String, StoredValue>, key: &str) -> Result<Vec<String>> {
        match data.get(key) {
            Some(value) if !value.is_expired() => Ok(serde_json::from_value(value.data.clone())?),
            _ => Ok(Vec::new()),
        }
    }

    fn forget(stats: &mut CacheStats, key: &str, removed: &StoredValue) {
        stats.total_keys = stats.total_keys.saturating_sub(1);
        stats.total_memory_bytes = stats
            .total_memory_bytes
            .saturating_sub(Self::estimate_entry_size(key, removed));
    }

    /// Estimate memory size of an entry
    fn estimate_entry_size(key: &str, value: &StoredValue) -> usize {
        key.len() + value.estimated_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get() {
        let store = CacheStore::new(CacheConfig::default());

        store.set("key1", json!({"id": 1}), None).await.unwrap();

        let result = store.get("key1").await.unwrap();
        assert_eq!(result, Some(json!({"id": 1})));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = CacheStore::new(CacheConfig::default());

        let result = store.get("nonexistent").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = CacheStore::new(CacheConfig::default());

        store.set("key1", json!("value1"), None).await.unwrap();

        assert!(store.delete("key1").await.unwrap());
        assert!(!store.delete("key1").await.unwrap());
        assert_eq!(store.get("key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let store = CacheStore::new(CacheConfig::default());

        store.set("key1", json!("value1"), Some(1)).await.unwrap();
        assert!(store.get("key1").await.unwrap().is_some());
        assert!(store.ttl("key1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(store.get("key1").await.unwrap(), None);
        assert!(!store.exists("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = CacheStore::new(CacheConfig::default());

        assert!(store.set_if_absent("key1", json!(1), None).await.unwrap());
        assert!(!store.set_if_absent("key1", json!(2), None).await.unwrap());
        assert_eq!(store.get("key1").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_set_if_vacant_replaces_placeholder() {
        let store = CacheStore::new(CacheConfig::default());

        store.set("key1", JsonValue::Null, Some(60)).await.unwrap();
        assert!(store.set_if_vacant("key1", json!(1), None).await.unwrap());
        assert!(!store.set_if_vacant("key1", json!(2), None).await.unwrap());
        assert_eq!(store.get("key1").await.unwrap(), Some(json!(1)));
        assert_eq!(store.ttl("key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mset_mget_mdel() {
        let store = CacheStore::new(CacheConfig::default());

        store
            .mset(
                vec![
                    ("key1".to_string(), json!(1)),
                    ("key2".to_string(), json!(2)),
                ],
                None,
            )
            .await
            .unwrap();

        let keys = vec!["key1".to_string(), "missing".to_string(), "key2".to_string()];
        let results = store.mget(&keys).await.unwrap();
        assert_eq!(results, vec![Some(json!(1)), None, Some(json!(2))]);

        assert_eq!(store.mdel(&keys).await.unwrap(), 2);
        assert_eq!(store.stats().await.total_keys, 0);
    }

    #[tokio::test]
    async fn test_scan() {
        let store = CacheStore::new(CacheConfig::default());

        store.set("users::1", json!({}), None).await.unwrap();
        store.set("users::2", json!({}), None).await.unwrap();
        store.set("posts::1", json!({}), None).await.unwrap();

        let keys = store.scan(Some("users::"), 10).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"users::1".to_string()));
        assert_eq!(store.scan(None, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_members() {
        let store = CacheStore::new(CacheConfig::default());
        let members = vec!["a".to_string(), "b".to_string()];

        store.add_members("set", &members).await.unwrap();
        store.add_members("set", &["a".to_string()]).await.unwrap();
        assert_eq!(store.members("set").await.unwrap(), members);

        assert_eq!(store.remove_members("set", &members).await.unwrap(), 2);
        assert!(!store.exists("set").await.unwrap());
        assert!(store.members("set").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let store = CacheStore::new(CacheConfig {
            max_memory_mb: 0,
            ..CacheConfig::default()
        });

        let err = store.set("key1", json!("x"), None).await.unwrap_err();
        assert!(matches!(err, RelCacheError::MemoryLimitExceeded));
    }

    #[tokio::test]
    async fn test_stats() {
        let store = CacheStore::new(CacheConfig::default());

        store.set("key1", json!(1), None).await.unwrap();
        store.set("key1", json!(2), None).await.unwrap();
        store.get("key1").await.unwrap();
        store.get("key2").await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.sets, 2);
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_keys, 1);
        assert!(stats.total_memory_bytes > 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_removes_expired() {
        let store = CacheStore::new(CacheConfig {
            ttl_cleanup_interval_ms: 20,
            ..CacheConfig::default()
        });
        store.set("key1", json!(1), Some(1)).await.unwrap();
        let handle = store.start_ttl_cleanup();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(store.stats().await.total_keys, 0);
        handle.abort();
    }
}
