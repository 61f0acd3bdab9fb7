//! Cache ("primary") layer of a model.

use super::cache_store::CacheStore;
use super::secondary::SecondaryEntityManager;
use crate::core::error::{RelCacheError, Result};
use crate::core::{CacheMode, Entity, Id, PersistencyOptions, Record};
use crate::model::Model;
use crate::query::{QueryConfig, QueryParams, QueryResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Cache layer consumed by the scheduler
#[async_trait]
pub trait PrimaryModelManager: Send + Sync {
    async fn get(&self, id: &Id) -> Result<Option<Entity>>;

    /// Entities found for `ids`, in input order. Missing ids are skipped.
    async fn m_get(&self, ids: &[Id]) -> Result<Vec<Entity>>;

    /// Write the whole entity, replacing any cached version
    async fn update(&self, entity: &Entity, options: &PersistencyOptions) -> Result<()>;

    async fn m_update(&self, entities: &[Entity], options: &PersistencyOptions) -> Result<()>;

    async fn delete(&self, id: &Id, options: &PersistencyOptions) -> Result<()>;

    async fn m_delete(&self, ids: &[Id], options: &PersistencyOptions) -> Result<()>;

    async fn query(&self, config: &QueryConfig, params: Option<&QueryParams>) -> Result<QueryResult>;

    async fn m_query(&self, config: &QueryConfig, params: &[QueryParams]) -> Result<Vec<QueryResult>>;

    /// Track a query so writes invalidate its cached results
    fn register_query(&self, config: QueryConfig);
}

/// Primary layer built on [`CacheStore`].
///
/// Entities are cached as records under `key_prefix + id`. A cached JSON
/// `null` is a negative placeholder: the id is known to be absent. Query
/// results are cached under their query key, and every such key is listed in
/// the query's reverse hash so it can be dropped in bulk.
pub struct CachePrimaryModelManager {
    model: Arc<Model>,
    cache: CacheStore,
    secondary: Option<Arc<SecondaryEntityManager>>,
    negative_ttl_secs: u64,
    queries: RwLock<Vec<QueryConfig>>,
}

impl CachePrimaryModelManager {
    pub fn new(
        model: Arc<Model>,
        cache: CacheStore,
        secondary: Option<Arc<SecondaryEntityManager>>,
        negative_ttl_secs: u64,
    ) -> Self {
        info!(
            "Primary manager for {} (read-through={}, negative_ttl={}s)",
            model.table_name(),
            secondary.is_some(),
            negative_ttl_secs
        );
        Self {
            model,
            cache,
            secondary,
            negative_ttl_secs,
            queries: RwLock::new(Vec::new()),
        }
    }

    /// Negative TTL taken from the cache configuration
    pub fn with_cache_defaults(
        model: Arc<Model>,
        cache: CacheStore,
        secondary: Option<Arc<SecondaryEntityManager>>,
    ) -> Self {
        let negative_ttl_secs = cache.config().negative_cache_ttl_secs;
        Self::new(model, cache, secondary, negative_ttl_secs)
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn registered_queries(&self) -> Vec<QueryConfig> {
        self.queries.read().clone()
    }

    fn entity_ttl(&self, options: &PersistencyOptions) -> Option<u64> {
        options.ttl.or(self.cache.config().default_ttl_secs)
    }

    async fn cached_record(&self, key: &str) -> Result<Option<Record>> {
        match self.cache.get(key).await? {
            Some(JsonValue::Object(record)) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    async fn write_entity(&self, entity: &Entity, options: &PersistencyOptions) -> Result<()> {
        let id = self.require_id(entity)?;
        let key = self.model.entity_key(&id);
        let previous = self.cached_record(&key).await?;
        let record = self.model.entity_to_record(entity);

        match options.cache_mode {
            CacheMode::CacheAndOverwrite => {
                self.cache
                    .set(&key, JsonValue::Object(record.clone()), self.entity_ttl(options))
                    .await?;
            }
            CacheMode::CacheIfNotExist => {
                self.cache
                    .set_if_vacant(&key, JsonValue::Object(record.clone()), self.entity_ttl(options))
                    .await?;
            }
            CacheMode::NoCache => {
                self.cache.delete(&key).await?;
            }
        }

        self.invalidate_queries(previous.as_ref(), Some(&record)).await
    }

    async fn remove_entity(&self, id: &Id, options: &PersistencyOptions) -> Result<()> {
        let key = self.model.entity_key(id);
        let previous = self.cached_record(&key).await?;

        if options.negative_cache {
            self.cache
                .set(&key, JsonValue::Null, Some(self.negative_ttl_secs))
                .await?;
        } else {
            self.cache.delete(&key).await?;
        }

        self.invalidate_queries(previous.as_ref(), None).await
    }

    /// Drop every cached query result the write may have changed.
    ///
    /// Keys are computed from the previous and new records when the previous
    /// one is known; otherwise every result of the query is dropped.
    async fn invalidate_queries(&self, previous: Option<&Record>, current: Option<&Record>) -> Result<()> {
        let queries = self.registered_queries();
        for query in &queries {
            let reverse = query.reverse_hash_key();
            match previous {
                Some(previous) => {
                    let mut keys: Vec<String> = Vec::with_capacity(2);
                    for record in std::iter::once(previous).chain(current) {
                        if let Some(key) = query.entity_key(record) {
                            if !keys.contains(&key) {
                                keys.push(key);
                            }
                        }
                    }
                    debug!("Invalidating {} keys of query {}", keys.len(), query.alias());
                    self.cache.mdel(&keys).await?;
                    self.cache.remove_members(reverse, &keys).await?;
                }
                None => {
                    let keys = self.cache.members(reverse).await?;
                    debug!("Invalidating all {} keys of query {}", keys.len(), query.alias());
                    self.cache.mdel(&keys).await?;
                    self.cache.delete(reverse).await?;
                }
            }
        }
        Ok(())
    }

    async fn store_query_result(&self, config: &QueryConfig, key: &str, result: &QueryResult) -> Result<()> {
        self.cache
            .set(key, serde_json::to_value(result)?, self.cache.config().default_ttl_secs)
            .await?;
        self.cache
            .add_members(config.reverse_hash_key(), &[key.to_string()])
            .await
    }

    fn ensure_registered(&self, config: &QueryConfig) {
        let known = self
            .queries
            .read()
            .iter()
            .any(|query| query.reverse_hash_key() == config.reverse_hash_key());
        if !known {
            self.register_query(config.clone());
        }
    }

    fn require_id(&self, entity: &Entity) -> Result<Id> {
        entity.id(&self.model).ok_or_else(|| {
            RelCacheError::InvalidValue(format!(
                "{} entity without a value for {}",
                self.model.table_name(),
                self.model.id()
            ))
        })
    }
}

fn decode_query_result(config: &QueryConfig, value: JsonValue) -> Result<QueryResult> {
    if config.is_multiple() {
        Ok(QueryResult::Multiple(serde_json::from_value(value)?))
    } else {
        Ok(QueryResult::Single(serde_json::from_value(value)?))
    }
}

#[async_trait]
impl PrimaryModelManager for CachePrimaryModelManager {
    async fn get(&self, id: &Id) -> Result<Option<Entity>> {
        let key = self.model.entity_key(id);
        match self.cache.get(&key).await? {
            Some(JsonValue::Object(record)) => return self.model.record_to_entity(&record).map(Some),
            Some(JsonValue::Null) => {
                debug!("Negative cache hit {}", key);
                return Ok(None);
            }
            Some(other) => {
                return Err(RelCacheError::Cache(format!(
                    "unexpected value at {key}: {other}"
                )));
            }
            None => {}
        }

        let Some(secondary) = &self.secondary else {
            return Ok(None);
        };
        let found = secondary.get_by_id(id).await?;
        match &found {
            Some(entity) => {
                let record = self.model.entity_to_record(entity);
                self.cache
                    .set_if_absent(&key, JsonValue::Object(record), self.cache.config().default_ttl_secs)
                    .await?;
            }
            None => {
                self.cache
                    .set_if_absent(&key, JsonValue::Null, Some(self.negative_ttl_secs))
                    .await?;
            }
        }
        Ok(found)
    }

    async fn m_get(&self, ids: &[Id]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.model.entity_key(id)).collect();
        let cached = self.cache.mget(&keys).await?;

        let mut found: HashMap<Id, Entity> = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        for (id, value) in ids.iter().zip(cached) {
            match value {
                Some(JsonValue::Object(record)) => {
                    found.insert(id.clone(), self.model.record_to_entity(&record)?);
                }
                Some(_) => {}
                None => {
                    if !misses.contains(id) {
                        misses.push(id.clone());
                    }
                }
            }
        }

        if let (Some(secondary), false) = (&self.secondary, misses.is_empty()) {
            debug!("Read-through of {} ids from {}", misses.len(), self.model.table_name());
            for entity in secondary.get_by_ids(&misses).await? {
                if let Some(id) = entity.id(&self.model) {
                    let record = self.model.entity_to_record(&entity);
                    self.cache
                        .set_if_absent(
                            &self.model.entity_key(&id),
                            JsonValue::Object(record),
                            self.cache.config().default_ttl_secs,
                        )
                        .await?;
                    found.insert(id, entity);
                }
            }
            for id in misses.iter().filter(|id| !found.contains_key(*id)) {
                self.cache
                    .set_if_absent(&self.model.entity_key(id), JsonValue::Null, Some(self.negative_ttl_secs))
                    .await?;
            }
        }

        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }

    async fn update(&self, entity: &Entity, options: &PersistencyOptions) -> Result<()> {
        self.write_entity(entity, options).await
    }

    async fn m_update(&self, entities: &[Entity], options: &PersistencyOptions) -> Result<()> {
        for entity in entities {
            self.write_entity(entity, options).await?;
        }
        Ok(())
    }

    async fn delete(&self, id: &Id, options: &PersistencyOptions) -> Result<()> {
        self.remove_entity(id, options).await
    }

    async fn m_delete(&self, ids: &[Id], options: &PersistencyOptions) -> Result<()> {
        for id in ids {
            self.remove_entity(id, options).await?;
        }
        Ok(())
    }

    async fn query(&self, config: &QueryConfig, params: Option<&QueryParams>) -> Result<QueryResult> {
        let params = config.resolve_params(params)?;
        self.ensure_registered(config);
        let key = config.query_key(&params)?;

        if let Some(value) = self.cache.get(&key).await? {
            debug!("Query cache hit {}", key);
            return decode_query_result(config, value);
        }

        let result = config.query(Some(&params)).await?;
        self.store_query_result(config, &key, &result).await?;
        Ok(result)
    }

    async fn m_query(&self, config: &QueryConfig, params: &[QueryParams]) -> Result<Vec<QueryResult>> {
        if params.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_registered(config);
        let keys = params
            .iter()
            .map(|params| config.query_key(params))
            .collect::<Result<Vec<_>>>()?;
        let cached = self.cache.mget(&keys).await?;

        let mut results: Vec<Option<QueryResult>> = Vec::with_capacity(params.len());
        let mut miss_indices = Vec::new();
        for (index, value) in cached.into_iter().enumerate() {
            match value {
                Some(value) => results.push(Some(decode_query_result(config, value)?)),
                None => {
                    results.push(None);
                    miss_indices.push(index);
                }
            }
        }

        if !miss_indices.is_empty() {
            let miss_params: Vec<QueryParams> = miss_indices.iter().map(|&i| params[i].clone()).collect();
            let fetched = if config.supports_batch() {
                config.m_query(&miss_params).await?
            } else {
                let mut fetched = Vec::with_capacity(miss_params.len());
                for params in &miss_params {
                    fetched.push(config.query(Some(params)).await?);
                }
                fetched
            };
            for (index, result) in miss_indices.into_iter().zip(fetched) {
                self.store_query_result(config, &keys[index], &result).await?;
                results[index] = Some(result);
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.ok_or_else(|| RelCacheError::Cache("query result missing after fetch".to_string()))
            })
            .collect()
    }

    fn register_query(&self, config: QueryConfig) {
        debug!(
            "Registering query {} on {}",
            config.alias(),
            self.model.table_name()
        );
        self.queries.write().push(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CacheConfig;
    use crate::model::{ColumnDefinition, ModelDefinition, SqlType};
    use crate::persistence::memory_store::{MemoryStore, TableSchema};
    use crate::persistence::store::SqlStore;
    use crate::persistence::SqlEngine;
    use crate::query::QueryConfigFactory;

    struct Fixture {
        primary: CachePrimaryModelManager,
        secondary: Arc<SecondaryEntityManager>,
        store: MemoryStore,
        factory: QueryConfigFactory,
    }

    fn fixture() -> Fixture {
        let model = Arc::new(
            Model::new(
                ModelDefinition::new("id", "users")
                    .column(ColumnDefinition::new("id", "id", SqlType::Integer).auto_increment())
                    .column(ColumnDefinition::new("name", "name", SqlType::String)),
            )
            .unwrap(),
        );
        let store = MemoryStore::new(SqlEngine::Postgres);
        store.create_table(TableSchema::new("users", "id").auto_increment());
        let sql: Arc<dyn SqlStore> = Arc::new(store.clone());
        let secondary = Arc::new(SecondaryEntityManager::for_store(Arc::clone(&model), Arc::clone(&sql)).unwrap());
        let primary = CachePrimaryModelManager::with_cache_defaults(
            Arc::clone(&model),
            CacheStore::new(CacheConfig::default()),
            Some(Arc::clone(&secondary)),
        );
        Fixture {
            primary,
            secondary,
            store,
            factory: QueryConfigFactory::for_model(model, sql),
        }
    }

    #[tokio::test]
    async fn test_read_through_and_negative_cache() {
        let f = fixture();
        let mut entity = Entity::new().with("name", "a");
        f.secondary.insert(&mut entity).await.unwrap();

        let loaded = f.primary.get(&Id::Integer(1)).await.unwrap();
        assert_eq!(loaded.as_ref(), Some(&entity));
        assert!(f.primary.cache().exists("users::1").await.unwrap());

        assert!(f.primary.get(&Id::Integer(2)).await.unwrap().is_none());
        assert_eq!(f.primary.cache().get("users::2").await.unwrap(), Some(JsonValue::Null));
        assert!(f.primary.cache().ttl("users::2").await.unwrap().is_some());

        f.store.clear_log();
        assert!(f.primary.get(&Id::Integer(2)).await.unwrap().is_none());
        assert!(f.store.executed_statements().is_empty());
    }

    #[tokio::test]
    async fn test_m_get_keeps_input_order() {
        let f = fixture();
        let mut entities = vec![Entity::new().with("name", "a"), Entity::new().with("name", "b")];
        f.secondary.m_insert(&mut entities).await.unwrap();
        f.primary.update(&entities[1], &PersistencyOptions::default()).await.unwrap();

        let loaded = f
            .primary
            .m_get(&[Id::Integer(2), Id::Integer(7), Id::Integer(1)])
            .await
            .unwrap();
        assert_eq!(loaded, vec![entities[1].clone(), entities[0].clone()]);
    }

    #[tokio::test]
    async fn test_cache_modes() {
        let f = fixture();
        let first = Entity::new().with("id", 1).with("name", "a");
        let second = Entity::new().with("id", 1).with("name", "b");

        f.primary.update(&first, &PersistencyOptions::default()).await.unwrap();
        let keep = PersistencyOptions::default().with_cache_mode(CacheMode::CacheIfNotExist);
        f.primary.update(&second, &keep).await.unwrap();
        assert_eq!(f.primary.get(&Id::Integer(1)).await.unwrap(), Some(first));

        let no_cache = PersistencyOptions::default().with_cache_mode(CacheMode::NoCache);
        f.primary.update(&second, &no_cache).await.unwrap();
        assert!(!f.primary.cache().exists("users::1").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_results_are_cached_and_invalidated() {
        let f = fixture();
        let by_name = f.factory.by_field("name").unwrap();
        f.primary.register_query(by_name.clone());

        let mut alice = Entity::new().with("name", "alice");
        f.secondary.insert(&mut alice).await.unwrap();
        f.primary.update(&alice, &PersistencyOptions::default()).await.unwrap();

        let params = QueryParams::field("alice");
        let result = f.primary.query(&by_name, Some(&params)).await.unwrap();
        assert_eq!(result, QueryResult::Multiple(vec![Id::Integer(1)]));
        assert!(f.primary.cache().exists("users::f_name/alice").await.unwrap());
        assert_eq!(
            f.primary.cache().members("users::f_name//reverse").await.unwrap(),
            vec!["users::f_name/alice".to_string()]
        );

        alice.set("name", "bob");
        f.secondary.update(&alice).await.unwrap();
        f.primary.update(&alice, &PersistencyOptions::default()).await.unwrap();
        assert!(!f.primary.cache().exists("users::f_name/alice").await.unwrap());

        let result = f.primary.query(&by_name, Some(&params)).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_delete_writes_bounded_placeholder() {
        let f = fixture();
        let entity = Entity::new().with("id", 3).with("name", "c");
        f.primary.update(&entity, &PersistencyOptions::default()).await.unwrap();

        f.primary.delete(&Id::Integer(3), &PersistencyOptions::default()).await.unwrap();
        assert_eq!(f.primary.cache().get("users::3").await.unwrap(), Some(JsonValue::Null));
        assert!(f.primary.cache().ttl("users::3").await.unwrap().is_some());

        let options = PersistencyOptions::default().with_negative_cache(false);
        f.primary.delete(&Id::Integer(3), &options).await.unwrap();
        assert!(!f.primary.cache().exists("users::3").await.unwrap());
    }

    #[tokio::test]
    async fn test_m_query_mixes_cached_and_fetched() {
        let f = fixture();
        let mut entities = vec![
            Entity::new().with("name", "a"),
            Entity::new().with("name", "a"),
            Entity::new().with("name", "b"),
        ];
        f.secondary.m_insert(&mut entities).await.unwrap();
        let by_name = f.factory.by_field("name").unwrap();

        f.primary.query(&by_name, Some(&QueryParams::field("b"))).await.unwrap();
        f.store.clear_log();

        let results = f
            .primary
            .m_query(
                &by_name,
                &[QueryParams::field("a"), QueryParams::field("b"), QueryParams::field("a")],
            )
            .await
            .unwrap();
        assert_eq!(results[0], QueryResult::Multiple(vec![Id::Integer(1), Id::Integer(2)]));
        assert_eq!(results[1], QueryResult::Multiple(vec![Id::Integer(3)]));
        assert_eq!(results[2], results[0]);
        assert_eq!(f.store.executed_statements().len(), 1);
    }
}
