// Write-through scheduler tests
// Ordering of durable and cache writes, layer flags, and query invalidation

use async_trait::async_trait;
use relcache::persistence::{Statement, StatementOutcome, StoreTransaction};
use relcache::{
    CacheConfig, CacheMode, CachePrimaryModelManager, CacheStore, ColumnDefinition, Entity, Id, MemoryStore, Model,
    ModelDefinition, PersistencyOptions, PrimaryModelManager, QueryConfigFactory, QueryParams, QueryResult,
    RangeOptions, RelCacheError, Result, SchedulerModelManager, SecondaryEntityManager, SqlEngine, SqlStore, SqlType,
    TableSchema, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Store that fails every statement while `failing` is set
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl SqlStore for FlakyStore {
    fn engine(&self) -> SqlEngine {
        self.inner.engine()
    }

    async fn execute(&self, statement: Statement) -> Result<StatementOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelCacheError::Store("connection reset".to_string()));
        }
        self.inner.execute(statement).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelCacheError::Transaction("connection reset".to_string()));
        }
        self.inner.begin_transaction().await
    }
}

struct Harness {
    scheduler: SchedulerModelManager,
    store: Arc<FlakyStore>,
    memory: MemoryStore,
    cache: CacheStore,
    factory: QueryConfigFactory,
}

fn harness() -> Harness {
    let model = Arc::new(
        Model::new(
            ModelDefinition::new("id", "accounts")
                .column(ColumnDefinition::new("id", "id", SqlType::Integer).auto_increment())
                .column(ColumnDefinition::new("email", "email", SqlType::String))
                .column(ColumnDefinition::new("plan", "plan", SqlType::String)),
        )
        .unwrap(),
    );
    let memory = MemoryStore::new(SqlEngine::Postgres);
    memory.create_table(TableSchema::new("accounts", "id").auto_increment().unique("email"));
    let store = Arc::new(FlakyStore {
        inner: memory.clone(),
        failing: AtomicBool::new(false),
    });
    let sql: Arc<dyn SqlStore> = store.clone();

    let cache = CacheStore::new(CacheConfig::default());
    let secondary = Arc::new(SecondaryEntityManager::for_store(Arc::clone(&model), Arc::clone(&sql)).unwrap());
    let primary: Arc<dyn PrimaryModelManager> = Arc::new(CachePrimaryModelManager::with_cache_defaults(
        Arc::clone(&model),
        cache.clone(),
        Some(Arc::clone(&secondary)),
    ));

    Harness {
        scheduler: SchedulerModelManager::new(Arc::clone(&model), Some(primary), Some(secondary)),
        store,
        memory,
        cache,
        factory: QueryConfigFactory::new(model, sql, "q::"),
    }
}

fn account(email: &str, plan: &str) -> Entity {
    Entity::new().with("email", email).with("plan", plan)
}

#[tokio::test]
async fn test_insert_then_read_from_cache() {
    let h = harness();
    let mut entity = account("a@x", "free");

    h.scheduler.insert(&mut entity, &PersistencyOptions::default()).await.unwrap();
    h.memory.clear_log();

    let loaded = h.scheduler.get(&Id::Integer(1)).await.unwrap().unwrap();
    assert_eq!(loaded.get("email"), Some(&Value::from("a@x")));
    assert!(h.memory.executed_statements().is_empty());
}

#[tokio::test]
async fn test_durable_failure_leaves_cache_untouched() {
    let h = harness();
    let mut first = account("a@x", "free");
    h.scheduler.insert(&mut first, &PersistencyOptions::default()).await.unwrap();

    let mut duplicate = account("a@x", "pro");
    let result = h.scheduler.insert(&mut duplicate, &PersistencyOptions::default()).await;
    assert!(matches!(result, Err(RelCacheError::ConstraintViolation { .. })));
    assert!(duplicate.get("id").is_none());
    assert!(!h.cache.exists("accounts::2").await.unwrap());

    h.store.failing.store(true, Ordering::SeqCst);
    let changed = first.clone().with("plan", "pro");
    let result = h.scheduler.update(&changed, &PersistencyOptions::default()).await;
    assert!(result.is_err());

    h.store.failing.store(false, Ordering::SeqCst);
    let cached = h.scheduler.get(&Id::Integer(1)).await.unwrap().unwrap();
    assert_eq!(cached.get("plan"), Some(&Value::from("free")));
}

#[tokio::test]
async fn test_secondary_only_skips_cache() {
    let h = harness();
    let mut entity = account("a@x", "free");

    h.scheduler.insert(&mut entity, &PersistencyOptions::secondary_only()).await.unwrap();

    assert_eq!(h.memory.row_count("accounts"), 1);
    assert!(!h.cache.exists("accounts::1").await.unwrap());
}

#[tokio::test]
async fn test_primary_only_skips_store() {
    let h = harness();
    let entity = account("w@x", "free").with("id", 50);

    h.scheduler.update(&entity, &PersistencyOptions::primary_only()).await.unwrap();

    assert_eq!(h.memory.row_count("accounts"), 0);
    assert!(h.memory.executed_statements().is_empty());
    let cached = h.scheduler.get(&Id::Integer(50)).await.unwrap();
    assert_eq!(cached, Some(entity));
}

#[tokio::test]
async fn test_legacy_flags() {
    let h = harness();
    let mut entity = account("a@x", "free");
    let options = PersistencyOptions {
        ignore_cache: true,
        ..Default::default()
    };

    h.scheduler.insert(&mut entity, &options).await.unwrap();
    assert!(!h.cache.exists("accounts::1").await.unwrap());

    let options = PersistencyOptions {
        persist: false,
        ..Default::default()
    };
    let changed = entity.clone().with("plan", "pro");
    h.scheduler.update(&changed, &options).await.unwrap();
    assert_eq!(h.memory.rows("accounts")[0].get("plan"), Some(&serde_json::json!("free")));
}

#[tokio::test]
async fn test_if_not_exist_keeps_cached_record() {
    let h = harness();
    let mut entity = account("a@x", "free");
    h.scheduler.insert(&mut entity, &PersistencyOptions::default()).await.unwrap();

    let changed = entity.clone().with("plan", "pro");
    let options = PersistencyOptions::default().with_cache_mode(CacheMode::CacheIfNotExist);
    h.scheduler.update(&changed, &options).await.unwrap();

    let cached = h.scheduler.get(&Id::Integer(1)).await.unwrap().unwrap();
    assert_eq!(cached.get("plan"), Some(&Value::from("free")));
    assert_eq!(h.memory.rows("accounts")[0].get("plan"), Some(&serde_json::json!("pro")));
}

#[tokio::test]
async fn test_delete_writes_negative_placeholder() {
    let h = harness();
    let mut entity = account("a@x", "free");
    h.scheduler.insert(&mut entity, &PersistencyOptions::default()).await.unwrap();

    h.scheduler.delete(&Id::Integer(1), &PersistencyOptions::default()).await.unwrap();
    h.memory.clear_log();

    assert!(h.scheduler.get(&Id::Integer(1)).await.unwrap().is_none());
    assert!(h.memory.executed_statements().is_empty());
    assert!(h.cache.ttl("accounts::1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_query_invalidated_by_update() {
    let h = harness();
    let by_plan = h.factory.by_field("plan").unwrap();
    h.scheduler.register_query(by_plan.clone());

    let mut entities = vec![account("a@x", "free"), account("b@x", "free")];
    h.scheduler.m_insert(&mut entities, &PersistencyOptions::default()).await.unwrap();

    let free = QueryParams::field("free");
    let pro = QueryParams::field("pro");
    let result = h.scheduler.query(&by_plan, Some(&free)).await.unwrap();
    assert_eq!(result, QueryResult::Multiple(vec![Id::Integer(1), Id::Integer(2)]));
    assert!(h.scheduler.query(&by_plan, Some(&pro)).await.unwrap().is_empty());

    let upgraded = entities[0].clone().with("plan", "pro");
    h.scheduler.update(&upgraded, &PersistencyOptions::default()).await.unwrap();

    let free_now = h.scheduler.query(&by_plan, Some(&free)).await.unwrap();
    assert_eq!(free_now, QueryResult::Multiple(vec![Id::Integer(2)]));
    let pro_now = h.scheduler.query(&by_plan, Some(&pro)).await.unwrap();
    assert_eq!(pro_now, QueryResult::Multiple(vec![Id::Integer(1)]));

    let entities = h.scheduler.query_entities(&by_plan, Some(&pro)).await.unwrap();
    assert_eq!(entities, vec![upgraded]);
}

#[tokio::test]
async fn test_m_delete_and_m_get() {
    let h = harness();
    let mut entities = vec![account("a@x", "free"), account("b@x", "free"), account("c@x", "pro")];
    h.scheduler.m_insert(&mut entities, &PersistencyOptions::default()).await.unwrap();

    h.scheduler
        .m_delete(&[Id::Integer(1), Id::Integer(3)], &PersistencyOptions::default())
        .await
        .unwrap();

    assert_eq!(h.memory.row_count("accounts"), 1);
    let remaining = h
        .scheduler
        .m_get(&[Id::Integer(3), Id::Integer(2), Id::Integer(1)])
        .await
        .unwrap();
    assert_eq!(remaining, vec![entities[1].clone()]);
}

#[tokio::test]
async fn test_scheduler_without_cache_layer() {
    let h = harness();
    let secondary = Arc::new(
        SecondaryEntityManager::for_store(Arc::clone(h.scheduler.model()), Arc::new(h.memory.clone())).unwrap(),
    );
    let scheduler = SchedulerModelManager::new(Arc::clone(h.scheduler.model()), None, Some(secondary));

    let mut entity = account("a@x", "free");
    scheduler.insert(&mut entity, &PersistencyOptions::default()).await.unwrap();

    assert_eq!(scheduler.get(&Id::Integer(1)).await.unwrap(), Some(entity));
    let by_email = h.factory.by_unique_field("email").unwrap();
    let found = scheduler.query(&by_email, Some(&QueryParams::field("a@x"))).await.unwrap();
    assert_eq!(found, QueryResult::Single(Some(Id::Integer(1))));
}

#[tokio::test]
async fn test_if_not_exist_replaces_negative_placeholder() {
    let h = harness();
    assert!(h.scheduler.get(&Id::Integer(1)).await.unwrap().is_none());

    let mut entity = account("a@x", "free");
    let options = PersistencyOptions::default().with_cache_mode(CacheMode::CacheIfNotExist);
    h.scheduler.insert(&mut entity, &options).await.unwrap();
    h.memory.clear_log();

    assert_eq!(h.scheduler.get(&Id::Integer(1)).await.unwrap(), Some(entity));
    assert!(h.memory.executed_statements().is_empty());
}

#[tokio::test]
async fn test_failed_batch_insert_caches_nothing() {
    let h = harness();
    let mut first = account("a@x", "free");
    h.scheduler.insert(&mut first, &PersistencyOptions::default()).await.unwrap();

    let mut batch = vec![account("b@x", "free"), account("a@x", "pro")];
    let result = h.scheduler.m_insert(&mut batch, &PersistencyOptions::default()).await;

    assert!(matches!(result, Err(RelCacheError::ConstraintViolation { .. })));
    assert!(batch.iter().all(|e| e.get("id").is_none()));
    assert_eq!(h.memory.row_count("accounts"), 1);
    assert_eq!(h.cache.scan(Some("accounts::"), 10).await.unwrap(), vec!["accounts::1".to_string()]);
}

#[tokio::test]
async fn test_failed_batch_update_keeps_cached_values() {
    let h = harness();
    let mut entities = vec![account("a@x", "free"), account("b@x", "free")];
    h.scheduler.m_insert(&mut entities, &PersistencyOptions::default()).await.unwrap();

    let conflicting = vec![
        entities[0].clone().with("email", "c@x").with("plan", "pro"),
        entities[1].clone().with("email", "c@x").with("plan", "pro"),
    ];
    let result = h.scheduler.m_update(&conflicting, &PersistencyOptions::default()).await;
    assert!(matches!(result, Err(RelCacheError::ConstraintViolation { .. })));

    h.memory.clear_log();
    let cached = h.scheduler.m_get(&[Id::Integer(1), Id::Integer(2)]).await.unwrap();
    assert_eq!(cached, entities);
    assert!(h.memory.executed_statements().is_empty());
}

#[tokio::test]
async fn test_primary_only_insert_skips_store() {
    let h = harness();
    let mut entity = account("n@x", "free").with("id", 7);

    h.scheduler.insert(&mut entity, &PersistencyOptions::primary_only()).await.unwrap();

    assert_eq!(h.memory.row_count("accounts"), 0);
    assert!(h.memory.executed_statements().is_empty());
    assert_eq!(h.scheduler.get(&Id::Integer(7)).await.unwrap(), Some(entity));
}

#[tokio::test]
async fn test_cached_range_matches_direct_query() {
    let h = harness();
    let by_id = h.factory.by_numeric_range("id", RangeOptions::new(2, "minId")).unwrap();
    h.scheduler.register_query(by_id.clone());

    let mut entities = vec![account("a@x", "free"), account("b@x", "free"), account("c@x", "free")];
    h.scheduler.m_insert(&mut entities, &PersistencyOptions::default()).await.unwrap();

    let warmed = h.scheduler.query(&by_id, Some(&QueryParams::range(1))).await.unwrap();
    assert_eq!(warmed, QueryResult::Multiple(vec![Id::Integer(1)]));

    let same_block = QueryParams::range(0);
    let cached = h.scheduler.query(&by_id, Some(&same_block)).await.unwrap();
    assert_eq!(cached, by_id.query(Some(&same_block)).await.unwrap());
}
