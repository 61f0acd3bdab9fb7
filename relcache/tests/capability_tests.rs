// Engine capability tests
// Generated-key reconciliation for class A and class B engines

use relcache::persistence::Statement;
use relcache::{
    ColumnDefinition, EngineCapabilities, Entity, Id, MemoryStore, Model, ModelDefinition, RelCacheError,
    SecondaryEntityManager, SqlEngine, SqlStore, SqlType, TableSchema, Value,
};
use std::sync::Arc;

fn model() -> Arc<Model> {
    Arc::new(
        Model::new(
            ModelDefinition::new("id", "items")
                .column(ColumnDefinition::new("id", "id", SqlType::Integer).auto_increment())
                .column(ColumnDefinition::new("sku", "sku", SqlType::String)),
        )
        .unwrap(),
    )
}

fn manager(engine: SqlEngine) -> (SecondaryEntityManager, MemoryStore) {
    let store = MemoryStore::new(engine);
    store.create_table(TableSchema::new("items", "id").auto_increment().unique("sku"));
    let manager = SecondaryEntityManager::for_store(model(), Arc::new(store.clone())).unwrap();
    (manager, store)
}

fn items(skus: &[&str]) -> Vec<Entity> {
    skus.iter().map(|sku| Entity::new().with("sku", *sku)).collect()
}

fn inserts(store: &MemoryStore) -> usize {
    store
        .executed_statements()
        .iter()
        .filter(|statement| matches!(statement, Statement::Insert { .. }))
        .count()
}

#[tokio::test]
async fn test_class_a_single_statement() {
    let (manager, store) = manager(SqlEngine::Postgres);
    let mut entities = items(&["a", "b", "c"]);

    manager.m_insert(&mut entities).await.unwrap();

    assert_eq!(inserts(&store), 1);
    assert_eq!(store.stats().transactions_committed, 0);
    let ids: Vec<_> = entities.iter().map(|e| e.get("id").cloned()).collect();
    assert_eq!(
        ids,
        vec![Some(Value::Integer(1)), Some(Value::Integer(2)), Some(Value::Integer(3))]
    );
}

#[tokio::test]
async fn test_class_b_one_insert_per_entity() {
    for engine in [SqlEngine::MySql, SqlEngine::Sqlite] {
        let (manager, store) = manager(engine);
        let mut entities = items(&["a", "b", "c"]);

        manager.m_insert(&mut entities).await.unwrap();

        assert_eq!(inserts(&store), 3, "engine {engine}");
        assert_eq!(store.stats().transactions_committed, 1);
        let ids: Vec<_> = entities.iter().filter_map(|e| e.id(manager.model())).collect();
        assert_eq!(ids, vec![Id::Integer(1), Id::Integer(2), Id::Integer(3)]);
    }
}

#[tokio::test]
async fn test_class_b_failure_rolls_back_and_assigns_nothing() {
    let (manager, store) = manager(SqlEngine::MySql);
    let mut existing = items(&["taken"]);
    manager.m_insert(&mut existing).await.unwrap();

    let mut entities = items(&["fresh", "taken"]);
    let err = manager.m_insert(&mut entities).await.unwrap_err();

    assert!(matches!(err, RelCacheError::ConstraintViolation { .. }));
    assert!(entities.iter().all(|e| e.get("id").is_none()));
    assert_eq!(store.row_count("items"), 1);
    assert_eq!(store.stats().transactions_rolled_back, 1);
}

#[tokio::test]
async fn test_class_a_failure_is_atomic() {
    let (manager, store) = manager(SqlEngine::Postgres);
    let mut entities = items(&["dup", "dup"]);

    assert!(manager.m_insert(&mut entities).await.is_err());
    assert!(entities.iter().all(|e| e.get("id").is_none()));
    assert_eq!(store.row_count("items"), 0);
}

#[tokio::test]
async fn test_sequential_transaction_statements() {
    let (manager, store) = manager(SqlEngine::MsSql);
    assert!(!manager.capabilities().concurrent_transaction_statements);

    let mut entities = items(&["a", "b"]);
    manager.m_insert(&mut entities).await.unwrap();

    let renamed: Vec<Entity> = entities
        .iter()
        .zip(["x", "y"])
        .map(|(entity, sku)| entity.clone().with("sku", sku))
        .collect();
    assert_eq!(manager.m_update(&renamed).await.unwrap(), 2);

    let conflicting = vec![renamed[0].clone().with("sku", "z"), renamed[1].clone().with("sku", "z")];
    assert!(manager.m_update(&conflicting).await.is_err());
    let skus: Vec<_> = store.rows("items").iter().map(|row| row["sku"].clone()).collect();
    assert_eq!(skus, vec![serde_json::json!("x"), serde_json::json!("y")]);
}

#[tokio::test]
async fn test_explicit_capabilities_override_store() {
    let store = MemoryStore::new(SqlEngine::Postgres);
    store.create_table(TableSchema::new("items", "id").auto_increment());
    let manager =
        SecondaryEntityManager::new(model(), Arc::new(store.clone()), EngineCapabilities::CLASS_B).unwrap();

    let mut entities = items(&["a", "b"]);
    manager.m_insert(&mut entities).await.unwrap();

    assert_eq!(inserts(&store), 2);
    assert_eq!(store.capabilities(), EngineCapabilities::CLASS_A);
}

#[tokio::test]
async fn test_empty_batches_skip_store() {
    let (manager, store) = manager(SqlEngine::MySql);

    manager.m_insert(&mut []).await.unwrap();
    assert_eq!(manager.m_update(&[]).await.unwrap(), 0);
    assert_eq!(manager.m_delete(&[]).await.unwrap(), 0);
    assert!(manager.get_by_ids(&[]).await.unwrap().is_empty());

    assert!(store.executed_statements().is_empty());
}

#[tokio::test]
async fn test_ordered_reads() {
    let (manager, _) = manager(SqlEngine::Postgres);
    let mut entities = items(&["a", "b", "c"]);
    manager.m_insert(&mut entities).await.unwrap();

    let ordered = manager
        .get_by_ids_ordered_asc(&[Id::Integer(3), Id::Integer(1)])
        .await
        .unwrap();
    let ids: Vec<_> = ordered.iter().filter_map(|e| e.id(manager.model())).collect();
    assert_eq!(ids, vec![Id::Integer(1), Id::Integer(3)]);
    assert!(manager.get_by_id(&Id::Integer(9)).await.unwrap().is_none());
}
