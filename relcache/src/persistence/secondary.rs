use super::engine::EngineCapabilities;
use super::store::{Order, Predicate, SqlStore, Statement, StatementOutcome};
use crate::core::error::{RelCacheError, Result};
use crate::core::{Entity, Id, Value};
use crate::model::Model;
use futures_util::future::join_all;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

/// CRUD against the durable store for one model.
///
/// Generated keys of batched inserts are reconciled according to the engine
/// capabilities fixed at construction:
/// class A engines return every key from one multi-row insert, class B
/// engines need one single-row insert per entity inside a transaction.
pub struct SecondaryEntityManager {
    model: Arc<Model>,
    store: Arc<dyn SqlStore>,
    capabilities: EngineCapabilities,
    columns_to_select: Vec<String>,
}

impl SecondaryEntityManager {
    pub fn new(model: Arc<Model>, store: Arc<dyn SqlStore>, capabilities: EngineCapabilities) -> Result<Self> {
        if model.column_by_alias(model.id()).is_none() {
            return Err(RelCacheError::MissingIdColumn {
                table: model.table_name().to_string(),
                id: model.id().to_string(),
            });
        }

        debug!(
            "Secondary manager for {} (multi_row_returning={}, concurrent_transaction_statements={})",
            model.table_name(),
            capabilities.multi_row_returning,
            capabilities.concurrent_transaction_statements
        );

        Ok(Self {
            columns_to_select: model.sql_column_names(),
            model,
            store,
            capabilities,
        })
    }

    /// Manager using the capabilities the store declares for its engine
    pub fn for_store(model: Arc<Model>, store: Arc<dyn SqlStore>) -> Result<Self> {
        let capabilities = store.capabilities();
        Self::new(model, store, capabilities)
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    pub async fn get_by_id(&self, id: &Id) -> Result<Option<Entity>> {
        debug!("Get {} id={}", self.model.table_name(), id);
        let statement = self
            .select()
            .filter(Predicate::eq(self.id_sql_name(), id.to_json()))
            .limit(1);
        let rows = self.store.execute(statement).await?.into_rows()?;
        rows.first()
            .map(|row| self.model.row_to_entity(row))
            .transpose()
    }

    /// Entities with the given ids, in store order. Missing ids are skipped.
    pub async fn get_by_ids(&self, ids: &[Id]) -> Result<Vec<Entity>> {
        self.get_many(ids, false).await
    }

    /// Entities with the given ids, ordered by id ascending
    pub async fn get_by_ids_ordered_asc(&self, ids: &[Id]) -> Result<Vec<Entity>> {
        self.get_many(ids, true).await
    }

    /// Insert one entity, writing a generated key back onto it
    pub async fn insert(&self, entity: &mut Entity) -> Result<()> {
        debug!("Insert into {}", self.model.table_name());
        let row = self.model.entity_to_row(entity);
        match self.model.auto_generated_column() {
            None => {
                self.store
                    .execute(Statement::insert(self.model.table_name(), vec![row], None))
                    .await?;
            }
            Some(column) => {
                let statement = Statement::insert(
                    self.model.table_name(),
                    vec![row],
                    Some(column.sql_name().to_string()),
                );
                let generated = self.store.execute(statement).await?.into_generated();
                let key = generated.first().ok_or_else(|| {
                    RelCacheError::Store(format!(
                        "insert into {} returned no generated key",
                        self.model.table_name()
                    ))
                })?;
                entity.set(column.entity_alias(), generated_value(key)?);
            }
        }
        Ok(())
    }

    /// Insert many entities. Generated keys are assigned in input order once
    /// the whole batch succeeded; on failure no entity is modified.
    pub async fn m_insert(&self, entities: &mut [Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        debug!(
            "Batch insert of {} entities into {}",
            entities.len(),
            self.model.table_name()
        );

        let rows = self.model.m_entity_to_row(entities);
        let Some(column) = self.model.auto_generated_column() else {
            self.store
                .execute(Statement::insert(self.model.table_name(), rows, None))
                .await?;
            return Ok(());
        };
        let returning = column.sql_name().to_string();

        let count = entities.len();
        let values = if self.capabilities.multi_row_returning {
            let statement = Statement::insert(self.model.table_name(), rows, Some(returning));
            let keys = self.store.execute(statement).await?.into_generated();
            self.generated_values(&keys, count)?
        } else {
            let statements = rows
                .into_iter()
                .map(|row| Statement::insert(self.model.table_name(), vec![row], Some(returning.clone())))
                .collect();
            // Keys are checked before the commit so a missing key rolls the batch back
            self.run_in_transaction(statements, |outcomes| {
                let keys: Vec<JsonValue> = outcomes
                    .into_iter()
                    .map(|outcome| outcome.into_generated().into_iter().next().unwrap_or(JsonValue::Null))
                    .collect();
                self.generated_values(&keys, count)
            })
            .await?
        };

        for (entity, value) in entities.iter_mut().zip(values) {
            entity.set(column.entity_alias(), value);
        }
        Ok(())
    }

    fn generated_values(&self, keys: &[JsonValue], rows: usize) -> Result<Vec<Value>> {
        if keys.len() != rows {
            return Err(RelCacheError::Store(format!(
                "insert into {} returned {} generated keys for {} rows",
                self.model.table_name(),
                keys.len(),
                rows
            )));
        }
        keys.iter().map(generated_value).collect()
    }

    pub async fn update(&self, entity: &Entity) -> Result<u64> {
        let statement = self.update_statement(entity)?;
        debug!("Update {} id={:?}", self.model.table_name(), entity.id(&self.model));
        Ok(self.store.execute(statement).await?.affected())
    }

    /// Update many entities inside one transaction, all or nothing
    pub async fn m_update(&self, entities: &[Entity]) -> Result<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        let statements = entities
            .iter()
            .map(|entity| self.update_statement(entity))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "Batch update of {} entities in {}",
            entities.len(),
            self.model.table_name()
        );

        self.run_in_transaction(statements, |outcomes| Ok(outcomes.iter().map(StatementOutcome::affected).sum()))
            .await
    }

    pub async fn delete(&self, id: &Id) -> Result<u64> {
        debug!("Delete {} id={}", self.model.table_name(), id);
        let statement = Statement::delete(self.model.table_name())
            .filter(Predicate::eq(self.id_sql_name(), id.to_json()));
        Ok(self.store.execute(statement).await?.affected())
    }

    pub async fn m_delete(&self, ids: &[Id]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        debug!("Batch delete of {} ids in {}", ids.len(), self.model.table_name());
        let statement = Statement::delete(self.model.table_name()).filter(Predicate::is_in(
            self.id_sql_name(),
            ids.iter().map(Id::to_json).collect(),
        ));
        Ok(self.store.execute(statement).await?.affected())
    }

    /// Run statements in one transaction. Every statement resolves and
    /// `finish` turns the outcomes into the result before the commit/rollback
    /// decision; any failure rolls the whole batch back.
    async fn run_in_transaction<T>(
        &self,
        statements: Vec<Statement>,
        finish: impl FnOnce(Vec<StatementOutcome>) -> Result<T>,
    ) -> Result<T> {
        let transaction = self.store.begin_transaction().await?;
        let count = statements.len();

        let results = if self.capabilities.concurrent_transaction_statements {
            join_all(statements.into_iter().map(|statement| transaction.execute(statement))).await
        } else {
            let mut results = Vec::with_capacity(count);
            for statement in statements {
                let result = transaction.execute(statement).await;
                let failed = result.is_err();
                results.push(result);
                if failed {
                    break;
                }
            }
            results
        };

        match results.into_iter().collect::<Result<Vec<_>>>().and_then(finish) {
            Ok(finished) => {
                transaction.commit().await?;
                debug!("Committed {} statements on {}", count, self.model.table_name());
                Ok(finished)
            }
            Err(e) => {
                warn!(
                    "Rolling back {} statements on {}: {}",
                    count,
                    self.model.table_name(),
                    e
                );
                if let Err(rollback_error) = transaction.rollback().await {
                    warn!("Rollback failed: {}", rollback_error);
                }
                Err(e)
            }
        }
    }

    async fn get_many(&self, ids: &[Id], ordered: bool) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Get {} ids from {}", ids.len(), self.model.table_name());
        let mut statement = self.select().filter(Predicate::is_in(
            self.id_sql_name(),
            ids.iter().map(Id::to_json).collect(),
        ));
        if ordered {
            statement = statement.order_by(self.id_sql_name(), Order::Asc);
        }
        let rows = self.store.execute(statement).await?.into_rows()?;
        self.model.m_row_to_entity(&rows)
    }

    fn update_statement(&self, entity: &Entity) -> Result<Statement> {
        let id = entity.id(&self.model).ok_or_else(|| {
            RelCacheError::InvalidValue(format!(
                "cannot update {} without a value for {}",
                self.model.table_name(),
                self.model.id()
            ))
        })?;
        let mut values = self.model.entity_to_row(entity);
        values.remove(self.id_sql_name());
        Ok(Statement::update(self.model.table_name(), values)
            .filter(Predicate::eq(self.id_sql_name(), id.to_json())))
    }

    fn select(&self) -> Statement {
        Statement::select(self.model.table_name(), self.columns_to_select.clone())
    }

    fn id_sql_name(&self) -> &str {
        self.model.id_column().sql_name()
    }
}

fn generated_value(key: &JsonValue) -> Result<Value> {
    Id::from_json(key)
        .map(Value::from)
        .ok_or_else(|| RelCacheError::Store(format!("invalid generated key {key}")))
}
