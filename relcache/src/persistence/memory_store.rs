use super::engine::{EngineCapabilities, SqlEngine};
use super::store::{compare, values_equal, Order, SqlStore, Statement, StatementOutcome, StoreTransaction};
use crate::core::error::{RelCacheError, Result};
use crate::core::Row;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Table layout for the in-memory engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: String,
    /// Primary key values are generated when absent
    pub auto_increment: bool,
    /// Columns with a unique constraint besides the primary key
    pub unique: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            auto_increment: false,
            unique: Vec::new(),
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unique(mut self, column: impl Into<String>) -> Self {
        self.unique.push(column.into());
        self
    }
}

#[derive(Debug, Clone)]
struct Table {
    schema: TableSchema,
    rows: Vec<Row>,
    next_id: i64,
}

type Tables = HashMap<String, Table>;

/// Counters of the in-memory engine
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub statements: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
}

/// In-process SQL table engine implementing the durable store contract.
///
/// Behaves like the configured engine regarding generated keys: class B
/// engines return only the first generated value of a multi-row insert.
/// Transactions read a snapshot plus their own writes, and commit by
/// replaying their statements against the live tables, so writes made
/// outside the transaction meanwhile are kept. Generated keys are reserved
/// on the live table as a transaction inserts.
#[derive(Clone)]
pub struct MemoryStore {
    engine: SqlEngine,
    tables: Arc<RwLock<Tables>>,
    log: Arc<Mutex<Vec<Statement>>>,
    stats: Arc<Mutex<MemoryStoreStats>>,
}

impl MemoryStore {
    pub fn new(engine: SqlEngine) -> Self {
        info!(
            "Initializing in-memory store engine={}, capabilities={:?}",
            engine,
            engine.capabilities()
        );

        Self {
            engine,
            tables: Arc::new(RwLock::new(HashMap::new())),
            log: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Mutex::new(MemoryStoreStats::default())),
        }
    }

    /// Create (or replace) a table
    pub fn create_table(&self, schema: TableSchema) {
        debug!("CREATE TABLE {}", schema.name);
        self.tables.write().insert(
            schema.name.clone(),
            Table {
                schema,
                rows: Vec::new(),
                next_id: 1,
            },
        );
    }

    /// Committed rows of a table, in insertion order
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.rows.len())
    }

    /// Every statement executed so far, inside or outside transactions
    pub fn executed_statements(&self) -> Vec<Statement> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    pub fn stats(&self) -> MemoryStoreStats {
        self.stats.lock().clone()
    }

    fn record(&self, statement: &Statement) {
        let (sql, params) = statement.to_sql(self.engine);
        debug!("SQL [{}] {} params={}", self.engine, sql, params.len());
        self.log.lock().push(statement.clone());
        self.stats.lock().statements += 1;
    }
}

#[async_trait]
impl SqlStore for MemoryStore {
    fn engine(&self) -> SqlEngine {
        self.engine
    }

    async fn execute(&self, statement: Statement) -> Result<StatementOutcome> {
        tokio::task::yield_now().await;
        self.record(&statement);
        let capabilities = self.capabilities();
        let mut tables = self.tables.write();
        apply(&mut tables, &statement, capabilities)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>> {
        debug!("BEGIN");
        let snapshot = self.tables.read().clone();
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            staged: Mutex::new(snapshot),
            replay: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    staged: Mutex<Tables>,
    /// Statements as applied, inserts carrying their generated keys
    replay: Mutex<Vec<Statement>>,
}

impl MemoryTransaction {
    /// Move the staged key counter of `table` past every key handed out on the live table
    fn sync_next_id(&self, staged: &mut Tables, table: &str, publish: bool) {
        let mut live = self.store.tables.write();
        if let (Some(staged), Some(live)) = (staged.get_mut(table), live.get_mut(table)) {
            if publish {
                live.next_id = live.next_id.max(staged.next_id);
            } else {
                staged.next_id = staged.next_id.max(live.next_id);
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn execute(&self, statement: Statement) -> Result<StatementOutcome> {
        tokio::task::yield_now().await;
        self.store.record(&statement);
        let capabilities = self.store.capabilities();
        let mut staged = self.staged.lock();
        let inserting = match &statement {
            Statement::Insert { table, .. } => Some(table.clone()),
            _ => None,
        };
        if let Some(table) = &inserting {
            self.sync_next_id(&mut staged, table, false);
        }
        let (outcome, applied) = apply_resolved(&mut staged, &statement, capabilities)?;
        if let Some(table) = &inserting {
            self.sync_next_id(&mut staged, table, true);
        }
        self.replay.lock().push(applied);
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        debug!("COMMIT");
        let capabilities = self.store.capabilities();
        let replay = self.replay.into_inner();
        let mut live = self.store.tables.write();
        let mut merged = live.clone();
        for statement in &replay {
            if let Err(e) = apply(&mut merged, statement, capabilities) {
                warn!("ROLLBACK on commit: {}", e);
                self.store.stats.lock().transactions_rolled_back += 1;
                return Err(RelCacheError::Transaction(format!("commit conflicts with concurrent writes: {e}")));
            }
        }
        *live = merged;
        self.store.stats.lock().transactions_committed += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        warn!("ROLLBACK");
        self.store.stats.lock().transactions_rolled_back += 1;
        Ok(())
    }
}

fn table_mut<'a>(tables: &'a mut Tables, name: &str) -> Result<&'a mut Table> {
    tables
        .get_mut(name)
        .ok_or_else(|| RelCacheError::UnknownTable(name.to_string()))
}

fn apply(tables: &mut Tables, statement: &Statement, capabilities: EngineCapabilities) -> Result<StatementOutcome> {
    apply_resolved(tables, statement, capabilities).map(|(outcome, _)| outcome)
}

/// Apply `statement`, also returning it in replayable form: an insert comes
/// back with its generated keys filled in
fn apply_resolved(
    tables: &mut Tables,
    statement: &Statement,
    capabilities: EngineCapabilities,
) -> Result<(StatementOutcome, Statement)> {
    let outcome = match statement {
        Statement::Select {
            table,
            columns,
            filters,
            order_by,
            limit,
        } => {
            let table = table_mut(tables, table)?;
            let mut rows: Vec<Row> = table
                .rows
                .iter()
                .filter(|row| filters.iter().all(|p| p.matches(row)))
                .cloned()
                .collect();
            if let Some((column, order)) = order_by {
                rows.sort_by(|a, b| {
                    let ordering = compare(
                        a.get(column).unwrap_or(&JsonValue::Null),
                        b.get(column).unwrap_or(&JsonValue::Null),
                    )
                    .unwrap_or(Ordering::Equal);
                    match order {
                        Order::Asc => ordering,
                        Order::Desc => ordering.reverse(),
                    }
                });
            }
            if let Some(limit) = limit {
                rows.truncate(*limit);
            }
            if !columns.is_empty() {
                rows = rows
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .filter(|(column, _)| columns.contains(column))
                            .collect()
                    })
                    .collect();
            }
            Ok(StatementOutcome::Rows(rows))
        }
        Statement::Insert {
            table,
            rows,
            returning,
        } => {
            let table = table_mut(tables, table)?;
            let mut next_id = table.next_id;
            let mut inserted: Vec<Row> = Vec::with_capacity(rows.len());

            for row in rows {
                let mut row = row.clone();
                let pk = table.schema.primary_key.clone();
                match row.get(&pk).and_then(JsonValue::as_i64) {
                    Some(explicit) if table.schema.auto_increment => {
                        next_id = next_id.max(explicit + 1);
                    }
                    None if table.schema.auto_increment
                        && row.get(&pk).is_none_or(JsonValue::is_null) =>
                    {
                        row.insert(pk.clone(), JsonValue::from(next_id));
                        next_id += 1;
                    }
                    _ => {}
                }
                check_unique(&table.schema, &table.rows, &inserted, &row, None)?;
                inserted.push(row);
            }

            table.next_id = next_id;
            let count = inserted.len() as u64;
            let generated: Option<Vec<JsonValue>> = returning.as_ref().map(|column| {
                inserted
                    .iter()
                    .map(|row| row.get(column).cloned().unwrap_or(JsonValue::Null))
                    .collect()
            });
            table.rows.extend(inserted.iter().cloned());
            let resolved = Statement::insert(table.schema.name.clone(), inserted, None);

            let outcome = match generated {
                Some(mut values) => {
                    if !capabilities.multi_row_returning {
                        values.truncate(1);
                    }
                    StatementOutcome::Generated(values)
                }
                None => StatementOutcome::Affected(count),
            };
            return Ok((outcome, resolved));
        }
        Statement::Update {
            table,
            values,
            filters,
        } => {
            let table = table_mut(tables, table)?;
            let targets: Vec<usize> = table
                .rows
                .iter()
                .enumerate()
                .filter(|(_, row)| filters.iter().all(|p| p.matches(row)))
                .map(|(index, _)| index)
                .collect();

            let mut updated = Vec::with_capacity(targets.len());
            for &index in &targets {
                let mut row = table.rows[index].clone();
                for (column, value) in values {
                    row.insert(column.clone(), value.clone());
                }
                check_unique(&table.schema, &table.rows, &updated, &row, Some(index))?;
                updated.push(row);
            }
            for (index, row) in targets.iter().zip(updated) {
                table.rows[*index] = row;
            }
            Ok(StatementOutcome::Affected(targets.len() as u64))
        }
        Statement::Delete { table, filters } => {
            let table = table_mut(tables, table)?;
            let before = table.rows.len();
            table
                .rows
                .retain(|row| !filters.iter().all(|p| p.matches(row)));
            Ok(StatementOutcome::Affected((before - table.rows.len()) as u64))
        }
    };
    outcome.map(|outcome| (outcome, statement.clone()))
}

fn check_unique(schema: &TableSchema, existing: &[Row], pending: &[Row], row: &Row, skip: Option<usize>) -> Result<()> {
    let constrained = std::iter::once(&schema.primary_key).chain(schema.unique.iter());
    for column in constrained {
        let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = existing
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != skip)
            .map(|(_, other)| other)
            .chain(pending.iter())
            .any(|other| other.get(column).is_some_and(|v| values_equal(v, value)));
        if clash {
            return Err(RelCacheError::ConstraintViolation {
                table: schema.name.clone(),
                column: column.clone(),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}
