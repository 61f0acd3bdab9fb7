//! Contract of the durable store ("secondary layer").
//!
//! Statements are literal predicate translations: equality, `IN` and numeric
//! bounds combined with AND. No joins, no planning.

use super::engine::{EngineCapabilities, SqlEngine};
use crate::core::error::{RelCacheError, Result};
use crate::core::Row;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// One condition of a WHERE clause
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq { column: String, value: JsonValue },
    In { column: String, values: Vec<JsonValue> },
    Gte { column: String, value: JsonValue },
    Lt { column: String, value: JsonValue },
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: JsonValue) -> Self {
        Self::Eq {
            column: column.into(),
            value,
        }
    }

    pub fn is_in(column: impl Into<String>, values: Vec<JsonValue>) -> Self {
        Self::In {
            column: column.into(),
            values,
        }
    }

    pub fn gte(column: impl Into<String>, value: JsonValue) -> Self {
        Self::Gte {
            column: column.into(),
            value,
        }
    }

    pub fn lt(column: impl Into<String>, value: JsonValue) -> Self {
        Self::Lt {
            column: column.into(),
            value,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. }
            | Self::In { column, .. }
            | Self::Gte { column, .. }
            | Self::Lt { column, .. } => column,
        }
    }

    /// Evaluate the predicate against a stored row
    pub fn matches(&self, row: &Row) -> bool {
        let stored = row.get(self.column()).unwrap_or(&JsonValue::Null);
        match self {
            Self::Eq { value, .. } => !stored.is_null() && values_equal(stored, value),
            Self::In { values, .. } => {
                !stored.is_null() && values.iter().any(|value| values_equal(stored, value))
            }
            Self::Gte { value, .. } => {
                compare(stored, value).is_some_and(|ordering| ordering != Ordering::Less)
            }
            Self::Lt { value, .. } => compare(stored, value) == Some(Ordering::Less),
        }
    }
}

/// SQL equality: numbers compare by value regardless of integer/float encoding
pub(crate) fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

pub(crate) fn compare(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Statement sent to the durable store
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select {
        table: String,
        columns: Vec<String>,
        filters: Vec<Predicate>,
        order_by: Option<(String, Order)>,
        limit: Option<usize>,
    },
    Insert {
        table: String,
        rows: Vec<Row>,
        /// Column whose generated values are returned
        returning: Option<String>,
    },
    Update {
        table: String,
        values: Row,
        filters: Vec<Predicate>,
    },
    Delete {
        table: String,
        filters: Vec<Predicate>,
    },
}

impl Statement {
    pub fn select(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self::Select {
            table: table.into(),
            columns,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn insert(table: impl Into<String>, rows: Vec<Row>, returning: Option<String>) -> Self {
        Self::Insert {
            table: table.into(),
            rows,
            returning,
        }
    }

    pub fn update(table: impl Into<String>, values: Row) -> Self {
        Self::Update {
            table: table.into(),
            values,
            filters: Vec::new(),
        }
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Self::Delete {
            table: table.into(),
            filters: Vec::new(),
        }
    }

    /// Add an AND-ed condition. Ignored for inserts.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        match &mut self {
            Self::Select { filters, .. } | Self::Update { filters, .. } | Self::Delete { filters, .. } => {
                filters.push(predicate);
            }
            Self::Insert { .. } => {}
        }
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, order: Order) -> Self {
        if let Self::Select { order_by, .. } = &mut self {
            *order_by = Some((column.into(), order));
        }
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        if let Self::Select { limit, .. } = &mut self {
            *limit = Some(n);
        }
        self
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Select { table, .. }
            | Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. } => table,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Select { .. } => "SELECT",
            Self::Insert { .. } => "INSERT",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
        }
    }

    /// Render the statement as SQL text plus bind parameters for `engine`
    pub fn to_sql(&self, engine: SqlEngine) -> (String, Vec<JsonValue>) {
        let mut params = Vec::new();
        let q = |identifier: &str| engine.quote_identifier(identifier);
        let sql = match self {
            Self::Select {
                table,
                columns,
                filters,
                order_by,
                limit,
            } => {
                let projection = if columns.is_empty() {
                    "*".to_string()
                } else {
                    columns.iter().map(|c| q(c.as_str())).collect::<Vec<_>>().join(", ")
                };
                let top = match (engine, limit) {
                    (SqlEngine::MsSql, Some(n)) => format!("TOP {n} "),
                    _ => String::new(),
                };
                let mut sql = format!("SELECT {top}{projection} FROM {}", q(table));
                sql.push_str(&render_where(engine, filters, &mut params));
                if let Some((column, order)) = order_by {
                    let direction = match order {
                        Order::Asc => "ASC",
                        Order::Desc => "DESC",
                    };
                    sql.push_str(&format!(" ORDER BY {} {direction}", q(column)));
                }
                match (engine, limit) {
                    (SqlEngine::MsSql, _) | (_, None) => {}
                    (SqlEngine::Oracle, Some(n)) => {
                        sql.push_str(&format!(" FETCH FIRST {n} ROWS ONLY"));
                    }
                    (_, Some(n)) => sql.push_str(&format!(" LIMIT {n}")),
                }
                sql
            }
            Self::Insert {
                table,
                rows,
                returning,
            } => {
                let mut columns: Vec<&String> = Vec::new();
                for row in rows {
                    for column in row.keys() {
                        if !columns.contains(&column) {
                            columns.push(column);
                        }
                    }
                }
                let tuples: Vec<String> = rows
                    .iter()
                    .map(|row| {
                        let slots: Vec<String> = columns
                            .iter()
                            .map(|column| {
                                params.push(row.get(*column).cloned().unwrap_or(JsonValue::Null));
                                engine.placeholder(params.len())
                            })
                            .collect();
                        format!("({})", slots.join(", "))
                    })
                    .collect();
                let column_list = columns.iter().map(|c| q(c.as_str())).collect::<Vec<_>>().join(", ");
                let output = match (engine, returning) {
                    (SqlEngine::MsSql, Some(column)) => format!(" OUTPUT INSERTED.{}", q(column)),
                    _ => String::new(),
                };
                let mut sql = format!(
                    "INSERT INTO {} ({column_list}){output} VALUES {}",
                    q(table),
                    tuples.join(", ")
                );
                match (engine, returning) {
                    (SqlEngine::Postgres | SqlEngine::Sqlite | SqlEngine::Oracle, Some(column)) => {
                        sql.push_str(&format!(" RETURNING {}", q(column)));
                    }
                    _ => {}
                }
                sql
            }
            Self::Update {
                table,
                values,
                filters,
            } => {
                let assignments: Vec<String> = values
                    .iter()
                    .map(|(column, value)| {
                        params.push(value.clone());
                        format!("{} = {}", q(column), engine.placeholder(params.len()))
                    })
                    .collect();
                let mut sql = format!("UPDATE {} SET {}", q(table), assignments.join(", "));
                sql.push_str(&render_where(engine, filters, &mut params));
                sql
            }
            Self::Delete { table, filters } => {
                let mut sql = format!("DELETE FROM {}", q(table));
                sql.push_str(&render_where(engine, filters, &mut params));
                sql
            }
        };
        (sql, params)
    }
}

fn render_where(engine: SqlEngine, filters: &[Predicate], params: &mut Vec<JsonValue>) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let mut bind = |value: &JsonValue| {
        params.push(value.clone());
        engine.placeholder(params.len())
    };
    let conditions: Vec<String> = filters
        .iter()
        .map(|predicate| {
            let column = engine.quote_identifier(predicate.column());
            match predicate {
                Predicate::Eq { value, .. } => format!("{column} = {}", bind(value)),
                Predicate::Gte { value, .. } => format!("{column} >= {}", bind(value)),
                Predicate::Lt { value, .. } => format!("{column} < {}", bind(value)),
                Predicate::In { values, .. } if values.is_empty() => "1 = 0".to_string(),
                Predicate::In { values, .. } => {
                    let slots: Vec<String> = values.iter().map(&mut bind).collect();
                    format!("{column} IN ({})", slots.join(", "))
                }
            }
        })
        .collect();
    format!(" WHERE {}", conditions.join(" AND "))
}

/// Result of one statement
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    /// Rows of a SELECT
    Rows(Vec<Row>),
    /// Generated values of an INSERT with `returning`
    Generated(Vec<JsonValue>),
    /// Affected row count of an INSERT, UPDATE or DELETE
    Affected(u64),
}

impl StatementOutcome {
    pub fn into_rows(self) -> Result<Vec<Row>> {
        match self {
            Self::Rows(rows) => Ok(rows),
            other => Err(RelCacheError::Store(format!(
                "expected rows, got {other:?}"
            ))),
        }
    }

    /// Generated values; a plain affected count yields none
    pub fn into_generated(self) -> Vec<JsonValue> {
        match self {
            Self::Generated(values) => values,
            Self::Rows(_) | Self::Affected(_) => Vec::new(),
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            Self::Rows(rows) => rows.len() as u64,
            Self::Generated(values) => values.len() as u64,
            Self::Affected(count) => *count,
        }
    }
}

/// Durable store consumed by the secondary layer
#[async_trait]
pub trait SqlStore: Send + Sync {
    /// Engine behind the store, used for SQL rendering and capability lookup
    fn engine(&self) -> SqlEngine;

    fn capabilities(&self) -> EngineCapabilities {
        self.engine().capabilities()
    }

    async fn execute(&self, statement: Statement) -> Result<StatementOutcome>;

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// Open transaction. Statements may be issued concurrently through `&self`;
/// the owner decides between commit and rollback once all of them resolved.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    async fn execute(&self, statement: Statement) -> Result<StatementOutcome>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
