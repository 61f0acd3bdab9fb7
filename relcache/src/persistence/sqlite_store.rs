//! SQLite-backed durable store.
//!
//! Statements are rendered with [`Statement::to_sql`] for the SQLite dialect
//! and run through rusqlite. SQLite is a class B engine: an insert returns
//! the generated key of its first row only.

use super::engine::SqlEngine;
use super::store::{SqlStore, Statement, StatementOutcome, StoreTransaction};
use crate::core::error::{RelCacheError, Result};
use crate::core::Row;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable store over one SQLite database file.
///
/// Plain statements share one connection. Each transaction opens its own
/// connection, so the database must live in a file.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening SQLite store at {}", path.display());
        let connection = connect(&path)?;
        connection
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(from_rusqlite)?;

        Ok(Self {
            path,
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run raw SQL, typically DDL, outside any transaction
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        debug!("SQL [sqlite] batch {}", sql);
        self.connection.lock().execute_batch(sql).map_err(from_rusqlite)
    }
}

#[async_trait]
impl SqlStore for SqliteStore {
    fn engine(&self) -> SqlEngine {
        SqlEngine::Sqlite
    }

    async fn execute(&self, statement: Statement) -> Result<StatementOutcome> {
        let connection = Arc::clone(&self.connection);
        blocking(move || run(&connection.lock(), &statement)).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>> {
        let path = self.path.clone();
        let connection = blocking(move || {
            let connection = connect(&path)?;
            connection.execute_batch("BEGIN IMMEDIATE").map_err(from_rusqlite)?;
            Ok(connection)
        })
        .await?;
        debug!("BEGIN");

        Ok(Box::new(SqliteTransaction {
            connection: Arc::new(Mutex::new(connection)),
        }))
    }
}

/// Open transaction on a dedicated connection. Dropping it without a commit
/// closes the connection, which rolls the transaction back.
struct SqliteTransaction {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteTransaction {
    async fn finish(self, sql: &'static str) -> Result<()> {
        let connection = self.connection;
        blocking(move || connection.lock().execute_batch(sql).map_err(from_rusqlite)).await
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn execute(&self, statement: Statement) -> Result<StatementOutcome> {
        let connection = Arc::clone(&self.connection);
        blocking(move || run(&connection.lock(), &statement)).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        debug!("COMMIT");
        (*self)
            .finish("COMMIT")
            .await
            .map_err(|e| RelCacheError::Transaction(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        warn!("ROLLBACK");
        (*self).finish("ROLLBACK").await
    }
}

fn connect(path: &Path) -> Result<Connection> {
    let connection = Connection::open(path).map_err(from_rusqlite)?;
    connection.busy_timeout(BUSY_TIMEOUT).map_err(from_rusqlite)?;
    Ok(connection)
}

/// rusqlite calls block, keep them off the async workers
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RelCacheError::Store(format!("SQLite worker failed: {e}")))?
}

fn run(connection: &Connection, statement: &Statement) -> Result<StatementOutcome> {
    let (sql, params) = statement.to_sql(SqlEngine::Sqlite);
    debug!("SQL [sqlite] {} params={}", sql, params.len());
    let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
    let mut prepared = connection.prepare(&sql).map_err(from_rusqlite)?;

    match statement {
        Statement::Select { .. } => {
            let names: Vec<String> = prepared.column_names().into_iter().map(String::from).collect();
            let rows = prepared
                .query_map(params_from_iter(params.iter()), |sql_row| {
                    let mut row = Row::new();
                    for (index, name) in names.iter().enumerate() {
                        row.insert(name.clone(), to_json_value(sql_row.get_ref(index)?));
                    }
                    Ok(row)
                })
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite)?;
            Ok(StatementOutcome::Rows(rows))
        }
        Statement::Insert {
            returning: Some(_), ..
        } => {
            let keys = prepared
                .query_map(params_from_iter(params.iter()), |sql_row| {
                    Ok(to_json_value(sql_row.get_ref(0)?))
                })
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite)?;
            Ok(StatementOutcome::Generated(keys))
        }
        _ => {
            let affected = prepared
                .execute(params_from_iter(params.iter()))
                .map_err(from_rusqlite)?;
            Ok(StatementOutcome::Affected(affected as u64))
        }
    }
}

fn to_sql_value(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json_value(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => JsonValue::from(f),
        ValueRef::Text(text) => JsonValue::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => JsonValue::from(bytes.to_vec()),
    }
}

/// Unique and primary key failures become `ConstraintViolation`, anything
/// else a store error
fn from_rusqlite(err: rusqlite::Error) -> RelCacheError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        if failure.code == ErrorCode::ConstraintViolation {
            // "UNIQUE constraint failed: users.name"
            let target = message.rsplit(": ").next().unwrap_or_default();
            let (table, column) = target.split_once('.').unwrap_or(("", target));
            return RelCacheError::ConstraintViolation {
                table: table.to_string(),
                column: column.to_string(),
                value: message.clone(),
            };
        }
    }
    RelCacheError::Store(err.to_string())
}
