use crate::core::error::{RelCacheError, Result};
use crate::core::{Id, Record, Row};
use crate::model::{Column, Model};
use crate::persistence::store::{Predicate, SqlStore, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Computes the cache key of a query from its parameters
pub type QueryKeyGen = Arc<dyn Fn(&QueryParams) -> String + Send + Sync>;

/// Computes the cache key of the query result a record belongs to.
/// `None` when the record lacks the discriminator fields.
pub type EntityKeyGen = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// Overrides for the generated cache keys
#[derive(Clone, Default)]
pub struct KeyGenOptions {
    pub query_key_gen: Option<QueryKeyGen>,
    pub entity_key_gen: Option<EntityKeyGen>,
    pub reverse_hash_key: Option<String>,
}

impl KeyGenOptions {
    pub fn with_query_key_gen(mut self, key_gen: impl Fn(&QueryParams) -> String + Send + Sync + 'static) -> Self {
        self.query_key_gen = Some(Arc::new(key_gen));
        self
    }

    pub fn with_entity_key_gen(
        mut self,
        key_gen: impl Fn(&Record) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.entity_key_gen = Some(Arc::new(key_gen));
        self
    }

    pub fn with_reverse_hash_key(mut self, key: impl Into<String>) -> Self {
        self.reverse_hash_key = Some(key.into());
        self
    }
}

/// Predicate parameters, one variant per query shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryParams {
    All,
    /// Discriminator value of a by-field query
    Field(JsonValue),
    /// Values of a by-fields query, in the order of the query's columns
    Fields(Vec<JsonValue>),
    /// Lower bound of a numeric range query
    Range { min: i64 },
}

impl QueryParams {
    pub fn field(value: impl Into<JsonValue>) -> Self {
        Self::Field(value.into())
    }

    pub fn fields<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        Self::Fields(values.into_iter().map(Into::into).collect())
    }

    pub fn range(min: i64) -> Self {
        Self::Range { min }
    }
}

/// Ids resolved by a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResult {
    Multiple(Vec<Id>),
    Single(Option<Id>),
}

impl QueryResult {
    /// Flatten into a list of ids
    pub fn ids(&self) -> Vec<Id> {
        match self {
            Self::Multiple(ids) => ids.clone(),
            Self::Single(id) => id.iter().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Multiple(ids) => ids.is_empty(),
            Self::Single(id) => id.is_none(),
        }
    }
}

/// Shape of the predicate a query config answers
#[derive(Debug, Clone)]
pub(crate) enum QueryShape {
    All,
    Field { column: Arc<Column>, unique: bool },
    Fields { columns: Vec<Arc<Column>>, unique: bool },
    Range {
        column: Arc<Column>,
        block_size: i64,
        min_value_field: String,
    },
}

/// A cache-addressable predicate query over one model.
///
/// `query_key` and `reverse_hash_key` depend only on the query shape and its
/// prefix, so a write to the model can locate every cached result it may
/// have changed.
#[derive(Clone)]
pub struct QueryConfig {
    model: Arc<Model>,
    store: Arc<dyn SqlStore>,
    alias: String,
    shape: QueryShape,
    query_key_gen: QueryKeyGen,
    entity_key_gen: EntityKeyGen,
    reverse_hash_key: String,
}

impl fmt::Debug for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConfig")
            .field("table", &self.model.table_name())
            .field("alias", &self.alias)
            .field("shape", &self.shape)
            .field("reverse_hash_key", &self.reverse_hash_key)
            .finish()
    }
}

impl QueryConfig {
    pub(crate) fn new(
        model: Arc<Model>,
        store: Arc<dyn SqlStore>,
        alias: String,
        shape: QueryShape,
        query_key_gen: QueryKeyGen,
        entity_key_gen: EntityKeyGen,
        reverse_hash_key: String,
    ) -> Self {
        Self {
            model,
            store,
            alias,
            shape,
            query_key_gen,
            entity_key_gen,
            reverse_hash_key,
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Stable name of the query shape, e.g. `f_name/`
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// True when the query resolves to a list of ids
    pub fn is_multiple(&self) -> bool {
        match &self.shape {
            QueryShape::All | QueryShape::Range { .. } => true,
            QueryShape::Field { unique, .. } | QueryShape::Fields { unique, .. } => !unique,
        }
    }

    /// True when `m_query` is available
    pub fn supports_batch(&self) -> bool {
        matches!(self.shape, QueryShape::Field { .. })
    }

    pub fn reverse_hash_key(&self) -> &str {
        &self.reverse_hash_key
    }

    /// Cache key of the result for `params`
    pub fn query_key(&self, params: &QueryParams) -> Result<String> {
        self.check_shape(params)?;
        Ok((self.query_key_gen)(params))
    }

    /// Cache key of the result `record` belongs to
    pub fn entity_key(&self, record: &Record) -> Option<String> {
        (self.entity_key_gen)(record)
    }

    /// Params to run the query with. Only the all-entities query runs without params.
    pub fn resolve_params(&self, params: Option<&QueryParams>) -> Result<QueryParams> {
        match (params, &self.shape) {
            (None, QueryShape::All) => Ok(QueryParams::All),
            (None, _) => Err(RelCacheError::MissingParameter("Expected params".to_string())),
            (Some(params), _) => {
                self.check_shape(params)?;
                Ok(params.clone())
            }
        }
    }

    /// Resolve one predicate against the durable store
    pub async fn query(&self, params: Option<&QueryParams>) -> Result<QueryResult> {
        let resolved = self.resolve_params(params)?;
        let params = &resolved;

        let id_column = self.model.id_column().sql_name().to_string();
        let mut statement = Statement::select(self.model.table_name(), vec![id_column]);
        match (&self.shape, params) {
            (QueryShape::All, _) => {}
            (QueryShape::Field { column, .. }, QueryParams::Field(value)) => {
                if is_falsy(value) {
                    return Err(RelCacheError::MissingParameter(format!(
                        "Expected a value for {}",
                        column.entity_alias()
                    )));
                }
                statement = statement.filter(Predicate::eq(column.sql_name(), value.clone()));
            }
            (QueryShape::Fields { columns, .. }, QueryParams::Fields(values)) => {
                for (column, value) in columns.iter().zip(values) {
                    if value.is_null() {
                        return Err(RelCacheError::MissingParameter(format!(
                            "Expected a value for {}",
                            column.entity_alias()
                        )));
                    }
                    statement = statement.filter(Predicate::eq(column.sql_name(), value.clone()));
                }
            }
            (QueryShape::Range { column, block_size, .. }, QueryParams::Range { min }) => {
                // Rows of the whole block `min` falls in, matching the block the result is keyed by
                let (start, end) = block_bounds(*min, *block_size).ok_or_else(|| {
                    RelCacheError::InvalidQueryParameters(format!(
                        "Range starting at {min} overflows block size {block_size}"
                    ))
                })?;
                statement = statement
                    .filter(Predicate::gte(column.sql_name(), JsonValue::from(start)))
                    .filter(Predicate::lt(column.sql_name(), JsonValue::from(end)));
            }
            _ => return Err(self.shape_mismatch(params)),
        }
        if !self.is_multiple() {
            statement = statement.limit(1);
        }

        debug!("Query {}{} on {}", self.alias, params_label(params), self.model.table_name());
        let rows = self.store.execute(statement).await?.into_rows()?;
        let mut ids = rows.iter().filter_map(|row| self.row_id(row));
        if self.is_multiple() {
            Ok(QueryResult::Multiple(ids.collect()))
        } else {
            Ok(QueryResult::Single(ids.next()))
        }
    }

    /// Resolve N by-field predicates with a single durable-store query.
    ///
    /// Entry `i` of the output answers `params[i]`; entries sharing a value
    /// share the same result.
    pub async fn m_query(&self, params: &[QueryParams]) -> Result<Vec<QueryResult>> {
        let (column, unique) = match &self.shape {
            QueryShape::Field { column, unique } => (column, *unique),
            _ => return Err(RelCacheError::BatchQueryUnsupported(self.alias.clone())),
        };
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let values = params
            .iter()
            .map(|params| match params {
                QueryParams::Field(value) if is_falsy(value) => Err(RelCacheError::MissingParameter(format!(
                    "Expected a value for {}",
                    column.entity_alias()
                ))),
                QueryParams::Field(value) => Ok(value),
                other => Err(self.shape_mismatch(other)),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut values_to_indices: HashMap<String, Vec<usize>> = HashMap::new();
        let mut distinct = Vec::new();
        for (index, value) in values.iter().enumerate() {
            let slots = values_to_indices.entry(value_key(value)).or_default();
            if slots.is_empty() {
                distinct.push((*value).clone());
            }
            slots.push(index);
        }

        debug!(
            "Batched query {} on {}: {} params, {} distinct values",
            self.alias,
            self.model.table_name(),
            params.len(),
            distinct.len()
        );
        let id_column = self.model.id_column().sql_name().to_string();
        let statement = Statement::select(
            self.model.table_name(),
            vec![id_column, column.sql_name().to_string()],
        )
        .filter(Predicate::is_in(column.sql_name(), distinct));
        let rows = self.store.execute(statement).await?.into_rows()?;

        let mut results: Vec<QueryResult> = (0..params.len())
            .map(|_| {
                if unique {
                    QueryResult::Single(None)
                } else {
                    QueryResult::Multiple(Vec::new())
                }
            })
            .collect();
        for row in &rows {
            let (Some(id), Some(value)) = (self.row_id(row), row.get(column.sql_name())) else {
                continue;
            };
            let Some(indices) = values_to_indices.get(&value_key(value)) else {
                continue;
            };
            for &index in indices {
                match &mut results[index] {
                    QueryResult::Multiple(ids) => ids.push(id.clone()),
                    QueryResult::Single(slot) => {
                        slot.get_or_insert_with(|| id.clone());
                    }
                }
            }
        }
        Ok(results)
    }

    /// Extract the parameters that would match `record`
    pub fn params_from_record(&self, record: &Record) -> Option<QueryParams> {
        self.shape.params_from_record(record)
    }

    /// Read parameters from an untyped object keyed by entity alias.
    /// Range queries read their lower bound from the configured min value field.
    pub fn params_from_object(&self, object: &Record) -> Result<QueryParams> {
        let missing = |field: &str| RelCacheError::MissingParameter(format!("Expected a value for {field}"));
        match &self.shape {
            QueryShape::All => Ok(QueryParams::All),
            QueryShape::Field { column, .. } => present(object, column)
                .map(QueryParams::Field)
                .ok_or_else(|| missing(column.entity_alias())),
            QueryShape::Fields { columns, .. } => columns
                .iter()
                .map(|column| present(object, column).ok_or_else(|| missing(column.entity_alias())))
                .collect::<Result<Vec<_>>>()
                .map(QueryParams::Fields),
            QueryShape::Range { min_value_field, .. } => {
                let value = object
                    .get(min_value_field)
                    .filter(|value| !value.is_null())
                    .ok_or_else(|| missing(min_value_field.as_str()))?;
                let min = value.as_i64().ok_or_else(|| {
                    RelCacheError::InvalidQueryParameters(format!(
                        "{min_value_field} must be an integer, got {value}"
                    ))
                })?;
                Ok(QueryParams::Range { min })
            }
        }
    }

    fn row_id(&self, row: &Row) -> Option<Id> {
        row.get(self.model.id_column().sql_name())
            .and_then(Id::from_json)
    }

    fn check_shape(&self, params: &QueryParams) -> Result<()> {
        let matches = match (&self.shape, params) {
            (QueryShape::All, QueryParams::All)
            | (QueryShape::Field { .. }, QueryParams::Field(_))
            | (QueryShape::Range { .. }, QueryParams::Range { .. }) => true,
            (QueryShape::Fields { columns, .. }, QueryParams::Fields(values)) => {
                columns.len() == values.len()
            }
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(self.shape_mismatch(params))
        }
    }

    fn shape_mismatch(&self, params: &QueryParams) -> RelCacheError {
        RelCacheError::InvalidQueryParameters(format!(
            "query {} on {} does not accept {:?}",
            self.alias,
            self.model.table_name(),
            params
        ))
    }
}

impl QueryShape {
    pub(crate) fn params_from_record(&self, record: &Record) -> Option<QueryParams> {
        match self {
            Self::All => Some(QueryParams::All),
            Self::Field { column, .. } => present(record, column).map(QueryParams::Field),
            Self::Fields { columns, .. } => columns
                .iter()
                .map(|column| present(record, column))
                .collect::<Option<Vec<_>>>()
                .map(QueryParams::Fields),
            Self::Range { column, .. } => {
                let value = present(record, column)?;
                let min = value
                    .as_i64()
                    .or_else(|| value.as_f64().map(|f| f.floor() as i64))
                    .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))?;
                Some(QueryParams::Range { min })
            }
        }
    }
}

fn present(record: &Record, column: &Column) -> Option<JsonValue> {
    record
        .get(column.entity_alias())
        .filter(|value| !value.is_null())
        .cloned()
}

/// Stringify a predicate value the way it appears inside a cache key
pub(crate) fn key_part(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Values equal under SQL comparison share a key
fn value_key(value: &JsonValue) -> String {
    match value {
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => format!("n:{i}"),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => format!("n:{}", f as i64),
                _ => format!("n:{n}"),
            },
        },
        JsonValue::String(s) => format!("s:{s}"),
        other => format!("j:{other}"),
    }
}

fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => false,
    }
}

/// `[start, end)` of the block holding `min`, `None` on overflow
fn block_bounds(min: i64, block_size: i64) -> Option<(i64, i64)> {
    let start = min.div_euclid(block_size).checked_mul(block_size)?;
    Some((start, start.checked_add(block_size)?))
}

fn params_label(params: &QueryParams) -> String {
    match params {
        QueryParams::All => String::new(),
        QueryParams::Field(value) => key_part(value),
        QueryParams::Fields(values) => values.iter().map(key_part).collect(),
        QueryParams::Range { min } => min.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_key_normalizes_numbers() {
        assert_eq!(value_key(&json!(1)), value_key(&json!(1.0)));
        assert_ne!(value_key(&json!(1)), value_key(&json!("1")));
        assert_eq!(value_key(&json!("a")), "s:a");
    }

    #[test]
    fn test_falsy_values() {
        assert!(is_falsy(&json!(null)));
        assert!(is_falsy(&json!(false)));
        assert!(is_falsy(&json!(0)));
        assert!(is_falsy(&json!("")));
        assert!(!is_falsy(&json!("0")));
        assert!(!is_falsy(&json!(-1)));
    }

    #[test]
    fn test_block_bounds() {
        assert_eq!(block_bounds(25, 10), Some((20, 30)));
        assert_eq!(block_bounds(-5, 10), Some((-10, 0)));
        assert_eq!(block_bounds(i64::MAX - 1, 10), None);
    }

    #[test]
    fn test_key_part() {
        assert_eq!(key_part(&json!("abc")), "abc");
        assert_eq!(key_part(&json!(12)), "12");
        assert_eq!(key_part(&json!(true)), "true");
    }

    #[test]
    fn test_query_result_ids() {
        assert_eq!(
            QueryResult::Multiple(vec![Id::Integer(1), Id::Integer(2)]).ids().len(),
            2
        );
        assert!(QueryResult::Single(None).is_empty());
        assert_eq!(QueryResult::Single(Some(Id::Integer(3))).ids(), vec![Id::Integer(3)]);
    }

    #[test]
    fn test_params_serde() {
        let params: QueryParams = serde_json::from_value(json!({"type": "range", "value": {"min": 20}})).unwrap();
        assert_eq!(params, QueryParams::range(20));
        let params: QueryParams = serde_json::from_value(json!({"type": "all"})).unwrap();
        assert_eq!(params, QueryParams::All);
    }
}
