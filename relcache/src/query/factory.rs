use super::config::{
    key_part, EntityKeyGen, KeyGenOptions, QueryConfig, QueryKeyGen, QueryParams, QueryShape,
};
use crate::core::error::{RelCacheError, Result};
use crate::core::Record;
use crate::model::{Column, Model, SqlType};
use crate::persistence::store::SqlStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Options of a numeric range query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeOptions {
    /// Width of each cached range
    pub block_size: i64,
    /// Field holding the lower bound in untyped parameter objects
    pub min_value_field: String,
}

impl RangeOptions {
    pub fn new(block_size: i64, min_value_field: impl Into<String>) -> Self {
        Self {
            block_size,
            min_value_field: min_value_field.into(),
        }
    }
}

/// Builds query configs over one model.
///
/// Every key produced by the configs starts with `query_prefix`.
pub struct QueryConfigFactory {
    model: Arc<Model>,
    store: Arc<dyn SqlStore>,
    query_prefix: String,
}

impl QueryConfigFactory {
    pub fn new(model: Arc<Model>, store: Arc<dyn SqlStore>, query_prefix: impl Into<String>) -> Self {
        Self {
            model,
            store,
            query_prefix: query_prefix.into(),
        }
    }

    /// Factory using the model key prefix as query prefix
    pub fn for_model(model: Arc<Model>, store: Arc<dyn SqlStore>) -> Self {
        let prefix = model.key_prefix().to_string();
        Self::new(model, store, prefix)
    }

    pub fn query_prefix(&self) -> &str {
        &self.query_prefix
    }

    /// Ids of every entity of the model
    pub fn all(&self) -> QueryConfig {
        self.all_with(KeyGenOptions::default())
    }

    pub fn all_with(&self, options: KeyGenOptions) -> QueryConfig {
        let key = format!("{}all/", self.query_prefix);
        self.build("all/".to_string(), QueryShape::All, Arc::new(move |_: &QueryParams| key.clone()), options)
    }

    /// Ids of the entities whose `column` equals the given value
    pub fn by_field(&self, column: &str) -> Result<QueryConfig> {
        self.by_field_with(column, KeyGenOptions::default())
    }

    pub fn by_field_with(&self, column: &str, options: KeyGenOptions) -> Result<QueryConfig> {
        self.single_field(column, false, options)
    }

    /// Id of the only entity whose `column` equals the given value
    pub fn by_unique_field(&self, column: &str) -> Result<QueryConfig> {
        self.by_unique_field_with(column, KeyGenOptions::default())
    }

    pub fn by_unique_field_with(&self, column: &str, options: KeyGenOptions) -> Result<QueryConfig> {
        self.single_field(column, true, options)
    }

    /// Ids of the entities matching every column/value pair
    pub fn by_fields(&self, columns: &[&str]) -> Result<QueryConfig> {
        self.by_fields_with(columns, KeyGenOptions::default())
    }

    pub fn by_fields_with(&self, columns: &[&str], options: KeyGenOptions) -> Result<QueryConfig> {
        self.multiple_fields(columns, false, options)
    }

    pub fn by_unique_fields(&self, columns: &[&str]) -> Result<QueryConfig> {
        self.by_unique_fields_with(columns, KeyGenOptions::default())
    }

    pub fn by_unique_fields_with(&self, columns: &[&str], options: KeyGenOptions) -> Result<QueryConfig> {
        self.multiple_fields(columns, true, options)
    }

    /// Ids of the entities in the block of `block_size` values holding `min`.
    ///
    /// Results are cached per block: an entity lives under
    /// `floor(value / block_size)`, and any `min` inside that block runs
    /// the same `[floor(min / block_size) * block_size, + block_size)` range.
    pub fn by_numeric_range(&self, column: &str, range: RangeOptions) -> Result<QueryConfig> {
        self.by_numeric_range_with(column, range, KeyGenOptions::default())
    }

    pub fn by_numeric_range_with(
        &self,
        column: &str,
        range: RangeOptions,
        options: KeyGenOptions,
    ) -> Result<QueryConfig> {
        let column = Arc::clone(self.model.require_column(column)?);
        if column.sql_type() != SqlType::Integer {
            return Err(RelCacheError::NonNumericRangeColumn(format!(
                "{}.{}",
                self.model.table_name(),
                column.entity_alias()
            )));
        }
        if range.block_size <= 0 {
            return Err(RelCacheError::InvalidConfig(format!(
                "range block size must be positive, got {}",
                range.block_size
            )));
        }

        let alias = format!("r_{}/", column.entity_alias());
        let prefix = format!("{}{}", self.query_prefix, alias);
        let block_size = range.block_size;
        let key_gen: QueryKeyGen = Arc::new(move |params: &QueryParams| match params {
            QueryParams::Range { min } => format!("{prefix}{}", min.div_euclid(block_size)),
            _ => prefix.clone(),
        });
        let shape = QueryShape::Range {
            column,
            block_size,
            min_value_field: range.min_value_field,
        };
        Ok(self.build(alias, shape, key_gen, options))
    }

    fn single_field(&self, column: &str, unique: bool, options: KeyGenOptions) -> Result<QueryConfig> {
        let column = Arc::clone(self.model.require_column(column)?);
        let alias = format!("{}_{}/", if unique { "uf" } else { "f" }, column.entity_alias());
        let prefix = format!("{}{}", self.query_prefix, alias);
        let key_gen: QueryKeyGen = Arc::new(move |params: &QueryParams| match params {
            QueryParams::Field(value) => format!("{prefix}{}", key_part(value)),
            _ => prefix.clone(),
        });
        Ok(self.build(alias, QueryShape::Field { column, unique }, key_gen, options))
    }

    fn multiple_fields(&self, columns: &[&str], unique: bool, options: KeyGenOptions) -> Result<QueryConfig> {
        if columns.is_empty() {
            return Err(RelCacheError::InvalidConfig(
                "a multiple fields query needs at least one column".to_string(),
            ));
        }
        let columns: Vec<Arc<Column>> = columns
            .iter()
            .map(|column| self.model.require_column(column).map(Arc::clone))
            .collect::<Result<_>>()?;

        let mut alias = if unique { "umf_" } else { "mf_" }.to_string();
        for column in &columns {
            alias.push('/');
            alias.push_str(column.entity_alias());
        }
        let prefix = format!("{}{}", self.query_prefix, alias);
        let key_gen: QueryKeyGen = Arc::new(move |params: &QueryParams| {
            let mut key = prefix.clone();
            if let QueryParams::Fields(values) = params {
                for value in values {
                    key.push_str(&key_part(value));
                }
            }
            key
        });
        Ok(self.build(alias, QueryShape::Fields { columns, unique }, key_gen, options))
    }

    fn build(
        &self,
        alias: String,
        shape: QueryShape,
        default_key_gen: QueryKeyGen,
        options: KeyGenOptions,
    ) -> QueryConfig {
        let KeyGenOptions {
            query_key_gen,
            entity_key_gen,
            reverse_hash_key,
        } = options;

        let entity_key_gen: EntityKeyGen = entity_key_gen.unwrap_or_else(|| {
            let shape = shape.clone();
            let key_gen = Arc::clone(&default_key_gen);
            Arc::new(move |record: &Record| shape.params_from_record(record).map(|params| key_gen(&params)))
        });
        let query_key_gen = query_key_gen.unwrap_or(default_key_gen);
        let reverse_hash_key =
            reverse_hash_key.unwrap_or_else(|| format!("{}{}/reverse", self.query_prefix, alias));

        debug!(
            "Built query config {} for {} (reverse hash {})",
            alias,
            self.model.table_name(),
            reverse_hash_key
        );

        QueryConfig::new(
            Arc::clone(&self.model),
            Arc::clone(&self.store),
            alias,
            shape,
            query_key_gen,
            entity_key_gen,
            reverse_hash_key,
        )
    }
}
