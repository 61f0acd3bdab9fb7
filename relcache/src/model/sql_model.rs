use super::column::{Column, ColumnDefinition, SqlType};
use crate::core::error::{RelCacheError, Result};
use crate::core::Id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Model as declared by the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Entity alias of the primary key column
    pub id: String,
    pub table_name: String,
    /// Globally unique alias other models use to reference this one
    #[serde(default)]
    pub alias: Option<String>,
    /// Prefix of every cache key produced for this model
    #[serde(default)]
    pub key_prefix: Option<String>,
    pub columns: Vec<ColumnDefinition>,
}

impl ModelDefinition {
    pub fn new(id: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            table_name: table_name.into(),
            alias: None,
            key_prefix: None,
            columns: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }
}

/// One relational table. Immutable once built.
#[derive(Debug)]
pub struct Model {
    id: String,
    table_name: String,
    alias: Option<String>,
    key_prefix: String,
    columns: Vec<Arc<Column>>,
    columns_by_alias: HashMap<String, usize>,
    columns_by_sql: HashMap<String, usize>,
    columns_by_type: HashMap<SqlType, Vec<usize>>,
    reference_columns: Vec<usize>,
    non_reference_columns: Vec<usize>,
    auto_generated_column: Option<usize>,
}

impl Model {
    /// Build a model, rejecting repeated column names, a second auto generated
    /// column and a missing id column
    pub fn new(definition: ModelDefinition) -> Result<Self> {
        let ModelDefinition {
            id,
            table_name,
            alias,
            key_prefix,
            columns: definitions,
        } = definition;

        let mut columns = Vec::with_capacity(definitions.len());
        let mut columns_by_alias = HashMap::new();
        let mut columns_by_sql = HashMap::new();
        let mut columns_by_type: HashMap<SqlType, Vec<usize>> = HashMap::new();
        let mut reference_columns = Vec::new();
        let mut non_reference_columns = Vec::new();
        let mut auto_generated_column = None;

        for (index, definition) in definitions.into_iter().enumerate() {
            let column = Column::from_definition(definition);

            if column.auto_generation_strategy().is_some() {
                if auto_generated_column.is_some() {
                    return Err(RelCacheError::MultipleAutoGeneratedColumns(table_name));
                }
                auto_generated_column = Some(index);
            }

            for (names, name) in [
                (&mut columns_by_alias, column.entity_alias()),
                (&mut columns_by_sql, column.sql_name()),
            ] {
                if names.insert(name.to_string(), index).is_some() {
                    return Err(RelCacheError::DuplicateColumn {
                        table: table_name,
                        column: name.to_string(),
                    });
                }
            }
            columns_by_type
                .entry(column.sql_type())
                .or_default()
                .push(index);
            if column.is_reference() {
                reference_columns.push(index);
            } else {
                non_reference_columns.push(index);
            }
            columns.push(Arc::new(column));
        }

        if !columns_by_alias.contains_key(&id) {
            return Err(RelCacheError::MissingIdColumn {
                table: table_name,
                id,
            });
        }

        let key_prefix = key_prefix.unwrap_or_else(|| format!("{table_name}::"));

        Ok(Self {
            id,
            table_name,
            alias,
            key_prefix,
            columns,
            columns_by_alias,
            columns_by_sql,
            columns_by_type,
            reference_columns,
            non_reference_columns,
            auto_generated_column,
        })
    }

    /// Entity alias of the primary key
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Columns in declaration order
    pub fn columns(&self) -> impl Iterator<Item = &Arc<Column>> {
        self.columns.iter()
    }

    pub fn column_by_alias(&self, alias: &str) -> Option<&Arc<Column>> {
        self.columns_by_alias.get(alias).map(|&i| &self.columns[i])
    }

    pub fn column_by_sql(&self, sql_name: &str) -> Option<&Arc<Column>> {
        self.columns_by_sql.get(sql_name).map(|&i| &self.columns[i])
    }

    /// Column lookup that fails with a configuration error
    pub fn require_column(&self, alias: &str) -> Result<&Arc<Column>> {
        self.column_by_alias(alias).ok_or_else(|| {
            RelCacheError::UnknownColumn(format!("{}.{}", self.table_name, alias))
        })
    }

    pub fn id_column(&self) -> &Arc<Column> {
        &self.columns[self.columns_by_alias[&self.id]]
    }

    pub fn auto_generated_column(&self) -> Option<&Arc<Column>> {
        self.auto_generated_column.map(|i| &self.columns[i])
    }

    pub fn reference_columns(&self) -> impl Iterator<Item = &Arc<Column>> {
        self.reference_columns.iter().map(|&i| &self.columns[i])
    }

    pub fn non_reference_columns(&self) -> impl Iterator<Item = &Arc<Column>> {
        self.non_reference_columns.iter().map(|&i| &self.columns[i])
    }

    pub fn columns_of_type(&self, sql_type: SqlType) -> impl Iterator<Item = &Arc<Column>> {
        self.columns_by_type
            .get(&sql_type)
            .into_iter()
            .flatten()
            .map(|&i| &self.columns[i])
    }

    /// SQL names of every column, in declaration order
    pub fn sql_column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| column.sql_name().to_string())
            .collect()
    }

    /// Cache key of the entity with the given id
    pub fn entity_key(&self, id: &Id) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}
