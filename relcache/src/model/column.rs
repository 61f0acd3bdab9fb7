use super::Model;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, Weak};

/// Column value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    Integer,
    String,
    Boolean,
    Date,
}

impl SqlType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer)
    }
}

/// Server-side key generation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoGenerationStrategy {
    AutoIncrement,
}

/// Column as declared by the application when registering a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Name of the field in the entities managed
    pub entity_alias: String,
    /// Name of the column at the SQL server
    pub sql_name: String,
    #[serde(rename = "type")]
    pub sql_type: SqlType,
    #[serde(default)]
    pub auto_generation_strategy: Option<AutoGenerationStrategy>,
    /// Alias of the model this column references
    #[serde(default)]
    pub ref_alias: Option<String>,
}

impl ColumnDefinition {
    pub fn new(entity_alias: impl Into<String>, sql_name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            entity_alias: entity_alias.into(),
            sql_name: sql_name.into(),
            sql_type,
            auto_generation_strategy: None,
            ref_alias: None,
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_generation_strategy = Some(AutoGenerationStrategy::AutoIncrement);
        self
    }

    pub fn references(mut self, model_alias: impl Into<String>) -> Self {
        self.ref_alias = Some(model_alias.into());
        self
    }
}

/// Registered column. The referenced model is filled in by the registry once
/// a model with `ref_alias` is registered; it is a back-reference, not ownership.
#[derive(Debug)]
pub struct Column {
    entity_alias: String,
    sql_name: String,
    sql_type: SqlType,
    auto_generation_strategy: Option<AutoGenerationStrategy>,
    ref_alias: Option<String>,
    ref_model: OnceLock<Weak<Model>>,
}

impl Column {
    pub fn from_definition(definition: ColumnDefinition) -> Self {
        Self {
            entity_alias: definition.entity_alias,
            sql_name: definition.sql_name,
            sql_type: definition.sql_type,
            auto_generation_strategy: definition.auto_generation_strategy,
            ref_alias: definition.ref_alias,
            ref_model: OnceLock::new(),
        }
    }

    pub fn entity_alias(&self) -> &str {
        &self.entity_alias
    }

    pub fn sql_name(&self) -> &str {
        &self.sql_name
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    pub fn auto_generation_strategy(&self) -> Option<AutoGenerationStrategy> {
        self.auto_generation_strategy
    }

    pub fn ref_alias(&self) -> Option<&str> {
        self.ref_alias.as_deref()
    }

    pub fn is_reference(&self) -> bool {
        self.ref_alias.is_some()
    }

    /// Referenced model, if already registered and still alive
    pub fn ref_model(&self) -> Option<Arc<Model>> {
        self.ref_model.get().and_then(Weak::upgrade)
    }

    pub fn is_resolved(&self) -> bool {
        self.ref_model.get().is_some()
    }

    /// Bind the referenced model. Returns false if the column was already bound.
    pub(crate) fn resolve(&self, model: &Arc<Model>) -> bool {
        self.ref_model.set(Arc::downgrade(model)).is_ok()
    }
}
