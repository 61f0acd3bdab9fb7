use super::column::Column;
use super::sql_model::{Model, ModelDefinition};
use crate::core::error::{RelCacheError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Holds every registered model and resolves references between them.
///
/// Models may be registered in any order. A reference column whose target
/// alias is not registered yet waits in `pending_references_by_alias` until a
/// model with that alias shows up. Registration happens during startup,
/// before traffic is served, so the registry is mutated through `&mut self`.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: Vec<Arc<Model>>,
    alias_to_model: HashMap<String, Arc<Model>>,
    pending_references_by_alias: HashMap<String, Vec<Arc<Column>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a model from its definition
    pub fn register(&mut self, definition: ModelDefinition) -> Result<Arc<Model>> {
        let model = Model::new(definition)?;
        self.register_model(model)
    }

    /// Register an already built model
    pub fn register_model(&mut self, model: Model) -> Result<Arc<Model>> {
        if let Some(alias) = model.alias() {
            if self.alias_to_model.contains_key(alias) {
                return Err(RelCacheError::DuplicateAlias(alias.to_string()));
            }
        }

        let model = Arc::new(model);
        info!(
            "Registering model table={}, alias={:?}",
            model.table_name(),
            model.alias()
        );

        for column in model.reference_columns() {
            let Some(ref_alias) = column.ref_alias() else {
                continue;
            };
            match self.alias_to_model.get(ref_alias) {
                Some(target) => {
                    column.resolve(target);
                }
                None => {
                    debug!(
                        "Column {}.{} waits for alias {}",
                        model.table_name(),
                        column.entity_alias(),
                        ref_alias
                    );
                    self.pending_references_by_alias
                        .entry(ref_alias.to_string())
                        .or_default()
                        .push(Arc::clone(column));
                }
            }
        }

        if let Some(alias) = model.alias() {
            if let Some(pending) = self.pending_references_by_alias.remove(alias) {
                debug!("Resolving {} pending references to alias {}", pending.len(), alias);
                for column in pending {
                    column.resolve(&model);
                }
            }
            self.alias_to_model
                .insert(alias.to_string(), Arc::clone(&model));
        }

        self.models.push(Arc::clone(&model));
        Ok(model)
    }

    pub fn get_by_alias(&self, alias: &str) -> Option<&Arc<Model>> {
        self.alias_to_model.get(alias)
    }

    pub fn get_by_table(&self, table_name: &str) -> Option<&Arc<Model>> {
        self.models
            .iter()
            .find(|model| model.table_name() == table_name)
    }

    /// Registered models in registration order
    pub fn models(&self) -> &[Arc<Model>] {
        &self.models
    }

    /// Aliases some column is still waiting for
    pub fn pending_aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self
            .pending_references_by_alias
            .keys()
            .map(String::as_str)
            .collect();
        aliases.sort_unstable();
        aliases
    }

    /// True once no reference column is waiting for a model
    pub fn is_resolved(&self) -> bool {
        self.pending_references_by_alias.is_empty()
    }
}
