use super::Model;
use crate::core::error::{RelCacheError, Result};
use crate::core::{Entity, Id};
use std::fmt;
use std::sync::Arc;

/// Lazy handle to another model's entity.
///
/// `id` is always set; `entity` is an optional materialized copy. The two are
/// caches of the same fact: assigning an entity rewrites the id from the
/// entity's own id field, assigning an id drops the entity.
#[derive(Clone)]
pub struct Reference {
    id: Id,
    entity: Option<Box<Entity>>,
    model: Option<Arc<Model>>,
    model_alias: Option<String>,
}

impl Reference {
    /// Reference bound to a known model
    pub fn new(id: impl Into<Id>, model: Arc<Model>) -> Self {
        let model_alias = model.alias().map(str::to_string);
        Self {
            id: id.into(),
            entity: None,
            model: Some(model),
            model_alias,
        }
    }

    /// Reference created from a column whose target model may not be registered yet
    pub(crate) fn for_column(id: Id, model: Option<Arc<Model>>, model_alias: Option<&str>) -> Self {
        Self {
            id,
            entity: None,
            model,
            model_alias: model_alias.map(str::to_string),
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Set the referenced id, discarding any materialized entity
    pub fn set_id(&mut self, id: impl Into<Id>) {
        self.entity = None;
        self.id = id.into();
    }

    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_deref()
    }

    /// Materialize the referenced entity. The id is taken from the entity itself.
    pub fn set_entity(&mut self, entity: Entity) -> Result<()> {
        if entity.is_empty() {
            return Err(RelCacheError::EmptyReferenceEntity);
        }
        let model = self.model.as_ref().ok_or_else(|| {
            RelCacheError::UnresolvedReference(
                self.model_alias.clone().unwrap_or_else(|| "<none>".to_string()),
            )
        })?;
        let id = entity.id(model).ok_or_else(|| {
            RelCacheError::InvalidValue(format!(
                "referenced entity has no id field \"{}\"",
                model.id()
            ))
        })?;

        self.id = id;
        self.entity = Some(Box::new(entity));
        Ok(())
    }

    /// Referenced model, if resolved
    pub fn model(&self) -> Option<&Arc<Model>> {
        self.model.as_ref()
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.entity == other.entity
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.id)
            .field("entity", &self.entity)
            .field("model", &self.model.as_ref().map(|m| m.table_name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDefinition, ModelDefinition, SqlType};

    fn team_model() -> Arc<Model> {
        let definition = ModelDefinition::new("id", "teams")
            .with_alias("team")
            .column(ColumnDefinition::new("id", "id", SqlType::Integer))
            .column(ColumnDefinition::new("name", "name", SqlType::String));
        Arc::new(Model::new(definition).unwrap())
    }

    #[test]
    fn test_set_entity_updates_id() {
        let mut reference = Reference::new(1, team_model());
        reference
            .set_entity(Entity::new().with("id", 2).with("name", "blue"))
            .unwrap();

        assert_eq!(reference.id(), &Id::Integer(2));
        assert_eq!(reference.entity().unwrap().id(reference.model().unwrap()), Some(Id::Integer(2)));
    }

    #[test]
    fn test_set_id_clears_entity() {
        let mut reference = Reference::new(1, team_model());
        reference.set_entity(Entity::new().with("id", 1)).unwrap();
        assert!(reference.entity().is_some());

        reference.set_id(3);
        assert!(reference.entity().is_none());
        assert_eq!(reference.id(), &Id::Integer(3));
    }

    #[test]
    fn test_empty_entity_fails() {
        let mut reference = Reference::new(1, team_model());
        let err = reference.set_entity(Entity::new()).unwrap_err();

        assert!(matches!(err, RelCacheError::EmptyReferenceEntity));
        assert_eq!(reference.id(), &Id::Integer(1));
        assert!(reference.entity().is_none());
    }

    #[test]
    fn test_entity_without_id_fails() {
        let mut reference = Reference::new(1, team_model());
        let err = reference
            .set_entity(Entity::new().with("name", "red"))
            .unwrap_err();

        assert!(matches!(err, RelCacheError::InvalidValue(_)));
        assert!(reference.entity().is_none());
    }

    #[test]
    fn test_unresolved_reference_cannot_materialize() {
        let mut reference = Reference::for_column(Id::Integer(1), None, Some("team"));
        let err = reference.set_entity(Entity::new().with("id", 1)).unwrap_err();

        assert!(matches!(err, RelCacheError::UnresolvedReference(alias) if alias == "team"));
    }
}
