use super::primary::PrimaryModelManager;
use super::secondary::SecondaryEntityManager;
use crate::core::error::Result;
use crate::core::{Entity, Id, PersistencyOptions};
use crate::model::{Model, Reference};
use crate::query::{QueryConfig, QueryParams, QueryResult};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Single entry point for the writes and reads of one model.
///
/// Writes go to the durable store first and reach the cache only once the
/// durable write succeeded. A failed durable write leaves the cache
/// untouched. A layer that is absent or skipped by the call's options does
/// not participate.
pub struct SchedulerModelManager {
    model: Arc<Model>,
    primary: Option<Arc<dyn PrimaryModelManager>>,
    secondary: Option<Arc<SecondaryEntityManager>>,
}

impl SchedulerModelManager {
    pub fn new(
        model: Arc<Model>,
        primary: Option<Arc<dyn PrimaryModelManager>>,
        secondary: Option<Arc<SecondaryEntityManager>>,
    ) -> Self {
        Self {
            model,
            primary,
            secondary,
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub async fn insert(&self, entity: &mut Entity, options: &PersistencyOptions) -> Result<()> {
        debug!("Scheduling insert on {}", self.model.table_name());
        if let Some(secondary) = self.secondary_for(options) {
            secondary.insert(entity).await?;
        }
        let entity = &*entity;
        self.to_primary("insert", options, |primary| async move {
            primary.update(entity, options).await
        })
        .await
    }

    pub async fn m_insert(&self, entities: &mut [Entity], options: &PersistencyOptions) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        debug!(
            "Scheduling insert of {} entities on {}",
            entities.len(),
            self.model.table_name()
        );
        if let Some(secondary) = self.secondary_for(options) {
            secondary.m_insert(entities).await?;
        }
        let entities = &*entities;
        self.to_primary("m_insert", options, |primary| async move {
            primary.m_update(entities, options).await
        })
        .await
    }

    pub async fn update(&self, entity: &Entity, options: &PersistencyOptions) -> Result<()> {
        debug!("Scheduling update on {}", self.model.table_name());
        if let Some(secondary) = self.secondary_for(options) {
            secondary.update(entity).await?;
        }
        self.to_primary("update", options, |primary| async move {
            primary.update(entity, options).await
        })
        .await
    }

    pub async fn m_update(&self, entities: &[Entity], options: &PersistencyOptions) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        debug!(
            "Scheduling update of {} entities on {}",
            entities.len(),
            self.model.table_name()
        );
        if let Some(secondary) = self.secondary_for(options) {
            secondary.m_update(entities).await?;
        }
        self.to_primary("m_update", options, |primary| async move {
            primary.m_update(entities, options).await
        })
        .await
    }

    pub async fn delete(&self, id: &Id, options: &PersistencyOptions) -> Result<()> {
        debug!("Scheduling delete on {} id={}", self.model.table_name(), id);
        if let Some(secondary) = self.secondary_for(options) {
            secondary.delete(id).await?;
        }
        self.to_primary("delete", options, |primary| async move {
            primary.delete(id, options).await
        })
        .await
    }

    pub async fn m_delete(&self, ids: &[Id], options: &PersistencyOptions) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        debug!(
            "Scheduling delete of {} ids on {}",
            ids.len(),
            self.model.table_name()
        );
        if let Some(secondary) = self.secondary_for(options) {
            secondary.m_delete(ids).await?;
        }
        self.to_primary("m_delete", options, |primary| async move {
            primary.m_delete(ids, options).await
        })
        .await
    }

    pub async fn get(&self, id: &Id) -> Result<Option<Entity>> {
        match (&self.primary, &self.secondary) {
            (Some(primary), _) => primary.get(id).await,
            (None, Some(secondary)) => secondary.get_by_id(id).await,
            (None, None) => Ok(None),
        }
    }

    pub async fn m_get(&self, ids: &[Id]) -> Result<Vec<Entity>> {
        match (&self.primary, &self.secondary) {
            (Some(primary), _) => primary.m_get(ids).await,
            (None, Some(secondary)) => secondary.get_by_ids(ids).await,
            (None, None) => Ok(Vec::new()),
        }
    }

    /// Ids matching a query, served from the cache layer when present
    pub async fn query(&self, config: &QueryConfig, params: Option<&QueryParams>) -> Result<QueryResult> {
        match &self.primary {
            Some(primary) => primary.query(config, params).await,
            None => config.query(params).await,
        }
    }

    pub async fn m_query(&self, config: &QueryConfig, params: &[QueryParams]) -> Result<Vec<QueryResult>> {
        match &self.primary {
            Some(primary) => primary.m_query(config, params).await,
            None => config.m_query(params).await,
        }
    }

    /// Entities matching a query, in result order
    pub async fn query_entities(&self, config: &QueryConfig, params: Option<&QueryParams>) -> Result<Vec<Entity>> {
        let ids = self.query(config, params).await?.ids();
        self.m_get(&ids).await
    }

    /// Track a query in the cache layer so writes invalidate its results
    pub fn register_query(&self, config: QueryConfig) {
        if let Some(primary) = &self.primary {
            primary.register_query(config);
        }
    }

    /// Lazy handle to the entity with the given id
    pub fn get_reference(&self, id: impl Into<Id>) -> Reference {
        Reference::new(id, Arc::clone(&self.model))
    }

    fn secondary_for(&self, options: &PersistencyOptions) -> Option<&SecondaryEntityManager> {
        if options.skip_secondary() {
            debug!("Durable store skipped on {}", self.model.table_name());
            return None;
        }
        self.secondary.as_deref()
    }

    /// Apply the cache step of a write whose durable step already succeeded
    async fn to_primary<'a, F, Fut>(&'a self, operation: &str, options: &PersistencyOptions, write: F) -> Result<()>
    where
        F: FnOnce(&'a dyn PrimaryModelManager) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if options.skip_primary() {
            debug!("Cache skipped for {} on {}", operation, self.model.table_name());
            return Ok(());
        }
        let Some(primary) = self.primary.as_deref() else {
            return Ok(());
        };
        write(primary).await.inspect_err(|e| {
            warn!(
                "Cache {} on {} failed after the durable write: {}",
                operation,
                self.model.table_name(),
                e
            );
        })
    }
}
