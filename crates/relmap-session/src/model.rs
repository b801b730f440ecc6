//! The model: unit-of-work coordinator across repositories.
//!
//! The model resolves repositories by name, identity or entity class through a
//! [`RepositoryLoader`], plans cascaded persists and removals and flushes every
//! repository that has been materialized.

use crate::cascade::{CascadeItem, persistence_queue, removal_queues};
use crate::entity::EntityHandle;
use crate::loader::RepositoryLoader;
use crate::lock;
use crate::repository::{FlushOutcome, Repository};
use crate::schema::MetadataStorage;
use relmap_core::{EntityClass, Error, LookupErrorKind, RepositoryId, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Callback invoked once per flush with every persisted and removed entity.
pub type FlushCallback = Box<dyn FnMut(&[EntityHandle], &[EntityHandle]) + Send>;

/// Static model configuration: which repositories exist and which entity
/// classes they own.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// Repositories in declaration order.
    repositories: Vec<RepositoryId>,
    names: HashMap<String, RepositoryId>,
    entities: HashMap<EntityClass, RepositoryId>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Repositories in declaration order.
    pub fn repositories(&self) -> &[RepositoryId] {
        &self.repositories
    }

    pub fn repository_id_by_name(&self, name: &str) -> Option<RepositoryId> {
        self.names.get(name).copied()
    }

    pub fn repository_id_for_class(&self, class: EntityClass) -> Option<RepositoryId> {
        self.entities.get(&class).copied()
    }

    pub fn contains(&self, id: RepositoryId) -> bool {
        self.repositories.contains(&id)
    }
}

/// Builder for [`Configuration`].
#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    configuration: Configuration,
}

impl ConfigurationBuilder {
    /// Declare a repository, its name and the entity classes it stores.
    #[must_use]
    pub fn repository(mut self, name: &str, id: RepositoryId, classes: &[EntityClass]) -> Self {
        let configuration = &mut self.configuration;
        if !configuration.repositories.contains(&id) {
            configuration.repositories.push(id);
        }
        configuration.names.insert(name.to_string(), id);
        for class in classes {
            configuration.entities.insert(*class, id);
        }
        self
    }

    pub fn build(self) -> Configuration {
        self.configuration
    }
}

/// Unit-of-work coordinator.
pub struct Model {
    this: Weak<Model>,
    configuration: Configuration,
    loader: Arc<dyn RepositoryLoader>,
    metadata: Arc<MetadataStorage>,
    on_flush: Mutex<Vec<FlushCallback>>,
}

impl Model {
    pub fn new(
        configuration: Configuration,
        loader: Arc<dyn RepositoryLoader>,
        metadata: Arc<MetadataStorage>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            configuration,
            loader,
            metadata,
            on_flush: Mutex::new(Vec::new()),
        })
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn metadata_storage(&self) -> &Arc<MetadataStorage> {
        &self.metadata
    }

    /// Register a callback fired once per [`Model::flush`].
    pub fn on_flush(&self, callback: impl FnMut(&[EntityHandle], &[EntityHandle]) + Send + 'static) {
        lock(&self.on_flush).push(Box::new(callback));
    }

    // ------------------------------------------------------------------
    // Repository lookup
    // ------------------------------------------------------------------

    pub fn has_repository_by_name(&self, name: &str) -> bool {
        self.configuration.repository_id_by_name(name).is_some()
    }

    pub fn repository_by_name(&self, name: &str) -> Result<Arc<dyn Repository>> {
        let id = self
            .configuration
            .repository_id_by_name(name)
            .ok_or_else(|| Error::lookup(LookupErrorKind::RepositoryName, name))?;
        self.repository(id)
    }

    pub fn has_repository(&self, id: RepositoryId) -> bool {
        self.configuration.contains(id) && self.loader.has_repository(id)
    }

    /// Get a repository, materializing it and attaching it to this model.
    pub fn repository(&self, id: RepositoryId) -> Result<Arc<dyn Repository>> {
        if !self.has_repository(id) {
            return Err(Error::lookup(LookupErrorKind::RepositoryClass, id.name()));
        }
        let repository = self.loader.get_repository(id)?;
        repository.set_model(self.this.clone());
        Ok(repository)
    }

    /// The repository owning an entity class.
    pub fn repository_for_class(&self, class: EntityClass) -> Result<Arc<dyn Repository>> {
        let id = self
            .configuration
            .repository_id_for_class(class)
            .ok_or_else(|| Error::lookup(LookupErrorKind::EntityRepository, class.name()))?;
        self.repository(id)
    }

    /// The repository owning an entity instance's class.
    pub fn repository_for_entity(&self, entity: &EntityHandle) -> Result<Arc<dyn Repository>> {
        self.repository_for_class(entity.class())
    }

    /// Repositories materialized so far, in declaration order.
    pub fn loaded_repositories(&self) -> Result<Vec<Arc<dyn Repository>>> {
        self.configuration
            .repositories
            .iter()
            .filter(|id| self.loader.is_created(**id))
            .map(|id| self.repository(*id))
            .collect()
    }

    /// Create a new, unpersisted entity attached to its repository.
    pub fn create_entity(&self, class: EntityClass) -> Result<EntityHandle> {
        let entity = EntityHandle::new(self.metadata.get(class)?);
        self.repository_for_class(class)?.attach(&entity);
        Ok(entity)
    }

    // ------------------------------------------------------------------
    // Unit of work
    // ------------------------------------------------------------------

    fn stage(&self, item: &CascadeItem) -> Result<()> {
        match item {
            CascadeItem::Entity(entity) => self.repository_for_entity(entity)?.do_persist(entity),
            CascadeItem::Collection(collection) => {
                collection.do_persist();
                Ok(())
            }
        }
    }

    /// Stage an entity (and, with cascade, its reachable graph) for persist.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.class()))]
    pub fn persist(&self, entity: &EntityHandle, with_cascade: bool) -> Result<EntityHandle> {
        let queue = persistence_queue(entity, self, with_cascade)?;
        tracing::debug!(items = queue.len(), "Persist queue planned");
        for item in &queue {
            self.stage(item)?;
        }
        Ok(entity.clone())
    }

    pub fn persist_and_flush(&self, entity: &EntityHandle, with_cascade: bool) -> Result<EntityHandle> {
        let entity = self.persist(entity, with_cascade)?;
        self.flush()?;
        Ok(entity)
    }

    /// Stage an entity (and, with cascade, its dependents) for removal.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.class()))]
    pub fn remove(&self, entity: &EntityHandle, with_cascade: bool) -> Result<EntityHandle> {
        let plan = removal_queues(entity, self, with_cascade)?;
        tracing::debug!(
            persist = plan.persist.len(),
            remove = plan.remove.len(),
            "Removal queues planned"
        );
        for item in &plan.persist {
            self.stage(item)?;
        }
        for entity in &plan.remove {
            self.repository_for_entity(entity)?.do_remove(entity)?;
        }
        Ok(entity.clone())
    }

    pub fn remove_and_flush(&self, entity: &EntityHandle, with_cascade: bool) -> Result<EntityHandle> {
        let entity = self.remove(entity, with_cascade)?;
        self.flush()?;
        Ok(entity)
    }

    /// Flush every materialized repository, then notify flush subscribers
    /// once with the aggregated results.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&self) -> Result<()> {
        let mut total = FlushOutcome::default();
        for repository in self.loaded_repositories()? {
            let outcome = repository.do_flush()?;
            total.persisted.extend(outcome.persisted);
            total.removed.extend(outcome.removed);
        }
        tracing::debug!(
            persisted = total.persisted.len(),
            removed = total.removed.len(),
            "Model flushed"
        );
        // Run without the lock so callbacks may register further callbacks.
        let mut callbacks = std::mem::take(&mut *lock(&self.on_flush));
        for callback in &mut callbacks {
            callback(&total.persisted, &total.removed);
        }
        let mut on_flush = lock(&self.on_flush);
        let registered = std::mem::replace(&mut *on_flush, callbacks);
        on_flush.extend(registered);
        Ok(())
    }

    /// Reset every materialized repository.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn clear(&self) -> Result<()> {
        for repository in self.loaded_repositories()? {
            repository.do_clear();
        }
        Ok(())
    }

    /// Re-fetch every live entity of every materialized repository.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn refresh_all(&self, allow_overwrite: bool) -> Result<()> {
        for repository in self.loaded_repositories()? {
            repository.do_refresh_all(allow_overwrite)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("configuration", &self.configuration)
            .field("on_flush", &lock(&self.on_flush).len())
            .finish_non_exhaustive()
    }
}
