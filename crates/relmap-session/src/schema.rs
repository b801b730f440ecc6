//! Entity schemas: metadata plus lifecycle hooks, keyed by entity class.

use crate::entity::EntityHandle;
use relmap_core::{EntityClass, EntityId, EntityMetadata, Error, LookupErrorKind, Result, StorageRow};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle hooks fired by the engine on entity state transitions.
///
/// All hooks have empty defaults. They run after the engine has released the
/// entity's lock, so a hook may freely read or modify the entity.
#[allow(unused_variables)]
pub trait EntityLifecycle: Send + Sync {
    /// Called once after a new instance is hydrated from storage.
    fn on_load(&self, entity: &EntityHandle, row: &StorageRow) {}

    /// Called after a live instance is overwritten by a refresh.
    fn on_refresh(&self, entity: &EntityHandle, row: &StorageRow) {}

    /// Called when the entity is attached to a repository.
    fn on_attach(&self, entity: &EntityHandle) {}

    /// Called when the entity is detached from its repository.
    fn on_detach(&self, entity: &EntityHandle) {}

    /// Called after the storage layer assigned or confirmed the identity.
    fn on_persist(&self, entity: &EntityHandle, id: &EntityId) {}

    /// Called after the entity was removed.
    fn on_remove(&self, entity: &EntityHandle) {}

    /// Called when the owning repository is cleared.
    fn on_free(&self, entity: &EntityHandle) {}
}

/// Metadata and hooks shared by every entity of one class.
pub struct EntitySchema {
    pub metadata: Arc<EntityMetadata>,
    pub lifecycle: Option<Arc<dyn EntityLifecycle>>,
}

impl EntitySchema {
    pub fn class(&self) -> EntityClass {
        self.metadata.class
    }
}

impl fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySchema")
            .field("class", &self.metadata.class)
            .field("has_lifecycle", &self.lifecycle.is_some())
            .finish()
    }
}

/// Registry of entity schemas.
#[derive(Debug, Default)]
pub struct MetadataStorage {
    schemas: HashMap<EntityClass, Arc<EntitySchema>>,
}

impl MetadataStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity class without lifecycle hooks.
    #[must_use]
    pub fn register(self, metadata: EntityMetadata) -> Self {
        self.insert(metadata, None)
    }

    /// Register an entity class with lifecycle hooks.
    #[must_use]
    pub fn register_with_lifecycle(
        self,
        metadata: EntityMetadata,
        lifecycle: Arc<dyn EntityLifecycle>,
    ) -> Self {
        self.insert(metadata, Some(lifecycle))
    }

    fn insert(mut self, metadata: EntityMetadata, lifecycle: Option<Arc<dyn EntityLifecycle>>) -> Self {
        let schema = EntitySchema {
            metadata: Arc::new(metadata),
            lifecycle,
        };
        self.schemas.insert(schema.class(), Arc::new(schema));
        self
    }

    /// Get the schema of an entity class.
    pub fn get(&self, class: EntityClass) -> Result<Arc<EntitySchema>> {
        self.schemas
            .get(&class)
            .cloned()
            .ok_or_else(|| Error::lookup(LookupErrorKind::EntityMetadata, class.name()))
    }

    /// Get the metadata of an entity class.
    pub fn metadata(&self, class: EntityClass) -> Result<Arc<EntityMetadata>> {
        self.get(class).map(|schema| Arc::clone(&schema.metadata))
    }

    pub fn contains(&self, class: EntityClass) -> bool {
        self.schemas.contains_key(&class)
    }
}
