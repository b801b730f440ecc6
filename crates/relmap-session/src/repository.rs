//! Repositories: the per-entity-class gateway between the model and storage.
//!
//! A repository owns an [`IdentityMap`] and a [`Mapper`]. It hydrates rows
//! into entities through the identity map, stages persists and removals for
//! the unit of work and commits them on flush.

use crate::collection::EntityIterator;
use crate::entity::EntityHandle;
use crate::identity_map::IdentityMap;
use crate::mapper::Mapper;
use crate::model::Model;
use crate::relationships::OneHasManyMapper;
use crate::schema::MetadataStorage;
use crate::{lock, read, write};
use relmap_core::{
    EntityClass, EntityId, Error, LookupErrorKind, PropertyErrorKind, PropertyMetadata,
    RepositoryId, Result, StateErrorKind, StorageRow, Value,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Entities committed by one flush.
#[derive(Debug, Default, Clone)]
pub struct FlushOutcome {
    pub persisted: Vec<EntityHandle>,
    pub removed: Vec<EntityHandle>,
}

/// The repository contract consumed by the model and relationships.
pub trait Repository: Send + Sync {
    fn id(&self) -> RepositoryId;

    /// Entity classes stored by this repository.
    fn entity_class_names(&self) -> &[EntityClass];

    /// Concrete entity class of a storage row (entity keys).
    fn entity_class_name(&self, row: &StorageRow) -> Result<EntityClass>;

    fn set_model(&self, model: Weak<Model>);

    fn model(&self) -> Result<Arc<Model>>;

    fn mapper(&self) -> Arc<dyn Mapper>;

    fn identity_map(&self) -> &IdentityMap;

    fn attach(&self, entity: &EntityHandle);

    fn detach(&self, entity: &EntityHandle);

    /// Turn a storage row (storage keys) into its entity instance.
    fn hydrate(&self, row: StorageRow) -> Result<Option<EntityHandle>>;

    fn get_by_id(&self, id: &EntityId) -> Result<Option<EntityHandle>>;

    /// Entities for the given identities, in the given order. Unknown and
    /// removed identities are skipped.
    fn get_by_ids(&self, ids: &[EntityId]) -> Result<Arc<EntityIterator>>;

    fn find_all(&self) -> Result<Arc<EntityIterator>>;

    /// Entities whose `property` holds any of `values`.
    fn find_by(&self, property: &str, values: &[Value]) -> Result<Arc<EntityIterator>>;

    /// Shared loader for a one-has-many property targeting this repository.
    fn relationship_mapper(
        &self,
        parent_class: EntityClass,
        property: &PropertyMetadata,
    ) -> Result<Arc<OneHasManyMapper>>;

    fn do_persist(&self, entity: &EntityHandle) -> Result<()>;

    fn do_remove(&self, entity: &EntityHandle) -> Result<()>;

    /// Commit staged writes and hand back what was committed.
    fn do_flush(&self) -> Result<FlushOutcome>;

    /// Forget every entity and discard unflushed writes.
    fn do_clear(&self);

    fn do_refresh_all(&self, allow_overwrite: bool) -> Result<()>;

    fn persist(&self, entity: &EntityHandle, with_cascade: bool) -> Result<EntityHandle> {
        self.model()?.persist(entity, with_cascade)
    }

    fn persist_and_flush(&self, entity: &EntityHandle, with_cascade: bool) -> Result<EntityHandle> {
        self.model()?.persist_and_flush(entity, with_cascade)
    }

    fn remove(&self, entity: &EntityHandle, with_cascade: bool) -> Result<EntityHandle> {
        self.model()?.remove(entity, with_cascade)
    }

    fn remove_and_flush(&self, entity: &EntityHandle, with_cascade: bool) -> Result<EntityHandle> {
        self.model()?.remove_and_flush(entity, with_cascade)
    }

    fn flush(&self) -> Result<()> {
        self.model()?.flush()
    }
}

// ============================================================================
// Repository Events
// ============================================================================

type EntityEventFn = Box<dyn FnMut(&EntityHandle) -> Result<()> + Send>;
type FlushEventFn = Box<dyn FnMut(&[EntityHandle], &[EntityHandle]) -> Result<()> + Send>;

/// Repository lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryEvent {
    /// Fired before an entity is written.
    BeforePersist,
    /// Fired after an entity was written and registered.
    AfterPersist,
    /// Fired before an entity is removed.
    BeforeRemove,
    /// Fired after an entity was removed and detached.
    AfterRemove,
}

/// Registered repository callbacks.
///
/// Returning `Err` from a callback aborts the operation that fired it.
#[derive(Default)]
pub struct RepositoryEventCallbacks {
    before_persist: Vec<EntityEventFn>,
    after_persist: Vec<EntityEventFn>,
    before_remove: Vec<EntityEventFn>,
    after_remove: Vec<EntityEventFn>,
    flush: Vec<FlushEventFn>,
}

impl fmt::Debug for RepositoryEventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryEventCallbacks")
            .field("before_persist", &self.before_persist.len())
            .field("after_persist", &self.after_persist.len())
            .field("before_remove", &self.before_remove.len())
            .field("after_remove", &self.after_remove.len())
            .field("flush", &self.flush.len())
            .finish()
    }
}

impl RepositoryEventCallbacks {
    fn list(&mut self, event: RepositoryEvent) -> &mut Vec<EntityEventFn> {
        match event {
            RepositoryEvent::BeforePersist => &mut self.before_persist,
            RepositoryEvent::AfterPersist => &mut self.after_persist,
            RepositoryEvent::BeforeRemove => &mut self.before_remove,
            RepositoryEvent::AfterRemove => &mut self.after_remove,
        }
    }
}

// ============================================================================
// Entity Repository
// ============================================================================

/// Resolves the concrete class of a polymorphic storage row.
pub type ClassResolver = Box<dyn Fn(&StorageRow) -> Option<EntityClass> + Send + Sync>;

/// The standard repository implementation.
pub struct EntityRepository {
    id: RepositoryId,
    classes: Vec<EntityClass>,
    class_resolver: Option<ClassResolver>,
    mapper: Arc<dyn Mapper>,
    identity_map: IdentityMap,
    model: RwLock<Weak<Model>>,
    to_flush: Mutex<FlushOutcome>,
    relationship_mappers: Mutex<HashMap<String, Arc<OneHasManyMapper>>>,
    events: Mutex<RepositoryEventCallbacks>,
}

impl EntityRepository {
    pub fn new(
        id: RepositoryId,
        classes: &[EntityClass],
        mapper: Arc<dyn Mapper>,
        metadata: Arc<MetadataStorage>,
    ) -> Self {
        Self {
            id,
            classes: classes.to_vec(),
            class_resolver: None,
            mapper,
            identity_map: IdentityMap::new(metadata),
            model: RwLock::new(Weak::new()),
            to_flush: Mutex::new(FlushOutcome::default()),
            relationship_mappers: Mutex::new(HashMap::new()),
            events: Mutex::new(RepositoryEventCallbacks::default()),
        }
    }

    /// Resolve row classes with `resolver`; `None` falls back to the first
    /// declared class.
    #[must_use]
    pub fn with_class_resolver(
        mut self,
        resolver: impl Fn(&StorageRow) -> Option<EntityClass> + Send + Sync + 'static,
    ) -> Self {
        self.class_resolver = Some(Box::new(resolver));
        self
    }

    /// Register a callback for an entity event.
    pub fn on_event(
        &self,
        event: RepositoryEvent,
        callback: impl FnMut(&EntityHandle) -> Result<()> + Send + 'static,
    ) {
        lock(&self.events).list(event).push(Box::new(callback));
    }

    /// Register a callback fired after every flush of this repository.
    pub fn on_flush(
        &self,
        callback: impl FnMut(&[EntityHandle], &[EntityHandle]) -> Result<()> + Send + 'static,
    ) {
        lock(&self.events).flush.push(Box::new(callback));
    }

    /// Numbers of entities staged for persist and removal.
    pub fn pending_counts(&self) -> (usize, usize) {
        let to_flush = lock(&self.to_flush);
        (to_flush.persisted.len(), to_flush.removed.len())
    }

    /// Run the callbacks of `event` with the lock released, so callbacks may
    /// persist, remove or register further callbacks. An event does not fire
    /// again from inside its own callbacks.
    fn fire(&self, event: RepositoryEvent, entity: &EntityHandle) -> Result<()> {
        let mut callbacks = std::mem::take(lock(&self.events).list(event));
        let result = callbacks.iter_mut().try_for_each(|cb| cb(entity));
        let mut events = lock(&self.events);
        let registered = std::mem::replace(events.list(event), callbacks);
        events.list(event).extend(registered);
        result
    }

    fn fire_flush(&self, outcome: &FlushOutcome) -> Result<()> {
        let mut callbacks = std::mem::take(&mut lock(&self.events).flush);
        let result = callbacks
            .iter_mut()
            .try_for_each(|cb| cb(&outcome.persisted, &outcome.removed));
        let mut events = lock(&self.events);
        let registered = std::mem::replace(&mut events.flush, callbacks);
        events.flush.extend(registered);
        result
    }

    /// Rename composite key fields from storage columns to entity properties.
    fn entity_id(&self, id: EntityId) -> EntityId {
        match id {
            EntityId::Composite(fields) => {
                let conventions = self.mapper.conventions();
                EntityId::Composite(
                    fields
                        .into_iter()
                        .map(|(k, v)| (conventions.convert_storage_to_entity_key(&k), v))
                        .collect(),
                )
            }
            scalar @ EntityId::Scalar(_) => scalar,
        }
    }

    fn hydrate_all(&self, rows: Vec<StorageRow>) -> Result<Vec<EntityHandle>> {
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(entity) = self.hydrate(row)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }
}

impl Repository for EntityRepository {
    fn id(&self) -> RepositoryId {
        self.id
    }

    fn entity_class_names(&self) -> &[EntityClass] {
        &self.classes
    }

    fn entity_class_name(&self, row: &StorageRow) -> Result<EntityClass> {
        if let Some(class) = self.class_resolver.as_ref().and_then(|resolve| resolve(row)) {
            return Ok(class);
        }
        self.classes
            .first()
            .copied()
            .ok_or_else(|| Error::lookup(LookupErrorKind::EntityMetadata, self.id.name()))
    }

    fn set_model(&self, model: Weak<Model>) {
        *write(&self.model) = model;
    }

    fn model(&self) -> Result<Arc<Model>> {
        read(&self.model).upgrade().ok_or_else(|| {
            Error::state(
                StateErrorKind::NotAttached,
                format!("Repository {} is not attached to a model.", self.id),
            )
        })
    }

    fn mapper(&self) -> Arc<dyn Mapper> {
        Arc::clone(&self.mapper)
    }

    fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    fn attach(&self, entity: &EntityHandle) {
        let model = read(&self.model).clone();
        entity.on_attach(self.id, model);
    }

    fn detach(&self, entity: &EntityHandle) {
        entity.on_detach();
    }

    fn hydrate(&self, row: StorageRow) -> Result<Option<EntityHandle>> {
        let row = self.mapper.conventions().convert_storage_to_entity(row);
        self.identity_map.create(&row, self)
    }

    fn get_by_id(&self, id: &EntityId) -> Result<Option<EntityHandle>> {
        if self.identity_map.exists(id) {
            return Ok(self.identity_map.get(id));
        }
        match self.mapper.find_by_id(id)? {
            Some(row) => self.hydrate(row),
            None => Ok(None),
        }
    }

    fn get_by_ids(&self, ids: &[EntityId]) -> Result<Arc<EntityIterator>> {
        let missing: Vec<EntityId> = ids
            .iter()
            .filter(|id| !self.identity_map.exists(id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.hydrate_all(self.mapper.find_by_ids(&missing)?)?;
        }
        let entities = ids
            .iter()
            .filter_map(|id| self.identity_map.get(id))
            .collect();
        Ok(EntityIterator::new(entities))
    }

    fn find_all(&self) -> Result<Arc<EntityIterator>> {
        let rows = self.mapper.find_all()?;
        Ok(EntityIterator::new(self.hydrate_all(rows)?))
    }

    fn find_by(&self, property: &str, values: &[Value]) -> Result<Arc<EntityIterator>> {
        let column = self.mapper.conventions().convert_entity_to_storage_key(property);
        let rows = self.mapper.find_by_column(&column, values)?;
        Ok(EntityIterator::new(self.hydrate_all(rows)?))
    }

    fn relationship_mapper(
        &self,
        parent_class: EntityClass,
        property: &PropertyMetadata,
    ) -> Result<Arc<OneHasManyMapper>> {
        let key = format!("{parent_class}::{}", property.name);
        let mut mappers = lock(&self.relationship_mappers);
        if let Some(mapper) = mappers.get(&key) {
            return Ok(Arc::clone(mapper));
        }
        let Some(relationship) = &property.relationship else {
            return Err(Error::property(
                parent_class.name(),
                &property.name,
                PropertyErrorKind::NotARelationship,
            ));
        };
        let Some(inverse) = relationship.property.as_deref() else {
            return Err(Error::Custom(format!(
                "Relationship {parent_class}::${} has no inverse property.",
                property.name
            )));
        };
        let column = self.mapper.conventions().convert_entity_to_storage_key(inverse);
        let mapper = Arc::new(OneHasManyMapper::new(column, relationship.order_by.clone()));
        mappers.insert(key, Arc::clone(&mapper));
        Ok(mapper)
    }

    #[tracing::instrument(level = "debug", skip(self, entity), fields(repository = %self.id))]
    fn do_persist(&self, entity: &EntityHandle) -> Result<()> {
        self.identity_map.check(entity, self)?;
        self.fire(RepositoryEvent::BeforePersist, entity)?;

        if entity.is_modified() {
            let row = self
                .mapper
                .conventions()
                .convert_entity_to_storage(entity.to_storage_row());
            let current = entity.persisted_id();
            let id = self.entity_id(self.mapper.persist(row, current.as_ref())?);
            entity.on_persist(&id);
            tracing::debug!(entity = %entity.class(), id = %id, "Persisted entity");
        }
        self.identity_map.add(entity)?;
        if entity.repository_id() != Some(self.id) {
            self.attach(entity);
        }
        {
            let mut to_flush = lock(&self.to_flush);
            if !to_flush.persisted.iter().any(|e| e.ptr_eq(entity)) {
                to_flush.persisted.push(entity.clone());
            }
        }

        self.fire(RepositoryEvent::AfterPersist, entity)
    }

    #[tracing::instrument(level = "debug", skip(self, entity), fields(repository = %self.id))]
    fn do_remove(&self, entity: &EntityHandle) -> Result<()> {
        self.identity_map.check(entity, self)?;
        self.fire(RepositoryEvent::BeforeRemove, entity)?;

        let removed = entity.persisted_id();
        if let Some(id) = &removed {
            self.mapper.remove(id)?;
            self.identity_map.remove(id);
            tracing::debug!(entity = %entity.class(), id = %id, "Removed entity");
        }
        self.detach(entity);
        entity.on_remove();
        {
            let mut to_flush = lock(&self.to_flush);
            to_flush.persisted.retain(|e| !e.ptr_eq(entity));
            if removed.is_some() && !to_flush.removed.iter().any(|e| e.ptr_eq(entity)) {
                to_flush.removed.push(entity.clone());
            }
        }

        self.fire(RepositoryEvent::AfterRemove, entity)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(repository = %self.id))]
    fn do_flush(&self) -> Result<FlushOutcome> {
        self.mapper.flush()?;
        let outcome = std::mem::take(&mut *lock(&self.to_flush));
        self.fire_flush(&outcome)?;
        tracing::debug!(
            persisted = outcome.persisted.len(),
            removed = outcome.removed.len(),
            "Repository flushed"
        );
        Ok(outcome)
    }

    fn do_clear(&self) {
        self.identity_map.destroy_all(self);
        self.mapper.clear_cache();
        self.mapper.rollback();
        *lock(&self.to_flush) = FlushOutcome::default();
        lock(&self.relationship_mappers).clear();
    }

    #[tracing::instrument(level = "debug", skip(self), fields(repository = %self.id))]
    fn do_refresh_all(&self, allow_overwrite: bool) -> Result<()> {
        let entities = self.identity_map.all_live();
        if !allow_overwrite {
            if let Some(modified) = entities.iter().find(|e| e.is_modified()) {
                return Err(Error::state(
                    StateErrorKind::ModifiedEntity,
                    format!(
                        "Cannot refresh modified {} entity without overwrite.",
                        modified.class()
                    ),
                ));
            }
        }

        let mut ids = Vec::with_capacity(entities.len());
        for entity in &entities {
            self.identity_map.mark_for_refresh(entity);
            if let Some(id) = entity.persisted_id() {
                ids.push(id);
            }
        }
        if !ids.is_empty() {
            self.hydrate_all(self.mapper.find_by_ids(&ids)?)?;
        }

        let mut vanished = 0_usize;
        for entity in &entities {
            if self.identity_map.is_marked_for_refresh(entity) {
                self.detach(entity);
                if let Some(id) = entity.persisted_id() {
                    self.identity_map.remove(&id);
                }
                vanished += 1;
            }
        }
        tracing::debug!(refreshed = entities.len() - vanished, vanished, "Repository refreshed");
        Ok(())
    }
}

impl fmt::Debug for EntityRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRepository")
            .field("id", &self.id)
            .field("classes", &self.classes)
            .field("identity_map", &self.identity_map)
            .finish_non_exhaustive()
    }
}
