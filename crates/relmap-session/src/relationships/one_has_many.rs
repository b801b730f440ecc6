//! One-to-many relationship collection.

use super::mapper::{OneHasManyMapper, RelationshipCollection};
use super::{
    EntitySet, ReverseUpdateGuard, check_target, is_updating, sort_entities, upgrade_parent,
};
use crate::collection::EntityIterator;
use crate::entity::{EntityHandle, WeakEntityHandle};
use crate::lock;
use relmap_core::{EntityClass, EntityId, PropertyMetadata, RelationshipMetadata, Result};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};

#[derive(Default)]
struct HasManyState {
    /// Members known to be stored under the parent.
    tracked: EntitySet,
    /// Members added since the last persist.
    to_add: EntitySet,
    /// Members removed since the last persist.
    to_remove: EntitySet,
    modified: bool,
    /// Materialized view, dropped on every change.
    collection: Option<Arc<EntityIterator>>,
    relationship_mapper: Option<Arc<OneHasManyMapper>>,
    was_loaded: bool,
}

/// Collection wrapper of a one-has-many property.
///
/// Changes are staged in memory (`to_add` / `to_remove`) and reconciled with
/// the stored members when the collection is read. Adding or removing a
/// member also updates the member's inverse reference.
pub struct OneHasMany {
    this: Weak<OneHasMany>,
    parent: WeakEntityHandle,
    parent_class: EntityClass,
    property: Arc<PropertyMetadata>,
    relationship: RelationshipMetadata,
    state: Mutex<HasManyState>,
    updating_reverse: AtomicBool,
}

impl OneHasMany {
    pub(crate) fn new(
        parent: WeakEntityHandle,
        parent_class: EntityClass,
        property: Arc<PropertyMetadata>,
        relationship: RelationshipMetadata,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            parent,
            parent_class,
            property,
            relationship,
            state: Mutex::new(HasManyState::default()),
            updating_reverse: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.property.name
    }

    pub fn relationship(&self) -> &RelationshipMetadata {
        &self.relationship
    }

    fn parent(&self) -> Result<EntityHandle> {
        upgrade_parent(&self.parent, self.parent_class)
    }

    fn check(&self, parent: &EntityHandle, entity: &EntityHandle) -> Result<()> {
        check_target(
            parent,
            self.parent_class,
            &self.property.name,
            self.relationship.entity,
            entity,
        )
    }

    /// Add a member. Cancels a pending removal of the same entity.
    ///
    /// Returns `None` when ignored during an inverse update.
    pub fn add(&self, entity: &EntityHandle) -> Result<Option<EntityHandle>> {
        if is_updating(&self.updating_reverse) {
            return Ok(None);
        }
        let parent = self.parent()?;
        self.check(&parent, entity)?;
        {
            let mut state = lock(&self.state);
            if state.to_remove.remove(entity) {
                state.tracked.insert(entity.clone());
            } else if !state.tracked.contains(entity) {
                state.to_add.insert(entity.clone());
            }
            state.modified = true;
            state.collection = None;
        }
        self.update_relationship_add(&parent, entity)?;
        Ok(Some(entity.clone()))
    }

    /// Add a member by its identity, looked up in the target repository.
    pub fn add_by_id(&self, id: impl Into<EntityId>) -> Result<Option<EntityHandle>> {
        let model = self.parent()?.model()?;
        let repository = model.repository_for_class(self.relationship.entity)?;
        match repository.get_by_id(&id.into())? {
            Some(entity) => self.add(&entity),
            None => Ok(None),
        }
    }

    /// Remove a member. Cancels a pending addition of the same entity.
    ///
    /// Returns `None` when ignored during an inverse update.
    pub fn remove(&self, entity: &EntityHandle) -> Result<Option<EntityHandle>> {
        if is_updating(&self.updating_reverse) {
            return Ok(None);
        }
        let parent = self.parent()?;
        self.check(&parent, entity)?;
        {
            let mut state = lock(&self.state);
            if !state.to_add.remove(entity) {
                state.tracked.remove(entity);
                state.to_remove.insert(entity.clone());
            }
            state.modified = true;
            state.collection = None;
        }
        self.update_relationship_remove(entity)?;
        Ok(Some(entity.clone()))
    }

    /// Replace the members with `entities`.
    pub fn set(&self, entities: &[EntityHandle]) -> Result<()> {
        let current = self.to_vec()?;
        for entity in &current {
            if !entities.iter().any(|e| e.ptr_eq(entity)) {
                self.remove(entity)?;
            }
        }
        for entity in entities {
            if !current.iter().any(|e| e.ptr_eq(entity)) {
                self.add(entity)?;
            }
        }
        Ok(())
    }

    pub fn has(&self, entity: &EntityHandle) -> Result<bool> {
        {
            let state = lock(&self.state);
            if state.to_add.contains(entity) || state.tracked.contains(entity) {
                return Ok(true);
            }
            if state.to_remove.contains(entity) {
                return Ok(false);
            }
        }
        Ok(self.get()?.iter().any(|e| e.ptr_eq(entity)))
    }

    /// The materialized collection: stored members plus pending additions,
    /// minus pending removals, in the relationship's default order.
    pub fn get(&self) -> Result<Arc<EntityIterator>> {
        if let Some(collection) = lock(&self.state).collection.clone() {
            return Ok(collection);
        }
        let parent = self.parent()?;
        let stored = if parent.is_persisted() && parent.is_attached() {
            Some(self.fetch_from_storage(&parent)?)
        } else {
            None
        };

        let (to_add, to_remove) = {
            let state = lock(&self.state);
            (state.to_add.clone(), state.to_remove.clone())
        };
        let view = match stored {
            Some(stored) if to_add.is_empty() && to_remove.is_empty() => stored,
            stored => {
                let mut entities = stored.map(|s| s.entities()).unwrap_or_default();
                for entity in to_add.iter() {
                    if !entities.iter().any(|e| e.ptr_eq(entity)) {
                        entities.push(entity.clone());
                    }
                }
                entities.retain(|e| !to_remove.contains(e));
                sort_entities(&mut entities, self.relationship.order_by.as_ref());
                EntityIterator::new(entities)
            }
        };

        let mut state = lock(&self.state);
        state.collection = Some(Arc::clone(&view));
        state.was_loaded = true;
        Ok(view)
    }

    fn fetch_from_storage(&self, parent: &EntityHandle) -> Result<Arc<EntityIterator>> {
        let model = parent.model()?;
        let repository = model.repository_for_class(self.relationship.entity)?;
        let mapper = repository.relationship_mapper(self.parent_class, &self.property)?;
        let mut collection =
            RelationshipCollection::new(repository, Arc::clone(&mapper)).set_relationship_parent(parent.clone());
        let this = self.this.clone();
        collection.subscribe_on_entity_fetch(Box::new(move |entities| {
            if let Some(this) = this.upgrade() {
                for entity in entities {
                    this.track_entity(entity);
                }
            }
        }));
        let iterator = collection.fetch()?;
        lock(&self.state).relationship_mapper = Some(mapper);
        Ok(iterator)
    }

    /// Members of the materialized collection.
    pub fn to_vec(&self) -> Result<Vec<EntityHandle>> {
        Ok(self.get()?.entities())
    }

    pub fn count_members(&self) -> Result<usize> {
        Ok(self.get()?.count())
    }

    pub fn is_loaded(&self) -> bool {
        let state = lock(&self.state);
        state.collection.is_some() || state.was_loaded
    }

    pub fn is_modified(&self) -> bool {
        lock(&self.state).modified
    }

    /// Record a stored member without staging a change.
    pub(crate) fn track_entity(&self, entity: &EntityHandle) {
        let mut state = lock(&self.state);
        if !state.to_add.contains(entity) && !state.to_remove.contains(entity) {
            state.tracked.insert(entity.clone());
        }
    }

    /// Members the unit of work must persist with this collection.
    ///
    /// Removed members that are persisted stay in the set (their foreign key
    /// changed); removed members that never reached storage are dropped.
    pub fn get_entities_for_persistence(&self) -> Vec<EntityHandle> {
        let (tracked, to_add, to_remove) = {
            let state = lock(&self.state);
            (state.tracked.clone(), state.to_add.clone(), state.to_remove.clone())
        };
        let mut entities = tracked;
        for entity in to_add.iter() {
            entities.insert(entity.clone());
        }
        for entity in to_remove.iter() {
            if entity.is_persisted() {
                entities.insert(entity.clone());
            } else {
                entities.remove(entity);
            }
        }
        entities.take()
    }

    /// Settle pending changes after the members were persisted.
    pub fn do_persist(&self) {
        let mapper = {
            let mut state = lock(&self.state);
            if !state.modified {
                return;
            }
            for entity in state.to_add.take() {
                state.tracked.insert(entity);
            }
            for entity in state.to_remove.take() {
                state.tracked.remove(&entity);
            }
            state.modified = false;
            state.collection = None;
            state.relationship_mapper.take()
        };
        if let Some(mapper) = mapper {
            mapper.clear_cache();
        }
    }

    /// Drop all state after the parent was refreshed.
    pub(crate) fn reset(&self) {
        let mapper = {
            let mut state = lock(&self.state);
            let mapper = state.relationship_mapper.take();
            *state = HasManyState::default();
            mapper
        };
        if let Some(mapper) = mapper {
            mapper.clear_cache();
        }
    }

    fn update_relationship_add(&self, parent: &EntityHandle, entity: &EntityHandle) -> Result<()> {
        let Some(inverse) = self.relationship.property.as_deref() else {
            return Ok(());
        };
        let _guard = ReverseUpdateGuard::acquire(&self.updating_reverse);
        entity.has_one(inverse)?.set_injected(Some(parent), true)?;
        Ok(())
    }

    fn update_relationship_remove(&self, entity: &EntityHandle) -> Result<()> {
        let Some(inverse) = self.relationship.property.as_deref() else {
            return Ok(());
        };
        let _guard = ReverseUpdateGuard::acquire(&self.updating_reverse);
        entity.has_one(inverse)?.set_injected(None, true)?;
        Ok(())
    }
}

impl fmt::Debug for OneHasMany {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("OneHasMany")
            .field("entity", &self.parent_class)
            .field("property", &self.property.name)
            .field("tracked", &state.tracked.0.len())
            .field("to_add", &state.to_add.0.len())
            .field("to_remove", &state.to_remove.0.len())
            .field("modified", &state.modified)
            .finish_non_exhaustive()
    }
}
