//! Single-valued relationship wrapper.

use super::{ReverseUpdateGuard, check_target, is_updating, upgrade_parent};
use crate::entity::{EntityHandle, WeakEntityHandle};
use crate::lock;
use relmap_core::{
    EntityClass, EntityId, Error, PropertyErrorKind, PropertyMetadata, RelationshipKind,
    RelationshipMetadata, Result, Value,
};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct HasOneState {
    /// The related entity, once loaded or assigned.
    value: Option<EntityHandle>,
    /// Raw foreign key known before the related entity is loaded.
    primary_value: Option<Value>,
    loaded: bool,
    modified: bool,
}

/// Wrapper of a many-has-one or one-has-one property.
///
/// On the side holding the foreign key the wrapper starts from the raw key and
/// loads the related entity on first access. The other side of a one-has-one
/// looks the related entity up by its inverse column.
pub struct HasOne {
    parent: WeakEntityHandle,
    parent_class: EntityClass,
    property: Arc<PropertyMetadata>,
    relationship: RelationshipMetadata,
    state: Mutex<HasOneState>,
    updating_reverse: AtomicBool,
}

impl HasOne {
    pub(crate) fn new(
        parent: WeakEntityHandle,
        parent_class: EntityClass,
        property: Arc<PropertyMetadata>,
        relationship: RelationshipMetadata,
        raw: Option<Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            parent,
            parent_class,
            property,
            relationship,
            state: Mutex::new(HasOneState {
                primary_value: raw.filter(|v| !v.is_null()),
                ..HasOneState::default()
            }),
            updating_reverse: AtomicBool::new(false),
        })
    }

    /// Name of the property this wrapper backs.
    pub fn name(&self) -> &str {
        &self.property.name
    }

    pub fn relationship(&self) -> &RelationshipMetadata {
        &self.relationship
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.state).loaded
    }

    pub fn is_modified(&self) -> bool {
        lock(&self.state).modified
    }

    fn parent(&self) -> Result<EntityHandle> {
        upgrade_parent(&self.parent, self.parent_class)
    }

    /// Whether the property references an entity.
    pub fn has_value(&self) -> Result<bool> {
        {
            let state = lock(&self.state);
            if state.loaded {
                return Ok(state.value.is_some());
            }
            if state.primary_value.is_some() {
                return Ok(true);
            }
        }
        Ok(self.get()?.is_some())
    }

    /// Raw foreign key, on the side that stores one.
    ///
    /// A related entity that is not persisted yet has no key to store.
    pub fn raw_value(&self) -> Option<Value> {
        if !self.relationship.holds_foreign_key() {
            return None;
        }
        let (loaded, value, primary) = {
            let state = lock(&self.state);
            (state.loaded, state.value.clone(), state.primary_value.clone())
        };
        if !loaded {
            return primary;
        }
        value
            .and_then(|entity| entity.persisted_id())
            .and_then(|id| id.as_scalar().cloned())
    }

    /// Get the related entity, loading it on first access.
    pub fn get(&self) -> Result<Option<EntityHandle>> {
        {
            let state = lock(&self.state);
            if state.loaded {
                return Ok(state.value.clone());
            }
        }
        let fetched = self.fetch()?;
        let mut state = lock(&self.state);
        if !state.loaded {
            state.value = fetched;
            state.loaded = true;
        }
        Ok(state.value.clone())
    }

    fn fetch(&self) -> Result<Option<EntityHandle>> {
        let parent = self.parent()?;
        if self.relationship.holds_foreign_key() {
            let primary = lock(&self.state).primary_value.clone();
            let Some(raw) = primary else {
                return Ok(None);
            };
            let model = parent.model()?;
            let repository = model.repository_for_class(self.relationship.entity)?;

            // Resolve every key of the parent's batch in one round trip.
            if let Some(batch) = parent.preload_values(&self.property.name) {
                let ids: Vec<EntityId> = batch
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| EntityId::Scalar(v.clone()))
                    .collect();
                if ids.len() > 1 {
                    repository.get_by_ids(&ids)?;
                }
            }
            return repository.get_by_id(&EntityId::Scalar(raw));
        }

        let (Some(id), Some(inverse)) = (parent.persisted_id(), self.relationship.property.as_deref())
        else {
            return Ok(None);
        };
        let model = parent.model()?;
        let repository = model.repository_for_class(self.relationship.entity)?;
        let mapper = repository.mapper();
        let column = mapper.conventions().convert_entity_to_storage_key(inverse);
        for row in mapper.find_by_column(&column, &[id.to_scalar()?])? {
            if let Some(entity) = repository.hydrate(row)? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Assign the related entity through the public path.
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: Option<&EntityHandle>) -> Result<bool> {
        if self.property.read_only {
            return Err(Error::property(
                self.parent_class.name(),
                &self.property.name,
                PropertyErrorKind::ReadOnly,
            ));
        }
        self.set_injected(value, false)
    }

    /// Assign the related entity, bypassing the read-only check. With
    /// `allow_null` the nullability check is skipped too.
    ///
    /// While this wrapper is updating its inverse side, further assignments are
    /// ignored and return `false`.
    pub fn set_injected(&self, value: Option<&EntityHandle>, allow_null: bool) -> Result<bool> {
        if is_updating(&self.updating_reverse) {
            return Ok(false);
        }
        let parent = self.parent()?;
        if value.is_none() && !allow_null && !self.property.nullable {
            return Err(Error::property(
                self.parent_class.name(),
                &self.property.name,
                PropertyErrorKind::NotNullable,
            ));
        }
        if let Some(entity) = value {
            check_target(
                &parent,
                self.parent_class,
                &self.property.name,
                self.relationship.entity,
                entity,
            )?;
        }

        let old = self.current()?;
        let changed = match (&old, value) {
            (Some(a), Some(b)) => !a.ptr_eq(b),
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.modify(&parent);
            self.update_relationship(&parent, old.as_ref(), value, allow_null)?;
        } else if let Some(entity) = value {
            self.init_reverse(&parent, entity)?;
        }

        let primary = value
            .and_then(EntityHandle::persisted_id)
            .and_then(|id| id.as_scalar().cloned());
        let mut state = lock(&self.state);
        state.value = value.cloned();
        state.primary_value = primary;
        state.loaded = true;
        Ok(changed)
    }

    /// Current value for change detection. An unattached parent cannot load,
    /// so it reads as unset.
    fn current(&self) -> Result<Option<EntityHandle>> {
        match self.get() {
            Err(err) if err.state_kind().is_some() => Ok(None),
            other => other,
        }
    }

    /// Whether this wrapper currently references `entity`.
    fn points_to(&self, entity: &EntityHandle) -> Result<bool> {
        Ok(self.current()?.is_some_and(|value| value.ptr_eq(entity)))
    }

    fn modify(&self, parent: &EntityHandle) {
        lock(&self.state).modified = true;
        let marks_parent = match self.relationship.kind {
            RelationshipKind::ManyHasOne => true,
            RelationshipKind::OneHasOne => self.relationship.is_main,
            RelationshipKind::OneHasMany => false,
        };
        if marks_parent {
            parent.set_as_modified(&self.property.name);
        }
    }

    fn update_relationship(
        &self,
        parent: &EntityHandle,
        old: Option<&EntityHandle>,
        new: Option<&EntityHandle>,
        allow_null: bool,
    ) -> Result<()> {
        let Some(inverse) = self.relationship.property.as_deref() else {
            return Ok(());
        };
        let _guard = ReverseUpdateGuard::acquire(&self.updating_reverse);
        match self.relationship.kind {
            RelationshipKind::ManyHasOne => {
                if let Some(old) = old {
                    old.has_many(inverse)?.remove(parent)?;
                }
                if let Some(new) = new {
                    new.has_many(inverse)?.add(parent)?;
                }
            }
            RelationshipKind::OneHasOne => {
                if let Some(old) = old {
                    let reverse = old.has_one(inverse)?;
                    if reverse.points_to(parent)? {
                        reverse.set_injected(None, true)?;
                    }
                }
                if let Some(new) = new {
                    let reverse = new.has_one(inverse)?;
                    if !reverse.points_to(parent)? {
                        reverse.set_injected(Some(parent), allow_null)?;
                    }
                }
            }
            RelationshipKind::OneHasMany => {}
        }
        Ok(())
    }

    /// Re-assigning the current value still registers the parent with the
    /// inverse collection.
    fn init_reverse(&self, parent: &EntityHandle, value: &EntityHandle) -> Result<()> {
        if self.relationship.kind != RelationshipKind::ManyHasOne {
            return Ok(());
        }
        if let Some(inverse) = self.relationship.property.as_deref() {
            value.has_many(inverse)?.track_entity(parent);
        }
        Ok(())
    }

    /// Forget the loaded value after the parent was refreshed.
    pub(crate) fn reset(&self, raw: Option<Value>) {
        *lock(&self.state) = HasOneState {
            primary_value: raw.filter(|v| !v.is_null()),
            ..HasOneState::default()
        };
    }
}

impl fmt::Debug for HasOne {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("HasOne")
            .field("entity", &self.parent_class)
            .field("property", &self.property.name)
            .field("kind", &self.relationship.kind)
            .field("loaded", &state.loaded)
            .field("modified", &state.modified)
            .finish_non_exhaustive()
    }
}
