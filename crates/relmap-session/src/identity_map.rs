//! Identity Map pattern for tracking unique entity instances per identity.
//!
//! Each repository owns one identity map. It guarantees that a persisted
//! identity corresponds to exactly one live [`EntityHandle`] inside that
//! repository:
//!
//! - **Uniqueness**: hydrating the same row twice yields the same instance
//! - **Tombstones**: identities removed in this unit of work stay known, so a
//!   stale storage read cannot resurrect them
//! - **Refresh**: instances marked for refresh are overwritten in place the
//!   next time their row is hydrated
//!
//! # Example
//!
//! ```ignore
//! let first = map.create(&row, repository.as_ref())?.unwrap();
//! let second = map.create(&row, repository.as_ref())?.unwrap();
//! assert!(first.ptr_eq(&second));
//!
//! map.remove(&id);
//! assert!(map.exists(&id));
//! assert!(map.get(&id).is_none());
//! ```

use crate::entity::EntityHandle;
use crate::lock;
use crate::repository::Repository;
use crate::schema::MetadataStorage;
use relmap_core::{ConflictError, EntityId, Error, IdHash, Result, StateErrorKind, StorageRow};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

enum Slot {
    Live(EntityHandle),
    /// Removed during this unit of work.
    Removed,
}

#[derive(Default)]
struct Entries {
    slots: HashMap<IdHash, Slot>,
    /// Insertion order of `slots`.
    order: Vec<IdHash>,
    refresh: HashSet<IdHash>,
}

impl Entries {
    fn put(&mut self, hash: IdHash, slot: Slot) {
        if self.slots.insert(hash.clone(), slot).is_none() {
            self.order.push(hash);
        }
    }
}

/// Per-repository map of identity hash to live entity or tombstone.
///
/// The map locks internally; hooks and repository callbacks always run with
/// the lock released.
pub struct IdentityMap {
    metadata: Arc<MetadataStorage>,
    entries: Mutex<Entries>,
}

impl IdentityMap {
    pub fn new(metadata: Arc<MetadataStorage>) -> Self {
        Self {
            metadata,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Whether the identity is known, as a live entity or a tombstone.
    ///
    /// A known identity must not be looked up in storage again.
    pub fn exists(&self, id: &EntityId) -> bool {
        lock(&self.entries).slots.contains_key(&id.hash())
    }

    /// Get the live entity for an identity. Tombstones read as `None`.
    ///
    /// The entity leaves any batch it was fetched through.
    pub fn get(&self, id: &EntityId) -> Option<EntityHandle> {
        let entity = match lock(&self.entries).slots.get(&id.hash()) {
            Some(Slot::Live(entity)) => entity.clone(),
            Some(Slot::Removed) | None => return None,
        };
        entity.set_preload_container(None);
        Some(entity)
    }

    /// Register a persisted entity, replacing any tombstone of its identity.
    pub fn add(&self, entity: &EntityHandle) -> Result<()> {
        let id = entity.persisted_id().ok_or_else(|| {
            Error::state(
                StateErrorKind::NotPersisted,
                format!("Cannot track unpersisted {} entity.", entity.class()),
            )
        })?;
        lock(&self.entries).put(id.hash(), Slot::Live(entity.clone()));
        Ok(())
    }

    /// Tombstone an identity.
    pub fn remove(&self, id: &EntityId) {
        let hash = id.hash();
        let mut entries = lock(&self.entries);
        entries.refresh.remove(&hash);
        entries.put(hash, Slot::Removed);
    }

    /// Turn a storage row (entity keys) into the entity instance for its
    /// identity.
    ///
    /// - a tombstoned identity yields `None`
    /// - a live identity yields the existing instance, refreshed from the row
    ///   when it was marked for refresh
    /// - an unknown identity yields a new instance, attached to `repository`,
    ///   with its load hook fired once
    pub fn create(&self, row: &StorageRow, repository: &dyn Repository) -> Result<Option<EntityHandle>> {
        let class = repository.entity_class_name(row)?;
        let schema = self.metadata.get(class)?;
        let hash = EntityId::from_row(&schema.metadata.primary_key, row)?.hash();

        let existing = {
            let mut entries = lock(&self.entries);
            let live = match entries.slots.get(&hash) {
                Some(Slot::Removed) => return Ok(None),
                Some(Slot::Live(entity)) => Some(entity.clone()),
                None => None,
            };
            live.map(|entity| (entity, entries.refresh.remove(&hash)))
        };
        if let Some((entity, refresh)) = existing {
            if refresh {
                tracing::trace!(entity = %class, id = %hash, "Refreshing entity");
                entity.on_refresh(row);
            }
            return Ok(Some(entity));
        }

        let entity = EntityHandle::from_storage_row(schema, row)?;
        lock(&self.entries).put(hash, Slot::Live(entity.clone()));
        repository.attach(&entity);
        entity.on_load(row);
        Ok(Some(entity))
    }

    /// All live entities, in insertion order.
    pub fn all_live(&self) -> Vec<EntityHandle> {
        let entries = lock(&self.entries);
        entries
            .order
            .iter()
            .filter_map(|hash| match entries.slots.get(hash) {
                Some(Slot::Live(entity)) => Some(entity.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn mark_for_refresh(&self, entity: &EntityHandle) {
        if let Some(id) = entity.persisted_id() {
            lock(&self.entries).refresh.insert(id.hash());
        }
    }

    pub fn is_marked_for_refresh(&self, entity: &EntityHandle) -> bool {
        entity
            .persisted_id()
            .is_some_and(|id| lock(&self.entries).refresh.contains(&id.hash()))
    }

    /// Check that `repository` accepts the entity's class.
    pub fn check(&self, entity: &EntityHandle, repository: &dyn Repository) -> Result<()> {
        let class = entity.class();
        if repository.entity_class_names().contains(&class) {
            Ok(())
        } else {
            Err(Error::Conflict(ConflictError {
                entity: class.name().to_string(),
                repository: repository.id().name().to_string(),
            }))
        }
    }

    /// Detach and free every live entity, then forget all identities.
    pub fn destroy_all(&self, repository: &dyn Repository) {
        let live = self.all_live();
        for entity in &live {
            repository.detach(entity);
            entity.on_free();
        }
        *lock(&self.entries) = Entries::default();
        tracing::debug!(repository = %repository.id(), freed = live.len(), "Identity map cleared");
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        lock(&self.entries)
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = lock(&self.entries);
        let live = entries
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count();
        f.debug_struct("IdentityMap")
            .field("live", &live)
            .field("removed", &(entries.slots.len() - live))
            .field("marked_for_refresh", &entries.refresh.len())
            .finish()
    }
}
