//! Preload-aware result cursor.
//!
//! An [`EntityIterator`] wraps one fetched batch of entities, either flat or
//! grouped by a parent identity (the result of one batched relationship query
//! covering many parents). Every entity handed out by the cursor remembers the
//! batch as its preload container, so any member can ask for a property's
//! values across the whole batch in a single call and relationship loaders can
//! fetch for all parents at once.

use crate::entity::EntityHandle;
use crate::lock;
use relmap_core::{Error, IdHash, Result, StateErrorKind, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug)]
enum Batch {
    Flat(Vec<EntityHandle>),
    Grouped(Vec<(IdHash, Vec<EntityHandle>)>),
}

/// Which part of the batch the cursor walks.
#[derive(Debug, Clone, Copy)]
enum Active {
    All,
    Group(usize),
    Empty,
}

#[derive(Debug)]
struct Cursor {
    active: Active,
    position: usize,
}

/// Cursor over a fetched batch of entities.
#[derive(Debug)]
pub struct EntityIterator {
    this: Weak<EntityIterator>,
    data: Batch,
    cursor: Mutex<Cursor>,
    preload_cache: Mutex<HashMap<String, Arc<Vec<Value>>>>,
}

impl EntityIterator {
    fn build(data: Batch) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            data,
            cursor: Mutex::new(Cursor {
                active: Active::All,
                position: 0,
            }),
            preload_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Create a cursor over a flat list.
    pub fn new(entities: Vec<EntityHandle>) -> Arc<Self> {
        Self::build(Batch::Flat(entities))
    }

    /// Create a cursor over entities grouped by parent identity.
    pub fn grouped(groups: Vec<(IdHash, Vec<EntityHandle>)>) -> Arc<Self> {
        Self::build(Batch::Grouped(groups))
    }

    /// Restrict the cursor to one group of a grouped batch, or lift the
    /// restriction with `None`. An unknown key selects an empty group.
    pub fn set_data_index(&self, index: Option<&IdHash>) -> Result<()> {
        let active = match (&self.data, index) {
            (_, None) => Active::All,
            (Batch::Flat(_), Some(key)) => {
                return Err(Error::state(
                    StateErrorKind::InvalidBatchIndex,
                    format!("Cannot select group '{key}' of an ungrouped batch."),
                ));
            }
            (Batch::Grouped(groups), Some(key)) => groups
                .iter()
                .position(|(hash, _)| hash == key)
                .map_or(Active::Empty, Active::Group),
        };
        let mut cursor = lock(&self.cursor);
        cursor.active = active;
        cursor.position = 0;
        Ok(())
    }

    fn active_slice(&self, active: Active) -> Vec<&EntityHandle> {
        match (&self.data, active) {
            (_, Active::Empty) => Vec::new(),
            (Batch::Flat(entities), _) => entities.iter().collect(),
            (Batch::Grouped(groups), Active::All) => {
                groups.iter().flat_map(|(_, group)| group.iter()).collect()
            }
            (Batch::Grouped(groups), Active::Group(index)) => {
                groups.get(index).map(|(_, g)| g.iter().collect()).unwrap_or_default()
            }
        }
    }

    fn all_entities(&self) -> Box<dyn Iterator<Item = &EntityHandle> + '_> {
        match &self.data {
            Batch::Flat(entities) => Box::new(entities.iter()),
            Batch::Grouped(groups) => Box::new(groups.iter().flat_map(|(_, group)| group.iter())),
        }
    }

    fn adopt(&self, entity: &EntityHandle) {
        if let Some(this) = self.this.upgrade() {
            entity.set_preload_container(Some(&this));
        }
    }

    /// The entity at the cursor, registered with this batch as its preload
    /// container.
    pub fn current(&self) -> Option<EntityHandle> {
        let entity = {
            let cursor = lock(&self.cursor);
            self.active_slice(cursor.active)
                .get(cursor.position)
                .map(|e| (*e).clone())
        }?;
        self.adopt(&entity);
        Some(entity)
    }

    /// Advance the cursor.
    pub fn next(&self) {
        lock(&self.cursor).position += 1;
    }

    /// Position of the cursor in the active set.
    pub fn key(&self) -> usize {
        lock(&self.cursor).position
    }

    pub fn valid(&self) -> bool {
        let cursor = lock(&self.cursor);
        cursor.position < self.active_slice(cursor.active).len()
    }

    pub fn rewind(&self) {
        lock(&self.cursor).position = 0;
    }

    /// Number of entities in the active set.
    pub fn count(&self) -> usize {
        let cursor = lock(&self.cursor);
        self.active_slice(cursor.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Snapshot of the active set, each entity registered with this batch.
    pub fn entities(&self) -> Vec<EntityHandle> {
        let entities: Vec<EntityHandle> = {
            let cursor = lock(&self.cursor);
            self.active_slice(cursor.active).into_iter().cloned().collect()
        };
        for entity in &entities {
            self.adopt(entity);
        }
        entities
    }

    /// Iterate over the active set without moving the shared cursor.
    pub fn iter(&self) -> impl Iterator<Item = EntityHandle> {
        self.entities().into_iter()
    }

    /// Raw values of `property` for every entity in the whole batch, across
    /// all groups. Entities whose class does not declare the property are
    /// skipped. The result is computed once per property.
    pub fn preload_values(&self, property: &str) -> Arc<Vec<Value>> {
        if let Some(cached) = lock(&self.preload_cache).get(property) {
            return Arc::clone(cached);
        }
        let values: Vec<Value> = self
            .all_entities()
            .filter(|entity| entity.metadata().has_property(property))
            .map(|entity| entity.get_raw_value(property).unwrap_or(Value::Null))
            .collect();
        tracing::trace!(property, count = values.len(), "Computed preload values");
        let mut cache = lock(&self.preload_cache);
        Arc::clone(
            cache
                .entry(property.to_string())
                .or_insert_with(|| Arc::new(values)),
        )
    }
}
