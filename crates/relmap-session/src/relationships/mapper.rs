//! Batched loading of one-has-many relationships.
//!
//! When a parent reads its collection, [`OneHasManyMapper`] loads the members
//! of every parent in the parent's preload batch with one storage query and
//! groups them by foreign key. Later reads from other parents of the same batch
//! are served from the cached groups.

use super::sort_entities;
use crate::collection::EntityIterator;
use crate::entity::EntityHandle;
use crate::lock;
use crate::repository::Repository;
use relmap_core::{Error, IdHash, Order, Result, StateErrorKind, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

type Groups = Arc<Vec<(IdHash, Vec<EntityHandle>)>>;

/// Loader for the members of one one-has-many property, shared by every
/// parent entity of that property.
pub struct OneHasManyMapper {
    /// Storage column on the target holding the parent's identity.
    column: String,
    order_by: Option<(String, Order)>,
    /// Loaded groups, keyed by the set of parent identities queried.
    cache: Mutex<HashMap<String, Groups>>,
}

impl OneHasManyMapper {
    pub fn new(column: impl Into<String>, order_by: Option<(String, Order)>) -> Self {
        Self {
            column: column.into(),
            order_by,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Members of `parent`, as a grouped batch covering the parent's whole
    /// preload batch with `parent`'s group selected.
    pub fn iterator(
        &self,
        repository: &dyn Repository,
        parent: &EntityHandle,
    ) -> Result<Arc<EntityIterator>> {
        let parent_id = parent
            .persisted_id()
            .ok_or_else(|| {
                Error::state(
                    StateErrorKind::NotPersisted,
                    format!("Cannot load relationship of unpersisted {} entity.", parent.class()),
                )
            })?
            .to_scalar()?;
        let parent_hash = IdHash::from(&parent_id);

        let mut ids: Vec<Value> = Vec::new();
        let mut hashes: Vec<IdHash> = Vec::new();
        let primary_key = parent.metadata().primary_key.first().cloned();
        let batch = primary_key.and_then(|pk| parent.preload_values(&pk));
        for value in batch.iter().flat_map(|b| b.iter()).chain([&parent_id]) {
            let hash = IdHash::from(value);
            if !value.is_null() && !hashes.contains(&hash) {
                hashes.push(hash);
                ids.push(value.clone());
            }
        }
        let key = hashes.iter().map(IdHash::as_str).collect::<Vec<_>>().join(",");

        let cached = lock(&self.cache).get(&key).cloned();
        let groups = match cached {
            Some(groups) => groups,
            None => {
                let groups = Arc::new(self.load(repository, &ids, hashes)?);
                lock(&self.cache).insert(key, Arc::clone(&groups));
                groups
            }
        };

        let iterator = EntityIterator::grouped(groups.as_ref().clone());
        iterator.set_data_index(Some(&parent_hash))?;
        Ok(iterator)
    }

    fn load(
        &self,
        repository: &dyn Repository,
        ids: &[Value],
        hashes: Vec<IdHash>,
    ) -> Result<Vec<(IdHash, Vec<EntityHandle>)>> {
        let rows = repository.mapper().find_by_column(&self.column, ids)?;
        let row_count = rows.len();
        let mut groups: Vec<(IdHash, Vec<EntityHandle>)> =
            hashes.into_iter().map(|hash| (hash, Vec::new())).collect();
        for row in rows {
            let Some(foreign_key) = row.get(&self.column).map(IdHash::from) else {
                continue;
            };
            let Some(entity) = repository.hydrate(row)? else {
                continue;
            };
            if let Some((_, group)) = groups.iter_mut().find(|(hash, _)| *hash == foreign_key) {
                group.push(entity);
            }
        }
        for (_, group) in &mut groups {
            sort_entities(group, self.order_by.as_ref());
        }
        tracing::debug!(
            column = %self.column,
            parents = ids.len(),
            rows = row_count,
            "Loaded one-has-many batch"
        );
        Ok(groups)
    }

    /// Forget every loaded batch.
    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }
}

impl fmt::Debug for OneHasManyMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneHasManyMapper")
            .field("column", &self.column)
            .field("order_by", &self.order_by)
            .field("cached_batches", &lock(&self.cache).len())
            .finish()
    }
}

/// Callback invoked with the entities of each fetched batch.
pub type FetchSubscriber = Box<dyn Fn(&[EntityHandle]) + Send + Sync>;

/// Stored members of one parent's collection.
pub struct RelationshipCollection {
    repository: Arc<dyn Repository>,
    mapper: Arc<OneHasManyMapper>,
    parent: Option<EntityHandle>,
    subscribers: Vec<FetchSubscriber>,
}

impl RelationshipCollection {
    pub fn new(repository: Arc<dyn Repository>, mapper: Arc<OneHasManyMapper>) -> Self {
        Self {
            repository,
            mapper,
            parent: None,
            subscribers: Vec::new(),
        }
    }

    /// Scope the collection to one parent entity.
    #[must_use]
    pub fn set_relationship_parent(mut self, parent: EntityHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Register a callback for every fetched batch.
    pub fn subscribe_on_entity_fetch(&mut self, subscriber: FetchSubscriber) {
        self.subscribers.push(subscriber);
    }

    pub fn mapper(&self) -> Arc<OneHasManyMapper> {
        Arc::clone(&self.mapper)
    }

    /// Fetch the parent's members and notify subscribers.
    pub fn fetch(&self) -> Result<Arc<EntityIterator>> {
        let parent = self.parent.as_ref().ok_or_else(|| {
            Error::state(
                StateErrorKind::NotAttached,
                "Relationship collection has no parent entity.",
            )
        })?;
        let iterator = self.mapper.iterator(self.repository.as_ref(), parent)?;
        let entities = iterator.entities();
        for subscriber in &self.subscribers {
            subscriber(&entities);
        }
        Ok(iterator)
    }
}

impl fmt::Debug for RelationshipCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipCollection")
            .field("repository", &self.repository.id())
            .field("mapper", &self.mapper)
            .field("has_parent", &self.parent.is_some())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
