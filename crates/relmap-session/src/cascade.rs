//! Cascade planning for persist and remove.
//!
//! Both planners walk the entity graph through relationship wrappers and
//! return an ordered work list; the model then stages each item with its
//! repository.
//!
//! - [`persistence_queue`] orders entities so every foreign key target is
//!   persisted before the entity referencing it. Dependents (one-has-many
//!   members, the non-owning side of a one-has-one) follow their parent.
//! - [`removal_queues`] orders dependents before the entity and nulls the
//!   relationships that do not cascade, collecting the entities whose foreign
//!   keys changed as a side effect.

use crate::entity::{EntityHandle, ObjectKey};
use crate::model::Model;
use crate::relationships::{OneHasMany, Relationship};
use relmap_core::{
    EntityClass, Error, PropertyMetadata, RelationshipMetadata, Result, StateErrorKind,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// One unit of cascaded work.
#[derive(Debug, Clone)]
pub enum CascadeItem {
    /// An entity to persist.
    Entity(EntityHandle),
    /// A collection whose pending changes settle once its members persisted.
    Collection(Arc<OneHasMany>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum VisitKey {
    Entity(ObjectKey),
    Collection(usize),
}

impl CascadeItem {
    fn key(&self) -> VisitKey {
        match self {
            CascadeItem::Entity(entity) => VisitKey::Entity(entity.object_key()),
            CascadeItem::Collection(collection) => collection_key(collection),
        }
    }
}

fn collection_key(collection: &Arc<OneHasMany>) -> VisitKey {
    VisitKey::Collection(Arc::as_ptr(collection).addr())
}

// ============================================================================
// Persist
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct PersistWalk<'a> {
    model: &'a Model,
    input: VecDeque<CascadeItem>,
    marks: HashMap<VisitKey, Mark>,
    output: Vec<CascadeItem>,
    /// Relationships followed depth-first, for cycle reports.
    path: Vec<String>,
}

/// Plan the persist of `entity`.
///
/// Without cascade the queue holds only `entity`. With cascade it holds every
/// entity and collection reachable through relationships flagged for persist
/// cascade, each once, foreign key targets first.
///
/// Relationships of a persisted entity that were never loaded are skipped:
/// nothing behind them can have changed.
///
/// # Errors
///
/// [`StateErrorKind::PersistCycle`] when unpersisted entities reference each
/// other through foreign keys, so neither can be written first.
pub fn persistence_queue(
    entity: &EntityHandle,
    model: &Model,
    with_cascade: bool,
) -> Result<Vec<CascadeItem>> {
    let mut walk = PersistWalk {
        model,
        input: VecDeque::from([CascadeItem::Entity(entity.clone())]),
        marks: HashMap::new(),
        output: Vec::new(),
        path: Vec::new(),
    };
    while let Some(item) = walk.input.pop_front() {
        match item {
            CascadeItem::Entity(entity) => walk.visit_entity(&entity, with_cascade)?,
            CascadeItem::Collection(collection) => walk.visit_collection(&collection)?,
        }
    }
    tracing::trace!(root = %entity.class(), items = walk.output.len(), "Persistence queue built");
    Ok(walk.output)
}

impl PersistWalk<'_> {
    fn visit_entity(&mut self, entity: &EntityHandle, with_cascade: bool) -> Result<()> {
        let key = VisitKey::Entity(entity.object_key());
        match self.marks.get(&key) {
            Some(Mark::Done) => return Ok(()),
            // Persisted entities already have a key to reference.
            Some(Mark::InProgress) if entity.is_persisted() => return Ok(()),
            Some(Mark::InProgress) => {
                return Err(Error::state(
                    StateErrorKind::PersistCycle,
                    format!(
                        "Persist cycle detected in {}. Persist one side without cascade first.",
                        self.path.join(" - ")
                    ),
                ));
            }
            None => {}
        }
        self.model.repository_for_entity(entity)?;

        if with_cascade {
            self.marks.insert(key, Mark::InProgress);
            let metadata = entity.metadata();
            for (property, relationship) in metadata.relationships() {
                if relationship.cascade.persist {
                    self.visit_relationship(entity, property, relationship)?;
                }
            }
        }
        self.marks.insert(key, Mark::Done);
        self.output.push(CascadeItem::Entity(entity.clone()));
        Ok(())
    }

    fn visit_relationship(
        &mut self,
        entity: &EntityHandle,
        property: &PropertyMetadata,
        relationship: &RelationshipMetadata,
    ) -> Result<()> {
        let persisted = entity.is_persisted();
        let wrapper = if persisted {
            match entity.existing_relationship(&property.name) {
                Some(wrapper) => wrapper,
                None => return Ok(()),
            }
        } else {
            entity.relationship(&property.name)?
        };

        match wrapper {
            Relationship::HasOne(has_one) => {
                if persisted && !has_one.is_loaded() {
                    return Ok(());
                }
                let Some(value) = has_one.get()? else {
                    return Ok(());
                };
                if relationship.holds_foreign_key() {
                    self.path.push(format!("{}::${}", entity.class(), property.name));
                    let visited = self.visit_entity(&value, true);
                    self.path.pop();
                    visited?;
                } else {
                    self.input.push_back(CascadeItem::Entity(value));
                }
            }
            Relationship::HasMany(has_many) => {
                if persisted && !has_many.is_loaded() && !has_many.is_modified() {
                    return Ok(());
                }
                self.input.push_back(CascadeItem::Collection(has_many));
            }
        }
        Ok(())
    }

    fn visit_collection(&mut self, collection: &Arc<OneHasMany>) -> Result<()> {
        let key = collection_key(collection);
        if self.marks.contains_key(&key) {
            return Ok(());
        }
        self.marks.insert(key, Mark::Done);
        for member in collection.get_entities_for_persistence() {
            self.visit_entity(&member, true)?;
        }
        self.output.push(CascadeItem::Collection(Arc::clone(collection)));
        Ok(())
    }
}

// ============================================================================
// Remove
// ============================================================================

/// Work produced by planning a removal.
#[derive(Debug, Default)]
pub struct RemovalPlan {
    /// Entities and collections changed by nulling relationships. Staged
    /// before any removal.
    pub persist: Vec<CascadeItem>,
    /// Entities to remove, dependents first.
    pub remove: Vec<EntityHandle>,
}

struct RemovalWalk<'a> {
    model: &'a Model,
    persist: Vec<CascadeItem>,
    persist_keys: HashSet<VisitKey>,
    remove: Vec<EntityHandle>,
    visited: HashSet<ObjectKey>,
}

/// Plan the removal of `entity`.
///
/// Relationships flagged for remove cascade are followed when `with_cascade`
/// is set: dependents are removed before `entity`, foreign key targets after
/// it. Every other relationship is detached from `entity` in memory:
///
/// - on the side holding the foreign key the reference is set to null
/// - members of a one-has-many and the non-owning side of a one-has-one get
///   their foreign key nulled and are queued for persist
///
/// Entities that end up removed are never queued for persist.
///
/// # Errors
///
/// [`StateErrorKind::NullViolation`] when a dependent's foreign key would have
/// to be nulled but is not nullable.
pub fn removal_queues(
    entity: &EntityHandle,
    model: &Model,
    with_cascade: bool,
) -> Result<RemovalPlan> {
    let mut walk = RemovalWalk {
        model,
        persist: Vec::new(),
        persist_keys: HashSet::new(),
        remove: Vec::new(),
        visited: HashSet::new(),
    };
    walk.visit(entity, with_cascade)?;

    let removed: HashSet<ObjectKey> = walk.remove.iter().map(EntityHandle::object_key).collect();
    let persist = walk
        .persist
        .into_iter()
        .filter(|item| match item {
            CascadeItem::Entity(entity) => !removed.contains(&entity.object_key()),
            CascadeItem::Collection(_) => true,
        })
        .collect();
    Ok(RemovalPlan {
        persist,
        remove: walk.remove,
    })
}

impl RemovalWalk<'_> {
    fn push_persist(&mut self, item: CascadeItem) {
        if self.persist_keys.insert(item.key()) {
            self.persist.push(item);
        }
    }

    fn visit(&mut self, entity: &EntityHandle, with_cascade: bool) -> Result<()> {
        if !self.visited.insert(entity.object_key()) {
            return Ok(());
        }
        self.model.repository_for_entity(entity)?;

        let mut dependents = Vec::new();
        let mut targets = Vec::new();
        let metadata = entity.metadata();
        for (property, relationship) in metadata.relationships() {
            if !(with_cascade && relationship.cascade.remove) {
                self.set_null(entity, property, relationship)?;
                continue;
            }
            match entity.relationship(&property.name)? {
                Relationship::HasOne(has_one) => {
                    let Some(value) = has_one.get()? else {
                        continue;
                    };
                    if relationship.holds_foreign_key() {
                        targets.push(value);
                    } else {
                        dependents.push(CascadeItem::Entity(value));
                    }
                }
                Relationship::HasMany(has_many) => {
                    dependents.push(CascadeItem::Collection(has_many));
                }
            }
        }

        for dependent in dependents {
            match dependent {
                CascadeItem::Entity(dependent) => self.visit(&dependent, true)?,
                CascadeItem::Collection(collection) => {
                    for member in collection.to_vec()? {
                        self.visit(&member, true)?;
                    }
                    self.push_persist(CascadeItem::Collection(collection));
                }
            }
        }
        self.remove.push(entity.clone());
        for target in targets {
            self.visit(&target, true)?;
        }
        Ok(())
    }

    fn set_null(
        &mut self,
        entity: &EntityHandle,
        property: &PropertyMetadata,
        relationship: &RelationshipMetadata,
    ) -> Result<()> {
        if relationship.holds_foreign_key() {
            entity.has_one(&property.name)?.set_injected(None, true)?;
            return Ok(());
        }
        let Some(inverse) = relationship.property.as_deref() else {
            return Ok(());
        };
        match entity.relationship(&property.name)? {
            Relationship::HasMany(has_many) => {
                let members = has_many.to_vec()?;
                if members.is_empty() {
                    return Ok(());
                }
                self.check_nullable(entity, relationship.entity, inverse)?;
                has_many.set(&[])?;
                for member in members {
                    self.push_persist(CascadeItem::Entity(member));
                }
                self.push_persist(CascadeItem::Collection(has_many));
            }
            Relationship::HasOne(has_one) => {
                let Some(value) = has_one.get()? else {
                    return Ok(());
                };
                self.check_nullable(entity, relationship.entity, inverse)?;
                has_one.set_injected(None, true)?;
                self.push_persist(CascadeItem::Entity(value));
            }
        }
        Ok(())
    }

    fn check_nullable(&self, entity: &EntityHandle, target: EntityClass, inverse: &str) -> Result<()> {
        let metadata = self.model.metadata_storage().metadata(target)?;
        if metadata.get_property(inverse).is_none_or(|p| p.nullable) {
            return Ok(());
        }
        tracing::debug!(entity = %entity.class(), target = %target, inverse, "Removal blocked by non-nullable reference");
        Err(Error::state(
            StateErrorKind::NullViolation,
            format!(
                "Cannot remove {} entity because {target}::${inverse} cannot be null.",
                entity.class()
            ),
        ))
    }
}
