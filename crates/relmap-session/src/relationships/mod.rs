//! Relationship wrappers.
//!
//! Every relationship property of an entity is backed by a wrapper created on
//! first access:
//!
//! - [`HasOne`] for many-has-one and one-has-one properties
//! - [`OneHasMany`] for one-has-many collections
//!
//! Wrappers on both sides of a bidirectional relationship keep each other
//! consistent: changing one side updates the inverse side in memory. A
//! per-wrapper reentry flag stops the inverse update from bouncing back.

mod has_one;
mod mapper;
mod one_has_many;

pub use has_one::HasOne;
pub use mapper::{FetchSubscriber, OneHasManyMapper, RelationshipCollection};
pub use one_has_many::OneHasMany;

use crate::entity::{EntityHandle, WeakEntityHandle};
use relmap_core::{
    EntityClass, Error, Order, PropertyErrorKind, Result, StateErrorKind, Value,
};
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A relationship wrapper of either cardinality.
#[derive(Debug, Clone)]
pub enum Relationship {
    HasOne(Arc<HasOne>),
    HasMany(Arc<OneHasMany>),
}

/// Holds a wrapper's reentry flag for the duration of an inverse update.
///
/// The flag is cleared on drop, so an error inside the propagation cannot
/// leave the wrapper stuck.
struct ReverseUpdateGuard<'a>(&'a AtomicBool);

impl<'a> ReverseUpdateGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ReverseUpdateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn is_updating(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Acquire)
}

fn upgrade_parent(parent: &WeakEntityHandle, class: EntityClass) -> Result<EntityHandle> {
    parent.upgrade().ok_or_else(|| {
        Error::state(
            StateErrorKind::Detached,
            format!("Parent {class} entity of a relationship has been dropped."),
        )
    })
}

/// Check that `entity` may be stored in a relationship targeting `target`.
///
/// Besides the exact class, any class served by the same repository as the
/// target is accepted.
fn check_target(
    parent: &EntityHandle,
    parent_class: EntityClass,
    property: &str,
    target: EntityClass,
    entity: &EntityHandle,
) -> Result<()> {
    let class = entity.class();
    if class == target {
        return Ok(());
    }
    if let Ok(model) = parent.model() {
        let configuration = model.configuration();
        let owner = configuration.repository_id_for_class(class);
        if owner.is_some() && owner == configuration.repository_id_for_class(target) {
            return Ok(());
        }
    }
    Err(Error::property(
        parent_class.name(),
        property,
        PropertyErrorKind::InvalidEntity,
    ))
}

/// Sort entities by a property's raw value. NULLs sort first.
fn sort_entities(entities: &mut [EntityHandle], order_by: Option<&(String, Order)>) {
    let Some((property, order)) = order_by else {
        return;
    };
    let mut keyed: Vec<(Value, EntityHandle)> = entities
        .iter()
        .map(|e| (e.get_raw_value(property).unwrap_or(Value::Null), e.clone()))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| {
        let ordering = a.compare(b).unwrap_or(CmpOrdering::Equal);
        match order {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        }
    });
    for (slot, (_, entity)) in entities.iter_mut().zip(keyed) {
        *slot = entity;
    }
}

/// Insertion-ordered set of entity handles, compared by identity.
#[derive(Debug, Default, Clone)]
struct EntitySet(Vec<EntityHandle>);

impl EntitySet {
    fn contains(&self, entity: &EntityHandle) -> bool {
        self.0.iter().any(|e| e.ptr_eq(entity))
    }

    fn insert(&mut self, entity: EntityHandle) -> bool {
        if self.contains(&entity) {
            return false;
        }
        self.0.push(entity);
        true
    }

    fn remove(&mut self, entity: &EntityHandle) -> bool {
        let before = self.0.len();
        self.0.retain(|e| !e.ptr_eq(entity));
        before != self.0.len()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &EntityHandle> {
        self.0.iter()
    }

    fn take(&mut self) -> Vec<EntityHandle> {
        std::mem::take(&mut self.0)
    }
}
