//! Identity map and unit of work for relmap.
//!
//! `relmap-session` is the **runtime engine** of the mapper. It keeps object
//! identity, routes entities to their repositories and coordinates persistence
//! and removal across a graph of related entities.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one live entity instance per persisted identity, per
//!   repository, with tombstones for removed identities.
//! - **Model**: the unit-of-work coordinator. Resolves repositories lazily,
//!   orders cascaded persists and removals and flushes every materialized
//!   repository.
//! - **Relationships**: bidirectional has-one and one-has-many collections that
//!   keep both sides consistent in memory before anything is written.
//! - **Result cursor**: `EntityIterator` groups batched relationship results and
//!   lets any member of a batch compute preload values for the whole batch.
//!
//! # Design
//!
//! - Entities are shared through [`EntityHandle`], an `Arc<RwLock<Entity>>`.
//!   Identity is pointer identity of the handle.
//! - Back-references (entity → repository → model, relationship → parent,
//!   entity → batch) are `Weak`, so dropping the model frees the graph.
//! - No entity lock is held while a relationship propagates to the other side.
//!
//! # Example
//!
//! ```ignore
//! let model = Model::new(configuration, Arc::new(loader), metadata);
//!
//! let author = model.create_entity(AUTHOR)?;
//! author.set_value("name", "Jane")?;
//! let book = model.create_entity(BOOK)?;
//! book.set_value("title", "Rust")?;
//! author.has_many("books")?.add(&book)?;
//!
//! // Persists author first, then book, then the collection.
//! model.persist_and_flush(&author, true)?;
//! ```

pub mod cascade;
pub mod collection;
pub mod entity;
pub mod identity_map;
pub mod loader;
pub mod mapper;
pub mod model;
pub mod relationships;
pub mod repository;
pub mod schema;

pub use cascade::{CascadeItem, RemovalPlan, persistence_queue, removal_queues};
pub use collection::EntityIterator;
pub use entity::{Entity, EntityHandle, ObjectKey, WeakEntityHandle};
pub use identity_map::IdentityMap;
pub use loader::{LazyRepositoryLoader, LazyRepositoryLoaderBuilder, RepositoryFactory, RepositoryLoader};
pub use mapper::{Conventions, Mapper, MemoryMapper};
pub use model::{Configuration, ConfigurationBuilder, FlushCallback, Model};
pub use relationships::{
    FetchSubscriber, HasOne, OneHasMany, OneHasManyMapper, Relationship, RelationshipCollection,
};
pub use repository::{
    ClassResolver, EntityRepository, FlushOutcome, Repository, RepositoryEvent,
    RepositoryEventCallbacks,
};
pub use schema::{EntityLifecycle, EntitySchema, MetadataStorage};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Lock helpers. Poisoned locks are recovered, not propagated.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
