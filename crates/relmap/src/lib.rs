//! relmap - an identity map and unit of work for object-relational mapping.
//!
//! relmap keeps exactly one live instance per persisted identity, tracks
//! bidirectional relationships in memory and writes a whole graph of related
//! entities in dependency order.
//!
//! - **Identity map**: hydrating the same row twice yields the same instance;
//!   removed identities stay tombstoned until the model is cleared
//! - **Unit of work**: `Model::persist` / `Model::remove` plan cascades,
//!   `Model::flush` commits every materialized repository
//! - **Relationships**: many-has-one, one-has-one and one-has-many wrappers
//!   that update their inverse side automatically
//! - **Batch preloading**: entities fetched together resolve their references
//!   for the whole batch in one storage round trip
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//! use std::sync::Arc;
//!
//! const AUTHORS: RepositoryId = RepositoryId::new("AuthorsRepository");
//! const BOOKS: RepositoryId = RepositoryId::new("BooksRepository");
//! const AUTHOR: EntityClass = EntityClass::new("Author");
//! const BOOK: EntityClass = EntityClass::new("Book");
//!
//! let metadata = Arc::new(
//!     MetadataStorage::new()
//!         .register(
//!             EntityMetadata::new(AUTHOR)
//!                 .property(PropertyMetadata::new("name"))
//!                 .property(PropertyMetadata::relationship(
//!                     "books",
//!                     RelationshipMetadata::new(RelationshipKind::OneHasMany, BOOK).inverse("author"),
//!                 )),
//!         )
//!         .register(
//!             EntityMetadata::new(BOOK)
//!                 .property(PropertyMetadata::new("title"))
//!                 .property(PropertyMetadata::relationship(
//!                     "author",
//!                     RelationshipMetadata::new(RelationshipKind::ManyHasOne, AUTHOR).inverse("books"),
//!                 )),
//!         ),
//! );
//!
//! let loader = LazyRepositoryLoader::builder()
//!     .repository(AUTHORS, /* factory */)
//!     .repository(BOOKS, /* factory */)
//!     .build();
//! let configuration = Configuration::builder()
//!     .repository("authors", AUTHORS, &[AUTHOR])
//!     .repository("books", BOOKS, &[BOOK])
//!     .build();
//! let model = Model::new(configuration, Arc::new(loader), metadata);
//!
//! let author = model.create_entity(AUTHOR)?;
//! author.set_value("name", "Jane")?;
//! let book = model.create_entity(BOOK)?;
//! book.set_value("title", "Rust")?;
//! book.set_reference("author", Some(&author))?;
//!
//! // Author first, then the book, then the author's collection.
//! model.persist_and_flush(&book, true)?;
//! ```

pub use relmap_core::{
    Cascade, ConflictError, EntityClass, EntityId, EntityMetadata, Error, IdHash, LookupErrorKind,
    Order, PropertyErrorKind, PropertyMetadata, RelationshipKind, RelationshipMetadata,
    RepositoryId, Result, StateErrorKind, StorageRow, Value,
};
pub use relmap_session::{
    CascadeItem, Configuration, ConfigurationBuilder, Conventions, Entity, EntityHandle,
    EntityIterator, EntityLifecycle, EntityRepository, EntitySchema, FlushCallback, FlushOutcome,
    HasOne, IdentityMap, LazyRepositoryLoader, Mapper, MemoryMapper, MetadataStorage, Model,
    OneHasMany, OneHasManyMapper, Relationship, RelationshipCollection, RemovalPlan, Repository,
    RepositoryEvent, RepositoryLoader, persistence_queue, removal_queues,
};

/// Crate-level version, from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenience re-exports for the common case.
pub mod prelude {
    pub use crate::{
        Cascade,
        Configuration,
        Conventions,
        EntityClass,
        EntityHandle,
        EntityId,
        EntityIterator,
        EntityLifecycle,
        EntityMetadata,
        EntityRepository,
        Error,
        LazyRepositoryLoader,
        MemoryMapper,
        MetadataStorage,
        Model,
        Order,
        PropertyMetadata,
        RelationshipKind,
        RelationshipMetadata,
        Repository,
        RepositoryEvent,
        RepositoryId,
        Result,
        StorageRow,
        Value,
    };
}
