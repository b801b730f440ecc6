//! Core types for relmap.
//!
//! This crate provides the storage-independent building blocks shared by the
//! runtime engine:
//!
//! - `Value` for dynamically typed property values
//! - `EntityId` / `IdHash` for persisted identities
//! - `StorageRow` for rows exchanged with the storage layer
//! - Entity and relationship metadata
//! - The `Error` taxonomy

pub mod error;
pub mod identity;
pub mod metadata;
pub mod row;
pub mod value;

pub use error::{
    ConflictError, Error, IdentityError, LookupError, LookupErrorKind, PropertyError,
    PropertyErrorKind, Result, StateError, StateErrorKind, StorageError,
};
pub use identity::{EntityId, IdHash};
pub use metadata::{
    Cascade, EntityClass, EntityMetadata, Order, PropertyMetadata, RelationshipKind,
    RelationshipMetadata, RepositoryId,
};
pub use row::StorageRow;
pub use value::Value;
