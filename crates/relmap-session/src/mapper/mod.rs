//! Storage mappers.
//!
//! A [`Mapper`] is the only component that talks to storage. It exchanges
//! [`StorageRow`]s keyed by storage column names; the owning repository
//! translates keys with the mapper's [`Conventions`].

mod conventions;
mod memory;

pub use conventions::Conventions;
pub use memory::MemoryMapper;

use relmap_core::{EntityId, Result, StorageRow, Value};

/// Storage backend of one repository.
///
/// Writes may be buffered until [`Mapper::flush`]; [`Mapper::rollback`]
/// discards unflushed writes.
pub trait Mapper: Send + Sync {
    /// Key translation between entity properties and storage columns.
    fn conventions(&self) -> &Conventions;

    fn find_by_id(&self, id: &EntityId) -> Result<Option<StorageRow>>;

    /// Rows for the given identities; missing identities are skipped.
    fn find_by_ids(&self, ids: &[EntityId]) -> Result<Vec<StorageRow>>;

    fn find_all(&self) -> Result<Vec<StorageRow>>;

    /// Rows whose `column` holds any of `values`.
    fn find_by_column(&self, column: &str, values: &[Value]) -> Result<Vec<StorageRow>>;

    /// Insert (`id` is `None`) or update a row and return its identity.
    fn persist(&self, row: StorageRow, id: Option<&EntityId>) -> Result<EntityId>;

    fn remove(&self, id: &EntityId) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn rollback(&self);

    /// Drop any cached query results.
    fn clear_cache(&self) {}
}
