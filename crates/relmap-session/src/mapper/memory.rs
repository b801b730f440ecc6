//! In-memory mapper.

use super::{Conventions, Mapper};
use crate::lock;
use relmap_core::{EntityId, Error, IdHash, Result, StorageRow, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    rows: Vec<StorageRow>,
    /// Last auto-increment value handed out.
    next_id: i64,
}

impl Table {
    fn position(&self, primary_key: &[String], hash: &IdHash) -> Option<usize> {
        self.rows.iter().position(|row| {
            EntityId::from_row(primary_key, row).is_ok_and(|id| id.hash() == *hash)
        })
    }

    fn bump(&mut self, id: &EntityId) {
        if let Some(value) = id.as_scalar().and_then(Value::as_i64) {
            self.next_id = self.next_id.max(value);
        }
    }
}

struct MemoryState {
    committed: Table,
    working: Table,
}

/// Mapper keeping rows in memory.
///
/// Writes apply to a working copy immediately so later reads see them;
/// `flush` commits the working copy and `rollback` restores the last commit.
/// Single-column keys missing from an inserted row are auto-incremented.
pub struct MemoryMapper {
    conventions: Conventions,
    state: Mutex<MemoryState>,
}

impl MemoryMapper {
    pub fn new(conventions: Conventions) -> Self {
        Self {
            conventions,
            state: Mutex::new(MemoryState {
                committed: Table::default(),
                working: Table::default(),
            }),
        }
    }

    /// Create a mapper seeded with committed rows.
    pub fn with_rows(conventions: Conventions, rows: Vec<StorageRow>) -> Result<Self> {
        let mapper = Self::new(conventions);
        mapper.seed(Table { rows, next_id: 0 })?;
        Ok(mapper)
    }

    fn seed(&self, mut table: Table) -> Result<()> {
        for row in &table.rows {
            let id = EntityId::from_row(self.conventions.primary_key(), row)?;
            if let Some(value) = id.as_scalar().and_then(Value::as_i64) {
                table.next_id = table.next_id.max(value);
            }
        }
        let mut state = lock(&self.state);
        state.working = table.clone();
        state.committed = table;
        Ok(())
    }

    /// Committed rows.
    pub fn rows(&self) -> Vec<StorageRow> {
        lock(&self.state).committed.rows.clone()
    }

    /// Whether there are unflushed writes.
    pub fn has_pending_writes(&self) -> bool {
        let state = lock(&self.state);
        state.working.rows != state.committed.rows
    }

    /// Serialize the committed rows to JSON.
    pub fn export_json(&self) -> Result<String> {
        let state = lock(&self.state);
        Ok(serde_json::to_string_pretty(&state.committed)?)
    }

    /// Replace all rows (committed and working) with a JSON export.
    pub fn import_json(&self, json: &str) -> Result<()> {
        let table: Table = serde_json::from_str(json)?;
        self.seed(table)
    }
}

impl Mapper for MemoryMapper {
    fn conventions(&self) -> &Conventions {
        &self.conventions
    }

    fn find_by_id(&self, id: &EntityId) -> Result<Option<StorageRow>> {
        let state = lock(&self.state);
        let primary_key = self.conventions.primary_key();
        Ok(state
            .working
            .position(primary_key, &id.hash())
            .map(|index| state.working.rows[index].clone()))
    }

    fn find_by_ids(&self, ids: &[EntityId]) -> Result<Vec<StorageRow>> {
        let hashes: Vec<IdHash> = ids.iter().map(EntityId::hash).collect();
        let state = lock(&self.state);
        let primary_key = self.conventions.primary_key();
        Ok(state
            .working
            .rows
            .iter()
            .filter(|row| {
                EntityId::from_row(primary_key, row).is_ok_and(|id| hashes.contains(&id.hash()))
            })
            .cloned()
            .collect())
    }

    fn find_all(&self) -> Result<Vec<StorageRow>> {
        Ok(lock(&self.state).working.rows.clone())
    }

    fn find_by_column(&self, column: &str, values: &[Value]) -> Result<Vec<StorageRow>> {
        let hashes: Vec<IdHash> = values.iter().map(IdHash::from).collect();
        let state = lock(&self.state);
        Ok(state
            .working
            .rows
            .iter()
            .filter(|row| {
                row.get(column)
                    .is_some_and(|value| !value.is_null() && hashes.contains(&IdHash::from(value)))
            })
            .cloned()
            .collect())
    }

    fn persist(&self, mut row: StorageRow, id: Option<&EntityId>) -> Result<EntityId> {
        let primary_key = self.conventions.primary_key().to_vec();
        let mut state = lock(&self.state);
        let table = &mut state.working;

        if let Some(id) = id {
            if let Some(index) = table.position(&primary_key, &id.hash()) {
                let stored = &mut table.rows[index];
                for (column, value) in row {
                    stored.set(column, value);
                }
                tracing::trace!(id = %id, "Updated row");
                return Ok(id.clone());
            }
        }

        let id = match EntityId::from_row(&primary_key, &row) {
            Ok(id) => id,
            Err(_) if primary_key.len() == 1 => {
                table.next_id += 1;
                let value = Value::BigInt(table.next_id);
                row.set(primary_key[0].clone(), value.clone());
                EntityId::Scalar(value)
            }
            Err(err) => return Err(err),
        };
        if table.position(&primary_key, &id.hash()).is_some() {
            return Err(Error::storage(format!("Duplicate primary key '{id}'.")));
        }
        table.bump(&id);
        table.rows.push(row);
        tracing::trace!(id = %id, "Inserted row");
        Ok(id)
    }

    fn remove(&self, id: &EntityId) -> Result<()> {
        let primary_key = self.conventions.primary_key();
        let mut state = lock(&self.state);
        if let Some(index) = state.working.position(primary_key, &id.hash()) {
            state.working.rows.remove(index);
            tracing::trace!(id = %id, "Removed row");
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.committed = state.working.clone();
        Ok(())
    }

    fn rollback(&self) {
        let mut state = lock(&self.state);
        state.working = state.committed.clone();
    }
}

impl fmt::Debug for MemoryMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryMapper")
            .field("conventions", &self.conventions)
            .field("rows", &state.committed.rows.len())
            .field("pending", &(state.working.rows != state.committed.rows))
            .finish()
    }
}
