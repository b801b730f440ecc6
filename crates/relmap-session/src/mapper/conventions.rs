//! Entity property ↔ storage column naming.

use relmap_core::StorageRow;

/// Naming conventions of one storage table.
///
/// Properties map to identically named columns unless renamed explicitly.
#[derive(Debug, Clone)]
pub struct Conventions {
    primary_key: Vec<String>,
    /// `(entity property, storage column)` pairs.
    mappings: Vec<(String, String)>,
}

impl Default for Conventions {
    fn default() -> Self {
        Self::new(&["id"])
    }
}

impl Conventions {
    /// Conventions with the given storage primary-key columns.
    pub fn new(primary_key: &[&str]) -> Self {
        Self {
            primary_key: primary_key.iter().map(|c| (*c).to_string()).collect(),
            mappings: Vec::new(),
        }
    }

    /// Map an entity property to a differently named column.
    #[must_use]
    pub fn with_mapping(mut self, property: impl Into<String>, column: impl Into<String>) -> Self {
        self.mappings.push((property.into(), column.into()));
        self
    }

    /// Storage primary-key columns.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn convert_entity_to_storage_key(&self, property: &str) -> String {
        self.mappings
            .iter()
            .find(|(p, _)| p == property)
            .map_or_else(|| property.to_string(), |(_, c)| c.clone())
    }

    pub fn convert_storage_to_entity_key(&self, column: &str) -> String {
        self.mappings
            .iter()
            .find(|(_, c)| c == column)
            .map_or_else(|| column.to_string(), |(p, _)| p.clone())
    }

    pub fn convert_entity_to_storage(&self, row: StorageRow) -> StorageRow {
        if self.mappings.is_empty() {
            return row;
        }
        row.map_keys(|k| self.convert_entity_to_storage_key(k))
    }

    pub fn convert_storage_to_entity(&self, row: StorageRow) -> StorageRow {
        if self.mappings.is_empty() {
            return row;
        }
        row.map_keys(|k| self.convert_storage_to_entity_key(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::Value;

    #[test]
    fn unmapped_keys_pass_through() {
        let conventions = Conventions::default();
        assert_eq!(conventions.convert_entity_to_storage_key("title"), "title");
        assert_eq!(conventions.primary_key(), ["id".to_string()]);
    }

    #[test]
    fn mapped_keys_round_trip() {
        let conventions = Conventions::default().with_mapping("author", "author_id");
        let row = StorageRow::from_pairs([("id", Value::BigInt(1)), ("author", Value::BigInt(2))]);
        let stored = conventions.convert_entity_to_storage(row);
        assert!(stored.contains("author_id"));
        assert!(!stored.contains("author"));
        let back = conventions.convert_storage_to_entity(stored);
        assert_eq!(back.get("author"), Some(&Value::BigInt(2)));
    }
}
