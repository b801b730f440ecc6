//! Storage row representation.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A single row exchanged with the storage layer.
///
/// Columns keep insertion order; setting an existing column replaces its value
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageRow {
    columns: Vec<(String, Value)>,
}

impl StorageRow {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut row = Self::new();
        for (k, v) in pairs {
            row.set(k, v);
        }
        row
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get a value by column name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Check if a column exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a column value, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.columns.iter_mut().find(|(column, _)| *column == name) {
            slot.1 = value;
        } else {
            self.columns.push((name, value));
        }
    }

    /// Remove a column, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let index = self.columns.iter().position(|(column, _)| column == name)?;
        Some(self.columns.remove(index).1)
    }

    /// Get all column names.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(column, _)| column.as_str())
    }

    /// Iterate over `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(column, value)| (column.as_str(), value))
    }

    /// Rename columns with the given function, keeping order.
    pub fn map_keys(self, mut f: impl FnMut(&str) -> String) -> Self {
        Self {
            columns: self
                .columns
                .into_iter()
                .map(|(column, value)| (f(&column), value))
                .collect(),
        }
    }
}

impl IntoIterator for StorageRow {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.into_iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for StorageRow {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_in_place() {
        let mut row = StorageRow::from_pairs([("id", Value::BigInt(1)), ("name", "a".into())]);
        row.set("id", Value::BigInt(2));
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("id"), Some(&Value::BigInt(2)));
        assert_eq!(row.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
    }

    #[test]
    fn remove_and_contains() {
        let mut row = StorageRow::from_pairs([("id", 1_i64)]);
        assert!(row.contains("id"));
        assert_eq!(row.remove("id"), Some(Value::BigInt(1)));
        assert!(row.is_empty());
        assert_eq!(row.remove("id"), None);
    }

    #[test]
    fn map_keys_renames() {
        let row = StorageRow::from_pairs([("full_name", "x")]);
        let row = row.map_keys(|k| if k == "full_name" { "name".into() } else { k.into() });
        assert!(row.contains("name"));
    }
}
