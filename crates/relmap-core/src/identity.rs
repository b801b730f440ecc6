//! Persisted entity identities.
//!
//! An identity is either a single scalar value or an ordered mapping of
//! primary-key field to value. Both collapse into an [`IdHash`], the string
//! key used by identity maps and grouped result batches.

use crate::error::{Error, IdentityError, Result};
use crate::row::StorageRow;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The persisted primary-key value(s) of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityId {
    /// Single-column primary key.
    Scalar(Value),
    /// Multi-column primary key, in declared field order.
    Composite(Vec<(String, Value)>),
}

impl EntityId {
    /// Build a composite identity from `(field, value)` pairs.
    pub fn composite<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        EntityId::Composite(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Extract an identity from a row given the primary-key columns.
    ///
    /// A single key column yields a scalar identity, several yield a composite
    /// one. Missing or NULL key columns are an error.
    pub fn from_row(primary_key: &[String], row: &StorageRow) -> Result<Self> {
        let mut fields = Vec::with_capacity(primary_key.len());
        for column in primary_key {
            match row.get(column) {
                Some(value) if !value.is_null() => fields.push((column.clone(), value.clone())),
                _ => {
                    return Err(Error::Identity(IdentityError {
                        message: format!("Row is missing primary key column '{column}'."),
                    }));
                }
            }
        }
        match fields.len() {
            0 => Err(Error::Identity(IdentityError {
                message: "Entity has no primary key columns.".to_string(),
            })),
            1 => Ok(EntityId::Scalar(fields.remove(0).1)),
            _ => Ok(EntityId::Composite(fields)),
        }
    }

    /// The identity hash used as map key.
    pub fn hash(&self) -> IdHash {
        match self {
            EntityId::Scalar(value) => IdHash(value.to_identity_string()),
            EntityId::Composite(fields) => IdHash(
                fields
                    .iter()
                    .map(|(_, v)| v.to_identity_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        }
    }

    /// The scalar value, if this is a single-column identity.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            EntityId::Scalar(value) => Some(value),
            EntityId::Composite(_) => None,
        }
    }

    /// Get the scalar value or fail for composite identities.
    pub fn to_scalar(&self) -> Result<Value> {
        self.as_scalar().cloned().ok_or_else(|| {
            Error::Identity(IdentityError {
                message: format!("Composite identity ({self}) cannot be used as a scalar key."),
            })
        })
    }

    /// Iterate over `(field, value)` pairs given the primary-key columns.
    pub fn fields<'a>(&'a self, primary_key: &'a [String]) -> Vec<(&'a str, &'a Value)> {
        match self {
            EntityId::Scalar(value) => primary_key
                .first()
                .map(|column| vec![(column.as_str(), value)])
                .unwrap_or_default(),
            EntityId::Composite(fields) => fields.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash().0)
    }
}

impl From<Value> for EntityId {
    fn from(value: Value) -> Self {
        EntityId::Scalar(value)
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Scalar(Value::BigInt(value))
    }
}

impl From<i32> for EntityId {
    fn from(value: i32) -> Self {
        EntityId::Scalar(Value::Int(value))
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Scalar(Value::Text(value.to_string()))
    }
}

/// String form of an identity, used as identity-map and grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdHash(String);

impl IdHash {
    /// Borrow the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Value> for IdHash {
    fn from(value: &Value) -> Self {
        IdHash(value.to_identity_string())
    }
}

impl From<&EntityId> for IdHash {
    fn from(id: &EntityId) -> Self {
        id.hash()
    }
}

impl fmt::Display for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_hash_is_string_form() {
        assert_eq!(EntityId::from(5_i64).hash().as_str(), "5");
        assert_eq!(EntityId::from("abc").hash().as_str(), "abc");
    }

    #[test]
    fn composite_hash_joins_in_declared_order() {
        let id = EntityId::composite([("book_id", 1_i64), ("tag_id", 2_i64)]);
        assert_eq!(id.hash().as_str(), "1,2");

        let reversed = EntityId::composite([("tag_id", 2_i64), ("book_id", 1_i64)]);
        assert_eq!(reversed.hash().as_str(), "2,1");
    }

    #[test]
    fn composite_with_timestamps_does_not_collide() {
        let a = EntityId::Composite(vec![
            ("id".into(), Value::BigInt(1)),
            ("at".into(), Value::Timestamp(1_000_000)),
        ]);
        let b = EntityId::Composite(vec![
            ("id".into(), Value::BigInt(1)),
            ("at".into(), Value::Timestamp(1_000_001)),
        ]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn from_row_scalar_and_composite() {
        let mut row = StorageRow::new();
        row.set("id", Value::BigInt(3));
        row.set("lang", Value::Text("en".into()));

        let scalar = EntityId::from_row(&["id".to_string()], &row).unwrap();
        assert_eq!(scalar, EntityId::Scalar(Value::BigInt(3)));

        let composite = EntityId::from_row(&["id".to_string(), "lang".to_string()], &row).unwrap();
        assert_eq!(composite.hash().as_str(), "3,en");
    }

    #[test]
    fn from_row_missing_column_fails() {
        let row = StorageRow::new();
        let err = EntityId::from_row(&["id".to_string()], &row).unwrap_err();
        assert!(matches!(err, Error::Identity(_)));
    }

    #[test]
    fn composite_is_not_scalar() {
        let id = EntityId::composite([("a", 1_i64), ("b", 2_i64)]);
        assert!(id.as_scalar().is_none());
        assert!(id.to_scalar().is_err());
    }
}
