//! Entity and relationship metadata.
//!
//! Metadata is declared once at configuration time and shared (`Arc`) by every
//! entity of a class. Entity classes and repositories are identified by plain
//! string tags, so routing an entity to its repository is a map lookup on a
//! closed set built up front rather than runtime type inspection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag naming an entity class (e.g. `"Book"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityClass(&'static str);

impl EntityClass {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Tag identifying a repository (e.g. `"BooksRepository"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryId(&'static str);

impl RepositoryId {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many-to-one: many `Book`s belong to one `Author`. Holds the foreign key.
    ManyHasOne,
    /// One-to-many: one `Author` has many `Book`s.
    OneHasMany,
    /// One-to-one: the `is_main` side holds the foreign key.
    OneHasOne,
}

/// Which operations cascade through a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cascade {
    pub persist: bool,
    pub remove: bool,
}

impl Default for Cascade {
    fn default() -> Self {
        Self {
            persist: true,
            remove: false,
        }
    }
}

/// Sort direction for a relationship's default order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Metadata about a relationship property.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipMetadata {
    /// Relationship cardinality.
    pub kind: RelationshipKind,
    /// Target entity class.
    pub entity: EntityClass,
    /// Inverse property on the target entity, if the relationship is bidirectional.
    pub property: Option<String>,
    /// Whether this side owns the association (one-to-one only).
    pub is_main: bool,
    /// Cascade configuration.
    pub cascade: Cascade,
    /// Default ordering of a one-to-many collection.
    pub order_by: Option<(String, Order)>,
}

impl RelationshipMetadata {
    /// Create a relationship of the given kind targeting `entity`.
    #[must_use]
    pub fn new(kind: RelationshipKind, entity: EntityClass) -> Self {
        Self {
            kind,
            entity,
            property: None,
            is_main: false,
            cascade: Cascade::default(),
            order_by: None,
        }
    }

    /// Set the inverse property on the target entity.
    #[must_use]
    pub fn inverse(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    /// Mark this side as the owning side.
    #[must_use]
    pub fn main(mut self, is_main: bool) -> Self {
        self.is_main = is_main;
        self
    }

    /// Set the cascade flags.
    #[must_use]
    pub fn cascade(mut self, persist: bool, remove: bool) -> Self {
        self.cascade = Cascade { persist, remove };
        self
    }

    /// Set the default ordering of the collection.
    #[must_use]
    pub fn order_by(mut self, property: impl Into<String>, order: Order) -> Self {
        self.order_by = Some((property.into(), order));
        self
    }

    /// Whether this side stores the foreign key of the association.
    pub fn holds_foreign_key(&self) -> bool {
        match self.kind {
            RelationshipKind::ManyHasOne => true,
            RelationshipKind::OneHasOne => self.is_main,
            RelationshipKind::OneHasMany => false,
        }
    }
}

/// Metadata about a single entity property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMetadata {
    /// Property name.
    pub name: String,
    /// Whether NULL is an accepted value.
    pub nullable: bool,
    /// Whether writes through the public setter are rejected.
    pub read_only: bool,
    /// Whether this property is part of the primary key.
    pub is_primary: bool,
    /// Relationship metadata, for relationship properties.
    pub relationship: Option<RelationshipMetadata>,
}

impl PropertyMetadata {
    /// Create a plain, non-nullable property.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: false,
            read_only: false,
            is_primary: false,
            relationship: None,
        }
    }

    /// Create a relationship property.
    #[must_use]
    pub fn relationship(name: impl Into<String>, relationship: RelationshipMetadata) -> Self {
        let mut property = Self::new(name);
        property.relationship = Some(relationship);
        property
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Check if this is a relationship property.
    pub fn is_relationship(&self) -> bool {
        self.relationship.is_some()
    }
}

/// Metadata describing an entity class.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    /// The entity class tag.
    pub class: EntityClass,
    /// Primary key properties, in declared order.
    pub primary_key: Vec<String>,
    /// All properties, primary key included.
    pub properties: Vec<PropertyMetadata>,
}

impl EntityMetadata {
    /// Create metadata with an `id` primary key.
    #[must_use]
    pub fn new(class: EntityClass) -> Self {
        Self {
            class,
            primary_key: vec!["id".to_string()],
            properties: vec![PropertyMetadata::new("id").nullable(true).primary()],
        }
    }

    /// Replace the primary key with the given properties.
    ///
    /// Properties not yet declared are added as primary-key properties.
    #[must_use]
    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        for property in &mut self.properties {
            property.is_primary = false;
        }
        self.properties.retain(|p| p.name != "id" || columns.contains(&"id"));
        for column in columns {
            match self.properties.iter_mut().find(|p| p.name == *column) {
                Some(property) => property.is_primary = true,
                None => self
                    .properties
                    .push(PropertyMetadata::new(*column).nullable(true).primary()),
            }
        }
        self.primary_key = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Add a property.
    #[must_use]
    pub fn property(mut self, property: PropertyMetadata) -> Self {
        self.properties.retain(|p| p.name != property.name);
        self.properties.push(property);
        self
    }

    /// Check if the class declares a property.
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p.name == name)
    }

    /// Get a property's metadata.
    pub fn get_property(&self, name: &str) -> Option<&PropertyMetadata> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Iterate over relationship properties in declared order.
    pub fn relationships(&self) -> impl Iterator<Item = (&PropertyMetadata, &RelationshipMetadata)> {
        self.properties
            .iter()
            .filter_map(|p| p.relationship.as_ref().map(|r| (p, r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHOR: EntityClass = EntityClass::new("Author");
    const BOOK: EntityClass = EntityClass::new("Book");

    #[test]
    fn default_cascade_persists_but_does_not_remove() {
        let rel = RelationshipMetadata::new(RelationshipKind::OneHasMany, BOOK);
        assert!(rel.cascade.persist);
        assert!(!rel.cascade.remove);
    }

    #[test]
    fn foreign_key_side() {
        let many = RelationshipMetadata::new(RelationshipKind::ManyHasOne, AUTHOR);
        assert!(many.holds_foreign_key());
        let one = RelationshipMetadata::new(RelationshipKind::OneHasOne, AUTHOR);
        assert!(!one.holds_foreign_key());
        assert!(one.main(true).holds_foreign_key());
        let has_many = RelationshipMetadata::new(RelationshipKind::OneHasMany, BOOK);
        assert!(!has_many.holds_foreign_key());
    }

    #[test]
    fn entity_metadata_properties() {
        let meta = EntityMetadata::new(BOOK)
            .property(PropertyMetadata::new("title"))
            .property(PropertyMetadata::relationship(
                "author",
                RelationshipMetadata::new(RelationshipKind::ManyHasOne, AUTHOR).inverse("books"),
            ));
        assert!(meta.has_property("id"));
        assert!(meta.has_property("title"));
        assert!(!meta.has_property("missing"));
        let rels: Vec<_> = meta.relationships().map(|(p, _)| p.name.as_str()).collect();
        assert_eq!(rels, vec!["author"]);
    }

    #[test]
    fn composite_primary_key_replaces_id() {
        let meta = EntityMetadata::new(BOOK).with_primary_key(&["book_id", "tag_id"]);
        assert_eq!(meta.primary_key, vec!["book_id", "tag_id"]);
        assert!(!meta.has_property("id"));
        assert!(meta.get_property("book_id").is_some_and(|p| p.is_primary));
    }
}
