//! Entity instances and shared handles.
//!
//! An [`Entity`] is a dynamic property bag described by its class metadata. It
//! is always shared through an [`EntityHandle`] (`Arc<RwLock<Entity>>`): the
//! identity map, relationship collections and result batches all point at the
//! same instance, and identity comparisons are pointer comparisons.
//!
//! Locks are held only for the duration of a single read or write. Lifecycle
//! hooks and relationship propagation always run with the lock released.

use crate::collection::EntityIterator;
use crate::model::Model;
use crate::relationships::{HasOne, OneHasMany, Relationship};
use crate::repository::Repository;
use crate::schema::{EntityLifecycle, EntitySchema};
use crate::{read, write};
use relmap_core::{
    EntityClass, EntityId, EntityMetadata, Error, PropertyErrorKind, PropertyMetadata,
    RelationshipKind, RepositoryId, Result, StateErrorKind, StorageRow, Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Repository and model an entity is attached to.
struct Attachment {
    repository: RepositoryId,
    model: Weak<Model>,
}

/// The state of one entity instance.
pub struct Entity {
    schema: Arc<EntitySchema>,
    /// Scalar values and raw foreign keys, by property name.
    values: BTreeMap<String, Value>,
    persisted_id: Option<EntityId>,
    modified: BTreeSet<String>,
    /// Relationship wrappers, created on first access.
    relationships: HashMap<String, Relationship>,
    preload_container: Option<Weak<EntityIterator>>,
    attachment: Option<Attachment>,
}

impl Entity {
    fn empty(schema: Arc<EntitySchema>) -> Self {
        Self {
            schema,
            values: BTreeMap::new(),
            persisted_id: None,
            modified: BTreeSet::new(),
            relationships: HashMap::new(),
            preload_container: None,
            attachment: None,
        }
    }

    pub fn class(&self) -> EntityClass {
        self.schema.class()
    }

    pub fn metadata(&self) -> &EntityMetadata {
        &self.schema.metadata
    }

    pub fn persisted_id(&self) -> Option<&EntityId> {
        self.persisted_id.as_ref()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted_id.is_some()
    }

    /// A new (never persisted) entity counts as modified.
    pub fn is_modified(&self) -> bool {
        self.persisted_id.is_none() || !self.modified.is_empty()
    }

    pub fn is_property_modified(&self, name: &str) -> bool {
        self.persisted_id.is_none() || self.modified.contains(name)
    }

    /// The repository this entity is attached to.
    pub fn repository_id(&self) -> Option<RepositoryId> {
        self.attachment.as_ref().map(|a| a.repository)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    fn property(&self, name: &str) -> Result<&PropertyMetadata> {
        self.schema.metadata.get_property(name).ok_or_else(|| {
            Error::property(self.class().name(), name, PropertyErrorKind::Undefined)
        })
    }

    fn values_from_row(metadata: &EntityMetadata, row: &StorageRow) -> BTreeMap<String, Value> {
        metadata
            .properties
            .iter()
            .filter(|p| p.relationship.as_ref().is_none_or(|r| r.holds_foreign_key()))
            .filter_map(|p| row.get(&p.name).map(|v| (p.name.clone(), v.clone())))
            .collect()
    }
}

/// Stable address of an entity instance, usable as a set or map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(usize);

/// Shared reference to an entity.
#[derive(Clone)]
pub struct EntityHandle(Arc<RwLock<Entity>>);

/// Non-owning reference to an entity.
#[derive(Clone, Default)]
pub struct WeakEntityHandle(Weak<RwLock<Entity>>);

impl WeakEntityHandle {
    pub fn upgrade(&self) -> Option<EntityHandle> {
        self.0.upgrade().map(EntityHandle)
    }
}

impl EntityHandle {
    /// Create a new, unpersisted and unattached entity.
    pub fn new(schema: Arc<EntitySchema>) -> Self {
        Self(Arc::new(RwLock::new(Entity::empty(schema))))
    }

    /// Build an entity from a storage row (keys already in entity terms).
    ///
    /// The instance is allocated empty first and hydrated second, so no hook
    /// can observe a half-built entity. Hooks are fired by the caller.
    pub(crate) fn from_storage_row(schema: Arc<EntitySchema>, row: &StorageRow) -> Result<Self> {
        let id = EntityId::from_row(&schema.metadata.primary_key, row)?;
        let handle = Self::new(schema);
        {
            let mut entity = handle.write();
            entity.values = Entity::values_from_row(&entity.schema.metadata, row);
            entity.persisted_id = Some(id);
        }
        Ok(handle)
    }

    /// Lock the entity for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        read(&self.0)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        write(&self.0)
    }

    pub fn downgrade(&self) -> WeakEntityHandle {
        WeakEntityHandle(Arc::downgrade(&self.0))
    }

    /// Check whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &EntityHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey(Arc::as_ptr(&self.0).addr())
    }

    pub fn class(&self) -> EntityClass {
        self.read().class()
    }

    pub fn schema(&self) -> Arc<EntitySchema> {
        Arc::clone(&self.read().schema)
    }

    pub fn metadata(&self) -> Arc<EntityMetadata> {
        Arc::clone(&self.read().schema.metadata)
    }

    pub fn persisted_id(&self) -> Option<EntityId> {
        self.read().persisted_id.clone()
    }

    pub fn is_persisted(&self) -> bool {
        self.read().is_persisted()
    }

    pub fn is_modified(&self) -> bool {
        self.read().is_modified()
    }

    pub fn is_property_modified(&self, name: &str) -> bool {
        self.read().is_property_modified(name)
    }

    /// Flag a property as changed.
    pub fn set_as_modified(&self, name: &str) {
        self.write().modified.insert(name.to_string());
    }

    pub fn is_attached(&self) -> bool {
        self.read().is_attached()
    }

    pub fn repository_id(&self) -> Option<RepositoryId> {
        self.read().repository_id()
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Get a scalar property value. Unset properties read as NULL.
    pub fn get_value(&self, name: &str) -> Result<Value> {
        let entity = self.read();
        let property = entity.property(name)?;
        if property.is_relationship() {
            return Err(Error::property(
                entity.class().name(),
                name,
                PropertyErrorKind::WrongKind,
            ));
        }
        Ok(entity.values.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Set a scalar property value through the public path.
    pub fn set_value(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.assign(name, value.into(), true)
    }

    /// Set a scalar property value, bypassing the read-only check.
    pub fn set_read_only_value(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.assign(name, value.into(), false)
    }

    fn assign(&self, name: &str, value: Value, enforce_read_only: bool) -> Result<()> {
        let mut entity = self.write();
        let class = entity.class().name();
        let property = entity.property(name)?;
        let kind = if property.is_relationship() {
            Some(PropertyErrorKind::WrongKind)
        } else if enforce_read_only && property.read_only {
            Some(PropertyErrorKind::ReadOnly)
        } else if value.is_null() && !property.nullable {
            Some(PropertyErrorKind::NotNullable)
        } else {
            None
        };
        if let Some(kind) = kind {
            return Err(Error::property(class, name, kind));
        }

        let current = entity.values.get(name);
        if current == Some(&value) {
            return Ok(());
        }
        if property.is_primary && entity.persisted_id.is_some() {
            return Err(Error::property(class, name, PropertyErrorKind::ReadOnly));
        }
        entity.values.insert(name.to_string(), value);
        entity.modified.insert(name.to_string());
        Ok(())
    }

    /// Check whether a property holds a non-NULL value (or a related entity).
    pub fn has_value(&self, name: &str) -> Result<bool> {
        let is_relationship = self.read().property(name)?.is_relationship();
        if !is_relationship {
            return Ok(self.read().values.get(name).is_some_and(|v| !v.is_null()));
        }
        match self.relationship(name)? {
            Relationship::HasOne(has_one) => has_one.has_value(),
            Relationship::HasMany(_) => Ok(true),
        }
    }

    /// Raw stored value of a property: scalars as-is, foreign keys as the
    /// referenced identity. `None` for unset or non-storable properties.
    pub fn get_raw_value(&self, name: &str) -> Option<Value> {
        let (wrapper, value) = {
            let entity = self.read();
            let wrapper = match entity.relationships.get(name) {
                Some(Relationship::HasOne(has_one)) => Some(Arc::clone(has_one)),
                _ => None,
            };
            (wrapper, entity.values.get(name).cloned())
        };
        match wrapper {
            Some(has_one) => has_one.raw_value(),
            None => value,
        }
    }

    /// Build the storage row (entity keys) for this entity.
    pub(crate) fn to_storage_row(&self) -> StorageRow {
        let mut row = StorageRow::new();
        let mut foreign_keys = Vec::new();
        {
            let entity = self.read();
            for property in &entity.schema.metadata.properties {
                match &property.relationship {
                    Some(rel) if rel.holds_foreign_key() => foreign_keys.push(property.name.clone()),
                    Some(_) => {}
                    None => {
                        if let Some(value) = entity.values.get(&property.name) {
                            row.set(property.name.clone(), value.clone());
                        }
                    }
                }
            }
        }
        for name in foreign_keys {
            let value = self.get_raw_value(&name).unwrap_or(Value::Null);
            row.set(name, value);
        }
        row
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    /// Get (creating on first access) the relationship wrapper of a property.
    pub fn relationship(&self, name: &str) -> Result<Relationship> {
        let (class, property, relationship, raw) = {
            let entity = self.read();
            if let Some(existing) = entity.relationships.get(name) {
                return Ok(existing.clone());
            }
            let property = entity.property(name)?;
            let Some(relationship) = property.relationship.clone() else {
                return Err(Error::property(
                    entity.class().name(),
                    name,
                    PropertyErrorKind::NotARelationship,
                ));
            };
            (
                entity.class(),
                Arc::new(property.clone()),
                relationship,
                entity.values.get(name).cloned(),
            )
        };

        let parent = self.downgrade();
        let created = match relationship.kind {
            RelationshipKind::OneHasMany => {
                Relationship::HasMany(OneHasMany::new(parent, class, property, relationship))
            }
            RelationshipKind::ManyHasOne | RelationshipKind::OneHasOne => Relationship::HasOne(
                HasOne::new(parent, class, property, relationship, raw),
            ),
        };

        let mut entity = self.write();
        Ok(entity
            .relationships
            .entry(name.to_string())
            .or_insert(created)
            .clone())
    }

    /// The relationship wrapper of a property, if it was ever accessed.
    pub(crate) fn existing_relationship(&self, name: &str) -> Option<Relationship> {
        self.read().relationships.get(name).cloned()
    }

    /// The has-one wrapper of a many-has-one or one-has-one property.
    pub fn has_one(&self, name: &str) -> Result<Arc<HasOne>> {
        match self.relationship(name)? {
            Relationship::HasOne(has_one) => Ok(has_one),
            Relationship::HasMany(_) => Err(Error::property(
                self.class().name(),
                name,
                PropertyErrorKind::WrongKind,
            )),
        }
    }

    /// The collection wrapper of a one-has-many property.
    pub fn has_many(&self, name: &str) -> Result<Arc<OneHasMany>> {
        match self.relationship(name)? {
            Relationship::HasMany(has_many) => Ok(has_many),
            Relationship::HasOne(_) => Err(Error::property(
                self.class().name(),
                name,
                PropertyErrorKind::WrongKind,
            )),
        }
    }

    /// Get the entity referenced by a has-one property.
    pub fn get_reference(&self, name: &str) -> Result<Option<EntityHandle>> {
        self.has_one(name)?.get()
    }

    /// Point a has-one property at another entity (or nothing).
    pub fn set_reference(&self, name: &str, value: Option<&EntityHandle>) -> Result<()> {
        self.has_one(name)?.set(value).map(|_| ())
    }

    /// Set a has-one property without the read-only and null checks.
    pub fn set_read_only_reference(&self, name: &str, value: Option<&EntityHandle>) -> Result<()> {
        self.has_one(name)?.set_injected(value, true).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Preloading
    // ------------------------------------------------------------------

    /// The batch this entity was last fetched through, if still alive.
    pub fn preload_container(&self) -> Option<Arc<EntityIterator>> {
        self.read().preload_container.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_preload_container(&self, container: Option<&Arc<EntityIterator>>) {
        self.write().preload_container = container.map(Arc::downgrade);
    }

    /// Raw values of `property` across this entity's whole batch.
    pub fn preload_values(&self, property: &str) -> Option<Arc<Vec<Value>>> {
        let container = self.preload_container()?;
        Some(container.preload_values(property))
    }

    // ------------------------------------------------------------------
    // Repository
    // ------------------------------------------------------------------

    /// The model this entity is attached to.
    pub fn model(&self) -> Result<Arc<Model>> {
        let entity = self.read();
        match &entity.attachment {
            Some(attachment) => attachment.model.upgrade().ok_or_else(|| {
                Error::state(
                    StateErrorKind::Detached,
                    format!("Model of {} entity has been dropped.", entity.class()),
                )
            }),
            None => Err(Error::state(
                StateErrorKind::NotAttached,
                format!("Entity {} is not attached to a repository.", entity.class()),
            )),
        }
    }

    /// The repository this entity is attached to.
    pub fn repository(&self) -> Result<Arc<dyn Repository>> {
        let model = self.model()?;
        match self.repository_id() {
            Some(id) => model.repository(id),
            None => Err(Error::state(
                StateErrorKind::NotAttached,
                format!("Entity {} is not attached to a repository.", self.class()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    fn lifecycle(&self) -> Option<Arc<dyn EntityLifecycle>> {
        self.read().schema.lifecycle.clone()
    }

    pub(crate) fn on_load(&self, row: &StorageRow) {
        if let Some(hooks) = self.lifecycle() {
            hooks.on_load(self, row);
        }
    }

    pub(crate) fn on_attach(&self, repository: RepositoryId, model: Weak<Model>) {
        self.write().attachment = Some(Attachment { repository, model });
        if let Some(hooks) = self.lifecycle() {
            hooks.on_attach(self);
        }
    }

    pub(crate) fn on_detach(&self) {
        self.write().attachment = None;
        if let Some(hooks) = self.lifecycle() {
            hooks.on_detach(self);
        }
    }

    pub(crate) fn on_persist(&self, id: &EntityId) {
        {
            let mut entity = self.write();
            let primary_key = entity.schema.metadata.primary_key.clone();
            for (field, value) in id.fields(&primary_key) {
                entity.values.insert(field.to_string(), value.clone());
            }
            entity.persisted_id = Some(id.clone());
            entity.modified.clear();
        }
        if let Some(hooks) = self.lifecycle() {
            hooks.on_persist(self, id);
        }
    }

    pub(crate) fn on_remove(&self) {
        {
            let mut entity = self.write();
            entity.persisted_id = None;
            entity.modified.clear();
        }
        if let Some(hooks) = self.lifecycle() {
            hooks.on_remove(self);
        }
    }

    /// Overwrite values with a freshly fetched row and drop relationship state.
    pub(crate) fn on_refresh(&self, row: &StorageRow) {
        let relationships: Vec<(String, Relationship)> = {
            let mut entity = self.write();
            entity.values = Entity::values_from_row(&entity.schema.metadata, row);
            entity.modified.clear();
            entity
                .relationships
                .iter()
                .map(|(name, rel)| (name.clone(), rel.clone()))
                .collect()
        };
        for (name, relationship) in relationships {
            match relationship {
                Relationship::HasOne(has_one) => has_one.reset(row.get(&name).cloned()),
                Relationship::HasMany(has_many) => has_many.reset(),
            }
        }
        if let Some(hooks) = self.lifecycle() {
            hooks.on_refresh(self, row);
        }
    }

    pub(crate) fn on_free(&self) {
        {
            let mut entity = self.write();
            entity.relationships.clear();
            entity.preload_container = None;
            entity.attachment = None;
        }
        if let Some(hooks) = self.lifecycle() {
            hooks.on_free(self);
        }
    }
}

impl PartialEq for EntityHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityHandle {}

impl Hash for EntityHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object_key().hash(state);
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(entity) => f
                .debug_struct("EntityHandle")
                .field("class", &entity.class())
                .field("id", &entity.persisted_id)
                .finish(),
            Err(_) => f.debug_struct("EntityHandle").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MetadataStorage;
    use relmap_core::{EntityMetadata, PropertyMetadata, RelationshipMetadata};
    use std::sync::Mutex;

    const AUTHOR: EntityClass = EntityClass::new("Author");
    const BOOK: EntityClass = EntityClass::new("Book");

    fn storage() -> MetadataStorage {
        MetadataStorage::new()
            .register(
                EntityMetadata::new(BOOK)
                    .property(PropertyMetadata::new("title"))
                    .property(PropertyMetadata::new("isbn").read_only(true))
                    .property(PropertyMetadata::new("note").nullable(true))
                    .property(PropertyMetadata::relationship(
                        "author",
                        RelationshipMetadata::new(RelationshipKind::ManyHasOne, AUTHOR)
                            .inverse("books"),
                    )),
            )
            .register(EntityMetadata::new(AUTHOR).property(PropertyMetadata::relationship(
                "books",
                RelationshipMetadata::new(RelationshipKind::OneHasMany, BOOK).inverse("author"),
            )))
    }

    fn book() -> EntityHandle {
        EntityHandle::new(storage().get(BOOK).unwrap())
    }

    #[test]
    fn new_entity_is_modified_and_unpersisted() {
        let book = book();
        assert!(!book.is_persisted());
        assert!(book.is_modified());
        assert_eq!(book.get_value("title").unwrap(), Value::Null);
    }

    #[test]
    fn set_value_marks_property_modified() {
        let row = StorageRow::from_pairs([("id", Value::BigInt(1)), ("title", "Old".into())]);
        let book = EntityHandle::from_storage_row(storage().get(BOOK).unwrap(), &row).unwrap();
        assert!(!book.is_modified());

        book.set_value("title", "Old").unwrap();
        assert!(!book.is_modified());

        book.set_value("title", "New").unwrap();
        assert!(book.is_property_modified("title"));
        assert!(!book.is_property_modified("isbn"));
        assert_eq!(book.get_value("title").unwrap(), Value::Text("New".into()));
    }

    #[test]
    fn property_errors() {
        let book = book();
        let err = book.set_value("missing", 1_i64).unwrap_err();
        assert_eq!(err.to_string(), "Property Book::$missing is undefined.");

        let err = book.set_value("isbn", "x").unwrap_err();
        assert!(matches!(err, Error::Property(ref p) if p.kind == PropertyErrorKind::ReadOnly));
        book.set_read_only_value("isbn", "x").unwrap();

        let err = book.set_value("title", Value::Null).unwrap_err();
        assert!(matches!(err, Error::Property(ref p) if p.kind == PropertyErrorKind::NotNullable));
        book.set_value("note", Value::Null).unwrap();

        let err = book.set_value("author", 1_i64).unwrap_err();
        assert!(matches!(err, Error::Property(ref p) if p.kind == PropertyErrorKind::WrongKind));
        let err = book.has_many("author").unwrap_err();
        assert!(matches!(err, Error::Property(ref p) if p.kind == PropertyErrorKind::WrongKind));
        let err = book.has_one("title").unwrap_err();
        assert!(
            matches!(err, Error::Property(ref p) if p.kind == PropertyErrorKind::NotARelationship)
        );
    }

    #[test]
    fn primary_key_of_persisted_entity_is_immutable() {
        let row = StorageRow::from_pairs([("id", 1_i64)]);
        let book = EntityHandle::from_storage_row(storage().get(BOOK).unwrap(), &row).unwrap();
        book.set_value("id", 1_i64).unwrap();
        assert!(book.set_value("id", 2_i64).is_err());
    }

    #[test]
    fn relationship_wrappers_are_created_once() {
        let book = book();
        let a = book.has_one("author").unwrap();
        let b = book.has_one("author").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn storage_row_carries_foreign_key() {
        let row = StorageRow::from_pairs([
            ("id", Value::BigInt(4)),
            ("title", "T".into()),
            ("author", Value::BigInt(9)),
        ]);
        let book = EntityHandle::from_storage_row(storage().get(BOOK).unwrap(), &row).unwrap();
        assert_eq!(book.get_raw_value("author"), Some(Value::BigInt(9)));
        let out = book.to_storage_row();
        assert_eq!(out.get("author"), Some(&Value::BigInt(9)));
        assert_eq!(out.get("title"), Some(&Value::Text("T".into())));
    }

    #[test]
    fn on_persist_assigns_identity() {
        let book = book();
        book.set_value("title", "T").unwrap();
        book.on_persist(&EntityId::from(7_i64));
        assert!(book.is_persisted());
        assert!(!book.is_modified());
        assert_eq!(book.get_value("id").unwrap(), Value::BigInt(7));

        book.on_remove();
        assert!(!book.is_persisted());
        assert!(book.is_modified());
    }

    #[test]
    fn identity_is_pointer_identity() {
        let a = book();
        let b = book();
        assert!(a.ptr_eq(&a.clone()));
        assert_ne!(a, b);
        assert_ne!(a.object_key(), b.object_key());
    }

    #[test]
    fn unattached_entity_has_no_model() {
        let err = book().model().unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::NotAttached));
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl EntityLifecycle for Recorder {
        fn on_load(&self, _: &EntityHandle, _: &StorageRow) {
            self.0.lock().unwrap().push("load");
        }
        fn on_refresh(&self, entity: &EntityHandle, _: &StorageRow) {
            // hooks run without the entity lock held
            let _ = entity.get_value("title");
            self.0.lock().unwrap().push("refresh");
        }
        fn on_persist(&self, _: &EntityHandle, _: &EntityId) {
            self.0.lock().unwrap().push("persist");
        }
        fn on_free(&self, _: &EntityHandle) {
            self.0.lock().unwrap().push("free");
        }
    }

    #[test]
    fn lifecycle_hooks_fire_in_order() {
        let recorder = Arc::new(Recorder::default());
        let storage = MetadataStorage::new().register_with_lifecycle(
            EntityMetadata::new(BOOK).property(PropertyMetadata::new("title")),
            recorder.clone(),
        );
        let row = StorageRow::from_pairs([("id", Value::BigInt(1)), ("title", "A".into())]);
        let book = EntityHandle::from_storage_row(storage.get(BOOK).unwrap(), &row).unwrap();
        book.on_load(&row);
        book.set_value("title", "B").unwrap();
        book.on_refresh(&row);
        assert_eq!(book.get_value("title").unwrap(), Value::Text("A".into()));
        assert!(!book.is_modified());
        book.on_persist(&EntityId::from(1_i64));
        book.on_free();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["load", "refresh", "persist", "free"]
        );
    }
}
