//! Error types for relmap operations.

/// The primary error type for all relmap operations.
///
/// There is no internal retry anywhere in the engine: an operation either
/// succeeds or returns one of these, leaving state as far as it got.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown repository name/identity or entity class.
    #[error(transparent)]
    Lookup(LookupError),
    /// Entity instance handed to a repository that does not accept its class.
    #[error(transparent)]
    Conflict(ConflictError),
    /// Operation not allowed in the current state.
    #[error(transparent)]
    State(StateError),
    /// Property access errors.
    #[error(transparent)]
    Property(PropertyError),
    /// Identity extraction errors.
    #[error(transparent)]
    Identity(IdentityError),
    /// Errors surfaced by the storage layer, propagated unchanged.
    #[error(transparent)]
    Storage(StorageError),
    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serde(String),
    /// Custom error with message
    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.describe())]
pub struct LookupError {
    pub kind: LookupErrorKind,
    /// The requested name or class.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupErrorKind {
    /// No repository registered under this name
    RepositoryName,
    /// No repository registered under this identity
    RepositoryClass,
    /// No repository owns this entity class
    EntityRepository,
    /// No metadata registered for this entity class
    EntityMetadata,
}

impl LookupError {
    fn describe(&self) -> String {
        match self.kind {
            LookupErrorKind::RepositoryName | LookupErrorKind::RepositoryClass => {
                format!("Repository '{}' does not exist.", self.name)
            }
            LookupErrorKind::EntityRepository => {
                format!("Repository for '{}' entity does not exist.", self.name)
            }
            LookupErrorKind::EntityMetadata => {
                format!("Metadata for '{}' entity does not exist.", self.name)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Entity '{entity}' is not accepted by '{repository}' repository.")]
pub struct ConflictError {
    pub entity: String,
    pub repository: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StateError {
    pub kind: StateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// Cascade dependencies form a cycle
    PersistCycle,
    /// Refresh would overwrite unsaved local changes
    ModifiedEntity,
    /// Entity is not attached to a repository
    NotAttached,
    /// A non-owning back-reference outlived its target
    Detached,
    /// Operation requires a persisted entity
    NotPersisted,
    /// Removal would null a non-nullable inverse property
    NullViolation,
    /// Grouping index used on an ungrouped batch
    InvalidBatchIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.describe())]
pub struct PropertyError {
    pub entity: String,
    pub property: String,
    pub kind: PropertyErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyErrorKind {
    /// Property is not declared in the entity metadata
    Undefined,
    /// Property is read-only
    ReadOnly,
    /// NULL assigned to a non-nullable property
    NotNullable,
    /// Relationship accessor used on a plain property (or vice versa)
    NotARelationship,
    /// Relationship accessor of the wrong cardinality
    WrongKind,
    /// Relationship assigned an entity of a class it does not target
    InvalidEntity,
}

impl PropertyError {
    fn describe(&self) -> String {
        let what = match self.kind {
            PropertyErrorKind::Undefined => "is undefined",
            PropertyErrorKind::ReadOnly => "is read-only",
            PropertyErrorKind::NotNullable => "cannot be null",
            PropertyErrorKind::NotARelationship => "is not a relationship",
            PropertyErrorKind::WrongKind => "is a relationship of another kind",
            PropertyErrorKind::InvalidEntity => "does not accept this entity",
        };
        format!("Property {}::${} {}.", self.entity, self.property, what)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct IdentityError {
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
#[error("Storage error: {message}")]
pub struct StorageError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Lookup failure carrying the requested name.
    pub fn lookup(kind: LookupErrorKind, name: impl Into<String>) -> Self {
        Error::Lookup(LookupError {
            kind,
            name: name.into(),
        })
    }

    /// State failure with a message.
    pub fn state(kind: StateErrorKind, message: impl Into<String>) -> Self {
        Error::State(StateError {
            kind,
            message: message.into(),
        })
    }

    /// Property failure.
    pub fn property(
        entity: impl Into<String>,
        property: impl Into<String>,
        kind: PropertyErrorKind,
    ) -> Self {
        Error::Property(PropertyError {
            entity: entity.into(),
            property: property.into(),
            kind,
        })
    }

    /// Storage failure without an underlying source.
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            message: message.into(),
            source: None,
        })
    }

    /// Storage failure wrapping an underlying error.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Storage(StorageError {
            message: message.into(),
            source: Some(Box::new(source)),
        })
    }

    /// Check whether this is a lookup failure.
    pub fn is_lookup(&self) -> bool {
        matches!(self, Error::Lookup(_))
    }

    /// The state error kind, if this is a state error.
    pub fn state_kind(&self) -> Option<StateErrorKind> {
        match self {
            Error::State(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Check whether this error came from the storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_error_carries_name() {
        let err = Error::lookup(LookupErrorKind::RepositoryName, "books");
        assert!(err.is_lookup());
        assert_eq!(err.to_string(), "Repository 'books' does not exist.");

        let err = Error::lookup(LookupErrorKind::EntityRepository, "Book");
        assert_eq!(err.to_string(), "Repository for 'Book' entity does not exist.");
    }

    #[test]
    fn conflict_error_names_both_classes() {
        let err = Error::Conflict(ConflictError {
            entity: "Author".into(),
            repository: "BooksRepository".into(),
        });
        assert_eq!(
            err.to_string(),
            "Entity 'Author' is not accepted by 'BooksRepository' repository."
        );
    }

    #[test]
    fn property_error_display() {
        let err = Error::property("Book", "title", PropertyErrorKind::ReadOnly);
        assert_eq!(err.to_string(), "Property Book::$title is read-only.");
    }

    #[test]
    fn storage_error_keeps_source() {
        let io = std::io::Error::other("disk full");
        let err = Error::storage_with_source("flush failed", io);
        assert!(err.is_storage());
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Storage error: flush failed");
    }

    #[test]
    fn state_kind_accessor() {
        let err = Error::state(StateErrorKind::PersistCycle, "cycle");
        assert_eq!(err.state_kind(), Some(StateErrorKind::PersistCycle));
        assert_eq!(Error::Custom("x".into()).state_kind(), None);
    }
}
