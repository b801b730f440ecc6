//! Shared fixtures: a small library domain backed by in-memory mappers.
//!
//! - authors (1 Jane, 2 John) with `books` and an optional `profile`
//! - books (1 Alpha, 2 Beta by Jane; 3 Gamma, 4 Delta by John)
//! - publishers (1 Acme, 2 Orbit) with `books`
//! - profiles (1 for Jane), the owning side of the one-to-one
//! - contents: threads and comments stored together, resolved by `type`
#![allow(dead_code)]

use relmap::prelude::*;
use relmap::{Mapper, PropertyErrorKind, StorageRow};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const AUTHORS: RepositoryId = RepositoryId::new("AuthorsRepository");
pub const BOOKS: RepositoryId = RepositoryId::new("BooksRepository");
pub const PUBLISHERS: RepositoryId = RepositoryId::new("PublishersRepository");
pub const PROFILES: RepositoryId = RepositoryId::new("ProfilesRepository");
pub const CONTENTS: RepositoryId = RepositoryId::new("ContentsRepository");

pub const AUTHOR: EntityClass = EntityClass::new("Author");
pub const BOOK: EntityClass = EntityClass::new("Book");
pub const PUBLISHER: EntityClass = EntityClass::new("Publisher");
pub const PROFILE: EntityClass = EntityClass::new("Profile");
pub const THREAD: EntityClass = EntityClass::new("Thread");
pub const COMMENT: EntityClass = EntityClass::new("Comment");

/// In-memory mapper counting storage reads.
pub struct CountingMapper {
    inner: MemoryMapper,
    reads: AtomicUsize,
}

impl CountingMapper {
    pub fn new(conventions: Conventions, rows: Vec<StorageRow>) -> Self {
        Self {
            inner: MemoryMapper::with_rows(conventions, rows).unwrap(),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<StorageRow> {
        self.inner.rows()
    }

    /// Committed row with the given scalar `id`.
    pub fn row(&self, id: i64) -> Option<StorageRow> {
        self.inner
            .rows()
            .into_iter()
            .find(|row| row.get("id") == Some(&Value::BigInt(id)))
    }

    /// Overwrite a committed column behind the model's back.
    pub fn overwrite(&self, id: i64, column: &str, value: impl Into<Value>) {
        let mut row = StorageRow::new();
        row.set(column, value);
        self.inner.persist(row, Some(&EntityId::from(id))).unwrap();
        self.inner.flush().unwrap();
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

impl Mapper for CountingMapper {
    fn conventions(&self) -> &Conventions {
        self.inner.conventions()
    }

    fn find_by_id(&self, id: &EntityId) -> Result<Option<StorageRow>> {
        self.read();
        self.inner.find_by_id(id)
    }

    fn find_by_ids(&self, ids: &[EntityId]) -> Result<Vec<StorageRow>> {
        self.read();
        self.inner.find_by_ids(ids)
    }

    fn find_all(&self) -> Result<Vec<StorageRow>> {
        self.read();
        self.inner.find_all()
    }

    fn find_by_column(&self, column: &str, values: &[Value]) -> Result<Vec<StorageRow>> {
        self.read();
        self.inner.find_by_column(column, values)
    }

    fn persist(&self, row: StorageRow, id: Option<&EntityId>) -> Result<EntityId> {
        self.inner.persist(row, id)
    }

    fn remove(&self, id: &EntityId) -> Result<()> {
        self.inner.remove(id)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn rollback(&self) {
        self.inner.rollback();
    }
}

fn row<const N: usize>(pairs: [(&str, Value); N]) -> StorageRow {
    StorageRow::from_pairs(pairs)
}

pub fn author_metadata() -> EntityMetadata {
    EntityMetadata::new(AUTHOR)
        .property(PropertyMetadata::new("name"))
        .property(PropertyMetadata::relationship(
            "books",
            RelationshipMetadata::new(RelationshipKind::OneHasMany, BOOK)
                .inverse("author")
                .order_by("title", Order::Asc),
        ))
        .property(
            PropertyMetadata::relationship(
                "profile",
                RelationshipMetadata::new(RelationshipKind::OneHasOne, PROFILE).inverse("author"),
            )
            .nullable(true),
        )
}

pub fn metadata() -> MetadataStorage {
    MetadataStorage::new()
        .register(author_metadata())
        .register(
            EntityMetadata::new(BOOK)
                .property(PropertyMetadata::new("title"))
                .property(PropertyMetadata::relationship(
                    "author",
                    RelationshipMetadata::new(RelationshipKind::ManyHasOne, AUTHOR).inverse("books"),
                ))
                .property(
                    PropertyMetadata::relationship(
                        "publisher",
                        RelationshipMetadata::new(RelationshipKind::ManyHasOne, PUBLISHER)
                            .inverse("books"),
                    )
                    .nullable(true),
                ),
        )
        .register(
            EntityMetadata::new(PUBLISHER)
                .property(PropertyMetadata::new("name"))
                .property(PropertyMetadata::relationship(
                    "books",
                    RelationshipMetadata::new(RelationshipKind::OneHasMany, BOOK)
                        .inverse("publisher")
                        .order_by("title", Order::Desc),
                )),
        )
        .register(
            EntityMetadata::new(PROFILE)
                .property(PropertyMetadata::new("bio"))
                .property(
                    PropertyMetadata::relationship(
                        "author",
                        RelationshipMetadata::new(RelationshipKind::OneHasOne, AUTHOR)
                            .inverse("profile")
                            .main(true),
                    )
                    .nullable(true),
                ),
        )
        .register(
            EntityMetadata::new(THREAD)
                .property(PropertyMetadata::new("type"))
                .property(PropertyMetadata::new("title")),
        )
        .register(
            EntityMetadata::new(COMMENT)
                .property(PropertyMetadata::new("type"))
                .property(PropertyMetadata::new("title"))
                .property(
                    PropertyMetadata::relationship(
                        "thread",
                        RelationshipMetadata::new(RelationshipKind::ManyHasOne, THREAD),
                    )
                    .nullable(true),
                ),
        )
}

/// A model over the seeded domain, plus handles on its storage.
pub struct Library {
    pub model: Arc<Model>,
    pub authors: Arc<EntityRepository>,
    pub books: Arc<EntityRepository>,
    pub publishers: Arc<EntityRepository>,
    pub profiles: Arc<EntityRepository>,
    pub contents: Arc<EntityRepository>,
    pub author_rows: Arc<CountingMapper>,
    pub book_rows: Arc<CountingMapper>,
    pub publisher_rows: Arc<CountingMapper>,
    pub profile_rows: Arc<CountingMapper>,
    pub content_rows: Arc<CountingMapper>,
}

impl Library {
    pub fn new() -> Self {
        Self::with_metadata(metadata())
    }

    pub fn with_metadata(metadata: MetadataStorage) -> Self {
        let metadata = Arc::new(metadata);

        let author_rows = Arc::new(CountingMapper::new(
            Conventions::default(),
            vec![
                row([("id", Value::BigInt(1)), ("name", "Jane".into())]),
                row([("id", Value::BigInt(2)), ("name", "John".into())]),
            ],
        ));
        let book_rows = Arc::new(CountingMapper::new(
            Conventions::default()
                .with_mapping("author", "author_id")
                .with_mapping("publisher", "publisher_id"),
            vec![
                book_row(1, "Alpha", 1, Some(1)),
                book_row(2, "Beta", 1, Some(2)),
                book_row(3, "Gamma", 2, Some(1)),
                book_row(4, "Delta", 2, None),
            ],
        ));
        let publisher_rows = Arc::new(CountingMapper::new(
            Conventions::default(),
            vec![
                row([("id", Value::BigInt(1)), ("name", "Acme".into())]),
                row([("id", Value::BigInt(2)), ("name", "Orbit".into())]),
            ],
        ));
        let profile_rows = Arc::new(CountingMapper::new(
            Conventions::default().with_mapping("author", "author_id"),
            vec![row([
                ("id", Value::BigInt(1)),
                ("bio", "Writes about ownership".into()),
                ("author_id", Value::BigInt(1)),
            ])],
        ));
        let content_rows = Arc::new(CountingMapper::new(
            Conventions::default(),
            vec![
                row([
                    ("id", Value::BigInt(1)),
                    ("type", "thread".into()),
                    ("title", "Hello".into()),
                ]),
                row([
                    ("id", Value::BigInt(2)),
                    ("type", "comment".into()),
                    ("title", "Hi there".into()),
                    ("thread", Value::BigInt(1)),
                ]),
            ],
        ));

        let repository = |id, classes: &[EntityClass], mapper: &Arc<CountingMapper>| {
            Arc::new(EntityRepository::new(
                id,
                classes,
                Arc::clone(mapper) as Arc<dyn Mapper>,
                Arc::clone(&metadata),
            ))
        };
        let authors = repository(AUTHORS, &[AUTHOR], &author_rows);
        let books = repository(BOOKS, &[BOOK], &book_rows);
        let publishers = repository(PUBLISHERS, &[PUBLISHER], &publisher_rows);
        let profiles = repository(PROFILES, &[PROFILE], &profile_rows);
        let contents = Arc::new(
            EntityRepository::new(
                CONTENTS,
                &[THREAD, COMMENT],
                Arc::clone(&content_rows) as Arc<dyn Mapper>,
                Arc::clone(&metadata),
            )
            .with_class_resolver(|row| match row.get("type").and_then(Value::as_str) {
                Some("comment") => Some(COMMENT),
                Some("thread") => Some(THREAD),
                _ => None,
            }),
        );

        let factory = |repository: &Arc<EntityRepository>| {
            let repository = Arc::clone(repository);
            move || Arc::clone(&repository) as Arc<dyn Repository>
        };
        let loader = LazyRepositoryLoader::builder()
            .repository(AUTHORS, factory(&authors))
            .repository(BOOKS, factory(&books))
            .repository(PUBLISHERS, factory(&publishers))
            .repository(PROFILES, factory(&profiles))
            .repository(CONTENTS, factory(&contents))
            .build();
        let configuration = Configuration::builder()
            .repository("authors", AUTHORS, &[AUTHOR])
            .repository("books", BOOKS, &[BOOK])
            .repository("publishers", PUBLISHERS, &[PUBLISHER])
            .repository("profiles", PROFILES, &[PROFILE])
            .repository("contents", CONTENTS, &[THREAD, COMMENT])
            .build();
        let model = Model::new(configuration, Arc::new(loader), metadata);

        Self {
            model,
            authors,
            books,
            publishers,
            profiles,
            contents,
            author_rows,
            book_rows,
            publisher_rows,
            profile_rows,
            content_rows,
        }
    }

    pub fn repository(&self, id: RepositoryId) -> Arc<dyn Repository> {
        self.model.repository(id).unwrap()
    }

    pub fn get(&self, id: RepositoryId, key: i64) -> EntityHandle {
        self.repository(id)
            .get_by_id(&EntityId::from(key))
            .unwrap()
            .unwrap_or_else(|| panic!("{id} #{key} not found"))
    }

    pub fn author(&self, key: i64) -> EntityHandle {
        self.get(AUTHORS, key)
    }

    pub fn book(&self, key: i64) -> EntityHandle {
        self.get(BOOKS, key)
    }

    pub fn publisher(&self, key: i64) -> EntityHandle {
        self.get(PUBLISHERS, key)
    }

    pub fn new_author(&self, name: &str) -> EntityHandle {
        let author = self.model.create_entity(AUTHOR).unwrap();
        author.set_value("name", name).unwrap();
        author
    }

    pub fn new_book(&self, title: &str, author: &EntityHandle) -> EntityHandle {
        let book = self.model.create_entity(BOOK).unwrap();
        book.set_value("title", title).unwrap();
        book.set_reference("author", Some(author)).unwrap();
        book
    }
}

fn book_row(id: i64, title: &str, author: i64, publisher: Option<i64>) -> StorageRow {
    row([
        ("id", Value::BigInt(id)),
        ("title", title.into()),
        ("author_id", Value::BigInt(author)),
        ("publisher_id", publisher.map_or(Value::Null, Value::BigInt)),
    ])
}

/// Titles of a list of books.
pub fn titles(books: &[EntityHandle]) -> Vec<String> {
    books
        .iter()
        .map(|book| book.get_value("title").unwrap().as_str().unwrap().to_string())
        .collect()
}

/// Kind of a property error, if `err` is one.
pub fn property_kind(err: &Error) -> Option<PropertyErrorKind> {
    match err {
        Error::Property(property) => Some(property.kind),
        _ => None,
    }
}
