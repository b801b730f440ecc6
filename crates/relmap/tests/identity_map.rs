mod common;

use common::*;
use relmap::prelude::*;
use relmap::{Mapper, StateErrorKind, StorageRow};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn same_identity_yields_same_instance() {
    let lib = Library::new();
    let first = lib.author(1);
    let second = lib.author(1);
    assert!(first.ptr_eq(&second));
    assert_eq!(lib.author_rows.reads(), 1);

    let all = lib.repository(AUTHORS).find_all().unwrap();
    let jane = all.iter().find(|a| a.get_value("name").unwrap() == Value::from("Jane"));
    assert!(jane.unwrap().ptr_eq(&first));
    assert_eq!(lib.authors.identity_map().len(), 2);
}

#[test]
fn removed_identity_stays_tombstoned() {
    let lib = Library::new();
    let orbit = lib.publisher(2);
    lib.model.remove_and_flush(&orbit, true).unwrap();

    let id = EntityId::from(2);
    let publishers = lib.repository(PUBLISHERS);
    assert!(publishers.identity_map().exists(&id));
    assert!(publishers.get_by_id(&id).unwrap().is_none());
    assert!(!orbit.is_persisted());
    assert!(!orbit.is_attached());

    let stale = StorageRow::from_pairs([("id", Value::BigInt(2)), ("name", "Orbit".into())]);
    assert!(publishers.hydrate(stale).unwrap().is_none());
}

#[test]
fn refresh_merges_storage_changes() {
    let lib = Library::new();
    let jane = lib.author(1);
    lib.author_rows.overwrite(1, "name", "Janet");

    lib.model.refresh_all(false).unwrap();
    assert_eq!(jane.get_value("name").unwrap(), Value::from("Janet"));
    assert!(!jane.is_modified());
    assert!(jane.ptr_eq(&lib.author(1)));
}

#[test]
fn refresh_refuses_to_drop_local_changes() {
    let lib = Library::new();
    let jane = lib.author(1);
    let john = lib.author(2);
    john.set_value("name", "Johnny").unwrap();

    let err = lib.model.refresh_all(false).unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::ModifiedEntity));
    assert_eq!(john.get_value("name").unwrap(), Value::from("Johnny"));
    assert!(!lib.authors.identity_map().is_marked_for_refresh(&jane));

    lib.model.refresh_all(true).unwrap();
    assert_eq!(john.get_value("name").unwrap(), Value::from("John"));
    assert!(!john.is_modified());
}

#[test]
fn refresh_detaches_vanished_entities() {
    let lib = Library::new();
    let delta = lib.book(4);
    lib.book_rows.remove(&EntityId::from(4)).unwrap();
    lib.book_rows.flush().unwrap();

    lib.model.refresh_all(true).unwrap();
    assert!(!delta.is_attached());
    let books = lib.repository(BOOKS);
    assert!(books.identity_map().exists(&EntityId::from(4)));
    assert!(books.get_by_id(&EntityId::from(4)).unwrap().is_none());
}

#[test]
fn rows_resolve_to_their_concrete_class() {
    let lib = Library::new();
    let contents = lib.repository(CONTENTS).find_all().unwrap();
    let classes: Vec<EntityClass> = contents.iter().map(|e| e.class()).collect();
    assert_eq!(classes, [THREAD, COMMENT]);

    let comment = contents.iter().nth(1).unwrap();
    let thread = comment.get_reference("thread").unwrap().unwrap();
    assert!(thread.ptr_eq(&contents.iter().next().unwrap()));
    assert_eq!(lib.model.repository_for_entity(&comment).unwrap().id(), CONTENTS);
}

#[test]
fn repository_rejects_foreign_classes() {
    let lib = Library::new();
    let book = lib.book(1);
    let err = lib.authors.do_persist(&book).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

struct LoadCounter(AtomicUsize);

impl EntityLifecycle for LoadCounter {
    fn on_load(&self, _entity: &EntityHandle, _row: &StorageRow) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn load_hook_fires_once_per_identity() {
    let counter = Arc::new(LoadCounter(AtomicUsize::new(0)));
    let metadata = metadata().register_with_lifecycle(author_metadata(), counter.clone());
    let lib = Library::with_metadata(metadata);

    lib.author(1);
    lib.author(1);
    lib.repository(AUTHORS).find_all().unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 2);
}
