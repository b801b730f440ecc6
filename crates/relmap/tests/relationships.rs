mod common;

use common::*;
use relmap::PropertyErrorKind;
use relmap::prelude::*;
use std::sync::Arc;

#[test]
fn collections_load_in_default_order() {
    let lib = Library::new();
    let jane = lib.author(1);
    assert_eq!(titles(&jane.has_many("books").unwrap().to_vec().unwrap()), ["Alpha", "Beta"]);

    let acme = lib.publisher(1);
    assert_eq!(titles(&acme.has_many("books").unwrap().to_vec().unwrap()), ["Gamma", "Alpha"]);
}

#[test]
fn references_resolve_through_the_identity_map() {
    let lib = Library::new();
    let alpha = lib.book(1);
    let jane = alpha.get_reference("author").unwrap().unwrap();
    assert!(jane.ptr_eq(&lib.author(1)));

    let books = jane.has_many("books").unwrap().to_vec().unwrap();
    assert!(books.iter().any(|b| b.ptr_eq(&alpha)));
    assert!(lib.book(4).get_reference("publisher").unwrap().is_none());
}

#[test]
fn adding_to_a_collection_moves_the_member() {
    let lib = Library::new();
    let jane = lib.author(1);
    let john = lib.author(2);
    let delta = lib.book(4);

    jane.has_many("books").unwrap().add(&delta).unwrap();

    assert!(delta.get_reference("author").unwrap().unwrap().ptr_eq(&jane));
    assert!(delta.is_property_modified("author"));
    assert_eq!(
        titles(&jane.has_many("books").unwrap().to_vec().unwrap()),
        ["Alpha", "Beta", "Delta"]
    );
    assert_eq!(titles(&john.has_many("books").unwrap().to_vec().unwrap()), ["Gamma"]);
}

#[test]
fn setting_a_reference_updates_the_inverse_collection() {
    let lib = Library::new();
    let jane = lib.author(1);
    let gamma = lib.book(3);
    let books = jane.has_many("books").unwrap();
    assert_eq!(books.count_members().unwrap(), 2);

    gamma.set_reference("author", Some(&jane)).unwrap();
    assert!(books.has(&gamma).unwrap());
    assert_eq!(books.count_members().unwrap(), 3);
    assert!(books.is_modified());
}

#[test]
fn add_and_remove_cancel_out() {
    let lib = Library::new();
    let jane = lib.author(1);
    let books = jane.has_many("books").unwrap();

    let delta = lib.book(4);
    books.add(&delta).unwrap();
    books.remove(&delta).unwrap();
    assert!(!books.get_entities_for_persistence().iter().any(|b| b.ptr_eq(&delta)));

    let alpha = lib.book(1);
    books.remove(&alpha).unwrap();
    assert!(!books.has(&alpha).unwrap());
    books.add(&alpha).unwrap();
    assert!(books.has(&alpha).unwrap());
    assert!(alpha.get_reference("author").unwrap().unwrap().ptr_eq(&jane));
    assert_eq!(titles(&books.to_vec().unwrap()), ["Alpha", "Beta"]);
}

#[test]
fn removed_members_of_stored_parents_still_persist() {
    let lib = Library::new();
    let acme = lib.publisher(1);
    let books = acme.has_many("books").unwrap();
    let gamma = lib.book(3);

    books.remove(&gamma).unwrap();
    assert!(gamma.get_reference("publisher").unwrap().is_none());
    let pending = books.get_entities_for_persistence();
    assert!(pending.iter().any(|b| b.ptr_eq(&gamma)));

    lib.model.persist_and_flush(&acme, true).unwrap();
    assert_eq!(lib.book_rows.row(3).unwrap().get("publisher_id"), Some(&Value::Null));
    assert!(!books.is_modified());
    assert_eq!(titles(&books.to_vec().unwrap()), ["Alpha"]);
}

#[test]
fn clean_collections_keep_their_loaded_view() {
    let lib = Library::new();
    let jane = lib.author(1);
    let books = jane.has_many("books").unwrap();
    books.to_vec().unwrap();
    assert_eq!(lib.book_rows.reads(), 1);

    books.do_persist();
    assert_eq!(titles(&books.to_vec().unwrap()), ["Alpha", "Beta"]);
    lib.model.persist(&jane, true).unwrap();
    books.to_vec().unwrap();
    assert_eq!(lib.book_rows.reads(), 1);
}

#[test]
fn one_to_one_keeps_both_sides_in_sync() {
    let lib = Library::new();
    let jane = lib.author(1);
    let old = jane.get_reference("profile").unwrap().unwrap();
    assert!(old.get_reference("author").unwrap().unwrap().ptr_eq(&jane));

    let profile = lib.model.create_entity(PROFILE).unwrap();
    profile.set_value("bio", "New bio").unwrap();
    profile.set_reference("author", Some(&jane)).unwrap();

    assert!(jane.get_reference("profile").unwrap().unwrap().ptr_eq(&profile));
    assert!(old.get_reference("author").unwrap().is_none());

    // The detached profile is no longer reachable from the author.
    lib.model.persist(&old, false).unwrap();
    lib.model.persist_and_flush(&jane, true).unwrap();
    let new_id = profile.persisted_id().unwrap();
    assert_eq!(lib.profile_rows.row(1).unwrap().get("author_id"), Some(&Value::Null));
    let stored = lib.profile_rows.row(new_id.as_scalar().unwrap().as_i64().unwrap()).unwrap();
    assert_eq!(stored.get("author_id"), Some(&Value::BigInt(1)));
}

#[test]
fn batch_members_preload_together() {
    let lib = Library::new();
    let authors = lib.repository(AUTHORS).find_all().unwrap();
    let authors: Vec<EntityHandle> = authors.iter().collect();

    let mut books = Vec::new();
    for author in &authors {
        books.extend(author.has_many("books").unwrap().to_vec().unwrap());
    }
    assert_eq!(books.len(), 4);
    assert_eq!(lib.book_rows.reads(), 1);

    for book in &books {
        book.get_reference("publisher").unwrap();
    }
    assert_eq!(lib.publisher_rows.reads(), 1);

    let first = books[0].preload_values("publisher").unwrap();
    let second = books[1].preload_values("publisher").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.len(), 4);
}

#[test]
fn grouped_cursor_walks_one_parent() {
    let lib = Library::new();
    let authors = lib.repository(AUTHORS).find_all().unwrap();
    let john = authors.iter().nth(1).unwrap();

    let cursor = john.has_many("books").unwrap().get().unwrap();
    assert_eq!(cursor.count(), 2);
    let mut seen = Vec::new();
    cursor.rewind();
    while cursor.valid() {
        seen.push(cursor.current().unwrap());
        cursor.next();
    }
    assert_eq!(titles(&seen), ["Delta", "Gamma"]);
}

#[test]
fn relationships_reject_foreign_entities() {
    let lib = Library::new();
    let alpha = lib.book(1);
    let jane = lib.author(1);

    let err = alpha.set_reference("publisher", Some(&jane)).unwrap_err();
    assert_eq!(property_kind(&err), Some(PropertyErrorKind::InvalidEntity));
    let err = jane.has_many("books").unwrap().add(&jane).unwrap_err();
    assert_eq!(property_kind(&err), Some(PropertyErrorKind::InvalidEntity));
    let err = alpha.set_reference("author", None).unwrap_err();
    assert_eq!(property_kind(&err), Some(PropertyErrorKind::NotNullable));
}

#[test]
fn classes_sharing_a_repository_are_accepted() {
    let lib = Library::new();
    let contents = lib.repository(CONTENTS);
    let reply = lib.model.create_entity(COMMENT).unwrap();
    reply.set_value("type", "comment").unwrap();
    reply.set_value("title", "Re: Hi there").unwrap();

    let comment = contents.get_by_id(&EntityId::from(2)).unwrap().unwrap();
    reply.set_reference("thread", Some(&comment)).unwrap();
    assert!(reply.get_reference("thread").unwrap().unwrap().ptr_eq(&comment));
}
