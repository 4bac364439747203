/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use fedgraph_core::collections::{reconcile_visibility, CollectionTools};
use fedgraph_core::context::JsonLdContext;
use fedgraph_core::notify::NotifyHub;
use fedgraph_core::object::{APEntity, ASObject, ASTerm};
use fedgraph_core::store::{ChangeSet, EntityStore, LocalStore, StagingStore};
use fedgraph_core::triple_store::EntityDb;
use fedgraph_protocol::{AS_PUBLIC, CHANNEL_COLLECTION_CHANGED};
use std::sync::{Arc, Mutex};

const COLL: &str = "https://a.example/users/alice/outbox";

fn note(n: u32, public: bool) -> APEntity {
    let mut o = ASObject::typed("Note", Some(format!("https://a.example/n/{n}")));
    if public {
        o.set("to", ASTerm::reference(AS_PUBLIC));
    } else {
        o.set("to", ASTerm::reference("https://a.example/users/bob"));
    }
    APEntity::new(o, true).unwrap()
}

async fn seeded(dir: &std::path::Path, notify: NotifyHub) -> (EntityDb, LocalStore) {
    let db = EntityDb::open(dir.join("c.db"), Arc::new(JsonLdContext::default())).unwrap();
    let store = LocalStore::new(db.clone(), notify);
    let mut coll = ASObject::typed("OrderedCollection", Some(COLL.to_string()));
    coll.set("attributedTo", ASTerm::reference("https://a.example/users/alice"));
    store
        .apply(ChangeSet {
            entities: vec![
                APEntity::new(coll, true).unwrap(),
                note(1, true),
                note(2, false),
                note(3, true),
            ],
            ..ChangeSet::default()
        })
        .await
        .unwrap();
    (db, store)
}

fn elements(page: &fedgraph_core::store::CollectionPage) -> Vec<&str> {
    page.items.iter().map(|i| i.element.as_str()).collect()
}

#[tokio::test]
async fn add_contains_remove_in_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, store) = seeded(dir.path(), NotifyHub::new()).await;
    let tools = CollectionTools::new(&store);

    for n in [3, 1, 2] {
        tools.add(COLL, &format!("https://a.example/n/{n}")).await.unwrap();
    }
    assert!(tools.contains(COLL, "https://a.example/n/1").await.unwrap());

    let all = tools.page(COLL, None, 10, true).await.unwrap();
    assert_eq!(all.total, 3);
    assert_eq!(
        elements(&all),
        vec!["https://a.example/n/3", "https://a.example/n/1", "https://a.example/n/2"]
    );

    let public = tools.page(COLL, None, 10, false).await.unwrap();
    assert_eq!(public.total, 2);
    assert_eq!(elements(&public), vec!["https://a.example/n/3", "https://a.example/n/1"]);

    tools.remove(COLL, "https://a.example/n/1").await.unwrap();
    assert!(!tools.contains(COLL, "https://a.example/n/1").await.unwrap());
    assert_eq!(
        tools.elements(COLL, true).await.unwrap(),
        vec!["https://a.example/n/3", "https://a.example/n/2"]
    );
}

#[tokio::test]
async fn re_adding_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, store) = seeded(dir.path(), NotifyHub::new()).await;
    let tools = CollectionTools::new(&store);
    tools.add(COLL, "https://a.example/n/1").await.unwrap();
    tools.add(COLL, "https://a.example/n/2").await.unwrap();
    tools.add(COLL, "https://a.example/n/1").await.unwrap();
    assert_eq!(tools.page(COLL, None, 10, true).await.unwrap().total, 2);
    assert_eq!(
        tools.elements(COLL, true).await.unwrap(),
        vec!["https://a.example/n/1", "https://a.example/n/2"]
    );
}

#[tokio::test]
async fn pages_follow_the_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, store) = seeded(dir.path(), NotifyHub::new()).await;
    let tools = CollectionTools::new(&store);
    for n in 1..=3 {
        tools.add(COLL, &format!("https://a.example/n/{n}")).await.unwrap();
    }

    let first = tools.page(COLL, None, 2, true).await.unwrap();
    assert_eq!(elements(&first), vec!["https://a.example/n/1", "https://a.example/n/2"]);
    let cursor = first.next.expect("more items");
    let second = tools.page(COLL, Some(cursor), 2, true).await.unwrap();
    assert_eq!(elements(&second), vec!["https://a.example/n/3"]);
    assert!(second.next.is_none());
}

#[tokio::test]
async fn staged_membership_is_visible_before_commit_only_to_its_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, store) = seeded(dir.path(), NotifyHub::new()).await;
    let staging = StagingStore::new(Box::new(store.clone()));

    CollectionTools::new(&staging)
        .add(COLL, "https://a.example/n/1")
        .await
        .unwrap();
    assert!(staging.collection_contains(COLL, "https://a.example/n/1").await.unwrap());
    assert!(!store.collection_contains(COLL, "https://a.example/n/1").await.unwrap());

    staging.commit_changes().await.unwrap();
    assert!(store.collection_contains(COLL, "https://a.example/n/1").await.unwrap());
}

#[tokio::test]
async fn membership_changes_publish_the_collection_id() {
    let dir = tempfile::tempdir().unwrap();
    let hub = NotifyHub::new();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    hub.subscribe(CHANNEL_COLLECTION_CHANGED, {
        let seen = seen.clone();
        move |payload| seen.lock().unwrap().push(payload.to_string())
    });
    let (_db, store) = seeded(dir.path(), hub).await;
    CollectionTools::new(&store)
        .add(COLL, "https://a.example/n/1")
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[COLL.to_string()]);
}

#[tokio::test]
async fn visibility_follows_later_edits() {
    let dir = tempfile::tempdir().unwrap();
    let (db, store) = seeded(dir.path(), NotifyHub::new()).await;
    let tools = CollectionTools::new(&store);
    tools.add(COLL, "https://a.example/n/2").await.unwrap();
    assert_eq!(tools.page(COLL, None, 10, false).await.unwrap().total, 0);

    store.store_entity(note(2, true)).await.unwrap();
    assert_eq!(reconcile_visibility(&db).await.unwrap(), 1);
    assert_eq!(tools.page(COLL, None, 10, false).await.unwrap().total, 1);
}
