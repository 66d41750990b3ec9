#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use stateline_core::{ContextConfig, ContextFactory, LifecycleState, MemoryStore, Value};

use common::factory_with_context;

fn reachability_factory() -> (std::sync::Arc<MemoryStore>, ContextFactory) {
    factory_with_context(ContextConfig {
        reachability_at_commit: true,
        ..ContextConfig::default()
    })
}

#[test]
fn test_cascaded_object_dropped_when_unreachable_at_commit() {
    // GIVEN a holder persisted with an item reached by cascade
    let (store, factory) = reachability_factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let item = ctx.new_object("Item").unwrap();
    ctx.set(item, "label", "orphan").unwrap();
    let holder = ctx.new_object("Holder").unwrap();
    ctx.set(holder, "item", item).unwrap();
    let holder = ctx.persist(holder).unwrap();
    assert_eq!(
        ctx.lifecycle_state(item).unwrap(),
        LifecycleState::PersistentNew
    );

    // WHEN the reference is cut before commit
    ctx.set(holder, "item", Value::Null).unwrap();
    ctx.commit().unwrap();

    // THEN only the holder is stored and the item is transient again
    assert_eq!(store.committed_of_class("Holder").len(), 1);
    assert!(store.committed_of_class("Item").is_empty());
    assert_eq!(ctx.lifecycle_state(item).unwrap(), LifecycleState::Transient);
}

#[test]
fn test_flushed_cascaded_object_deleted_when_unreachable() {
    // GIVEN a cascaded item already inserted by an explicit flush
    let (store, factory) = reachability_factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let item = ctx.new_object("Item").unwrap();
    let holder = ctx.new_object("Holder").unwrap();
    ctx.set(holder, "item", item).unwrap();
    let holder = ctx.persist(holder).unwrap();
    ctx.flush(true).unwrap();
    let inserts = store.stats().inserts;
    assert_eq!(inserts, 2);

    // WHEN it becomes unreachable and the transaction commits
    ctx.set(holder, "item", Value::Null).unwrap();
    ctx.commit().unwrap();

    // THEN the inserted row is deleted within the same transaction
    assert!(store.committed_of_class("Item").is_empty());
    assert_eq!(store.stats().deletes, 1);
    assert_eq!(ctx.lifecycle_state(item).unwrap(), LifecycleState::Transient);
}

#[test]
fn test_reachable_cascaded_object_survives_commit() {
    let (store, factory) = reachability_factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let item = ctx.new_object("Item").unwrap();
    let holder = ctx.new_object("Holder").unwrap();
    ctx.set(holder, "item", item).unwrap();
    ctx.persist(holder).unwrap();

    ctx.commit().unwrap();

    assert_eq!(store.committed_of_class("Item").len(), 1);
    assert_eq!(
        ctx.lifecycle_state(item).unwrap(),
        LifecycleState::PersistentClean
    );
}

#[test]
fn test_explicitly_persisted_object_is_a_root() {
    // GIVEN an item persisted explicitly and also referenced
    let (store, factory) = reachability_factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let item = ctx.new_object("Item").unwrap();
    let item = ctx.persist(item).unwrap();
    let holder = ctx.new_object("Holder").unwrap();
    ctx.set(holder, "item", item).unwrap();
    let holder = ctx.persist(holder).unwrap();

    // WHEN the reference is cut
    ctx.set(holder, "item", Value::Null).unwrap();
    ctx.commit().unwrap();

    // THEN the item stays because it was persisted on its own
    assert_eq!(store.committed_of_class("Item").len(), 1);
}

#[test]
fn test_without_reachability_cascaded_object_is_kept() {
    let (store, factory) = common::factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let item = ctx.new_object("Item").unwrap();
    let holder = ctx.new_object("Holder").unwrap();
    ctx.set(holder, "item", item).unwrap();
    let holder = ctx.persist(holder).unwrap();

    ctx.set(holder, "item", Value::Null).unwrap();
    ctx.commit().unwrap();

    assert_eq!(store.committed_of_class("Item").len(), 1);
}
