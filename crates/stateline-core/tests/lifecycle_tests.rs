#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use stateline_core::{ContextConfig, ErrorKind, LifecycleState, StatelineError, Value};

use common::{committed_person, factory, factory_with_context, stored_text};

#[test]
fn test_persist_flush_commit_leaves_clean_object_in_both_caches() {
    // GIVEN an open context with an active transaction
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();

    // WHEN a new person is persisted, flushed and committed
    let ann = ctx.new_object("Person").unwrap();
    ctx.set(ann, "name", "Ann").unwrap();
    ctx.set(ann, "email", "ann@example.com").unwrap();
    let ann = ctx.persist(ann).unwrap();
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::PersistentNew);
    ctx.flush(true).unwrap();
    ctx.commit().unwrap();

    // THEN the object is clean and no longer dirty or enlisted
    assert_eq!(
        ctx.lifecycle_state(ann).unwrap(),
        LifecycleState::PersistentClean
    );
    assert!(ctx.dirty_direct().is_empty());
    assert!(ctx.dirty_indirect().is_empty());
    assert_eq!(ctx.enlisted_len(), 0);

    // AND its storage-assigned identity is in L1, L2 and storage
    let identity = ctx.identity_of(ann).unwrap().unwrap();
    assert!(!identity.is_temporary());
    assert_eq!(ctx.l1_lookup(&identity), Some(ann));
    assert!(factory.l2().contains(&identity));
    assert_eq!(stored_text(&store, &identity, 0).as_deref(), Some("Ann"));
    assert_eq!(ctx.version_of(ann).unwrap(), Some(1));
}

#[test]
fn test_identity_replacement_after_flush_moves_every_entry() {
    // GIVEN a new object with a temporary identity
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let bob = ctx.new_object("Person").unwrap();
    ctx.set(bob, "name", "Bob").unwrap();
    let bob = ctx.persist(bob).unwrap();
    let temporary = ctx.identity_of(bob).unwrap().unwrap();
    assert!(temporary.is_temporary());
    assert!(ctx.is_enlisted(&temporary));

    // WHEN the flush inserts it
    ctx.flush(true).unwrap();

    // THEN nothing is keyed by the temporary identity any more
    let assigned = ctx.identity_of(bob).unwrap().unwrap();
    assert_ne!(assigned, temporary);
    assert_eq!(ctx.l1_lookup(&temporary), None);
    assert!(!ctx.is_enlisted(&temporary));
    assert!(!ctx.is_pending_l2(&temporary));

    // AND everything is keyed by the assigned one
    assert_eq!(ctx.l1_lookup(&assigned), Some(bob));
    assert!(ctx.is_enlisted(&assigned));
    assert!(ctx.is_pending_l2(&assigned));
    ctx.commit().unwrap();
}

#[test]
fn test_second_flush_writes_nothing() {
    // GIVEN a flushed transaction
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let ann = ctx.new_object("Person").unwrap();
    ctx.set(ann, "name", "Ann").unwrap();
    ctx.persist(ann).unwrap();
    ctx.flush(true).unwrap();
    assert_eq!(store.stats().inserts, 1);

    // WHEN flushing again with no intervening change
    store.reset_stats();
    ctx.flush(true).unwrap();

    // THEN no row is written
    assert_eq!(store.stats().writes(), 0);
    ctx.commit().unwrap();
}

#[test]
fn test_persist_outside_transaction_commits_implicitly() {
    // GIVEN a context with implicit transactions enabled (default)
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();

    // WHEN persisting without begin
    let (ann, identity) = committed_person(&mut ctx, "Ann", "ann@example.com");

    // THEN the write is committed and the transaction is closed again
    assert!(!ctx.transaction().is_active());
    assert_eq!(
        ctx.lifecycle_state(ann).unwrap(),
        LifecycleState::PersistentClean
    );
    assert!(store.committed(&identity).is_some());
    assert_eq!(store.stats().commits, 1);
}

#[test]
fn test_persist_outside_transaction_without_atomic_write_fails() {
    // GIVEN a context that forbids implicit transactions
    let config = ContextConfig {
        nontransactional_atomic_write: false,
        ..ContextConfig::default()
    };
    let (store, factory) = factory_with_context(config);
    let mut ctx = factory.open().unwrap();
    let ann = ctx.new_object("Person").unwrap();

    // WHEN persisting without begin
    let err = ctx.persist(ann).unwrap_err();

    // THEN the operation is refused and nothing changes
    assert!(matches!(err, StatelineError::TransactionNotActive { .. }));
    assert_eq!(err.kind(), ErrorKind::TransactionState);
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Transient);
    assert_eq!(store.committed_len(), 0);
}

#[test]
fn test_persist_cascades_to_transient_referents() {
    // GIVEN a transient person referencing a transient friend
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let ann = ctx.new_object("Person").unwrap();
    let bob = ctx.new_object("Person").unwrap();
    ctx.set(ann, "name", "Ann").unwrap();
    ctx.set(bob, "name", "Bob").unwrap();
    ctx.set(ann, "friend", bob).unwrap();

    // WHEN only the referrer is persisted
    ctx.persist(ann).unwrap();

    // THEN both rows are committed and the reference is stored
    assert_eq!(store.committed_of_class("Person").len(), 2);
    assert_eq!(
        ctx.lifecycle_state(bob).unwrap(),
        LifecycleState::PersistentClean
    );
    assert_eq!(ctx.get(ann, "friend").unwrap(), Value::Ref(bob));
}

#[test]
fn test_persist_all_with_duplicate_identity_rolls_back_whole_batch() {
    // GIVEN two accounts sharing one application identity
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let first = ctx.new_object("Account").unwrap();
    let second = ctx.new_object("Account").unwrap();
    ctx.set(first, "number", 7i64).unwrap();
    ctx.set(second, "number", 7i64).unwrap();

    // WHEN both are persisted in one batch outside a transaction
    let err = ctx.persist_all(&[first, second]).unwrap_err();

    // THEN the batch error carries the duplicate
    assert_eq!(err.kind(), ErrorKind::BatchFailed);
    assert_eq!(err.nested().len(), 1);
    assert!(matches!(
        err.nested()[0],
        StatelineError::DuplicateTracker { .. }
    ));

    // AND the first object was rolled back too
    assert_eq!(ctx.lifecycle_state(first).unwrap(), LifecycleState::Transient);
    assert_eq!(
        ctx.l1_lookup(&stateline_core::Identity::single("Account", 7i64)),
        None
    );
    assert_eq!(store.committed_len(), 0);
}

#[test]
fn test_delete_then_commit_makes_object_transient() {
    // GIVEN a committed person
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, identity) = committed_person(&mut ctx, "Ann", "ann@example.com");

    // WHEN it is deleted inside a transaction
    ctx.begin().unwrap();
    ctx.delete(ann).unwrap();
    assert_eq!(
        ctx.lifecycle_state(ann).unwrap(),
        LifecycleState::PersistentDeleted
    );
    ctx.commit().unwrap();

    // THEN the row and both cache entries are gone
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Transient);
    assert!(store.committed(&identity).is_none());
    assert_eq!(ctx.l1_lookup(&identity), None);
    assert!(!factory.l2().contains(&identity));
}

#[test]
fn test_delete_of_unflushed_new_object_writes_nothing() {
    // GIVEN a new object never flushed
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let ann = ctx.new_object("Person").unwrap();
    let ann = ctx.persist(ann).unwrap();

    // WHEN it is deleted before commit
    ctx.delete(ann).unwrap();
    assert_eq!(
        ctx.lifecycle_state(ann).unwrap(),
        LifecycleState::PersistentNewDeleted
    );
    ctx.commit().unwrap();

    // THEN storage never saw it
    assert_eq!(store.stats().writes(), 0);
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Transient);
}

#[test]
fn test_delete_transient_object_is_rejected() {
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let ann = ctx.new_object("Person").unwrap();

    let err = ctx.delete(ann).unwrap_err();

    assert!(matches!(err, StatelineError::NotPersistent { .. }));
}

#[test]
fn test_mark_dirty_on_transient_object_is_rejected() {
    // GIVEN an open transaction and a transient person
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let ann = ctx.new_object("Person").unwrap();
    ctx.set(ann, "name", "Ann").unwrap();

    // WHEN it is marked dirty directly
    let err = ctx.mark_dirty(ann, true).unwrap_err();

    // THEN nothing is tracked and commit writes no row
    assert!(matches!(err, StatelineError::NotPersistent { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(ctx.dirty_direct().is_empty());
    assert_eq!(ctx.enlisted_len(), 0);
    ctx.commit().unwrap();
    assert_eq!(store.committed_len(), 0);
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Transient);
}

#[test]
fn test_delete_all_outside_transaction_is_all_or_nothing() {
    // GIVEN a committed person and a transient one
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, identity) = committed_person(&mut ctx, "Ann", "ann@example.com");
    let stray = ctx.new_object("Person").unwrap();

    // WHEN both are deleted in one call
    let err = ctx.delete_all(&[ann, stray]).unwrap_err();

    // THEN the transient object stops the batch and Ann's row survives
    assert!(matches!(err, StatelineError::NotPersistent { .. }));
    assert_eq!(stored_text(&store, &identity, 0).as_deref(), Some("Ann"));
    assert_ne!(
        ctx.lifecycle_state(ann).unwrap(),
        LifecycleState::PersistentDeleted
    );
}

#[test]
fn test_delete_all_in_transaction_removes_every_row() {
    // GIVEN two committed people
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, _) = committed_person(&mut ctx, "Ann", "ann@example.com");
    let (bob, _) = committed_person(&mut ctx, "Bob", "bob@example.com");

    // WHEN both are deleted and the transaction commits
    ctx.begin().unwrap();
    ctx.delete_all(&[ann, bob]).unwrap();
    ctx.commit().unwrap();

    // THEN storage is empty
    assert_eq!(store.committed_len(), 0);
    assert_eq!(ctx.lifecycle_state(bob).unwrap(), LifecycleState::Transient);
}

#[test]
fn test_detach_and_attach_copy_round_trip() {
    // GIVEN a committed person detached as a copy
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, identity) = committed_person(&mut ctx, "Ann", "ann@example.com");
    let mut copy = ctx.detach_copy(ann).unwrap();
    assert_eq!(copy.identity, identity);
    assert!(!copy.is_dirty());

    // WHEN the copy is changed and merged into another context
    copy.set_value(0, stateline_core::model::StoredValue::Text("Annie".into()));
    let mut other = factory.open().unwrap();
    let merged = other.attach_copy(&copy).unwrap();

    // THEN the change is committed through the other context
    assert_eq!(other.get(merged, "name").unwrap(), Value::text("Annie"));
    assert_eq!(stored_text(&store, &identity, 0).as_deref(), Some("Annie"));
    assert_eq!(store.committed(&identity).unwrap().version, Some(2));
}

#[test]
fn test_detached_object_keeps_loaded_values() {
    // GIVEN a committed person
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, identity) = committed_person(&mut ctx, "Ann", "ann@example.com");

    // WHEN it is detached
    ctx.detach(ann).unwrap();

    // THEN it left L1 but still answers reads
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Detached);
    assert_eq!(ctx.l1_lookup(&identity), None);
    assert_eq!(ctx.get(ann, "name").unwrap(), Value::text("Ann"));

    // AND persisting it again attaches a managed copy
    let attached = ctx.persist(ann).unwrap();
    assert_ne!(attached, ann);
    assert_eq!(ctx.l1_lookup(&identity), Some(attached));
    assert_eq!(ctx.get(attached, "name").unwrap(), Value::text("Ann"));
}

#[test]
fn test_detach_transient_is_rejected() {
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let ann = ctx.new_object("Person").unwrap();

    let err = ctx.detach(ann).unwrap_err();

    assert!(matches!(err, StatelineError::NotPersistent { .. }));
}

#[test]
fn test_not_detachable_class_is_rejected() {
    // GIVEN a class that forbids detachment
    let mut registry = stateline_core::MetadataRegistry::new();
    registry
        .register(
            stateline_core::ClassMetadata::new("Secret")
                .not_detachable()
                .field(stateline_core::FieldMetadata::basic("value")),
        )
        .unwrap();
    let factory = stateline_core::ContextFactory::new(
        registry,
        std::sync::Arc::new(stateline_core::MemoryStore::new()),
        stateline_core::FactoryConfig::default(),
    )
    .unwrap();
    let mut ctx = factory.open().unwrap();
    let secret = ctx.new_object("Secret").unwrap();
    let secret = ctx.persist(secret).unwrap();

    // WHEN detaching it
    let err = ctx.detach(secret).unwrap_err();

    // THEN the class is named in the error
    assert_eq!(err.kind(), ErrorKind::NotDetachable);
    assert_eq!(
        ctx.lifecycle_state(secret).unwrap(),
        LifecycleState::PersistentClean
    );
}

#[test]
fn test_detach_all_on_commit_detaches_loaded_objects() {
    // GIVEN a context that detaches everything at commit
    let config = ContextConfig {
        detach_all_on_commit: true,
        ..ContextConfig::default()
    };
    let (_store, factory) = factory_with_context(config);
    let mut ctx = factory.open().unwrap();

    // WHEN a person is persisted and committed
    let (ann, identity) = committed_person(&mut ctx, "Ann", "ann@example.com");

    // THEN it is detached with its values readable
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Detached);
    assert_eq!(ctx.l1_lookup(&identity), None);
    assert_eq!(ctx.get(ann, "email").unwrap(), Value::text("ann@example.com"));
}

#[test]
fn test_refresh_discards_pending_changes() {
    // GIVEN a committed person with an uncommitted change
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, _identity) = committed_person(&mut ctx, "Ann", "ann@example.com");
    ctx.begin().unwrap();
    ctx.set(ann, "name", "Changed").unwrap();
    assert_eq!(
        ctx.lifecycle_state(ann).unwrap(),
        LifecycleState::PersistentDirty
    );

    // WHEN it is refreshed
    ctx.refresh(ann).unwrap();

    // THEN the stored value is back and the object is clean
    assert_eq!(ctx.get(ann, "name").unwrap(), Value::text("Ann"));
    assert_eq!(
        ctx.lifecycle_state(ann).unwrap(),
        LifecycleState::PersistentClean
    );
    assert!(ctx.dirty_direct().is_empty());
    ctx.rollback().unwrap();
}

#[test]
fn test_refresh_of_removed_row_releases_handle() {
    // GIVEN a person loaded in one context and deleted through another
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, identity) = committed_person(&mut ctx, "Ann", "ann@example.com");
    let mut other = factory.open().unwrap();
    let remote = other.find_by_identity(&identity, true, true, None).unwrap();
    other.delete(remote).unwrap();

    // WHEN the first context refreshes it
    let err = ctx.refresh(ann).unwrap_err();

    // THEN the object is reported missing and the handle is stale
    assert!(err.is_not_found());
    assert_eq!(ctx.l1_lookup(&identity), None);
    assert_eq!(
        ctx.lifecycle_state(ann).unwrap_err().kind(),
        ErrorKind::StaleReference
    );
}

#[test]
fn test_evict_makes_clean_object_hollow_and_reload_on_read() {
    let (store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, _identity) = committed_person(&mut ctx, "Ann", "ann@example.com");

    ctx.evict(ann).unwrap();
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Hollow);

    store.reset_stats();
    assert_eq!(ctx.get(ann, "name").unwrap(), Value::text("Ann"));
    assert_eq!(store.stats().finds, 1);
    assert_eq!(
        ctx.lifecycle_state(ann).unwrap(),
        LifecycleState::PersistentClean
    );
}

#[test]
fn test_evict_all_hollows_clean_objects_only() {
    // GIVEN a committed person and a new, unflushed one in a transaction
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, _) = committed_person(&mut ctx, "Ann", "ann@example.com");
    ctx.begin().unwrap();
    let bob = ctx.new_object("Person").unwrap();
    ctx.set(bob, "name", "Bob").unwrap();
    let bob = ctx.persist(bob).unwrap();

    // WHEN everything is evicted
    ctx.evict_all().unwrap();

    // THEN only the clean object lost its state
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Hollow);
    assert_eq!(
        ctx.lifecycle_state(bob).unwrap(),
        LifecycleState::PersistentNew
    );
    assert_eq!(ctx.get(ann, "name").unwrap(), Value::text("Ann"));
    ctx.rollback().unwrap();
}

#[test]
fn test_close_with_detach_on_close_keeps_values_readable() {
    // GIVEN a context that detaches on close
    let config = ContextConfig {
        detach_on_close: true,
        ..ContextConfig::default()
    };
    let (_store, factory) = factory_with_context(config);
    let mut ctx = factory.open().unwrap();
    let (ann, _identity) = committed_person(&mut ctx, "Ann", "ann@example.com");

    // WHEN the context is closed twice
    ctx.close().unwrap();
    ctx.close().unwrap();

    // THEN the object is detached and readable, the context refuses work
    assert!(ctx.is_closed());
    assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Detached);
    assert_eq!(ctx.get(ann, "name").unwrap(), Value::text("Ann"));
    assert!(matches!(
        ctx.new_object("Person").unwrap_err(),
        StatelineError::ContextClosed
    ));
}

#[test]
fn test_close_without_detach_makes_handles_stale() {
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let (ann, _identity) = committed_person(&mut ctx, "Ann", "ann@example.com");

    ctx.close().unwrap();

    assert_eq!(
        ctx.lifecycle_state(ann).unwrap_err().kind(),
        ErrorKind::StaleReference
    );
}

#[test]
fn test_handle_from_other_context_is_rejected() {
    let (_store, factory) = factory();
    let mut first = factory.open().unwrap();
    let mut second = factory.open().unwrap();
    let ann = first.new_object("Person").unwrap();

    let err = second.get(ann, "name").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::WrongContext);
}

#[test]
fn test_field_type_mismatch_is_rejected() {
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    let ann = ctx.new_object("Person").unwrap();
    let item = ctx.new_object("Item").unwrap();

    let err = ctx.set(ann, "friend", item).unwrap_err();
    assert!(matches!(err, StatelineError::TypeMismatch { .. }));

    let err = ctx.set(ann, "nickname", "A").unwrap_err();
    assert!(matches!(err, StatelineError::UnknownField { .. }));
}
