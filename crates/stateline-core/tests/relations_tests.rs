#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use stateline_core::{ContextConfig, ErrorKind, ExecutionContext, ObjectRef, Value};

use common::{factory, factory_with_context};

fn named(ctx: &mut ExecutionContext, class: &str, name: &str) -> ObjectRef {
    let obj = ctx.new_object(class).unwrap();
    ctx.set(obj, "name", name).unwrap();
    ctx.persist(obj).unwrap()
}

#[test]
fn test_collection_add_sets_inverse_reference_at_flush() {
    // GIVEN a persistent parent and child in one transaction
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let parent = named(&mut ctx, "Parent", "p");
    let child = named(&mut ctx, "Child", "c");

    // WHEN the child is added to the parent's collection and flushed
    ctx.add_to_collection(parent, "children", child).unwrap();
    assert_eq!(ctx.get(child, "parent").unwrap(), Value::Null);
    ctx.flush(true).unwrap();

    // THEN the child points back at its parent
    assert_eq!(ctx.get(child, "parent").unwrap(), Value::Ref(parent));
    ctx.commit().unwrap();
}

#[test]
fn test_reference_set_adds_to_inverse_collection() {
    // GIVEN a persistent parent and child
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let parent = named(&mut ctx, "Parent", "p");
    let child = named(&mut ctx, "Child", "c");

    // WHEN the child's reference is set
    ctx.set(child, "parent", parent).unwrap();
    ctx.flush(true).unwrap();

    // THEN the parent's collection contains the child
    assert_eq!(
        ctx.get(parent, "children").unwrap(),
        Value::Collection(vec![child])
    );
    ctx.commit().unwrap();
}

#[test]
fn test_collection_remove_clears_inverse_reference() {
    // GIVEN a committed parent/child pair
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let parent = named(&mut ctx, "Parent", "p");
    let child = named(&mut ctx, "Child", "c");
    ctx.add_to_collection(parent, "children", child).unwrap();
    ctx.commit().unwrap();
    assert_eq!(ctx.get(child, "parent").unwrap(), Value::Ref(parent));

    // WHEN the child is removed from the collection
    ctx.begin().unwrap();
    ctx.remove_from_collection(parent, "children", child).unwrap();
    ctx.commit().unwrap();

    // THEN its reference is cleared
    assert_eq!(ctx.get(child, "parent").unwrap(), Value::Null);
}

#[test]
fn test_moving_child_releases_previous_owner() {
    // GIVEN a child belonging to a first parent
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let first = named(&mut ctx, "Parent", "first");
    let second = named(&mut ctx, "Parent", "second");
    let child = named(&mut ctx, "Child", "c");
    ctx.add_to_collection(first, "children", child).unwrap();
    ctx.flush(true).unwrap();

    // WHEN the second parent adds it
    ctx.add_to_collection(second, "children", child).unwrap();
    ctx.flush(true).unwrap();

    // THEN the child moved and the first parent no longer lists it
    assert_eq!(ctx.get(child, "parent").unwrap(), Value::Ref(second));
    assert_eq!(
        ctx.get(first, "children").unwrap(),
        Value::Collection(Vec::new())
    );
    ctx.commit().unwrap();
}

#[test]
fn test_contradicting_edits_fail_in_strict_mode() {
    // GIVEN strict relation checking
    let config = ContextConfig {
        managed_relations_strict: true,
        ..ContextConfig::default()
    };
    let (store, factory) = factory_with_context(config);
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let first = named(&mut ctx, "Parent", "first");
    let second = named(&mut ctx, "Parent", "second");
    let child = named(&mut ctx, "Child", "c");

    // WHEN both sides are edited to disagree
    ctx.add_to_collection(first, "children", child).unwrap();
    ctx.set(child, "parent", second).unwrap();
    let err = ctx.flush(true).unwrap_err();

    // THEN the flush reports the inconsistency and writes nothing
    assert_eq!(err.kind(), ErrorKind::InconsistentRelation);
    ctx.rollback().unwrap();
    assert_eq!(store.committed_len(), 0);
}

#[test]
fn test_strict_contradiction_applies_no_other_edit() {
    // GIVEN strict relation checking and a parent with two recorded adds
    let config = ContextConfig {
        managed_relations_strict: true,
        ..ContextConfig::default()
    };
    let (_store, factory) = factory_with_context(config);
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let first = named(&mut ctx, "Parent", "first");
    let second = named(&mut ctx, "Parent", "second");
    let child = named(&mut ctx, "Child", "c");
    let sibling = named(&mut ctx, "Child", "s");
    ctx.add_to_collection(first, "children", sibling).unwrap();
    ctx.add_to_collection(first, "children", child).unwrap();

    // AND the second add is contradicted by the child's own edit
    ctx.set(child, "parent", second).unwrap();

    // WHEN the flush runs
    let err = ctx.flush(true).unwrap_err();

    // THEN the consistent add was not applied either
    assert_eq!(err.kind(), ErrorKind::InconsistentRelation);
    assert_eq!(ctx.get(sibling, "parent").unwrap(), Value::Null);

    // AND the recorded edits are still there for the next flush
    let again = ctx.flush(true).unwrap_err();
    assert_eq!(again.kind(), ErrorKind::InconsistentRelation);
    ctx.rollback().unwrap();
}

#[test]
fn test_contradicting_edit_is_skipped_when_not_strict() {
    // GIVEN default relation checking
    let (_store, factory) = factory();
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let first = named(&mut ctx, "Parent", "first");
    let second = named(&mut ctx, "Parent", "second");
    let child = named(&mut ctx, "Child", "c");

    // WHEN both sides are edited to disagree
    ctx.add_to_collection(first, "children", child).unwrap();
    ctx.set(child, "parent", second).unwrap();
    ctx.flush(true).unwrap();

    // THEN the explicit reference wins and its inverse is maintained
    assert_eq!(ctx.get(child, "parent").unwrap(), Value::Ref(second));
    assert_eq!(
        ctx.get(second, "children").unwrap(),
        Value::Collection(vec![child])
    );
    ctx.commit().unwrap();
}

#[test]
fn test_unmanaged_relations_are_left_alone() {
    // GIVEN managed relations switched off
    let config = ContextConfig {
        managed_relations: false,
        ..ContextConfig::default()
    };
    let (_store, factory) = factory_with_context(config);
    let mut ctx = factory.open().unwrap();
    ctx.begin().unwrap();
    let parent = named(&mut ctx, "Parent", "p");
    let child = named(&mut ctx, "Child", "c");

    // WHEN only one side is edited
    ctx.add_to_collection(parent, "children", child).unwrap();
    ctx.flush(true).unwrap();

    // THEN the other side is untouched
    assert_eq!(ctx.get(child, "parent").unwrap(), Value::Null);
    ctx.commit().unwrap();
}
