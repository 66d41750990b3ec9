#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use stateline_core::{ErrorKind, Value};

use common::factory;

#[test]
fn test_shared_context_runs_a_unit_of_work() {
    // GIVEN a shared context
    let (store, factory) = factory();
    let shared = factory.open_shared().unwrap();

    // WHEN a person is persisted through it
    shared.begin().unwrap();
    let person = shared.new_object("Person").unwrap();
    shared.set(person, "name", "Ann").unwrap();
    let person = shared.persist(person).unwrap();
    shared.flush().unwrap();
    shared.commit().unwrap();

    // THEN the row is stored and the context is marked multithreaded
    assert_eq!(store.committed_len(), 1);
    assert_eq!(shared.get(person, "name").unwrap(), Value::text("Ann"));
    assert!(shared.with(|ctx| Ok(ctx.config().multithreaded)).unwrap());
}

#[test]
fn test_shared_context_used_from_several_threads() {
    // GIVEN a committed person and a shared context
    let (_store, factory) = factory();
    let mut setup = factory.open().unwrap();
    let (_, identity) = common::committed_person(&mut setup, "Ann", "ann@example.com");
    let shared = factory.open_shared().unwrap();

    // WHEN several threads look it up concurrently
    let found: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| shared.find_by_identity(&identity, false).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // THEN they all see the same managed object
    assert!(found.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(shared.with(|ctx| Ok(ctx.trackers_for(&identity))).unwrap(), 1);
}

#[test]
fn test_reentrant_borrow_reports_internal_error() {
    let (_store, factory) = factory();
    let shared = factory.open_shared().unwrap();

    let result = shared.with(|_ctx| shared.new_object("Person"));

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Internal);
}

#[test]
fn test_closed_shared_context_refuses_work() {
    let (_store, factory) = factory();
    let shared = factory.open_shared().unwrap();

    shared.close().unwrap();

    assert_eq!(
        shared.new_object("Person").unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    let ctx = shared.into_inner();
    assert!(ctx.is_closed());
}

#[test]
fn test_debug_output_while_idle_and_while_in_use() {
    // GIVEN a shared context
    let (_store, factory) = factory();
    let shared = factory.open_shared().unwrap();

    // WHEN it is formatted outside and inside a unit of work
    let idle = format!("{:?}", shared);
    let busy = shared.with(|_ctx| Ok(format!("{:?}", shared))).unwrap();

    // THEN the idle form shows the context and the busy form does not block
    assert!(idle.starts_with("SharedExecutionContext(ExecutionContext"));
    assert!(idle.contains("closed: false"));
    assert_eq!(busy, "SharedExecutionContext(<in use>)");
}
