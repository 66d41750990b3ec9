#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use proptest::prelude::*;
use std::collections::HashMap;

use stateline_core::{ExecutionContext, Identity, ObjectRef};

use common::{committed_person, factory, stored_text};

const PEOPLE: usize = 3;

#[derive(Debug, Clone)]
enum Step {
    Find { person: usize, validate: bool },
    Rename { person: usize, name: u8 },
    Evict { person: usize },
    Flush,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..PEOPLE, any::<bool>()).prop_map(|(person, validate)| Step::Find { person, validate }),
        (0..PEOPLE, any::<u8>()).prop_map(|(person, name)| Step::Rename { person, name }),
        (0..PEOPLE).prop_map(|person| Step::Evict { person }),
        Just(Step::Flush),
    ]
}

fn check_invariants(ctx: &ExecutionContext, ids: &[Identity]) -> Result<(), TestCaseError> {
    for id in ids {
        prop_assert!(ctx.trackers_for(id) <= 1, "two trackers for {}", id);
    }
    let direct = ctx.dirty_direct();
    for obj in ctx.dirty_indirect() {
        prop_assert!(!direct.contains(&obj), "{} is dirty both ways", obj);
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_unit_of_work_keeps_identity_and_last_write(steps in prop::collection::vec(step(), 1..24)) {
        let (store, factory) = factory();
        let mut setup = factory.open().unwrap();
        let ids: Vec<Identity> = (0..PEOPLE)
            .map(|i| committed_person(&mut setup, &format!("p{}", i), &format!("p{}@example.com", i)).1)
            .collect();

        let mut ctx = factory.open().unwrap();
        ctx.begin().unwrap();
        let mut handles: HashMap<usize, ObjectRef> = HashMap::new();
        let mut expected: Vec<String> = (0..PEOPLE).map(|i| format!("p{}", i)).collect();

        for step in steps {
            match step {
                Step::Find { person, validate } => {
                    let found = ctx.find_by_identity(&ids[person], validate, true, None).unwrap();
                    if let Some(previous) = handles.get(&person) {
                        prop_assert_eq!(*previous, found);
                    }
                    handles.insert(person, found);
                }
                Step::Rename { person, name } => {
                    if let Some(obj) = handles.get(&person) {
                        let name = format!("n{}", name);
                        ctx.set(*obj, "name", name.as_str()).unwrap();
                        expected[person] = name;
                    }
                }
                Step::Evict { person } => {
                    if let Some(obj) = handles.get(&person) {
                        // Objects with pending changes refuse eviction
                        let _ = ctx.evict(*obj);
                    }
                }
                Step::Flush => ctx.flush(true).unwrap(),
            }
            check_invariants(&ctx, &ids)?;
        }

        ctx.commit().unwrap();
        for (person, id) in ids.iter().enumerate() {
            prop_assert_eq!(stored_text(&store, id, 0), Some(expected[person].clone()));
        }
    }
}
