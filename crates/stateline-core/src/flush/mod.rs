//! Flush engine
//!
//! Translates the dirty sets and queued operations of a context into
//! storage-adapter calls. The context drives rounds (see
//! [`ExecutionContext::flush`]); a [`FlushProcess`] performs one round.

pub mod operation_queue;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::context::ExecutionContext;
use crate::errors::{Result, StatelineError};
use crate::model::{FieldBitSet, ObjectRef, StoredValue, Value};
use crate::storage::{BatchKind, StoredObject};
use crate::tracker::LifecycleState;

pub use operation_queue::{Operation, OperationQueue};

/// One flush round over a context's pending work
pub trait FlushProcess: Send + Sync {
    /// Write the given dirty objects and queued operations
    ///
    /// Returns the optimistic conflicts met along the way, paired with the
    /// conflicting object. Objects made dirty while the round runs are left
    /// in the context's dirty sets for the next round.
    ///
    /// # Errors
    ///
    /// Returns the first non-optimistic failure; the round stops there.
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        direct: &BTreeSet<ObjectRef>,
        indirect: &BTreeSet<ObjectRef>,
        queue: &mut OperationQueue,
    ) -> Result<Vec<(ObjectRef, StatelineError)>>;
}

/// Default process: inserts, then updates, then deletes
///
/// New objects are inserted referenced-first. A reference to an object not
/// yet inserted (a cycle) is stored empty and written by a follow-up update
/// once every insert of the round is done.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderedFlushProcess;

impl FlushProcess for OrderedFlushProcess {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        direct: &BTreeSet<ObjectRef>,
        indirect: &BTreeSet<ObjectRef>,
        queue: &mut OperationQueue,
    ) -> Result<Vec<(ObjectRef, StatelineError)>> {
        let mut work: BTreeSet<ObjectRef> = direct
            .union(indirect)
            .copied()
            .filter(|obj| ctx.check(*obj).is_ok())
            .collect();

        let mut pending = queue.drain_all().into_iter();
        while let Some(op) = pending.next() {
            if ctx.check(op.owner()).is_err() {
                continue;
            }
            if let Err(err) = ctx.apply_operation(&op) {
                queue.push(op);
                pending.for_each(|op| queue.push(op));
                return Err(err);
            }
            work.insert(op.owner());
        }

        cascade_reachable(ctx, &mut work)?;
        let plan = FlushPlan::classify(ctx, &work)?;
        debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "flush plan"
        );

        let mut conflicts = Vec::new();
        insert_objects(ctx, &plan.inserts)?;
        update_objects(ctx, &plan.updates, &mut conflicts)?;
        delete_objects(ctx, &plan.deletes, &mut conflicts)?;
        for obj in plan.unwritten {
            ctx.tracker_mut(obj)?.mark_flushed();
        }
        Ok(conflicts)
    }
}

#[derive(Debug, Default)]
struct FlushPlan {
    inserts: BTreeSet<ObjectRef>,
    updates: Vec<ObjectRef>,
    deletes: Vec<ObjectRef>,
    /// New objects deleted before they ever reached storage
    unwritten: Vec<ObjectRef>,
}

impl FlushPlan {
    fn classify(ctx: &ExecutionContext, work: &BTreeSet<ObjectRef>) -> Result<Self> {
        let mut plan = FlushPlan::default();
        for &obj in work {
            let tracker = ctx.tracker(obj)?;
            let has_changes =
                !tracker.dirty_fields().is_empty() || ctx.forced_version_bumps.contains(&obj);
            match tracker.lifecycle_state() {
                LifecycleState::PersistentNew if !tracker.is_flushed_new() => {
                    plan.inserts.insert(obj);
                }
                LifecycleState::PersistentNew
                | LifecycleState::PersistentDirty
                | LifecycleState::PersistentClean
                | LifecycleState::Hollow
                    if has_changes =>
                {
                    plan.updates.push(obj)
                }
                LifecycleState::PersistentDeleted if !tracker.is_flushed_deleted() => {
                    plan.deletes.push(obj)
                }
                LifecycleState::PersistentNewDeleted => {
                    if !tracker.is_flushed_new() {
                        plan.unwritten.push(obj);
                    } else if !tracker.is_flushed_deleted() {
                        plan.deletes.push(obj);
                    }
                }
                _ => {}
            }
        }
        Ok(plan)
    }
}

/// Persist transient objects reachable from the round's work
///
/// Transient referents behind cascading fields join this round; detached
/// referents are attached, which dirties them for the next round.
fn cascade_reachable(ctx: &mut ExecutionContext, work: &mut BTreeSet<ObjectRef>) -> Result<()> {
    let mut stack: Vec<ObjectRef> = work.iter().copied().collect();
    let mut seen = HashSet::new();
    loop {
        while let Some(obj) = stack.pop() {
            if !seen.insert(obj) {
                continue;
            }
            let state = ctx.tracker(obj)?.lifecycle_state();
            if !state.is_persistent() || state.is_deleted() {
                continue;
            }
            let class = ctx.class_of(obj)?;
            for (field, referent) in ctx.referents(obj)? {
                match ctx.tracker(referent)?.lifecycle_state() {
                    LifecycleState::Transient => {
                        let cascades = class.field_at(field).is_some_and(|f| f.cascade_persist);
                        if !cascades {
                            return Err(StatelineError::NotPersistent {
                                op: format!(
                                    "flush {}.{} referencing a transient object",
                                    class.name,
                                    class.field_at(field).map_or("?", |f| f.name.as_str())
                                ),
                            });
                        }
                        trace!(object = %referent, "persisting reachable object");
                        ctx.persist_reachable(referent)?;
                        work.insert(referent);
                        stack.push(referent);
                    }
                    LifecycleState::Detached => {
                        let attached = ctx.attach_detached(referent)?;
                        if attached != referent {
                            ctx.swap_reference(obj, field, referent, attached)?;
                        }
                    }
                    _ => {}
                }
            }
        }

        // objects persisted by the cascade itself belong to this round
        let joined: Vec<ObjectRef> = ctx
            .dirty_direct
            .iter()
            .chain(ctx.dirty_indirect.iter())
            .copied()
            .filter(|obj| {
                ctx.tracker(*obj).is_ok_and(|t| {
                    t.lifecycle_state() == LifecycleState::PersistentNew && !t.is_flushed_new()
                })
            })
            .collect();
        if joined.is_empty() {
            return Ok(());
        }
        for obj in joined {
            ctx.dirty_direct.remove(&obj);
            ctx.dirty_indirect.remove(&obj);
            if work.insert(obj) {
                stack.push(obj);
            }
        }
    }
}

/// Run `body` between `batch_start` and `batch_end`
///
/// The batch is closed even when `body` fails; the body's error wins.
fn in_batch<T>(
    ctx: &mut ExecutionContext,
    kind: BatchKind,
    body: impl FnOnce(&mut ExecutionContext) -> Result<T>,
) -> Result<T> {
    let store = Arc::clone(&ctx.store);
    let id = ctx.id;
    store.batch_start(id, kind)?;
    let result = body(ctx);
    let end = store.batch_end(id, kind);
    let value = result?;
    end?;
    Ok(value)
}

/// Referenced-first order over the objects to insert
fn insert_order(ctx: &ExecutionContext, inserts: &BTreeSet<ObjectRef>) -> Result<Vec<ObjectRef>> {
    let mut order = Vec::with_capacity(inserts.len());
    let mut visited = HashSet::new();
    for &root in inserts {
        let mut stack = vec![(root, false)];
        while let Some((obj, expanded)) = stack.pop() {
            if expanded {
                order.push(obj);
                continue;
            }
            if !visited.insert(obj) {
                continue;
            }
            stack.push((obj, true));
            for (_, referent) in ctx.referents(obj)? {
                if inserts.contains(&referent) && !visited.contains(&referent) {
                    stack.push((referent, false));
                }
            }
        }
    }
    Ok(order)
}

fn insert_objects(ctx: &mut ExecutionContext, inserts: &BTreeSet<ObjectRef>) -> Result<()> {
    if inserts.is_empty() {
        return Ok(());
    }
    let order = insert_order(ctx, inserts)?;
    let deferred = in_batch(ctx, BatchKind::Insert, |ctx| {
        let mut inserted = HashSet::new();
        let mut deferred = Vec::new();
        for obj in order {
            let later = insert_one(ctx, obj, inserts, &inserted)?;
            inserted.insert(obj);
            if !later.is_empty() {
                deferred.push((obj, later));
            }
        }
        Ok(deferred)
    })?;

    if deferred.is_empty() {
        return Ok(());
    }
    in_batch(ctx, BatchKind::Update, |ctx| {
        for (obj, fields) in deferred {
            let tracker = ctx.tracker(obj)?;
            let Some(identity) = tracker.identity().cloned() else {
                continue;
            };
            let version = tracker.version();
            let values = ctx.stored_fields(obj, &fields)?;
            trace!(identity = %identity, fields = values.len(), "deferred reference update");
            ctx.store
                .update(ctx.id, &identity, &values, version, version)?;
        }
        Ok(())
    })
}

/// Insert one object; returns the fields whose references must be written later
fn insert_one(
    ctx: &mut ExecutionContext,
    obj: ObjectRef,
    pending: &BTreeSet<ObjectRef>,
    inserted: &HashSet<ObjectRef>,
) -> Result<FieldBitSet> {
    ctx.refresh_application_identity(obj)?;
    let class = ctx.class_of(obj)?;
    let tracker = ctx.tracker(obj)?;
    let identity = tracker.identity().cloned().ok_or_else(|| {
        StatelineError::internal(format!("new object {} has no identity", obj))
    })?;

    let mut values = vec![StoredValue::Null; class.field_count()];
    let mut later = FieldBitSet::new();
    for (field, slot) in values.iter_mut().enumerate() {
        let value = tracker.field_value(field).cloned().unwrap_or(Value::Null);
        let waits = value
            .referenced()
            .iter()
            .any(|r| pending.contains(r) && !inserted.contains(r));
        if waits {
            later.insert(field);
        } else {
            *slot = ctx.to_stored(&value)?;
        }
    }

    let version = class.versioned.then_some(1);
    let row = StoredObject {
        identity: identity.clone(),
        class: class.name.clone(),
        version,
        values,
    };
    let assigned = ctx.store.insert(ctx.id, &row)?;

    let tracker = ctx.tracker_mut(obj)?;
    tracker.set_version(version);
    tracker.mark_flushed();
    let identity = match assigned {
        Some(assigned) if assigned != identity => {
            ctx.replace_identity_internal(obj, &identity, assigned.clone())?;
            assigned
        }
        _ => identity,
    };
    trace!(identity = %identity, "inserted");
    ctx.reachability.add_flushed_new(identity);
    Ok(later)
}

fn update_objects(
    ctx: &mut ExecutionContext,
    updates: &[ObjectRef],
    conflicts: &mut Vec<(ObjectRef, StatelineError)>,
) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    in_batch(ctx, BatchKind::Update, |ctx| {
        for &obj in updates {
            let class = ctx.class_of(obj)?;
            let forced = ctx.forced_version_bumps.remove(&obj);
            let tracker = ctx.tracker(obj)?;
            let Some(identity) = tracker.identity().cloned() else {
                continue;
            };
            let dirty = tracker.dirty_fields().clone();
            let (expected, new) = if class.versioned {
                let current = tracker.version();
                (current, Some(current.unwrap_or(0) + 1))
            } else {
                (None, None)
            };
            if dirty.is_empty() && !(forced && class.versioned) {
                ctx.tracker_mut(obj)?.mark_flushed();
                continue;
            }
            let values = ctx.stored_fields(obj, &dirty)?;

            match ctx.store.update(ctx.id, &identity, &values, expected, new) {
                Ok(()) => {
                    trace!(identity = %identity, fields = values.len(), forced, "updated");
                    let tracker = ctx.tracker_mut(obj)?;
                    if class.versioned {
                        tracker.set_version(new);
                    }
                    tracker.mark_flushed();
                }
                Err(err) if err.is_optimistic() => {
                    debug!(identity = %identity, "optimistic conflict on update");
                    conflicts.push((obj, err));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })
}

fn delete_objects(
    ctx: &mut ExecutionContext,
    deletes: &[ObjectRef],
    conflicts: &mut Vec<(ObjectRef, StatelineError)>,
) -> Result<()> {
    if deletes.is_empty() {
        return Ok(());
    }
    in_batch(ctx, BatchKind::Delete, |ctx| {
        for &obj in deletes {
            let class = ctx.class_of(obj)?;
            let tracker = ctx.tracker(obj)?;
            let Some(identity) = tracker.identity().cloned() else {
                continue;
            };
            let expected = if class.versioned {
                tracker.version()
            } else {
                None
            };
            match ctx.store.delete(ctx.id, &identity, expected) {
                Ok(()) => {
                    trace!(identity = %identity, "deleted");
                    ctx.tracker_mut(obj)?.mark_flushed();
                }
                Err(err) if err.is_optimistic() => {
                    debug!(identity = %identity, "optimistic conflict on delete");
                    conflicts.push((obj, err));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })
}
