//! Persist, delete, attach, detach, refresh, locking and close

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::context::dirty::conflicts_to_error;
use crate::context::ExecutionContext;
use crate::errors::{Result, StatelineError};
use crate::locking::LockMode;
use crate::model::{Identity, ObjectRef, Value};
use crate::tracker::{DetachedObject, LifecycleState};
use crate::{log_op_end, log_op_error, log_op_start};

impl ExecutionContext {
    /// Run `f` in the active transaction, or in an implicit one
    ///
    /// The implicit transaction commits when `f` succeeds and rolls back
    /// otherwise, which also drops L1 entries made by the failed attempt.
    pub(crate) fn with_implicit_tx<T>(
        &mut self,
        op: &str,
        f: impl FnOnce(&mut ExecutionContext) -> Result<T>,
    ) -> Result<T> {
        if self.tx.is_active() {
            return f(self);
        }
        if !self.config.nontransactional_atomic_write {
            return Err(StatelineError::TransactionNotActive { op: op.to_string() });
        }
        let mut scope = self.enter_invocation();
        scope.invocation.set_nontx_write(true);
        debug!(op = op, "running in implicit transaction");
        scope.begin_internal()?;
        match f(&mut *scope) {
            Ok(value) => {
                scope.commit_internal()?;
                Ok(value)
            }
            Err(err) => {
                if scope.tx.is_active() {
                    if let Err(rollback_err) = scope.rollback_internal() {
                        warn!(op = op, error = %rollback_err, "implicit rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    // ===== Persist =====

    /// Make `obj` persistent
    ///
    /// Transient objects get a tracker identity and become directly dirty;
    /// transient objects reachable through cascading fields follow. Detached
    /// objects are attached. Persistent objects are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for deleted objects,
    /// `DuplicateTracker` if another object holds the identity, or
    /// `TransactionNotActive` when no transaction is active and implicit
    /// transactions are disabled.
    pub fn persist(&mut self, obj: ObjectRef) -> Result<ObjectRef> {
        self.ensure_open()?;
        log_op_start!("persist", context_id = self.id.as_u64(), object = %obj);
        let start = Instant::now();
        let persisted = self
            .with_implicit_tx("persist", |ctx| ctx.persist_internal(obj, true))
            .map_err(|e| {
                log_op_error!(
                    "persist",
                    &e,
                    duration_ms = start.elapsed().as_millis() as u64
                );
                e
            })?;
        self.evict_l1_overflow();
        log_op_end!("persist", duration_ms = start.elapsed().as_millis() as u64);
        Ok(persisted)
    }

    /// Persist every object, collecting the failures
    ///
    /// # Errors
    ///
    /// Returns `PersistAllFailed` carrying every per-object failure. Outside a
    /// transaction the whole batch is rolled back.
    pub fn persist_all(&mut self, objects: &[ObjectRef]) -> Result<Vec<ObjectRef>> {
        self.ensure_open()?;
        log_op_start!(
            "persist_all",
            context_id = self.id.as_u64(),
            count = objects.len()
        );
        let start = Instant::now();
        let result = self.with_implicit_tx("persist_all", |ctx| {
            let mut persisted = Vec::with_capacity(objects.len());
            let mut failures = Vec::new();
            for &obj in objects {
                match ctx.persist_internal(obj, true) {
                    Ok(p) => persisted.push(p),
                    Err(err) => failures.push(err),
                }
            }
            if failures.is_empty() {
                Ok(persisted)
            } else {
                Err(StatelineError::PersistAllFailed { failures })
            }
        });
        let persisted = result.map_err(|e| {
            log_op_error!(
                "persist_all",
                &e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;
        self.evict_l1_overflow();
        log_op_end!(
            "persist_all",
            duration_ms = start.elapsed().as_millis() as u64,
            count = persisted.len()
        );
        Ok(persisted)
    }

    /// `explicit` marks a reachability root
    pub(crate) fn persist_internal(&mut self, obj: ObjectRef, explicit: bool) -> Result<ObjectRef> {
        let state = self.tracker(obj)?.lifecycle_state();
        match state {
            LifecycleState::Transient => {
                self.persist_graph(obj, explicit)?;
                Ok(obj)
            }
            LifecycleState::Detached => {
                let attached = self.attach_detached(obj)?;
                if explicit {
                    if let Some(identity) = self.tracker(attached)?.identity().cloned() {
                        self.reachability.add_root(identity);
                    }
                }
                Ok(attached)
            }
            s if s.is_deleted() => Err(StatelineError::InvalidStateTransition {
                op: "persist".to_string(),
                state: s.to_string(),
            }),
            _ => {
                if explicit {
                    if let Some(identity) = self.tracker(obj)?.identity().cloned() {
                        self.reachability.add_root(identity);
                    }
                }
                Ok(obj)
            }
        }
    }

    /// Persist a transient object reached by a flush cascade
    pub(crate) fn persist_reachable(&mut self, obj: ObjectRef) -> Result<()> {
        self.persist_internal(obj, false).map(|_| ())
    }

    /// Persist `root` and the transient objects reachable through
    /// cascading fields
    fn persist_graph(&mut self, root: ObjectRef, explicit: bool) -> Result<()> {
        let mut stack = vec![root];
        while let Some(obj) = stack.pop() {
            if self.tracker(obj)?.lifecycle_state() != LifecycleState::Transient {
                continue;
            }
            let identity = self.make_persistent(obj)?;
            if explicit && obj == root {
                self.reachability.add_root(identity.clone());
            }
            self.reachability.add_persisted(identity);

            let class = self.class_of(obj)?;
            for (field, referent) in self.referents(obj)? {
                if !class.field_at(field).is_some_and(|f| f.cascade_persist) {
                    continue;
                }
                match self.tracker(referent)?.lifecycle_state() {
                    LifecycleState::Transient => stack.push(referent),
                    LifecycleState::Detached => {
                        let attached = self.attach_detached(referent)?;
                        if attached != referent {
                            self.swap_reference(obj, field, referent, attached)?;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Give one transient object an identity, an L1 entry and a dirty mark
    fn make_persistent(&mut self, obj: ObjectRef) -> Result<Identity> {
        let class = self.class_of(obj)?;
        let identity = self.initial_identity(obj, &class)?;
        if self.cache.l1().contains(&identity) {
            return Err(StatelineError::DuplicateTracker {
                identity: identity.to_string(),
            });
        }
        self.tracker_mut(obj)?.make_persistent(identity.clone())?;
        if let Err(err) = self.cache.l1_mut().put(identity.clone(), obj) {
            self.tracker_mut(obj)?.make_transient()?;
            return Err(err);
        }
        self.try_index_unique_keys(obj);
        self.mark_dirty(obj, true)?;
        self.record_initial_relations(obj)?;
        debug!(identity = %identity, "object made persistent");
        Ok(identity)
    }

    // ===== Delete =====

    /// Delete `obj` and its dependent objects
    ///
    /// Detached objects are attached first. Deleting an already deleted
    /// object is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotPersistent` for transient objects, or
    /// `TransactionNotActive` when no transaction is active and implicit
    /// transactions are disabled.
    pub fn delete(&mut self, obj: ObjectRef) -> Result<()> {
        self.ensure_open()?;
        log_op_start!("delete", context_id = self.id.as_u64(), object = %obj);
        let start = Instant::now();
        self.with_implicit_tx("delete", |ctx| ctx.delete_internal(obj))
            .map_err(|e| {
                log_op_error!(
                    "delete",
                    &e,
                    duration_ms = start.elapsed().as_millis() as u64
                );
                e
            })?;
        log_op_end!("delete", duration_ms = start.elapsed().as_millis() as u64);
        Ok(())
    }

    /// Delete several objects; stops at the first failure
    ///
    /// # Errors
    ///
    /// As [`delete`](Self::delete). Outside a transaction nothing is deleted
    /// when one object fails.
    pub fn delete_all(&mut self, objects: &[ObjectRef]) -> Result<()> {
        self.ensure_open()?;
        log_op_start!(
            "delete_all",
            context_id = self.id.as_u64(),
            count = objects.len()
        );
        let start = Instant::now();
        self.with_implicit_tx("delete_all", |ctx| {
            objects.iter().try_for_each(|&obj| ctx.delete_internal(obj))
        })
        .map_err(|e| {
            log_op_error!(
                "delete_all",
                &e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;
        log_op_end!(
            "delete_all",
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(())
    }

    fn delete_internal(&mut self, root: ObjectRef) -> Result<()> {
        let mut stack = vec![root];
        while let Some(obj) = stack.pop() {
            let is_root = obj == root;
            let obj = if self.tracker(obj)?.lifecycle_state() == LifecycleState::Detached {
                self.attach_detached(obj)?
            } else {
                obj
            };
            let state = self.tracker(obj)?.lifecycle_state();
            if state == LifecycleState::Transient {
                if is_root {
                    return Err(StatelineError::NotPersistent {
                        op: "delete".to_string(),
                    });
                }
                continue;
            }
            if state.is_deleted() {
                continue;
            }

            let class = self.class_of(obj)?;
            let mut dependents = Vec::new();
            if class.fields.iter().any(|f| f.cascade_delete) {
                self.load_object(obj)?;
                dependents = self
                    .referents(obj)?
                    .into_iter()
                    .filter(|(field, _)| class.field_at(*field).is_some_and(|f| f.cascade_delete))
                    .map(|(_, r)| r)
                    .collect();
            }

            self.mark_dirty(obj, true)?;
            self.tracker_mut(obj)?.delete_persistent()?;
            debug!(object = %obj, dependents = dependents.len(), "object deleted");
            stack.extend(dependents);
        }
        Ok(())
    }

    // ===== Attach =====

    /// Bring a detached object (and its detached referents) back under
    /// management
    ///
    /// With copy-on-attach the detached object stays detached and a managed
    /// copy is returned; otherwise the object itself is attached.
    pub(crate) fn attach_detached(&mut self, obj: ObjectRef) -> Result<ObjectRef> {
        if self.tracker(obj)?.lifecycle_state() != LifecycleState::Detached {
            return Ok(obj);
        }
        let mut scope = self.enter_invocation();
        scope.attach_graph(obj)
    }

    fn attach_graph(&mut self, root: ObjectRef) -> Result<ObjectRef> {
        let attached_root = self.attach_one(root)?;
        let mut pending = vec![attached_root];
        while let Some(owner) = pending.pop() {
            for (field, referent) in self.referents(owner)? {
                if self.tracker(referent)?.lifecycle_state() != LifecycleState::Detached {
                    continue;
                }
                let identity = self.detached_identity(referent)?;
                let attached = match self.invocation.attached(&identity) {
                    Some(done) => done,
                    None => {
                        let attached = self.attach_one(referent)?;
                        pending.push(attached);
                        attached
                    }
                };
                if attached != referent {
                    self.swap_reference(owner, field, referent, attached)?;
                }
            }
        }
        Ok(attached_root)
    }

    fn detached_identity(&self, obj: ObjectRef) -> Result<Identity> {
        let identity = self.tracker(obj)?.identity().cloned().ok_or_else(|| {
            StatelineError::internal(format!("detached object {} has no identity", obj))
        })?;
        self.normalize(&identity)
    }

    fn attach_one(&mut self, obj: ObjectRef) -> Result<ObjectRef> {
        let identity = self.detached_identity(obj)?;
        if let Some(done) = self.invocation.attached(&identity) {
            return Ok(done);
        }
        let live = self.cache.l1().peek(&identity).filter(|live| *live != obj);
        let target = match live {
            Some(_) if !self.config.copy_on_attach => {
                return Err(StatelineError::DuplicateTracker {
                    identity: identity.to_string(),
                })
            }
            Some(live) => {
                self.merge_detached(live, obj)?;
                live
            }
            None if self.config.copy_on_attach => {
                let class = self.class_of(obj)?;
                let copy = self.alloc(self.trackers.new_hollow(&class, identity.clone()));
                if let Err(err) = self.cache.l1_mut().put(identity.clone(), copy) {
                    self.release(copy);
                    return Err(err);
                }
                self.merge_detached(copy, obj)?;
                copy
            }
            None => {
                self.tracker_mut(obj)?.attach()?;
                self.cache.l1_mut().put(identity.clone(), obj)?;
                obj
            }
        };
        self.invocation.record_attached(identity.clone(), target);
        self.try_index_unique_keys(target);

        if self.tracker(target)?.dirty_fields().is_empty() {
            if self.tx.is_active() {
                self.enlist(target)?;
            }
        } else {
            self.mark_dirty(target, true)?;
        }
        debug!(identity = %identity, copied = target != obj, "object attached");
        Ok(target)
    }

    /// Merge the state of a detached object into a managed tracker
    fn merge_detached(&mut self, target: ObjectRef, source: ObjectRef) -> Result<()> {
        let tracker = self.tracker(source)?;
        let mut values = Vec::new();
        tracker.provide_fields(tracker.loaded_fields(), &mut |field, value| {
            values.push((field, value.clone()));
        });
        let version = tracker.version();
        let dirty = tracker.dirty_fields().clone();
        self.tracker_mut(target)?.attach_copy(version, values, &dirty)
    }

    /// Point `field` of `owner` at `new` instead of `old`
    ///
    /// Dirty fields stay dirty; clean fields stay clean.
    pub(crate) fn swap_reference(
        &mut self,
        owner: ObjectRef,
        field: usize,
        old: ObjectRef,
        new: ObjectRef,
    ) -> Result<()> {
        let swapped = match self.tracker(owner)?.field_value(field) {
            Some(Value::Ref(r)) if *r == old => Value::Ref(new),
            Some(Value::Collection(items)) if items.contains(&old) => Value::Collection(
                items
                    .iter()
                    .map(|r| if *r == old { new } else { *r })
                    .collect(),
            ),
            _ => return Ok(()),
        };
        if self.tracker(owner)?.dirty_fields().contains(field) {
            self.tracker_mut(owner)?.replace_field(field, swapped)
        } else {
            self.tracker_mut(owner)?.load_fields(vec![(field, swapped)]);
            Ok(())
        }
    }

    /// Merge a detached copy into this context
    ///
    /// The copy's dirty fields become modifications of the managed object;
    /// its other fields only fill fields not loaded yet.
    ///
    /// # Errors
    ///
    /// Returns `ClassNotPersistable`, `InvalidStateTransition` if the managed
    /// object is deleted, or `TransactionNotActive` when no transaction is
    /// active and implicit transactions are disabled.
    pub fn attach_copy(&mut self, copy: &DetachedObject) -> Result<ObjectRef> {
        self.ensure_open()?;
        log_op_start!(
            "attach",
            context_id = self.id.as_u64(),
            identity = %copy.identity,
            dirty = copy.is_dirty()
        );
        let start = Instant::now();
        let attached = self
            .with_implicit_tx("attach", |ctx| {
                let mut scope = ctx.enter_invocation();
                scope.invocation.set_merging(true);
                scope.attach_copy_internal(copy)
            })
            .map_err(|e| {
                log_op_error!(
                    "attach",
                    &e,
                    duration_ms = start.elapsed().as_millis() as u64
                );
                e
            })?;
        log_op_end!("attach", duration_ms = start.elapsed().as_millis() as u64);
        Ok(attached)
    }

    fn attach_copy_internal(&mut self, copy: &DetachedObject) -> Result<ObjectRef> {
        let meta = Arc::clone(self.metadata.class(&copy.class)?);
        let identity = self.normalize(&copy.identity)?;
        let target = match self.cache.l1().peek(&identity) {
            Some(live) => live,
            None => {
                let obj = self.alloc(self.trackers.new_hollow(&meta, identity.clone()));
                if let Err(err) = self.cache.l1_mut().put(identity.clone(), obj) {
                    self.release(obj);
                    return Err(err);
                }
                obj
            }
        };

        let mut values = Vec::new();
        for field in copy.loaded.iter() {
            if let Some(stored) = copy.values.get(field) {
                values.push((field, self.from_stored(stored)?));
            }
        }
        self.tracker_mut(target)?
            .attach_copy(copy.version, values, &copy.dirty)?;
        self.try_index_unique_keys(target);
        if copy.is_dirty() {
            self.mark_dirty(target, true)?;
        } else {
            self.enlist(target)?;
        }
        self.reachability.add_root(identity);
        Ok(target)
    }

    // ===== Detach =====

    /// Detach `obj` and the loaded detachable objects it references
    ///
    /// Pending changes are flushed first inside a transaction. Detached
    /// objects leave L1 and keep their loaded values.
    ///
    /// # Errors
    ///
    /// Returns `NotDetachable` if the class forbids detachment,
    /// `NotPersistent` for transient objects, or flush failures.
    pub fn detach(&mut self, obj: ObjectRef) -> Result<()> {
        self.ensure_open()?;
        log_op_start!("detach", context_id = self.id.as_u64(), object = %obj);
        let start = Instant::now();
        let result = {
            let mut scope = self.enter_invocation();
            scope.detach_graph(obj)
        };
        result.map_err(|e| {
            log_op_error!(
                "detach",
                &e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;
        log_op_end!("detach", duration_ms = start.elapsed().as_millis() as u64);
        Ok(())
    }

    fn detach_graph(&mut self, root: ObjectRef) -> Result<()> {
        let mut stack = vec![root];
        while let Some(obj) = stack.pop() {
            let is_root = obj == root;
            if !self.invocation.visit_detach(obj) {
                continue;
            }
            let class = self.class_of(obj)?;
            let state = self.tracker(obj)?.lifecycle_state();
            if !class.detachable {
                if is_root {
                    return Err(StatelineError::NotDetachable {
                        class: class.name.clone(),
                    });
                }
                continue;
            }
            match state {
                LifecycleState::Transient if is_root => {
                    return Err(StatelineError::NotPersistent {
                        op: "detach".to_string(),
                    })
                }
                LifecycleState::Transient | LifecycleState::Detached => continue,
                s if s.is_deleted() => {
                    if is_root {
                        return Err(StatelineError::InvalidStateTransition {
                            op: "detach".to_string(),
                            state: s.to_string(),
                        });
                    }
                    continue;
                }
                _ => {}
            }

            let tracker = self.tracker(obj)?;
            let unflushed = (state.is_new() && !tracker.is_flushed_new())
                || !tracker.dirty_fields().is_empty();
            if unflushed && self.tx.is_active() {
                let outcome = self.flush_internal()?;
                conflicts_to_error(outcome)?;
            }

            self.load_object(obj)?;
            let referents = self.referents(obj)?;
            let identity = self.tracker(obj)?.identity().cloned();
            self.tracker_mut(obj)?.detach()?;
            if let Some(identity) = identity {
                if self.pending_l2.contains(&identity) {
                    self.cache.l2_evict(&identity);
                }
                debug!(identity = %identity, "object detached");
            }
            self.forget(obj);

            for (_, referent) in referents {
                let state = self.tracker(referent)?.lifecycle_state();
                if state.is_persistent() && !state.is_deleted() && state != LifecycleState::Hollow
                {
                    stack.push(referent);
                }
            }
        }
        Ok(())
    }

    /// Detach every given object in place, skipping those that cannot be
    ///
    /// Used by detach-on-close and detach-all-on-commit.
    pub(crate) fn detach_in_place(&mut self, objects: &[ObjectRef]) -> usize {
        let mut detached = 0usize;
        for &obj in objects {
            let Ok(class) = self.class_of(obj) else {
                continue;
            };
            let Ok(state) = self.lifecycle_state(obj) else {
                continue;
            };
            if !class.detachable || !state.is_persistent() || state.is_deleted() {
                continue;
            }
            let identity = self.identity_of(obj).ok().flatten();
            match self.tracker_mut(obj).and_then(|t| t.detach()) {
                Ok(()) => {
                    self.forget(obj);
                    detached += 1;
                }
                Err(err) => debug!(object = %obj, error = %err, "object left attached"),
            }
            if let Some(identity) = identity {
                self.enlisted.remove(&identity);
            }
        }
        detached
    }

    /// Context-independent copy of a persistent object
    ///
    /// # Errors
    ///
    /// Returns `NotDetachable`, `NotPersistent` for transient objects, or
    /// load and flush failures.
    pub fn detach_copy(&mut self, obj: ObjectRef) -> Result<DetachedObject> {
        self.ensure_open()?;
        let class = self.class_of(obj)?;
        if !class.detachable {
            return Err(StatelineError::NotDetachable {
                class: class.name.clone(),
            });
        }
        let tracker = self.tracker(obj)?;
        let state = tracker.lifecycle_state();
        if state == LifecycleState::Transient {
            return Err(StatelineError::NotPersistent {
                op: "detach copy".to_string(),
            });
        }
        if state.is_new() && !tracker.is_flushed_new() && self.tx.is_active() {
            let outcome = self.flush_internal()?;
            conflicts_to_error(outcome)?;
        }
        self.load_object(obj)?;
        let values = self.stored_row(obj)?;
        let mut copy = self.tracker(obj)?.detach_copy(values)?;
        copy.identity = self.normalize(&copy.identity)?;
        Ok(copy)
    }

    // ===== Evict / refresh =====

    /// Drop the loaded values of a clean object
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for objects with pending changes.
    pub fn evict(&mut self, obj: ObjectRef) -> Result<()> {
        self.ensure_open()?;
        self.tracker_mut(obj)?.evict()
    }

    /// Reload `obj` from storage, discarding its pending changes
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the row is gone (the object is dropped
    /// from the context and its handle becomes stale), or
    /// `InvalidStateTransition` for transient, new or deleted objects.
    pub fn refresh(&mut self, obj: ObjectRef) -> Result<()> {
        self.ensure_open()?;
        log_op_start!("refresh", context_id = self.id.as_u64(), object = %obj);
        let start = Instant::now();
        self.refresh_internal(obj).map_err(|e| {
            log_op_error!(
                "refresh",
                &e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;
        log_op_end!("refresh", duration_ms = start.elapsed().as_millis() as u64);
        Ok(())
    }

    fn refresh_internal(&mut self, obj: ObjectRef) -> Result<()> {
        let tracker = self.tracker(obj)?;
        let state = tracker.lifecycle_state();
        let identity = match tracker.identity() {
            Some(identity) if state.is_persistent() && !state.is_new() && !state.is_deleted() => {
                identity.clone()
            }
            _ => {
                return Err(StatelineError::InvalidStateTransition {
                    op: "refresh".to_string(),
                    state: state.to_string(),
                })
            }
        };

        let Some(row) = self.store.find_object(self.id, &identity)? else {
            self.cache.l2_evict(&identity);
            self.forget(obj);
            self.release(obj);
            return Err(StatelineError::ObjectNotFound {
                identity: identity.to_string(),
            });
        };
        let field_count = self.class_of(obj)?.field_count();
        let mut values = Vec::with_capacity(field_count);
        for (field, stored) in row.values.iter().enumerate().take(field_count) {
            values.push((field, self.from_stored(stored)?));
        }
        self.tracker_mut(obj)?.refresh(values, row.version)?;
        self.forget_handle(obj);
        self.try_index_unique_keys(obj);
        Ok(())
    }

    // ===== Locking =====

    /// Record a lock mode for `obj` in the current transaction
    ///
    /// Write modes force a version bump at commit even when the object is
    /// unmodified.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotActive` outside a transaction and
    /// `NotPersistent` for transient or detached objects.
    pub fn lock_object(&mut self, obj: ObjectRef, mode: LockMode) -> Result<()> {
        self.ensure_open()?;
        if !self.tx.is_active() {
            return Err(StatelineError::TransactionNotActive {
                op: "lock".to_string(),
            });
        }
        let state = self.tracker(obj)?.lifecycle_state();
        if !state.is_persistent() {
            return Err(StatelineError::NotPersistent {
                op: "lock".to_string(),
            });
        }
        debug!(object = %obj, mode = ?mode, "lock recorded");
        self.locks.lock(obj, mode);
        self.enlist(obj)
    }

    /// # Errors
    ///
    /// Returns `WrongContext` or `StaleObjectRef` for an unusable handle.
    pub fn lock_mode(&self, obj: ObjectRef) -> Result<LockMode> {
        self.check(obj)?;
        Ok(self.locks.lock_mode(obj))
    }

    // ===== Close =====

    /// Close the context
    ///
    /// An active transaction is rolled back. With detach-on-close, loaded
    /// objects are detached and stay readable; every other managed handle
    /// becomes stale. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for adapters that do.
    pub fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        log_op_start!("close", context_id = self.id.as_u64());
        let start = Instant::now();

        if self.tx.is_active() {
            if let Err(err) = self.rollback_internal() {
                warn!(context_id = self.id.as_u64(), error = %err, "rollback on close failed");
            }
        }
        let mut detached = 0usize;
        if self.config.detach_on_close {
            let objects = self.cache.l1().objects();
            for &obj in &objects {
                if let Err(err) = self.load_object(obj) {
                    debug!(object = %obj, error = %err, "load before detach failed");
                }
            }
            detached = self.detach_in_place(&objects);
        }
        for obj in self.cache.l1_mut().clear() {
            if self.lifecycle_state(obj).is_ok_and(|s| s != LifecycleState::Detached) {
                self.release(obj);
            }
        }
        self.enlisted.clear();
        self.pending_l2.clear();
        self.mark_closed();

        log_op_end!(
            "close",
            duration_ms = start.elapsed().as_millis() as u64,
            detached = detached
        );
        Ok(())
    }
}
