//! Transaction boundaries
//!
//! `commit` runs `pre_commit` (version bumps, flush, reachability, L2 push,
//! detach snapshot), the storage commit and `post_commit` (tracker
//! transitions, state reset, detach pass). `rollback` runs `pre_rollback`
//! (L2 eviction, tracker transitions), the storage rollback and
//! `post_rollback`.

use std::time::Instant;

use tracing::{debug, warn};

use crate::config::CacheMode;
use crate::context::ExecutionContext;
use crate::errors::{Result, StatelineError};
use crate::model::{Identity, ObjectRef};
use crate::tracker::LifecycleState;
use crate::{log_op_end, log_op_error, log_op_start};

/// What `pre_commit` hands to `post_commit`
#[derive(Debug, Default)]
struct CommitPlan {
    /// Objects to detach after the commit, already loaded
    detach_roots: Vec<ObjectRef>,
    conflicts: Vec<StatelineError>,
}

impl ExecutionContext {
    /// Start a transaction
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransactionState` if one is already running, or the
    /// storage adapter's begin failure.
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        log_op_start!("begin", context_id = self.id.as_u64());
        let start = Instant::now();
        self.begin_internal().map_err(|e| {
            log_op_error!("begin", &e, duration_ms = start.elapsed().as_millis() as u64);
            e
        })?;
        log_op_end!(
            "begin",
            duration_ms = start.elapsed().as_millis() as u64,
            tx_id = %self.tx.id().map(|id| id.as_str()).unwrap_or_default()
        );
        Ok(())
    }

    pub(crate) fn begin_internal(&mut self) -> Result<()> {
        self.pre_begin();
        self.tx.begin(self.config.optimistic)?;
        if let Err(err) = self.store.begin(self.id) {
            self.tx.finish();
            return Err(err);
        }
        debug!(
            context_id = self.id.as_u64(),
            optimistic = self.tx.is_optimistic(),
            "transaction begun"
        );
        Ok(())
    }

    /// Objects made dirty outside a transaction join the new one
    fn pre_begin(&mut self) {
        self.locks.clear();
        self.forced_version_bumps.clear();
        self.reachability.clear();
        self.l2_written_in_tx.clear();
        self.conflicted.clear();
        let carried: Vec<ObjectRef> = self
            .dirty_direct
            .iter()
            .chain(self.dirty_indirect.iter())
            .copied()
            .collect();
        for obj in carried {
            if let Err(err) = self.enlist(obj) {
                debug!(object = %obj, error = %err, "dirty object dropped at begin");
                self.dirty_direct.remove(&obj);
                self.dirty_indirect.remove(&obj);
            }
        }
    }

    /// Commit the current transaction
    ///
    /// A failure before the storage commit rolls the transaction back.
    /// Optimistic conflicts do not stop the commit: every other object is
    /// committed, the conflicting objects are evicted and the aggregate is
    /// returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransactionState` without an active transaction,
    /// `FlushIncomplete` if changes remain after the round cap,
    /// `OptimisticConflicts`, `TransitionFailures`, or storage failures.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let tx_id = self
            .tx
            .id()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        log_op_start!(
            "commit",
            context_id = self.id.as_u64(),
            tx_id = %tx_id,
            enlisted_len = self.enlisted.len(),
            dirty_len = self.dirty_len()
        );
        let start = Instant::now();
        self.commit_internal().map_err(|e| {
            log_op_error!(
                "commit",
                &e,
                duration_ms = start.elapsed().as_millis() as u64,
                tx_id = %tx_id
            );
            e
        })?;
        log_op_end!(
            "commit",
            duration_ms = start.elapsed().as_millis() as u64,
            tx_id = %tx_id
        );
        Ok(())
    }

    pub(crate) fn commit_internal(&mut self) -> Result<()> {
        self.tx.start_commit()?;
        let plan = match self.pre_commit() {
            Ok(plan) => plan,
            Err(err) => return Err(self.abort_commit(err)),
        };
        if let Err(err) = self.store.commit(self.id) {
            return Err(self.abort_commit(err));
        }
        self.post_commit(plan)
    }

    fn abort_commit(&mut self, err: StatelineError) -> StatelineError {
        debug!(error = %err, "commit failed, rolling back");
        if let Err(rollback_err) = self.rollback_internal() {
            warn!(error = %rollback_err, "rollback after failed commit also failed");
        }
        err
    }

    fn pre_commit(&mut self) -> Result<CommitPlan> {
        let mut plan = CommitPlan::default();

        // (1) lock-forced version bumps of unmodified objects
        for obj in self.locks.version_bump_candidates() {
            let Ok(tracker) = self.tracker(obj) else {
                continue;
            };
            let state = tracker.lifecycle_state();
            let untouched = tracker.dirty_fields().is_empty();
            if !state.is_persistent() || state.is_new() || state.is_deleted() || !untouched {
                continue;
            }
            if !self.class_of(obj)?.versioned {
                continue;
            }
            debug!(object = %obj, "forced version bump");
            self.forced_version_bumps.insert(obj);
            self.mark_dirty(obj, true)?;
        }

        // (2) full flush
        self.flush_for_commit(&mut plan)?;

        // (3) reachability
        if self.config.reachability_at_commit {
            let mut handler = std::mem::take(&mut self.reachability);
            let changed = handler.execute(self);
            self.reachability = handler;
            if changed? {
                self.flush_for_commit(&mut plan)?;
            }
        }

        for obj in std::mem::take(&mut self.conflicted) {
            if let Ok(Some(identity)) = self.identity_of(obj) {
                debug!(identity = %identity, "evicting conflicted object");
                self.cache.l2_evict(&identity);
            }
            self.forget(obj);
            self.release(obj);
        }

        // (4) L2 push
        self.push_to_l2()?;

        // (5) detach snapshot
        if self.config.detach_all_on_commit {
            let roots = self.cache.l1().objects();
            for &obj in &roots {
                if let Err(err) = self.load_object(obj) {
                    debug!(object = %obj, error = %err, "detach preload failed");
                }
            }
            plan.detach_roots = roots;
        }
        Ok(plan)
    }

    fn flush_for_commit(&mut self, plan: &mut CommitPlan) -> Result<()> {
        let outcome = self.flush_internal()?;
        if outcome.residual > 0 {
            return Err(StatelineError::FlushIncomplete {
                rounds: outcome.rounds,
                residual: outcome.residual,
            });
        }
        plan.conflicts.extend(outcome.conflicts);
        Ok(())
    }

    /// Write the snapshots of changed cacheable objects to L2
    fn push_to_l2(&mut self) -> Result<()> {
        if self.cache.store_mode() == CacheMode::Bypass || self.pending_l2.is_empty() {
            return Ok(());
        }
        let mut pending: Vec<Identity> = self.pending_l2.iter().cloned().collect();
        pending.sort();
        self.cache.begin_l2_batch();
        let mut written = 0usize;
        for identity in pending {
            let obj = self
                .enlisted
                .get(&identity)
                .copied()
                .or_else(|| self.cache.l1().peek(&identity));
            let Some(obj) = obj else {
                self.cache.l2_evict(&identity);
                continue;
            };
            let Ok(state) = self.lifecycle_state(obj) else {
                self.cache.l2_evict(&identity);
                continue;
            };
            if state.is_deleted() || !state.is_persistent() {
                self.cache.l2_evict(&identity);
                for key in self.unique_keys_of(obj)? {
                    self.cache.l2().remove_unique(&key);
                }
                continue;
            }
            if let Some(entry) = self.snapshot(obj)? {
                if self.cache.l2_store(entry) {
                    written += 1;
                }
                let keys = self.unique_keys_of(obj)?;
                self.cache
                    .l2_store_unique(keys.into_iter().map(|k| (k, identity.clone())).collect());
            }
        }
        self.cache.end_l2_batch();
        debug!(written = written, "l2 updated at commit");
        Ok(())
    }

    fn post_commit(&mut self, plan: CommitPlan) -> Result<()> {
        let retain = self.config.retain_values || self.config.detach_all_on_commit;
        let mut enlisted: Vec<(Identity, ObjectRef)> = self.enlisted.drain().collect();
        enlisted.sort();
        let mut failures = Vec::new();
        for (identity, obj) in enlisted {
            let Ok(tracker) = self.tracker_mut(obj) else {
                continue;
            };
            let was_deleted = tracker.lifecycle_state().is_deleted();
            if let Err(err) = tracker.post_commit(retain) {
                failures.push(err);
                continue;
            }
            if was_deleted {
                if self.cache.l1().peek(&identity) == Some(obj) {
                    self.cache.l1_mut().remove(&identity);
                }
            } else {
                self.try_index_unique_keys(obj);
            }
        }

        self.clear_transaction_state();
        self.tx.finish();

        if !plan.detach_roots.is_empty() {
            let detached = self.detach_in_place(&plan.detach_roots);
            debug!(detached = detached, "detached on commit");
        }
        self.evict_l1_overflow();

        if !failures.is_empty() {
            return Err(StatelineError::TransitionFailures {
                phase: "post_commit".to_string(),
                failures,
            });
        }
        if !plan.conflicts.is_empty() {
            return Err(StatelineError::OptimisticConflicts {
                failures: plan.conflicts,
            });
        }
        Ok(())
    }

    /// Roll back the current transaction
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransactionState` without an active transaction,
    /// `TransitionFailures` if trackers failed to revert, or the storage
    /// rollback failure. Transaction state is reset in every case.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        log_op_start!(
            "rollback",
            context_id = self.id.as_u64(),
            enlisted_len = self.enlisted.len()
        );
        let start = Instant::now();
        self.rollback_internal().map_err(|e| {
            log_op_error!(
                "rollback",
                &e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;
        log_op_end!("rollback", duration_ms = start.elapsed().as_millis() as u64);
        Ok(())
    }

    pub(crate) fn rollback_internal(&mut self) -> Result<()> {
        self.tx.start_rollback()?;
        let failures = self.pre_rollback();
        let store_result = self.store.rollback(self.id);
        self.post_rollback();
        store_result?;
        if !failures.is_empty() {
            return Err(StatelineError::TransitionFailures {
                phase: "pre_rollback".to_string(),
                failures,
            });
        }
        Ok(())
    }

    /// Evict speculative L2 writes and revert every enlisted tracker
    fn pre_rollback(&mut self) -> Vec<StatelineError> {
        let speculative: Vec<Identity> = self
            .l2_written_in_tx
            .iter()
            .chain(self.pending_l2.iter())
            .cloned()
            .collect();
        for identity in &speculative {
            self.cache.l2_evict(identity);
        }
        if !speculative.is_empty() {
            debug!(evicted = speculative.len(), "speculative l2 entries evicted");
        }

        let mut objects: Vec<ObjectRef> = self.enlisted.values().copied().collect();
        objects.extend(self.dirty_direct.iter().copied());
        objects.extend(self.dirty_indirect.iter().copied());
        objects.sort();
        objects.dedup();

        let mut failures = Vec::new();
        for obj in objects {
            let Ok(tracker) = self.tracker_mut(obj) else {
                continue;
            };
            if let Err(err) = tracker.pre_rollback() {
                failures.push(err);
            }
        }
        failures
    }

    /// Drop reverted-to-transient objects from L1, re-key the rest and reset state
    fn post_rollback(&mut self) {
        let enlisted: Vec<(Identity, ObjectRef)> = self.enlisted.drain().collect();
        for (identity, obj) in enlisted {
            let transient = self
                .lifecycle_state(obj)
                .is_ok_and(|state| state == LifecycleState::Transient);
            if transient && self.cache.l1().peek(&identity) == Some(obj) {
                self.cache.l1_mut().remove(&identity);
            } else if !transient {
                self.try_index_unique_keys(obj);
            }
        }
        self.clear_transaction_state();
        self.tx.finish();
    }

    fn clear_transaction_state(&mut self) {
        self.enlisted.clear();
        self.dirty_direct.clear();
        self.dirty_indirect.clear();
        self.pending_l2.clear();
        self.l2_written_in_tx.clear();
        self.queue.clear();
        self.locks.clear();
        self.forced_version_bumps.clear();
        self.relations.clear();
        self.reachability.clear();
        self.conflicted.clear();
    }
}
