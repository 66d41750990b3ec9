//! Dirty tracking, enlistment and flush rounds

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::errors::{Result, StatelineError};
use crate::model::ObjectRef;
use crate::flush::OperationQueue;
use crate::tracker::LifecycleState;
use crate::{log_op_end, log_op_error, log_op_start};

/// Result of one flush (all rounds)
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub rounds: usize,
    /// Optimistic conflicts collected across rounds
    pub conflicts: Vec<StatelineError>,
    /// Objects whose write conflicted
    pub conflicted: Vec<ObjectRef>,
    /// Objects and queued operations still pending after the round cap
    pub residual: usize,
}

/// Aggregate collected conflicts into one error
pub(crate) fn conflicts_to_error(outcome: FlushOutcome) -> Result<()> {
    if outcome.conflicts.is_empty() {
        return Ok(());
    }
    Err(StatelineError::OptimisticConflicts {
        failures: outcome.conflicts,
    })
}

impl ExecutionContext {
    /// Record `obj` as modified
    ///
    /// Direct marks promote an indirectly dirty object; indirect marks never
    /// demote. When datastore writes are not delayed and the dirty count
    /// reaches the auto-flush limit, the pending objects are flushed first.
    ///
    /// # Errors
    ///
    /// Returns `NotPersistent` for a transient or detached object, handle
    /// errors, or the failure of an eager flush.
    pub fn mark_dirty(&mut self, obj: ObjectRef, direct: bool) -> Result<()> {
        self.check(obj)?;
        let state = self.tracker(obj)?.lifecycle_state();
        if !state.is_persistent() {
            return Err(StatelineError::NotPersistent {
                op: format!("mark_dirty on {} object {}", state, obj),
            });
        }
        let in_direct = self.dirty_direct.contains(&obj);
        let in_indirect = self.dirty_indirect.contains(&obj);

        let auto_flush = if !in_direct
            && !in_indirect
            && !self.flushing
            && self.tx.is_active()
            && !self.datastore_ops_delayed()
            && self.dirty_len() >= self.config.flush_auto_object_limit
        {
            debug!(
                dirty_len = self.dirty_len(),
                limit = self.config.flush_auto_object_limit,
                "auto flush limit reached"
            );
            self.flush_internal().and_then(conflicts_to_error)
        } else {
            Ok(())
        };

        if direct {
            self.dirty_indirect.remove(&obj);
            self.dirty_direct.insert(obj);
        } else if !in_direct {
            self.dirty_indirect.insert(obj);
        }

        self.enlist(obj)?;
        let class = self.class_of(obj)?;
        if class.cacheable {
            if let Some(identity) = self.tracker(obj)?.identity().cloned() {
                self.pending_l2.insert(identity);
            }
        }
        // obj stays tracked even when the eager flush failed
        auto_flush
    }

    /// Add a persistent object to the unit of work
    pub(crate) fn enlist(&mut self, obj: ObjectRef) -> Result<()> {
        let tracker = self.tracker(obj)?;
        let Some(identity) = tracker.identity().cloned() else {
            return Ok(());
        };
        let state = tracker.lifecycle_state();
        if !state.is_persistent() {
            return Ok(());
        }
        if self.enlisted.insert(identity.clone(), obj).is_none() && !state.is_new() {
            self.reachability.add_root(identity);
        }
        Ok(())
    }

    pub(crate) fn dirty_len(&self) -> usize {
        self.dirty_direct.len() + self.dirty_indirect.len()
    }

    pub(crate) fn has_pending_changes(&self) -> bool {
        self.dirty_len() > 0 || !self.queue.is_empty() || !self.relations.is_empty()
    }

    /// Write pending changes to storage
    ///
    /// With nothing dirty and `to_storage` false this is a no-op. Objects
    /// still dirty after the round cap stay dirty for the next flush.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotActive` outside a transaction,
    /// `OptimisticConflicts` when writes conflicted, or the first
    /// non-optimistic storage failure.
    pub fn flush(&mut self, to_storage: bool) -> Result<()> {
        self.ensure_open()?;
        if !to_storage && !self.has_pending_changes() {
            return Ok(());
        }
        log_op_start!(
            "flush",
            context_id = self.id.as_u64(),
            dirty_len = self.dirty_len()
        );
        let start = Instant::now();

        let result = if self.tx.is_active() {
            self.flush_internal().and_then(conflicts_to_error)
        } else {
            Err(StatelineError::TransactionNotActive {
                op: "flush".to_string(),
            })
        };
        result.map_err(|e| {
            log_op_error!("flush", &e, duration_ms = start.elapsed().as_millis() as u64);
            e
        })?;

        log_op_end!(
            "flush",
            duration_ms = start.elapsed().as_millis() as u64,
            dirty_len = self.dirty_len()
        );
        Ok(())
    }

    /// Run flush rounds up to the configured cap
    ///
    /// Each round runs relationship management and then hands the current
    /// dirty sets and queued operations to the flush process. Work created by
    /// a round is picked up by the next one.
    pub(crate) fn flush_internal(&mut self) -> Result<FlushOutcome> {
        if self.flushing {
            return Ok(FlushOutcome::default());
        }
        self.flushing = true;
        let result = self.run_flush_rounds();
        self.flushing = false;
        result
    }

    fn run_flush_rounds(&mut self) -> Result<FlushOutcome> {
        let mut outcome = FlushOutcome::default();
        let max_rounds = self.config.max_flush_rounds;

        for round in 1..=max_rounds {
            if self.config.managed_relations && !self.relations.is_empty() {
                let mut relations = std::mem::take(&mut self.relations);
                if let Err(err) = relations.execute(self) {
                    if !relations.is_empty() {
                        self.relations = relations;
                    }
                    return Err(err);
                }
            }
            if self.dirty_len() == 0 && self.queue.is_empty() {
                break;
            }

            let direct = std::mem::take(&mut self.dirty_direct);
            let indirect = std::mem::take(&mut self.dirty_indirect);
            let mut queue = std::mem::take(&mut self.queue);
            debug!(
                flush_round = round,
                direct = direct.len(),
                indirect = indirect.len(),
                queued = queue.len(),
                "flush round"
            );

            let process = std::sync::Arc::clone(&self.flush_process);
            let conflicts = match process.execute(self, &direct, &indirect, &mut queue) {
                Ok(conflicts) => conflicts,
                Err(err) => {
                    self.restore_unflushed(&direct, &indirect, queue);
                    return Err(err);
                }
            };
            for op in queue.drain_all() {
                self.queue.push(op);
            }
            for (obj, err) in conflicts {
                outcome.conflicted.push(obj);
                outcome.conflicts.push(err);
            }
            outcome.rounds = round;
        }

        outcome.residual = self.dirty_len() + self.queue.len();
        if outcome.residual > 0 {
            let residual_ops: Vec<String> = self.queue.iter().map(|op| op.to_string()).collect();
            warn!(
                context_id = self.id.as_u64(),
                flush_round = outcome.rounds,
                dirty_len = self.dirty_len(),
                residual_ops = ?residual_ops,
                "flush round cap reached with work remaining"
            );
        }
        self.conflicted.extend(outcome.conflicted.iter().copied());
        Ok(outcome)
    }

    /// Put back the work of a round that failed
    ///
    /// Objects written before the failure carry no pending changes and stay
    /// out. Unapplied queued operations go ahead of any queued since.
    fn restore_unflushed(
        &mut self,
        direct: &BTreeSet<ObjectRef>,
        indirect: &BTreeSet<ObjectRef>,
        mut queue: OperationQueue,
    ) {
        let mut restored = 0usize;
        for &obj in direct {
            if self.has_unwritten_changes(obj) {
                self.dirty_indirect.remove(&obj);
                self.dirty_direct.insert(obj);
                restored += 1;
            }
        }
        for &obj in indirect {
            if !self.dirty_direct.contains(&obj) && self.has_unwritten_changes(obj) {
                self.dirty_indirect.insert(obj);
                restored += 1;
            }
        }
        let mut newer = std::mem::take(&mut self.queue);
        for op in queue.drain_all().into_iter().chain(newer.drain_all()) {
            self.queue.push(op);
        }
        debug!(
            restored = restored,
            queued = self.queue.len(),
            "failed flush round restored"
        );
    }

    fn has_unwritten_changes(&self, obj: ObjectRef) -> bool {
        let Ok(tracker) = self.tracker(obj) else {
            return false;
        };
        let state = tracker.lifecycle_state();
        if !state.is_persistent() {
            return false;
        }
        !tracker.dirty_fields().is_empty()
            || (state == LifecycleState::PersistentNew && !tracker.is_flushed_new())
            || (state.is_deleted() && !tracker.is_flushed_deleted())
            || self.forced_version_bumps.contains(&obj)
    }
}
