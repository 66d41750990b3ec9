//! Persistence-by-reachability at commit
//!
//! Objects persisted only because a cascade reached them stay persistent
//! only if they are still reachable at commit. The closure is computed once
//! from the roots (explicitly persisted objects and pre-existing enlisted
//! objects) over the loaded reference and collection fields.

use std::collections::{BTreeSet, HashSet, VecDeque};

use tracing::debug;

use crate::context::ExecutionContext;
use crate::errors::Result;
use crate::model::{Identity, ObjectRef};

#[derive(Debug, Default)]
pub struct ReachabilityAtCommitHandler {
    /// Made persistent during this transaction, explicitly or by cascade
    persisted: BTreeSet<Identity>,
    /// Inserted into storage during this transaction
    flushed_new: HashSet<Identity>,
    roots: BTreeSet<Identity>,
}

impl ReachabilityAtCommitHandler {
    pub fn add_root(&mut self, identity: Identity) {
        self.roots.insert(identity);
    }

    pub fn add_persisted(&mut self, identity: Identity) {
        self.persisted.insert(identity);
    }

    pub fn add_flushed_new(&mut self, identity: Identity) {
        self.flushed_new.insert(identity);
    }

    pub fn is_root(&self, identity: &Identity) -> bool {
        self.roots.contains(identity)
    }

    pub fn is_persisted(&self, identity: &Identity) -> bool {
        self.persisted.contains(identity)
    }

    pub fn is_flushed_new(&self, identity: &Identity) -> bool {
        self.flushed_new.contains(identity)
    }

    /// Move bookkeeping from `old` to `new`
    pub fn replace_identity(&mut self, old: &Identity, new: &Identity) {
        if self.persisted.remove(old) {
            self.persisted.insert(new.clone());
        }
        if self.flushed_new.remove(old) {
            self.flushed_new.insert(new.clone());
        }
        if self.roots.remove(old) {
            self.roots.insert(new.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.persisted.is_empty() && self.flushed_new.is_empty() && self.roots.is_empty()
    }

    pub fn clear(&mut self) {
        self.persisted.clear();
        self.flushed_new.clear();
        self.roots.clear();
    }

    /// Un-persist every cascade-persisted object no longer reachable
    ///
    /// Objects never written to storage go back to transient. Objects
    /// already inserted are deleted and left dirty for the next flush.
    /// Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns tracker transition failures.
    pub fn execute(&mut self, ctx: &mut ExecutionContext) -> Result<bool> {
        if self.persisted.is_empty() {
            return Ok(false);
        }
        let reachable = self.reachable(ctx);
        let mut changed = false;

        for identity in &self.persisted {
            let Some(obj) = lookup(ctx, identity) else {
                continue;
            };
            if reachable.contains(&obj) {
                continue;
            }
            let Ok(state) = ctx.lifecycle_state(obj) else {
                continue;
            };
            if !state.is_new() || state.is_deleted() {
                continue;
            }
            let flushed = self.flushed_new.contains(identity) || ctx.tracker(obj)?.is_flushed_new();
            if flushed {
                debug!(identity = %identity, "unreachable flushed object deleted");
                ctx.mark_dirty(obj, true)?;
                ctx.tracker_mut(obj)?.delete_persistent()?;
            } else {
                debug!(identity = %identity, "unreachable object made transient");
                ctx.forget(obj);
                ctx.tracker_mut(obj)?.make_transient()?;
            }
            changed = true;
        }

        debug!(
            roots = self.roots.len(),
            persisted = self.persisted.len(),
            reachable = reachable.len(),
            changed = changed,
            "reachability computed"
        );
        Ok(changed)
    }

    fn reachable(&self, ctx: &ExecutionContext) -> HashSet<ObjectRef> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ObjectRef> =
            self.roots.iter().filter_map(|id| lookup(ctx, id)).collect();
        while let Some(obj) = queue.pop_front() {
            let live = ctx
                .lifecycle_state(obj)
                .is_ok_and(|state| state.is_persistent() && !state.is_deleted());
            if !live || !seen.insert(obj) {
                continue;
            }
            if let Ok(referents) = ctx.referents(obj) {
                queue.extend(referents.into_iter().map(|(_, r)| r));
            }
        }
        seen
    }
}

fn lookup(ctx: &ExecutionContext, identity: &Identity) -> Option<ObjectRef> {
    ctx.enlisted
        .get(identity)
        .copied()
        .or_else(|| ctx.cache.l1().peek(identity))
}
