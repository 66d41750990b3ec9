//! Invocation-scoped side state
//!
//! Nested operations (attach of a graph, detach of a graph, implicit
//! transactions) share a little state without threading it through every
//! signature. The state lives on the context and is reference counted by
//! [`InvocationScope`] guards; it is cleared when the last guard drops.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};

use crate::context::ExecutionContext;
use crate::model::{Identity, ObjectRef};

#[derive(Debug, Default)]
pub struct InvocationState {
    merging: bool,
    nontx_write: bool,
    /// Identity → handle of objects attached during this invocation
    attached: HashMap<Identity, ObjectRef>,
    /// Objects already visited by a detach walk
    detached: HashSet<ObjectRef>,
    depth: usize,
}

impl InvocationState {
    /// A detached copy is being merged; relation edits are not recorded
    pub fn is_merging(&self) -> bool {
        self.merging
    }

    pub fn set_merging(&mut self, merging: bool) {
        self.merging = merging;
    }

    /// A persist or delete is running inside an implicit transaction
    pub fn is_nontx_write(&self) -> bool {
        self.nontx_write
    }

    pub fn set_nontx_write(&mut self, value: bool) {
        self.nontx_write = value;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn attached(&self, identity: &Identity) -> Option<ObjectRef> {
        self.attached.get(identity).copied()
    }

    pub(crate) fn record_attached(&mut self, identity: Identity, obj: ObjectRef) {
        self.attached.insert(identity, obj);
    }

    pub(crate) fn replace_identity(&mut self, old: &Identity, new: &Identity) {
        if let Some(obj) = self.attached.remove(old) {
            self.attached.insert(new.clone(), obj);
        }
    }

    /// Returns false if `obj` was already visited
    pub(crate) fn visit_detach(&mut self, obj: ObjectRef) -> bool {
        self.detached.insert(obj)
    }

    fn acquire(&mut self) {
        self.depth += 1;
    }

    fn release(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.merging = false;
            self.nontx_write = false;
            self.attached.clear();
            self.detached.clear();
        }
    }
}

/// RAII guard over the invocation state; derefs to the context
pub struct InvocationScope<'a> {
    ctx: &'a mut ExecutionContext,
}

impl Deref for InvocationScope<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        self.ctx
    }
}

impl DerefMut for InvocationScope<'_> {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        self.ctx
    }
}

impl Drop for InvocationScope<'_> {
    fn drop(&mut self) {
        self.ctx.invocation.release();
    }
}

impl ExecutionContext {
    /// Enter (or re-enter) the invocation scope
    pub fn enter_invocation(&mut self) -> InvocationScope<'_> {
        self.invocation.acquire();
        InvocationScope { ctx: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cleared_when_last_scope_releases() {
        let mut state = InvocationState::default();
        state.acquire();
        state.acquire();
        state.set_merging(true);
        state.release();
        assert!(state.is_merging());
        assert_eq!(state.depth(), 1);
        state.release();
        assert!(!state.is_merging());
        assert_eq!(state.depth(), 0);
    }

    #[test]
    fn test_detach_visits_once() {
        let mut state = InvocationState::default();
        let obj = ObjectRef {
            context: stateline_core_types::ContextId::from_raw(1),
            slot: 0,
            generation: 0,
        };
        assert!(state.visit_detach(obj));
        assert!(!state.visit_detach(obj));
    }
}
