//! Queue of deferred collection operations
//!
//! Collection edits on a persistent object whose collection is not loaded
//! are queued instead of forcing a load. They are applied in arrival order
//! when the collection is loaded or when the owner is flushed.

use crate::model::ObjectRef;

/// One deferred collection edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CollectionAdd {
        owner: ObjectRef,
        field: usize,
        element: ObjectRef,
    },
    CollectionRemove {
        owner: ObjectRef,
        field: usize,
        element: ObjectRef,
    },
    CollectionClear {
        owner: ObjectRef,
        field: usize,
    },
}

impl Operation {
    pub fn owner(&self) -> ObjectRef {
        match self {
            Operation::CollectionAdd { owner, .. }
            | Operation::CollectionRemove { owner, .. }
            | Operation::CollectionClear { owner, .. } => *owner,
        }
    }

    pub fn field(&self) -> usize {
        match self {
            Operation::CollectionAdd { field, .. }
            | Operation::CollectionRemove { field, .. }
            | Operation::CollectionClear { field, .. } => *field,
        }
    }

    /// Apply this edit to a loaded collection
    pub fn apply_to(&self, items: &mut Vec<ObjectRef>) {
        match self {
            Operation::CollectionAdd { element, .. } => items.push(*element),
            Operation::CollectionRemove { element, .. } => {
                if let Some(pos) = items.iter().position(|item| item == element) {
                    items.remove(pos);
                }
            }
            Operation::CollectionClear { .. } => items.clear(),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::CollectionAdd {
                owner,
                field,
                element,
            } => write!(f, "add {} to {}[{}]", element, owner, field),
            Operation::CollectionRemove {
                owner,
                field,
                element,
            } => write!(f, "remove {} from {}[{}]", element, owner, field),
            Operation::CollectionClear { owner, field } => {
                write!(f, "clear {}[{}]", owner, field)
            }
        }
    }
}

/// Arrival-ordered operation queue
#[derive(Debug, Clone, Default)]
pub struct OperationQueue {
    ops: Vec<Operation>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Whether any edit is pending for `owner`'s `field`
    pub fn has_pending(&self, owner: ObjectRef, field: usize) -> bool {
        self.ops
            .iter()
            .any(|op| op.owner() == owner && op.field() == field)
    }

    /// Remove and return every pending edit, in arrival order
    pub fn drain_all(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.ops)
    }

    /// Remove and return the edits for one owner's field, in arrival order
    pub fn take_for(&mut self, owner: ObjectRef, field: usize) -> Vec<Operation> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.ops)
            .into_iter()
            .partition(|op| op.owner() == owner && op.field() == field);
        self.ops = kept;
        taken
    }

    /// Drop all edits owned by `owner`
    pub fn remove_owner(&mut self, owner: ObjectRef) {
        self.ops.retain(|op| op.owner() != owner);
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateline_core_types::ContextId;

    fn handle(slot: u32) -> ObjectRef {
        ObjectRef {
            context: ContextId::from_raw(1),
            slot,
            generation: 0,
        }
    }

    #[test]
    fn test_take_for_preserves_order_and_other_entries() {
        let mut queue = OperationQueue::new();
        queue.push(Operation::CollectionAdd {
            owner: handle(1),
            field: 0,
            element: handle(2),
        });
        queue.push(Operation::CollectionClear {
            owner: handle(3),
            field: 0,
        });
        queue.push(Operation::CollectionRemove {
            owner: handle(1),
            field: 0,
            element: handle(2),
        });

        let taken = queue.take_for(handle(1), 0);
        assert_eq!(taken.len(), 2);
        assert!(matches!(taken[0], Operation::CollectionAdd { .. }));
        assert!(matches!(taken[1], Operation::CollectionRemove { .. }));
        assert_eq!(queue.len(), 1);
        assert!(!queue.has_pending(handle(1), 0));
    }

    #[test]
    fn test_apply_to_collection() {
        let mut items = vec![handle(5)];
        Operation::CollectionAdd {
            owner: handle(1),
            field: 0,
            element: handle(6),
        }
        .apply_to(&mut items);
        Operation::CollectionRemove {
            owner: handle(1),
            field: 0,
            element: handle(5),
        }
        .apply_to(&mut items);
        assert_eq!(items, vec![handle(6)]);

        Operation::CollectionClear {
            owner: handle(1),
            field: 0,
        }
        .apply_to(&mut items);
        assert!(items.is_empty());
    }
}
