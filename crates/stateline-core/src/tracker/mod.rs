//! Object state tracker contract
//!
//! A tracker is the per-object companion holding lifecycle state, field
//! values and loaded/dirty bookkeeping. It is a pure state machine: the
//! execution context performs all storage and cache I/O and feeds results in.

pub mod detached;
pub mod lifecycle;
pub mod state_manager;

use std::fmt;

use crate::errors::Result;
use crate::model::{ClassMetadata, FieldBitSet, Identity, StoredValue, Value};

pub use detached::DetachedObject;
pub use lifecycle::LifecycleState;
pub use state_manager::StateManager;

/// Lifecycle contract the execution context drives
pub trait StateTracker: Send + fmt::Debug {
    /// Concrete class of the tracked object
    fn class(&self) -> &str;
    fn lifecycle_state(&self) -> LifecycleState;
    fn identity(&self) -> Option<&Identity>;
    fn set_identity(&mut self, identity: Identity);
    fn version(&self) -> Option<i64>;
    fn set_version(&mut self, version: Option<i64>);
    fn loaded_fields(&self) -> &FieldBitSet;
    fn dirty_fields(&self) -> &FieldBitSet;
    /// Inserted into storage during the current transaction
    fn is_flushed_new(&self) -> bool;
    /// Delete already issued to storage during the current transaction
    fn is_flushed_deleted(&self) -> bool;

    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the object is transient.
    fn make_persistent(&mut self, identity: Identity) -> Result<()>;
    /// Drop persistence of a new or deleted object
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for states that cannot revert.
    fn make_transient(&mut self) -> Result<()>;
    /// # Errors
    ///
    /// Returns `NotPersistent` for transient/detached objects and
    /// `InvalidStateTransition` for already-deleted ones.
    fn delete_persistent(&mut self) -> Result<()>;
    /// Re-enter management from `Detached`
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the object is detached.
    fn attach(&mut self) -> Result<()>;
    /// Merge a detached copy's state into this tracker
    ///
    /// Non-dirty values only fill fields not loaded yet; dirty values are
    /// applied as modifications.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` if the tracker is deleted.
    fn attach_copy(
        &mut self,
        version: Option<i64>,
        values: Vec<(usize, Value)>,
        dirty: &FieldBitSet,
    ) -> Result<()>;
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for new, dirty or deleted objects.
    fn detach(&mut self) -> Result<()>;
    /// Build a detached copy from the context-converted loaded values
    ///
    /// # Errors
    ///
    /// Returns `NotPersistent` for transient objects.
    fn detach_copy(&self, values: Vec<StoredValue>) -> Result<DetachedObject>;
    /// Drop loaded values of a clean object (clean becomes hollow)
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for objects with pending changes.
    fn evict(&mut self) -> Result<()>;
    /// Replace values with fresh storage values, discarding changes
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for new or deleted objects.
    fn refresh(&mut self, values: Vec<(usize, Value)>, version: Option<i64>) -> Result<()>;
    /// Reconcile with storage; `None` means the row does not exist
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` when storage has no row.
    fn validate(&mut self, stored_version: Option<Option<i64>>) -> Result<()>;
    /// Hand the requested loaded field values to `consumer`
    fn provide_fields(&self, fields: &FieldBitSet, consumer: &mut dyn FnMut(usize, &Value));
    fn field_value(&self, field: usize) -> Option<&Value>;
    /// Apply a modification to one field
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for deleted objects.
    fn replace_field(&mut self, field: usize, value: Value) -> Result<()>;
    /// Load values read from storage without marking them dirty
    fn load_fields(&mut self, values: Vec<(usize, Value)>);
    /// Storage now reflects the pending changes
    fn mark_flushed(&mut self);
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for objects that should not be enlisted.
    fn post_commit(&mut self, retain_values: bool) -> Result<()>;
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for objects that should not be enlisted.
    fn pre_rollback(&mut self) -> Result<()>;
}

/// Creates trackers for the execution context
pub trait TrackerFactory: Send + Sync {
    fn new_transient(&self, class: &ClassMetadata) -> Box<dyn StateTracker>;
    fn new_hollow(&self, class: &ClassMetadata, identity: Identity) -> Box<dyn StateTracker>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTrackerFactory;

impl TrackerFactory for DefaultTrackerFactory {
    fn new_transient(&self, class: &ClassMetadata) -> Box<dyn StateTracker> {
        Box::new(StateManager::transient(&class.name, class.field_count()))
    }

    fn new_hollow(&self, class: &ClassMetadata, identity: Identity) -> Box<dyn StateTracker> {
        Box::new(StateManager::hollow(&class.name, class.field_count(), identity))
    }
}
