//! Execution context
//!
//! One unit of work. The context owns an arena of trackers addressed by
//! [`ObjectRef`] handles, the L1 cache, the enlistment and dirty bookkeeping,
//! the operation queue and the transaction. Trackers never reference each
//! other directly; relations between objects are handle values inside
//! tracker fields.
//!
//! The context is single-threaded. Wrap it in a
//! [`SharedExecutionContext`] to opt into re-entrant locking.

mod dirty;
mod find;
mod identity;
mod invocation;
mod lifecycle_ops;
mod shared;
mod transaction_ops;

pub use dirty::FlushOutcome;
pub use invocation::{InvocationScope, InvocationState};
pub use shared::SharedExecutionContext;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use stateline_core_types::ContextId;
use tracing::debug;

use crate::cache::{CacheCoordinator, CachedObject, Level2Cache};
use crate::config::{ContextConfig, ContextOption, FlushMode, L1CacheKind};
use crate::errors::{Result, StatelineError};
use crate::flush::{FlushProcess, Operation, OperationQueue, OrderedFlushProcess};
use crate::locking::LockManager;
use crate::model::{
    ClassMetadata, FieldBitSet, FieldKind, Identity, MetadataRegistry, ObjectRef, StoredValue,
    UniqueKey, Value,
};
use crate::reachability::ReachabilityAtCommitHandler;
use crate::relations::{ManagedRelationsHandler, RelationChange};
use crate::storage::StoreManager;
use crate::tracker::{DefaultTrackerFactory, LifecycleState, StateTracker, TrackerFactory};
use crate::transaction::Transaction;
use crate::{log_op_end, log_op_start};

struct Slot {
    generation: u32,
    tracker: Option<Box<dyn StateTracker>>,
}

/// Session-scoped unit of work over one storage adapter
pub struct ExecutionContext {
    pub(crate) id: ContextId,
    pub(crate) metadata: Arc<MetadataRegistry>,
    pub(crate) store: Arc<dyn StoreManager>,
    pub(crate) trackers: Arc<dyn TrackerFactory>,
    pub(crate) flush_process: Arc<dyn FlushProcess>,
    pub(crate) config: ContextConfig,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    pub(crate) cache: CacheCoordinator,
    pub(crate) tx: Transaction,
    /// Objects taking part in the current unit of work, by identity
    pub(crate) enlisted: HashMap<Identity, ObjectRef>,
    pub(crate) dirty_direct: BTreeSet<ObjectRef>,
    pub(crate) dirty_indirect: BTreeSet<ObjectRef>,
    /// Identities whose L2 entry must be refreshed at commit
    pub(crate) pending_l2: HashSet<Identity>,
    /// Identities written to L2 while a transaction was active
    pub(crate) l2_written_in_tx: HashSet<Identity>,
    pub(crate) queue: OperationQueue,
    pub(crate) locks: LockManager,
    pub(crate) forced_version_bumps: BTreeSet<ObjectRef>,
    pub(crate) relations: ManagedRelationsHandler,
    pub(crate) reachability: ReachabilityAtCommitHandler,
    pub(crate) invocation: InvocationState,
    pub(crate) conflicted: Vec<ObjectRef>,
    pub(crate) flushing: bool,
    closed: bool,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("store", &self.store.name())
            .field("l1_len", &self.cache.l1().len())
            .field("enlisted", &self.enlisted.len())
            .field("dirty_direct", &self.dirty_direct.len())
            .field("dirty_indirect", &self.dirty_indirect.len())
            .field("tx", &self.tx.status())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ExecutionContext {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation.
    pub fn new(
        metadata: Arc<MetadataRegistry>,
        store: Arc<dyn StoreManager>,
        l2: Arc<dyn Level2Cache>,
        config: ContextConfig,
    ) -> Result<Self> {
        config.validate()?;
        let cache = CacheCoordinator::new(
            config.l1_cache,
            l2,
            config.l2_retrieve_mode,
            config.l2_store_mode,
            config.l2_batch_size,
        );
        let id = ContextId::next();
        debug!(context_id = id.as_u64(), store = store.name(), "execution context opened");
        Ok(Self {
            id,
            metadata,
            store,
            trackers: Arc::new(DefaultTrackerFactory),
            flush_process: Arc::new(OrderedFlushProcess),
            config,
            slots: Vec::new(),
            free_slots: Vec::new(),
            cache,
            tx: Transaction::new(),
            enlisted: HashMap::new(),
            dirty_direct: BTreeSet::new(),
            dirty_indirect: BTreeSet::new(),
            pending_l2: HashSet::new(),
            l2_written_in_tx: HashSet::new(),
            queue: OperationQueue::new(),
            locks: LockManager::new(),
            forced_version_bumps: BTreeSet::new(),
            relations: ManagedRelationsHandler::default(),
            reachability: ReachabilityAtCommitHandler::default(),
            invocation: InvocationState::default(),
            conflicted: Vec::new(),
            flushing: false,
            closed: false,
        })
    }

    pub fn with_tracker_factory(mut self, factory: Arc<dyn TrackerFactory>) -> Self {
        self.trackers = factory;
        self
    }

    pub fn with_flush_process(mut self, process: Arc<dyn FlushProcess>) -> Self {
        self.flush_process = process;
        self
    }

    // ===== Inspection =====

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    pub fn store(&self) -> &Arc<dyn StoreManager> {
        &self.store
    }

    pub fn cache(&self) -> &CacheCoordinator {
        &self.cache
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn invocation(&self) -> &InvocationState {
        &self.invocation
    }

    pub fn operation_queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// # Errors
    ///
    /// Returns `WrongContext` or `StaleObjectRef` for an unusable handle.
    pub fn lifecycle_state(&self, obj: ObjectRef) -> Result<LifecycleState> {
        Ok(self.tracker(obj)?.lifecycle_state())
    }

    /// # Errors
    ///
    /// Returns `WrongContext` or `StaleObjectRef` for an unusable handle.
    pub fn identity_of(&self, obj: ObjectRef) -> Result<Option<Identity>> {
        Ok(self.tracker(obj)?.identity().cloned())
    }

    /// # Errors
    ///
    /// Returns `WrongContext` or `StaleObjectRef` for an unusable handle.
    pub fn version_of(&self, obj: ObjectRef) -> Result<Option<i64>> {
        Ok(self.tracker(obj)?.version())
    }

    /// Object cached in L1 under `identity`, without touching recency
    pub fn l1_lookup(&self, identity: &Identity) -> Option<ObjectRef> {
        let identity = self.normalize(identity).ok()?;
        self.cache.l1().peek(&identity)
    }

    pub fn is_enlisted(&self, identity: &Identity) -> bool {
        self.normalize(identity)
            .map(|identity| self.enlisted.contains_key(&identity))
            .unwrap_or(false)
    }

    pub fn enlisted_len(&self) -> usize {
        self.enlisted.len()
    }

    pub fn dirty_direct(&self) -> Vec<ObjectRef> {
        self.dirty_direct.iter().copied().collect()
    }

    pub fn dirty_indirect(&self) -> Vec<ObjectRef> {
        self.dirty_indirect.iter().copied().collect()
    }

    pub fn is_pending_l2(&self, identity: &Identity) -> bool {
        self.normalize(identity)
            .map(|identity| self.pending_l2.contains(&identity))
            .unwrap_or(false)
    }

    /// Number of live trackers (any state) that carry `identity`
    pub fn trackers_for(&self, identity: &Identity) -> usize {
        let Ok(identity) = self.normalize(identity) else {
            return 0;
        };
        self.slots
            .iter()
            .filter_map(|slot| slot.tracker.as_deref())
            .filter(|tracker| {
                tracker.lifecycle_state().is_persistent() && tracker.identity() == Some(&identity)
            })
            .count()
    }

    // ===== Options =====

    /// Change one of the runtime-mutable options
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOption` for options fixed at open time and
    /// `InvalidConfig` for an invalid L1 capacity.
    pub fn set_option(&mut self, option: ContextOption) -> Result<()> {
        self.ensure_open()?;
        match option {
            ContextOption::L1Cache(kind) => {
                if let L1CacheKind::Lru { capacity: 0 } = kind {
                    return Err(StatelineError::InvalidConfig {
                        reason: "l1 lru capacity must be at least 1".to_string(),
                    });
                }
                self.config.l1_cache = kind;
                self.cache.l1_mut().set_kind(kind);
                self.evict_l1_overflow();
            }
            ContextOption::FlushMode(mode) => self.config.flush_mode = mode,
            ContextOption::L2RetrieveMode(mode) => {
                self.config.l2_retrieve_mode = mode;
                self.cache.set_retrieve_mode(mode);
            }
            ContextOption::L2StoreMode(mode) => {
                self.config.l2_store_mode = mode;
                self.cache.set_store_mode(mode);
            }
            other => {
                return Err(StatelineError::UnsupportedOption {
                    option: other.name().to_string(),
                })
            }
        }
        Ok(())
    }

    // ===== Object creation and field access =====

    /// Create a transient object of `class`
    ///
    /// # Errors
    ///
    /// Returns `ClassNotPersistable` if the class is not registered.
    pub fn new_object(&mut self, class: &str) -> Result<ObjectRef> {
        self.ensure_open()?;
        let meta = Arc::clone(self.metadata.class(class)?);
        let tracker = self.trackers.new_transient(&meta);
        Ok(self.alloc(tracker))
    }

    /// Read a field, loading the object from storage when necessary
    ///
    /// # Errors
    ///
    /// Returns `UnknownField`, handle errors, or a load failure.
    pub fn get(&mut self, obj: ObjectRef, field: &str) -> Result<Value> {
        let class = self.class_of(obj)?;
        let index = class.field_index(field)?;
        if !self.tracker(obj)?.loaded_fields().contains(index) {
            let state = self.tracker(obj)?.lifecycle_state();
            if state == LifecycleState::Detached {
                return Err(StatelineError::InvalidStateTransition {
                    op: format!("read unloaded field {}", field),
                    state: state.to_string(),
                });
            }
            self.ensure_open()?;
            self.load_object(obj)?;
        }
        Ok(self
            .tracker(obj)?
            .field_value(index)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Assign a field
    ///
    /// Persistent objects become dirty and are enlisted; edits of
    /// bidirectional relation fields are recorded for managed relations.
    ///
    /// # Errors
    ///
    /// Returns `UnknownField`, `TypeMismatch`, handle errors, or
    /// `InvalidStateTransition` for deleted objects.
    pub fn set(&mut self, obj: ObjectRef, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let class = self.class_of(obj)?;
        let index = class.field_index(field)?;
        self.validate_value(&class, index, &value)?;
        if self.tracker(obj)?.lifecycle_state() != LifecycleState::Detached {
            self.ensure_open()?;
        }
        self.set_field(obj, index, value, true)
    }

    /// # Errors
    ///
    /// Returns `TypeMismatch` if the field is not a collection of the
    /// element's class, or handle errors.
    pub fn add_to_collection(&mut self, obj: ObjectRef, field: &str, element: ObjectRef) -> Result<()> {
        self.ensure_open()?;
        let (class, index) = self.collection_field(obj, field)?;
        self.validate_value(&class, index, &Value::Collection(vec![element]))?;
        self.edit_collection(
            obj,
            index,
            Operation::CollectionAdd {
                owner: obj,
                field: index,
                element,
            },
        )
    }

    /// # Errors
    ///
    /// Returns `TypeMismatch` if the field is not a collection, or handle errors.
    pub fn remove_from_collection(
        &mut self,
        obj: ObjectRef,
        field: &str,
        element: ObjectRef,
    ) -> Result<()> {
        self.ensure_open()?;
        let (_, index) = self.collection_field(obj, field)?;
        self.check(element)?;
        self.edit_collection(
            obj,
            index,
            Operation::CollectionRemove {
                owner: obj,
                field: index,
                element,
            },
        )
    }

    /// # Errors
    ///
    /// Returns `TypeMismatch` if the field is not a collection, or handle errors.
    pub fn clear_collection(&mut self, obj: ObjectRef, field: &str) -> Result<()> {
        self.ensure_open()?;
        let (_, index) = self.collection_field(obj, field)?;
        self.edit_collection(
            obj,
            index,
            Operation::CollectionClear {
                owner: obj,
                field: index,
            },
        )
    }

    /// Evict every clean object from L1 bookkeeping to hollow
    ///
    /// # Errors
    ///
    /// Returns `ContextClosed` on a closed context.
    pub fn evict_all(&mut self) -> Result<()> {
        self.ensure_open()?;
        log_op_start!("evict_all", context_id = self.id.as_u64());
        let start = Instant::now();
        let mut evicted = 0usize;
        for obj in self.cache.l1().objects() {
            let Ok(tracker) = self.tracker_mut(obj) else {
                continue;
            };
            if matches!(
                tracker.lifecycle_state(),
                LifecycleState::PersistentClean | LifecycleState::Hollow
            ) && tracker.evict().is_ok()
            {
                evicted += 1;
            }
        }
        log_op_end!(
            "evict_all",
            duration_ms = start.elapsed().as_millis() as u64,
            evicted = evicted
        );
        Ok(())
    }

    // ===== Crate-internal plumbing =====

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StatelineError::ContextClosed);
        }
        Ok(())
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn alloc(&mut self, tracker: Box<dyn StateTracker>) -> ObjectRef {
        match self.free_slots.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.tracker = Some(tracker);
                ObjectRef {
                    context: self.id,
                    slot,
                    generation: entry.generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    tracker: Some(tracker),
                });
                ObjectRef {
                    context: self.id,
                    slot,
                    generation: 0,
                }
            }
        }
    }

    /// Free the slot of `obj`; later use of the handle is stale
    pub(crate) fn release(&mut self, obj: ObjectRef) {
        if self.check(obj).is_err() {
            return;
        }
        self.forget_handle(obj);
        let entry = &mut self.slots[obj.slot as usize];
        entry.tracker = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_slots.push(obj.slot);
    }

    /// Drop handle-keyed bookkeeping for `obj`
    pub(crate) fn forget_handle(&mut self, obj: ObjectRef) {
        self.dirty_direct.remove(&obj);
        self.dirty_indirect.remove(&obj);
        self.forced_version_bumps.remove(&obj);
        self.locks.unlock(obj);
        self.queue.remove_owner(obj);
        self.relations.forget(obj);
    }

    /// Remove `obj` from every identity- and handle-keyed structure
    pub(crate) fn forget(&mut self, obj: ObjectRef) {
        if let Ok(Some(identity)) = self.identity_of(obj) {
            if self.cache.l1().peek(&identity) == Some(obj) {
                self.cache.l1_mut().remove(&identity);
            }
            if self.enlisted.get(&identity) == Some(&obj) {
                self.enlisted.remove(&identity);
            }
            self.pending_l2.remove(&identity);
        }
        self.forget_handle(obj);
    }

    /// # Errors
    ///
    /// Returns `WrongContext` for foreign handles and `StaleObjectRef` for
    /// released ones.
    pub(crate) fn check(&self, obj: ObjectRef) -> Result<()> {
        if obj.context != self.id {
            return Err(StatelineError::WrongContext {
                expected: self.id.to_string(),
                actual: obj.context.to_string(),
            });
        }
        match self.slots.get(obj.slot as usize) {
            Some(slot) if slot.generation == obj.generation && slot.tracker.is_some() => Ok(()),
            _ => Err(StatelineError::StaleObjectRef { slot: obj.slot }),
        }
    }

    pub(crate) fn tracker(&self, obj: ObjectRef) -> Result<&dyn StateTracker> {
        self.check(obj)?;
        self.slots
            .get(obj.slot as usize)
            .and_then(|slot| slot.tracker.as_deref())
            .ok_or(StatelineError::StaleObjectRef { slot: obj.slot })
    }

    pub(crate) fn tracker_mut(
        &mut self,
        obj: ObjectRef,
    ) -> Result<&mut (dyn StateTracker + 'static)> {
        self.check(obj)?;
        self.slots
            .get_mut(obj.slot as usize)
            .and_then(|slot| slot.tracker.as_deref_mut())
            .ok_or(StatelineError::StaleObjectRef { slot: obj.slot })
    }

    pub(crate) fn class_of(&self, obj: ObjectRef) -> Result<Arc<ClassMetadata>> {
        let tracker = self.tracker(obj)?;
        Ok(Arc::clone(self.metadata.class(tracker.class())?))
    }

    /// Identity keyed under its root class
    pub(crate) fn normalize(&self, identity: &Identity) -> Result<Identity> {
        let root = self.metadata.root_class(identity.class())?;
        if root == identity.class() {
            Ok(identity.clone())
        } else {
            Ok(identity.with_class(root))
        }
    }

    /// Whether datastore writes wait for commit or an explicit flush
    pub(crate) fn datastore_ops_delayed(&self) -> bool {
        self.config.flush_mode == FlushMode::Manual
            || (self.tx.is_active() && self.tx.is_optimistic())
    }

    /// Objects referenced from the loaded fields of `obj`, with their field
    pub(crate) fn referents(&self, obj: ObjectRef) -> Result<Vec<(usize, ObjectRef)>> {
        let tracker = self.tracker(obj)?;
        let mut out = Vec::new();
        tracker.provide_fields(tracker.loaded_fields(), &mut |field, value| {
            out.extend(value.referenced().into_iter().map(|r| (field, r)));
        });
        Ok(out)
    }

    // ===== Value conversion =====

    pub(crate) fn to_stored(&self, value: &Value) -> Result<StoredValue> {
        Ok(match value {
            Value::Null => StoredValue::Null,
            Value::Bool(v) => StoredValue::Bool(*v),
            Value::Int(v) => StoredValue::Int(*v),
            Value::Float(v) => StoredValue::Float(*v),
            Value::Text(v) => StoredValue::Text(v.clone()),
            Value::Ref(obj) => StoredValue::Ref(self.stored_identity(*obj)?),
            Value::Collection(items) => StoredValue::Collection(
                items
                    .iter()
                    .map(|obj| self.stored_identity(*obj))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    fn stored_identity(&self, obj: ObjectRef) -> Result<Identity> {
        self.tracker(obj)?.identity().cloned().ok_or_else(|| {
            StatelineError::NotPersistent {
                op: format!("store a reference to {}", obj),
            }
        })
    }

    /// Resolve identities to handles; unknown objects come back hollow
    pub(crate) fn from_stored(&mut self, value: &StoredValue) -> Result<Value> {
        Ok(match value {
            StoredValue::Null => Value::Null,
            StoredValue::Bool(v) => Value::Bool(*v),
            StoredValue::Int(v) => Value::Int(*v),
            StoredValue::Float(v) => Value::Float(*v),
            StoredValue::Text(v) => Value::Text(v.clone()),
            StoredValue::Ref(identity) => {
                Value::Ref(self.resolve_reference(identity)?)
            }
            StoredValue::Collection(identities) => {
                let mut items = Vec::with_capacity(identities.len());
                for identity in identities {
                    items.push(self.resolve_reference(identity)?);
                }
                Value::Collection(items)
            }
        })
    }

    /// Stored form of the given fields of `obj`
    pub(crate) fn stored_fields(
        &self,
        obj: ObjectRef,
        fields: &FieldBitSet,
    ) -> Result<Vec<(usize, StoredValue)>> {
        let tracker = self.tracker(obj)?;
        fields
            .iter()
            .map(|field| {
                let value = tracker.field_value(field).unwrap_or(&Value::Null);
                Ok((field, self.to_stored(value)?))
            })
            .collect()
    }

    /// Full stored row of `obj`; unloaded fields are `Null`
    pub(crate) fn stored_row(&self, obj: ObjectRef) -> Result<Vec<StoredValue>> {
        let count = self.class_of(obj)?.field_count();
        let all = FieldBitSet::with_all(count);
        let mut row = vec![StoredValue::Null; count];
        for (field, value) in self.stored_fields(obj, &all)? {
            row[field] = value;
        }
        Ok(row)
    }

    /// L2 snapshot of a persistent object's loaded state
    pub(crate) fn snapshot(&self, obj: ObjectRef) -> Result<Option<CachedObject>> {
        let tracker = self.tracker(obj)?;
        let Some(identity) = tracker.identity().cloned() else {
            return Ok(None);
        };
        if tracker.loaded_fields().is_empty() {
            return Ok(None);
        }
        let loaded = tracker.loaded_fields().clone();
        let count = self.class_of(obj)?.field_count();
        let mut values = vec![StoredValue::Null; count];
        for (field, value) in self.stored_fields(obj, &loaded)? {
            if field < count {
                values[field] = value;
            }
        }
        Ok(Some(CachedObject {
            class: tracker.class().to_string(),
            identity,
            version: tracker.version(),
            values,
            loaded,
        }))
    }

    // ===== Loading =====

    /// Load every unloaded field of a persistent object from storage
    ///
    /// Pending queued collection edits for the object are applied after the
    /// load.
    pub(crate) fn load_object(&mut self, obj: ObjectRef) -> Result<()> {
        let tracker = self.tracker(obj)?;
        let state = tracker.lifecycle_state();
        if !state.is_persistent() || (state.is_new() && !tracker.is_flushed_new()) {
            return Ok(());
        }
        let field_count = self.class_of(obj)?.field_count();
        let loaded = tracker.loaded_fields().clone();
        if loaded.len() < field_count {
            let Some(identity) = tracker.identity().cloned() else {
                return Ok(());
            };
            let row = self.store.find_object(self.id, &identity)?.ok_or_else(|| {
                StatelineError::ObjectNotFound {
                    identity: identity.to_string(),
                }
            })?;
            let mut values = Vec::new();
            for (field, stored) in row.values.iter().enumerate() {
                if field < field_count && !loaded.contains(field) {
                    values.push((field, self.from_stored(stored)?));
                }
            }
            let tracker = self.tracker_mut(obj)?;
            tracker.load_fields(values);
            if tracker.version().is_none() {
                tracker.set_version(row.version);
            }
            debug!(identity = %identity, "object loaded from storage");
        }
        self.apply_queued(obj)
    }

    pub(crate) fn ensure_field_loaded(&mut self, obj: ObjectRef, field: usize) -> Result<()> {
        if self.tracker(obj)?.loaded_fields().contains(field) {
            return Ok(());
        }
        self.load_object(obj)
    }

    /// Apply queued collection edits of `obj` to its loaded collections
    fn apply_queued(&mut self, obj: ObjectRef) -> Result<()> {
        let pending: BTreeSet<usize> = self
            .queue
            .iter()
            .filter(|op| op.owner() == obj)
            .map(|op| op.field())
            .collect();
        for field in pending {
            for op in self.queue.take_for(obj, field) {
                self.apply_operation(&op)?;
            }
        }
        Ok(())
    }

    /// Apply one queued edit to its owner's collection
    pub(crate) fn apply_operation(&mut self, op: &Operation) -> Result<()> {
        let owner = op.owner();
        let field = op.field();
        let state = self.tracker(owner)?.lifecycle_state();
        if state.is_deleted() || !state.is_persistent() {
            return Ok(());
        }
        if !self.tracker(owner)?.loaded_fields().contains(field) {
            self.load_object(owner)?;
        }
        let mut items = match self.tracker(owner)?.field_value(field) {
            Some(Value::Collection(items)) => items.clone(),
            _ => Vec::new(),
        };
        op.apply_to(&mut items);
        self.tracker_mut(owner)?
            .replace_field(field, Value::Collection(items))
    }

    // ===== Field mutation =====

    fn collection_field(&self, obj: ObjectRef, field: &str) -> Result<(Arc<ClassMetadata>, usize)> {
        let class = self.class_of(obj)?;
        let index = class.field_index(field)?;
        match class.field_at(index).map(|f| &f.kind) {
            Some(FieldKind::Collection { .. }) => Ok((class, index)),
            _ => Err(StatelineError::TypeMismatch {
                class: class.name.clone(),
                field: field.to_string(),
                reason: "not a collection field".to_string(),
            }),
        }
    }

    fn validate_value(&self, class: &ClassMetadata, field: usize, value: &Value) -> Result<()> {
        let Some(meta) = class.field_at(field) else {
            return Err(StatelineError::internal(format!(
                "field index {} out of range for {}",
                field, class.name
            )));
        };
        let mismatch = |reason: String| StatelineError::TypeMismatch {
            class: class.name.clone(),
            field: meta.name.clone(),
            reason,
        };
        let check_target = |obj: ObjectRef, target: &str| -> Result<()> {
            let tracker = self.tracker(obj)?;
            if self.metadata.is_assignable(tracker.class(), target) {
                Ok(())
            } else {
                Err(mismatch(format!("{} is not a {}", tracker.class(), target)))
            }
        };
        match (&meta.kind, value) {
            (_, Value::Null) => Ok(()),
            (FieldKind::Basic, Value::Ref(_) | Value::Collection(_)) => {
                Err(mismatch("expected a scalar value".to_string()))
            }
            (FieldKind::Basic, _) => Ok(()),
            (FieldKind::Reference { target }, Value::Ref(obj)) => check_target(*obj, target),
            (FieldKind::Reference { .. }, _) => Err(mismatch("expected a reference".to_string())),
            (FieldKind::Collection { element }, Value::Collection(items)) => items
                .iter()
                .try_for_each(|obj| check_target(*obj, element)),
            (FieldKind::Collection { .. }, _) => {
                Err(mismatch("expected a collection".to_string()))
            }
        }
    }

    /// Whether edits of `field` are recorded for managed relations
    pub(crate) fn tracks_relation(
        &self,
        class: &ClassMetadata,
        field: usize,
        state: LifecycleState,
    ) -> bool {
        self.config.managed_relations
            && state.is_persistent()
            && !state.is_deleted()
            && !self.invocation.is_merging()
            && self.metadata.inverse_of(&class.name, field).is_some()
    }

    /// Replace a field value and do the dirty/relation bookkeeping
    ///
    /// `direct` is false for changes made by relationship management.
    pub(crate) fn set_field(
        &mut self,
        obj: ObjectRef,
        field: usize,
        value: Value,
        direct: bool,
    ) -> Result<()> {
        let state = self.tracker(obj)?.lifecycle_state();
        let class = self.class_of(obj)?;
        let track = direct && self.tracks_relation(&class, field, state);
        let previous = if track {
            self.ensure_field_loaded(obj, field)?;
            self.tracker(obj)?.field_value(field).cloned()
        } else {
            None
        };

        self.tracker_mut(obj)?.replace_field(field, value.clone())?;
        if state.is_persistent() && class.in_unique_key(field) {
            self.try_index_unique_keys(obj);
        }

        if track {
            self.record_relation_edit(obj, field, previous.as_ref(), &value);
        }
        if state.is_persistent() {
            self.mark_dirty(obj, direct)?;
        }
        Ok(())
    }

    fn record_relation_edit(
        &mut self,
        owner: ObjectRef,
        field: usize,
        previous: Option<&Value>,
        value: &Value,
    ) {
        let is_collection = self
            .class_of(owner)
            .ok()
            .and_then(|class| class.field_at(field).map(|f| f.kind.clone()))
            .is_some_and(|kind| matches!(kind, FieldKind::Collection { .. }));

        if !is_collection {
            let old = previous.and_then(Value::as_ref_object);
            let new = value.as_ref_object();
            if old != new {
                self.relations
                    .record(owner, RelationChange::Set { field, old, new });
            }
            return;
        }

        let before = previous.map(Value::referenced).unwrap_or_default();
        let after = value.referenced();
        for element in after.iter().filter(|e| !before.contains(e)) {
            self.relations.record(
                owner,
                RelationChange::Add {
                    field,
                    element: *element,
                },
            );
        }
        for element in before.iter().filter(|e| !after.contains(e)) {
            self.relations.record(
                owner,
                RelationChange::Remove {
                    field,
                    element: *element,
                },
            );
        }
    }

    /// Record the current bidirectional field values of a newly persisted object
    pub(crate) fn record_initial_relations(&mut self, obj: ObjectRef) -> Result<()> {
        let class = self.class_of(obj)?;
        let state = self.tracker(obj)?.lifecycle_state();
        for field in class.relation_fields() {
            if !self.tracks_relation(&class, field, state) {
                continue;
            }
            let value = self.tracker(obj)?.field_value(field).cloned();
            if let Some(value) = value {
                if !value.is_null() {
                    self.record_relation_edit(obj, field, None, &value);
                }
            }
        }
        Ok(())
    }

    fn edit_collection(&mut self, obj: ObjectRef, field: usize, op: Operation) -> Result<()> {
        let tracker = self.tracker(obj)?;
        let state = tracker.lifecycle_state();
        let loaded = tracker.loaded_fields().contains(field);
        if state.is_deleted() {
            return Err(StatelineError::InvalidStateTransition {
                op: "modify".to_string(),
                state: state.to_string(),
            });
        }

        if !loaded && state.is_persistent() && !state.is_new() && self.datastore_ops_delayed() {
            let class = self.class_of(obj)?;
            if self.tracks_relation(&class, field, state) {
                match &op {
                    Operation::CollectionAdd { element, .. } => self.relations.record(
                        obj,
                        RelationChange::Add {
                            field,
                            element: *element,
                        },
                    ),
                    Operation::CollectionRemove { element, .. } => self.relations.record(
                        obj,
                        RelationChange::Remove {
                            field,
                            element: *element,
                        },
                    ),
                    Operation::CollectionClear { .. } => {}
                }
            }
            debug!(op = %op, "collection edit queued");
            self.queue.push(op);
            return self.mark_dirty(obj, true);
        }

        self.ensure_field_loaded(obj, field)?;
        let mut items = match self.tracker(obj)?.field_value(field) {
            Some(Value::Collection(items)) => items.clone(),
            _ => Vec::new(),
        };
        op.apply_to(&mut items);
        self.set_field(obj, field, Value::Collection(items), true)
    }

    // ===== Unique keys =====

    /// Declared unique keys of `obj` whose fields are all loaded and set
    pub(crate) fn unique_keys_of(&self, obj: ObjectRef) -> Result<Vec<UniqueKey>> {
        let class = self.class_of(obj)?;
        let tracker = self.tracker(obj)?;
        let root = self.metadata.root_class(&class.name)?;
        let mut keys = Vec::new();
        'keys: for fields in &class.unique_keys {
            let mut values = Vec::with_capacity(fields.len());
            for name in fields {
                let index = class.field_index(name)?;
                match tracker.field_value(index).and_then(Value::as_key) {
                    Some(value) => values.push(value),
                    None => continue 'keys,
                }
            }
            keys.push(UniqueKey {
                class: root.clone(),
                fields: fields.clone(),
                values,
            });
        }
        Ok(keys)
    }

    /// Unique keys computable from a stored row
    pub(crate) fn unique_keys_of_row(
        &self,
        class: &ClassMetadata,
        values: &[StoredValue],
    ) -> Result<Vec<UniqueKey>> {
        let root = self.metadata.root_class(&class.name)?;
        let mut keys = Vec::new();
        'keys: for fields in &class.unique_keys {
            let mut key_values = Vec::with_capacity(fields.len());
            for name in fields {
                let index = class.field_index(name)?;
                match values.get(index).and_then(StoredValue::as_key) {
                    Some(value) => key_values.push(value),
                    None => continue 'keys,
                }
            }
            keys.push(UniqueKey {
                class: root.clone(),
                fields: fields.clone(),
                values: key_values,
            });
        }
        Ok(keys)
    }

    // ===== L1 policy =====

    /// Apply the LRU capacity of L1
    ///
    /// Enlisted, dirty, new and referenced objects are pinned. Evicted
    /// handles are released.
    pub(crate) fn evict_l1_overflow(&mut self) {
        let L1CacheKind::Lru { capacity } = self.cache.l1().kind() else {
            return;
        };
        if self.cache.l1().len() <= capacity {
            return;
        }
        let mut pinned: HashSet<ObjectRef> = self.enlisted.values().copied().collect();
        pinned.extend(self.dirty_direct.iter().copied());
        pinned.extend(self.dirty_indirect.iter().copied());
        for obj in self.cache.l1().objects() {
            let Ok(tracker) = self.tracker(obj) else {
                continue;
            };
            if tracker.lifecycle_state().is_new() {
                pinned.insert(obj);
            }
            if let Ok(referents) = self.referents(obj) {
                pinned.extend(referents.into_iter().map(|(_, r)| r));
            }
        }
        let evicted = self
            .cache
            .l1_mut()
            .evict_overflow(|obj| pinned.contains(&obj));
        for obj in evicted {
            debug!(object = %obj, "l1 entry evicted");
            self.release(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SharedLevel2Cache;
    use crate::model::FieldMetadata;
    use crate::storage::MemoryStore;

    fn context() -> ExecutionContext {
        let mut registry = MetadataRegistry::new();
        registry
            .register(
                ClassMetadata::new("Person")
                    .field(FieldMetadata::basic("name"))
                    .field(FieldMetadata::reference("friend", "Person")),
            )
            .unwrap();
        ExecutionContext::new(
            Arc::new(registry),
            Arc::new(MemoryStore::new()),
            Arc::new(SharedLevel2Cache::new()),
            ContextConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_transient_object_field_access() {
        let mut ctx = context();
        let ann = ctx.new_object("Person").unwrap();
        ctx.set(ann, "name", "Ann").unwrap();
        assert_eq!(ctx.get(ann, "name").unwrap(), Value::text("Ann"));
        assert_eq!(ctx.lifecycle_state(ann).unwrap(), LifecycleState::Transient);
        assert!(ctx.dirty_direct().is_empty());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut ctx = context();
        let ann = ctx.new_object("Person").unwrap();
        let err = ctx.set(ann, "friend", "Bob").unwrap_err();
        assert!(matches!(err, StatelineError::TypeMismatch { .. }));
        let err = ctx.set(ann, "name", Value::Ref(ann)).unwrap_err();
        assert!(matches!(err, StatelineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_handle_from_other_context_is_rejected() {
        let mut a = context();
        let mut b = context();
        let obj = a.new_object("Person").unwrap();
        let err = b.get(obj, "name").unwrap_err();
        assert!(matches!(err, StatelineError::WrongContext { .. }));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_released_handle_is_stale() {
        let mut ctx = context();
        let obj = ctx.new_object("Person").unwrap();
        ctx.release(obj);
        let err = ctx.get(obj, "name").unwrap_err();
        assert!(matches!(err, StatelineError::StaleObjectRef { .. }));

        // slot reuse gets a new generation
        let again = ctx.new_object("Person").unwrap();
        assert_eq!(again.slot, obj.slot);
        assert_ne!(again.generation, obj.generation);
    }

    #[test]
    fn test_unsupported_option() {
        let mut ctx = context();
        let err = ctx
            .set_option(ContextOption::Optimistic(true))
            .unwrap_err();
        assert!(matches!(err, StatelineError::UnsupportedOption { .. }));
        ctx.set_option(ContextOption::FlushMode(FlushMode::Manual))
            .unwrap();
        assert_eq!(ctx.config().flush_mode, FlushMode::Manual);
    }
}
