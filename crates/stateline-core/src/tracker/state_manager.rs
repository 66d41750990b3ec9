use crate::errors::{Result, StatelineError};
use crate::model::{FieldBitSet, Identity, StoredValue, Value};
use crate::tracker::{DetachedObject, LifecycleState, StateTracker};

/// Default tracker implementation
#[derive(Debug, Clone)]
pub struct StateManager {
    class: String,
    state: LifecycleState,
    identity: Option<Identity>,
    version: Option<i64>,
    values: Vec<Value>,
    loaded: FieldBitSet,
    dirty: FieldBitSet,
    flushed_new: bool,
    flushed_deleted: bool,
}

impl StateManager {
    pub fn transient(class: &str, field_count: usize) -> Self {
        Self {
            class: class.to_string(),
            state: LifecycleState::Transient,
            identity: None,
            version: None,
            values: vec![Value::Null; field_count],
            loaded: FieldBitSet::with_all(field_count),
            dirty: FieldBitSet::new(),
            flushed_new: false,
            flushed_deleted: false,
        }
    }

    pub fn hollow(class: &str, field_count: usize, identity: Identity) -> Self {
        Self {
            state: LifecycleState::Hollow,
            identity: Some(identity),
            loaded: FieldBitSet::new(),
            ..Self::transient(class, field_count)
        }
    }

    fn invalid(&self, op: &str) -> StatelineError {
        StatelineError::InvalidStateTransition {
            op: op.to_string(),
            state: self.state.to_string(),
        }
    }

    fn unload(&mut self) {
        for value in self.values.iter_mut() {
            *value = Value::Null;
        }
        self.loaded.clear();
        self.dirty.clear();
    }

    fn reset_flush_flags(&mut self) {
        self.flushed_new = false;
        self.flushed_deleted = false;
    }

    fn store_value(&mut self, field: usize, value: Value) {
        if field >= self.values.len() {
            self.values.resize(field + 1, Value::Null);
        }
        self.values[field] = value;
        self.loaded.insert(field);
    }
}

impl StateTracker for StateManager {
    fn class(&self) -> &str {
        &self.class
    }

    fn lifecycle_state(&self) -> LifecycleState {
        self.state
    }

    fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    fn version(&self) -> Option<i64> {
        self.version
    }

    fn set_version(&mut self, version: Option<i64>) {
        self.version = version;
    }

    fn loaded_fields(&self) -> &FieldBitSet {
        &self.loaded
    }

    fn dirty_fields(&self) -> &FieldBitSet {
        &self.dirty
    }

    fn is_flushed_new(&self) -> bool {
        self.flushed_new
    }

    fn is_flushed_deleted(&self) -> bool {
        self.flushed_deleted
    }

    fn make_persistent(&mut self, identity: Identity) -> Result<()> {
        if self.state != LifecycleState::Transient {
            return Err(self.invalid("make persistent"));
        }
        self.state = LifecycleState::PersistentNew;
        self.identity = Some(identity);
        self.version = None;
        self.dirty = self.loaded.clone();
        self.reset_flush_flags();
        Ok(())
    }

    fn make_transient(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::PersistentNew
            | LifecycleState::PersistentNewDeleted
            | LifecycleState::PersistentDeleted => {
                self.state = LifecycleState::Transient;
                self.identity = None;
                self.version = None;
                self.dirty.clear();
                self.reset_flush_flags();
                Ok(())
            }
            LifecycleState::Transient => Ok(()),
            _ => Err(self.invalid("make transient")),
        }
    }

    fn delete_persistent(&mut self) -> Result<()> {
        self.state = match self.state {
            LifecycleState::PersistentNew => LifecycleState::PersistentNewDeleted,
            LifecycleState::PersistentClean
            | LifecycleState::PersistentDirty
            | LifecycleState::Hollow => LifecycleState::PersistentDeleted,
            LifecycleState::Transient | LifecycleState::Detached => {
                return Err(StatelineError::NotPersistent {
                    op: "delete".to_string(),
                })
            }
            LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted => {
                return Err(self.invalid("delete"))
            }
        };
        Ok(())
    }

    fn attach(&mut self) -> Result<()> {
        if self.state != LifecycleState::Detached {
            return Err(self.invalid("attach"));
        }
        self.state = if self.dirty.is_empty() {
            LifecycleState::PersistentClean
        } else {
            LifecycleState::PersistentDirty
        };
        Ok(())
    }

    fn attach_copy(
        &mut self,
        version: Option<i64>,
        values: Vec<(usize, Value)>,
        dirty: &FieldBitSet,
    ) -> Result<()> {
        if self.state.is_deleted() || self.state == LifecycleState::Transient {
            return Err(self.invalid("attach copy"));
        }
        let mut changed = false;
        for (field, value) in values {
            if dirty.contains(field) {
                self.store_value(field, value);
                self.dirty.insert(field);
                changed = true;
            } else if !self.loaded.contains(field) {
                self.store_value(field, value);
            }
        }
        if (changed && !self.state.is_new()) || self.version.is_none() {
            // optimistic check runs against the version the copy was read at
            self.version = version;
        }
        if self.state == LifecycleState::Hollow && !self.loaded.is_empty() {
            self.state = LifecycleState::PersistentClean;
        }
        if changed && self.state == LifecycleState::PersistentClean {
            self.state = LifecycleState::PersistentDirty;
        }
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::PersistentClean | LifecycleState::Hollow => {
                self.state = LifecycleState::Detached;
                self.dirty.clear();
                self.reset_flush_flags();
                Ok(())
            }
            LifecycleState::PersistentNew | LifecycleState::PersistentDirty
                if self.dirty.is_empty() && (self.flushed_new || !self.state.is_new()) =>
            {
                self.state = LifecycleState::Detached;
                self.reset_flush_flags();
                Ok(())
            }
            LifecycleState::Detached => Ok(()),
            _ => Err(self.invalid("detach")),
        }
    }

    fn detach_copy(&self, values: Vec<StoredValue>) -> Result<DetachedObject> {
        let identity = match (&self.identity, self.state) {
            (Some(identity), state) if state.is_persistent() || state == LifecycleState::Detached => {
                identity.clone()
            }
            _ => {
                return Err(StatelineError::NotPersistent {
                    op: "detach copy".to_string(),
                })
            }
        };
        Ok(DetachedObject {
            class: self.class.clone(),
            identity,
            version: self.version,
            values,
            loaded: self.loaded.clone(),
            dirty: FieldBitSet::new(),
        })
    }

    fn evict(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::PersistentClean | LifecycleState::Hollow => {
                self.state = LifecycleState::Hollow;
                self.unload();
                Ok(())
            }
            _ => Err(self.invalid("evict")),
        }
    }

    fn refresh(&mut self, values: Vec<(usize, Value)>, version: Option<i64>) -> Result<()> {
        match self.state {
            LifecycleState::PersistentClean
            | LifecycleState::PersistentDirty
            | LifecycleState::Hollow => {
                self.unload();
                for (field, value) in values {
                    self.store_value(field, value);
                }
                self.version = version;
                self.state = LifecycleState::PersistentClean;
                Ok(())
            }
            _ => Err(self.invalid("refresh")),
        }
    }

    fn validate(&mut self, stored_version: Option<Option<i64>>) -> Result<()> {
        match stored_version {
            None => Err(StatelineError::ObjectNotFound {
                identity: self
                    .identity
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| self.class.clone()),
            }),
            Some(version) => {
                if self.state == LifecycleState::Hollow {
                    self.version = version;
                }
                Ok(())
            }
        }
    }

    fn provide_fields(&self, fields: &FieldBitSet, consumer: &mut dyn FnMut(usize, &Value)) {
        for field in fields.iter() {
            if self.loaded.contains(field) {
                if let Some(value) = self.values.get(field) {
                    consumer(field, value);
                }
            }
        }
    }

    fn field_value(&self, field: usize) -> Option<&Value> {
        if self.loaded.contains(field) {
            self.values.get(field)
        } else {
            None
        }
    }

    fn replace_field(&mut self, field: usize, value: Value) -> Result<()> {
        match self.state {
            LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted => {
                return Err(self.invalid("modify"))
            }
            LifecycleState::PersistentClean | LifecycleState::Hollow => {
                self.state = LifecycleState::PersistentDirty;
            }
            _ => {}
        }
        self.store_value(field, value);
        if self.state != LifecycleState::Transient {
            self.dirty.insert(field);
        }
        Ok(())
    }

    fn load_fields(&mut self, values: Vec<(usize, Value)>) {
        for (field, value) in values {
            if !self.dirty.contains(field) {
                self.store_value(field, value);
            }
        }
        if self.state == LifecycleState::Hollow {
            self.state = LifecycleState::PersistentClean;
        }
    }

    fn mark_flushed(&mut self) {
        match self.state {
            LifecycleState::PersistentNew => self.flushed_new = true,
            LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted => {
                self.flushed_deleted = true
            }
            _ => {}
        }
        self.dirty.clear();
    }

    fn post_commit(&mut self, retain_values: bool) -> Result<()> {
        match self.state {
            LifecycleState::PersistentNew
            | LifecycleState::PersistentDirty
            | LifecycleState::PersistentClean => {
                self.state = LifecycleState::PersistentClean;
                self.dirty.clear();
                if !retain_values {
                    self.state = LifecycleState::Hollow;
                    self.unload();
                }
            }
            LifecycleState::Hollow => {}
            LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted => {
                self.state = LifecycleState::Transient;
                self.identity = None;
                self.version = None;
                self.dirty.clear();
            }
            LifecycleState::Transient | LifecycleState::Detached => {
                return Err(self.invalid("post commit"))
            }
        }
        self.reset_flush_flags();
        Ok(())
    }

    fn pre_rollback(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::PersistentNew | LifecycleState::PersistentNewDeleted => {
                self.state = LifecycleState::Transient;
                self.identity = None;
                self.version = None;
                self.dirty.clear();
            }
            LifecycleState::PersistentClean
            | LifecycleState::PersistentDirty
            | LifecycleState::PersistentDeleted => {
                self.state = LifecycleState::Hollow;
                self.unload();
                self.version = None;
            }
            LifecycleState::Hollow => {}
            LifecycleState::Transient | LifecycleState::Detached => {
                return Err(self.invalid("rollback"))
            }
        }
        self.reset_flush_flags();
        Ok(())
    }
}
