use serde::{Deserialize, Serialize};

use crate::model::{FieldBitSet, Identity, StoredValue};

/// Context-independent copy of a detached object
///
/// Produced by `detach_copy` and consumed by `attach_copy` in any context
/// sharing the same metadata. Fields outside `loaded` carry no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachedObject {
    pub class: String,
    pub identity: Identity,
    pub version: Option<i64>,
    pub values: Vec<StoredValue>,
    pub loaded: FieldBitSet,
    pub dirty: FieldBitSet,
}

impl DetachedObject {
    pub fn value(&self, field: usize) -> Option<&StoredValue> {
        if self.loaded.contains(field) {
            self.values.get(field)
        } else {
            None
        }
    }

    /// Change a field while detached; it is written on attach
    pub fn set_value(&mut self, field: usize, value: StoredValue) {
        if field >= self.values.len() {
            self.values.resize(field + 1, StoredValue::Null);
        }
        self.values[field] = value;
        self.loaded.insert(field);
        self.dirty.insert(field);
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }
}
