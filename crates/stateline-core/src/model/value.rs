use serde::{Deserialize, Serialize};
use stateline_core_types::ContextId;
use std::fmt;

use crate::model::identity::{Identity, KeyValue};

/// Handle to one object managed by one execution context
///
/// Handles are copyable and cheap. The generation detects reuse of a released
/// arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub(crate) context: ContextId,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ObjectRef {
    pub fn context(&self) -> ContextId {
        self.context
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.context, self.slot, self.generation)
    }
}

/// Field value as seen inside one execution context
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Ref(ObjectRef),
    Collection(Vec<ObjectRef>),
}

impl Value {
    pub fn text(v: impl Into<String>) -> Self {
        Value::Text(v.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_ref_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Ref(obj) => Some(*obj),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Objects referenced by this value
    pub fn referenced(&self) -> Vec<ObjectRef> {
        match self {
            Value::Ref(obj) => vec![*obj],
            Value::Collection(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Key component form, when the value can be one
    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            Value::Int(v) => Some(KeyValue::Int(*v)),
            Value::Text(v) => Some(KeyValue::Text(v.clone())),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Ref(v)
    }
}

/// Context-independent field value
///
/// References are identities, so the value can live in storage rows, L2
/// entries and detached copies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Ref(Identity),
    Collection(Vec<Identity>),
}

impl StoredValue {
    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            StoredValue::Int(v) => Some(KeyValue::Int(*v)),
            StoredValue::Text(v) => Some(KeyValue::Text(v.clone())),
            _ => None,
        }
    }

    /// Identities referenced by this value
    pub fn referenced(&self) -> Vec<&Identity> {
        match self {
            StoredValue::Ref(id) => vec![id],
            StoredValue::Collection(ids) => ids.iter().collect(),
            _ => Vec::new(),
        }
    }
}
