//! Object identities
//!
//! An identity names one persistent object within a context and the backing
//! store. The class component is always the root class of the hierarchy so a
//! lookup through a superclass and through the concrete class meet on the
//! same key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TEMPORARY: AtomicU64 = AtomicU64::new(1);

/// Scalar component of an application identity or unique key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

/// Opaque, comparable object identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    /// Surrogate key assigned by the datastore
    Datastore { class: String, id: u64 },
    /// Application identity over one primary-key field
    Single { class: String, key: KeyValue },
    /// Application identity over several primary-key fields
    Composite { class: String, keys: Vec<KeyValue> },
    /// Placeholder until the datastore assigns the real key
    Temporary { class: String, seq: u64 },
}

impl Identity {
    pub fn datastore(class: impl Into<String>, id: u64) -> Self {
        Identity::Datastore {
            class: class.into(),
            id,
        }
    }

    pub fn single(class: impl Into<String>, key: impl Into<KeyValue>) -> Self {
        Identity::Single {
            class: class.into(),
            key: key.into(),
        }
    }

    pub fn composite(class: impl Into<String>, keys: Vec<KeyValue>) -> Self {
        Identity::Composite {
            class: class.into(),
            keys,
        }
    }

    /// Allocate a fresh temporary identity
    pub fn temporary(class: impl Into<String>) -> Self {
        Identity::Temporary {
            class: class.into(),
            seq: NEXT_TEMPORARY.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn class(&self) -> &str {
        match self {
            Identity::Datastore { class, .. }
            | Identity::Single { class, .. }
            | Identity::Composite { class, .. }
            | Identity::Temporary { class, .. } => class,
        }
    }

    /// Same key under another class name
    pub fn with_class(&self, class: impl Into<String>) -> Self {
        let class = class.into();
        match self {
            Identity::Datastore { id, .. } => Identity::Datastore { class, id: *id },
            Identity::Single { key, .. } => Identity::Single {
                class,
                key: key.clone(),
            },
            Identity::Composite { keys, .. } => Identity::Composite {
                class,
                keys: keys.clone(),
            },
            Identity::Temporary { seq, .. } => Identity::Temporary { class, seq: *seq },
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Identity::Temporary { .. })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Datastore { class, id } => write!(f, "{}#{}", class, id),
            Identity::Single { class, key } => write!(f, "{}[{}]", class, key),
            Identity::Composite { class, keys } => {
                write!(f, "{}[", class)?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", key)?;
                }
                write!(f, "]")
            }
            Identity::Temporary { class, seq } => write!(f, "{}~tmp{}", class, seq),
        }
    }
}

/// Declared unique-key tuple of one object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueKey {
    pub class: String,
    pub fields: Vec<String>,
    pub values: Vec<KeyValue>,
}

impl UniqueKey {
    pub fn new(class: impl Into<String>, fields: &[&str], values: Vec<KeyValue>) -> Self {
        Self {
            class: class.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            values,
        }
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.class)?;
        for (i, (field, value)) in self.fields.iter().zip(&self.values).enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", field, value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_forms() {
        assert_eq!(Identity::datastore("Person", 12).to_string(), "Person#12");
        assert_eq!(Identity::single("Person", "ann").to_string(), "Person['ann']");
        assert_eq!(
            Identity::composite("Line", vec![KeyValue::Int(1), KeyValue::Int(2)]).to_string(),
            "Line[1,2]"
        );
    }

    #[test]
    fn test_temporary_identities_are_unique() {
        let a = Identity::temporary("Person");
        let b = Identity::temporary("Person");
        assert!(a.is_temporary());
        assert_ne!(a, b);
    }

    #[test]
    fn test_with_class_keeps_key() {
        let id = Identity::datastore("Person", 4);
        let moved = id.with_class("Employee");
        assert_eq!(moved.class(), "Employee");
        assert_eq!(moved, Identity::datastore("Employee", 4));
    }

    #[test]
    fn test_identity_serializes_as_map_key_string() {
        let id = Identity::single("Person", 7);
        let json = serde_json::to_string(&id).unwrap();
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
