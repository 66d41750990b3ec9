//! Narrow class/field metadata consumed by the engine
//!
//! The engine never parses a schema language. Callers build
//! [`ClassMetadata`] values and register them; subclasses inherit the
//! superclass field list as a prefix so field indices are stable across a
//! hierarchy.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::errors::{Result, StatelineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Scalar value (bool/int/float/text)
    Basic,
    /// Single reference to another persistable object
    Reference { target: String },
    /// Collection of references
    Collection { element: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStrategy {
    /// Surrogate key assigned by the datastore on insert
    Datastore,
    /// Key taken from the primary-key fields
    Application,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMetadata {
    pub name: String,
    pub kind: FieldKind,
    pub primary_key: bool,
    /// Name of the owning field on the other side of a bidirectional relation
    pub mapped_by: Option<String>,
    pub cascade_persist: bool,
    pub cascade_delete: bool,
    pub default_fetch: bool,
}

impl FieldMetadata {
    fn with_kind(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            primary_key: false,
            mapped_by: None,
            cascade_persist: true,
            cascade_delete: false,
            default_fetch: true,
        }
    }

    pub fn basic(name: &str) -> Self {
        Self::with_kind(name, FieldKind::Basic)
    }

    pub fn reference(name: &str, target: &str) -> Self {
        Self::with_kind(
            name,
            FieldKind::Reference {
                target: target.to_string(),
            },
        )
    }

    pub fn collection(name: &str, element: &str) -> Self {
        Self::with_kind(
            name,
            FieldKind::Collection {
                element: element.to_string(),
            },
        )
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn mapped_by(mut self, field: &str) -> Self {
        self.mapped_by = Some(field.to_string());
        self
    }

    /// Deleting the owner deletes the referenced objects
    pub fn dependent(mut self) -> Self {
        self.cascade_delete = true;
        self
    }

    pub fn no_cascade_persist(mut self) -> Self {
        self.cascade_persist = false;
        self
    }

    /// Not part of the default fetch group
    pub fn lazy(mut self) -> Self {
        self.default_fetch = false;
        self
    }

    /// Class of the referenced objects, for relation fields
    pub fn related_class(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Basic => None,
            FieldKind::Reference { target } => Some(target),
            FieldKind::Collection { element } => Some(element),
        }
    }

    pub fn is_relation(&self) -> bool {
        !matches!(self.kind, FieldKind::Basic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMetadata {
    pub name: String,
    pub superclass: Option<String>,
    pub fields: Vec<FieldMetadata>,
    pub identity: IdentityStrategy,
    pub versioned: bool,
    pub cacheable: bool,
    pub detachable: bool,
    pub unique_keys: Vec<Vec<String>>,
}

impl ClassMetadata {
    /// Datastore-identity class, cacheable and detachable
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: None,
            fields: Vec::new(),
            identity: IdentityStrategy::Datastore,
            versioned: false,
            cacheable: true,
            detachable: true,
            unique_keys: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.to_string());
        self
    }

    pub fn field(mut self, field: FieldMetadata) -> Self {
        self.fields.push(field);
        self
    }

    pub fn application_identity(mut self) -> Self {
        self.identity = IdentityStrategy::Application;
        self
    }

    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }

    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn not_detachable(mut self) -> Self {
        self.detachable = false;
        self
    }

    pub fn unique(mut self, fields: &[&str]) -> Self {
        self.unique_keys
            .push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// # Errors
    ///
    /// Returns `UnknownField` if the class declares no such field.
    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| StatelineError::UnknownField {
                class: self.name.clone(),
                field: name.to_string(),
            })
    }

    pub fn field_at(&self, index: usize) -> Option<&FieldMetadata> {
        self.fields.get(index)
    }

    /// Whether `field` belongs to a declared unique key
    pub fn in_unique_key(&self, field: usize) -> bool {
        self.unique_keys
            .iter()
            .flatten()
            .any(|name| self.field_index(name).ok() == Some(field))
    }

    pub fn pk_fields(&self) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn default_fetch_fields(&self) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.default_fetch)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn relation_fields(&self) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_relation())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Registry of persistable classes
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    classes: HashMap<String, Arc<ClassMetadata>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class; its superclass must already be registered
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for duplicate names, unknown superclasses,
    /// missing primary keys on application-identity classes, or unique keys
    /// naming undeclared fields.
    pub fn register(&mut self, class: ClassMetadata) -> Result<()> {
        if self.classes.contains_key(&class.name) {
            return Err(StatelineError::InvalidConfig {
                reason: format!("class {} registered twice", class.name),
            });
        }

        let mut flattened = class;
        if let Some(parent_name) = &flattened.superclass {
            let parent = self.classes.get(parent_name).ok_or_else(|| {
                StatelineError::InvalidConfig {
                    reason: format!(
                        "superclass {} of {} is not registered",
                        parent_name, flattened.name
                    ),
                }
            })?;
            let mut fields = parent.fields.clone();
            fields.append(&mut flattened.fields);
            flattened.fields = fields;
            flattened.identity = parent.identity;
            flattened.versioned = parent.versioned;
            let mut keys = parent.unique_keys.clone();
            keys.append(&mut flattened.unique_keys);
            flattened.unique_keys = keys;
        }

        let mut seen = BTreeSet::new();
        for field in &flattened.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(StatelineError::InvalidConfig {
                    reason: format!("field {}.{} declared twice", flattened.name, field.name),
                });
            }
        }
        if flattened.identity == IdentityStrategy::Application && flattened.pk_fields().is_empty()
        {
            return Err(StatelineError::InvalidConfig {
                reason: format!(
                    "application-identity class {} declares no primary key",
                    flattened.name
                ),
            });
        }
        for key in &flattened.unique_keys {
            for field in key {
                flattened.field_index(field)?;
            }
        }

        self.classes
            .insert(flattened.name.clone(), Arc::new(flattened));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ClassNotPersistable` if the class is not registered.
    pub fn class(&self, name: &str) -> Result<&Arc<ClassMetadata>> {
        self.classes
            .get(name)
            .ok_or_else(|| StatelineError::ClassNotPersistable {
                class: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// All transitive subclasses, sorted by name
    pub fn subclasses(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .classes
            .keys()
            .filter(|candidate| candidate.as_str() != name && self.is_assignable(candidate, name))
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// # Errors
    ///
    /// Returns `ClassNotPersistable` if the class is not registered.
    pub fn root_class(&self, name: &str) -> Result<String> {
        let mut current = self.class(name)?;
        while let Some(parent) = &current.superclass {
            current = self.class(parent)?;
        }
        Ok(current.name.clone())
    }

    /// Whether instances of `class` may be stored where `target` is expected
    pub fn is_assignable(&self, class: &str, target: &str) -> bool {
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            if name == target {
                return true;
            }
            current = self.classes.get(&name).and_then(|c| c.superclass.clone());
        }
        false
    }

    /// Other side of a bidirectional relation field
    ///
    /// Returns the related class and the index of the inverse field on it.
    /// A field pairs with the related class's field named by its own
    /// `mapped_by`, or with the related field whose `mapped_by` names it.
    pub fn inverse_of(&self, class: &str, field: usize) -> Option<(Arc<ClassMetadata>, usize)> {
        let owner = self.classes.get(class)?;
        let meta = owner.field_at(field)?;
        let related = self.classes.get(meta.related_class()?)?;

        if let Some(mapped_by) = &meta.mapped_by {
            let index = related.field_index(mapped_by).ok()?;
            return Some((Arc::clone(related), index));
        }
        related
            .fields
            .iter()
            .position(|f| {
                f.mapped_by.as_deref() == Some(meta.name.as_str())
                    && f.related_class()
                        .is_some_and(|target| self.is_assignable(class, target))
            })
            .map(|index| (Arc::clone(related), index))
    }
}
