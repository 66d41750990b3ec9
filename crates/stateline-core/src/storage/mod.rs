//! Storage adapter contract
//!
//! The execution context hands ordered row operations to a [`StoreManager`];
//! it never sees how rows are kept. Adapters are shared across contexts, so
//! every method takes `&self` and keys transactional state by [`ContextId`].

pub mod memory;

use serde::{Deserialize, Serialize};
use stateline_core_types::ContextId;

use crate::errors::Result;
use crate::model::{Identity, KeyValue, StoredValue};

pub use memory::{MemoryStore, StoreStats};

/// One stored row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub identity: Identity,
    /// Concrete class of the object
    pub class: String,
    pub version: Option<i64>,
    pub values: Vec<StoredValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Insert,
    Update,
    Delete,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Insert => "insert",
            BatchKind::Update => "update",
            BatchKind::Delete => "delete",
        }
    }
}

pub trait StoreManager: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `find` may fetch the full row eagerly by identity
    fn supports_direct_lookup(&self) -> bool {
        true
    }

    /// # Errors
    ///
    /// Returns `Storage` on adapter failure. A missing row is `Ok(None)`.
    fn find_object(&self, ctx: ContextId, identity: &Identity) -> Result<Option<StoredObject>>;

    /// Rows in the same order as `identities`
    ///
    /// # Errors
    ///
    /// Returns `Storage` on adapter failure.
    fn find_objects(
        &self,
        ctx: ContextId,
        identities: &[Identity],
    ) -> Result<Vec<Option<StoredObject>>> {
        identities
            .iter()
            .map(|identity| self.find_object(ctx, identity))
            .collect()
    }

    /// Row of `class` whose `fields` hold `values`
    ///
    /// # Errors
    ///
    /// Returns `Storage` on adapter failure.
    fn find_unique(
        &self,
        ctx: ContextId,
        class: &str,
        fields: &[usize],
        values: &[KeyValue],
    ) -> Result<Option<StoredObject>>;

    /// Concrete class of the row, if it is one of `candidates`
    ///
    /// # Errors
    ///
    /// Returns `Storage` on adapter failure.
    fn class_for_identity(
        &self,
        ctx: ContextId,
        identity: &Identity,
        candidates: &[String],
    ) -> Result<Option<String>> {
        Ok(self
            .find_object(ctx, identity)?
            .map(|row| row.class)
            .filter(|class| candidates.iter().any(|c| c == class)))
    }

    /// # Errors
    ///
    /// Returns `Storage` on adapter failure.
    fn batch_start(&self, _ctx: ContextId, _kind: BatchKind) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Storage` on adapter failure.
    fn batch_end(&self, _ctx: ContextId, _kind: BatchKind) -> Result<()> {
        Ok(())
    }

    /// Insert a row; returns the storage-assigned identity when the row's
    /// identity was temporary
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the identity already exists.
    fn insert(&self, ctx: ContextId, object: &StoredObject) -> Result<Option<Identity>>;

    /// Update some fields, checking `expected_version` when given
    ///
    /// # Errors
    ///
    /// Returns `OptimisticConflict` on a version mismatch and `ObjectNotFound`
    /// if the row is gone.
    fn update(
        &self,
        ctx: ContextId,
        identity: &Identity,
        fields: &[(usize, StoredValue)],
        expected_version: Option<i64>,
        new_version: Option<i64>,
    ) -> Result<()>;

    /// # Errors
    ///
    /// Returns `OptimisticConflict` on a version mismatch.
    fn delete(
        &self,
        ctx: ContextId,
        identity: &Identity,
        expected_version: Option<i64>,
    ) -> Result<()>;

    /// # Errors
    ///
    /// Returns `Storage` if a transaction is already open for `ctx`.
    fn begin(&self, ctx: ContextId) -> Result<()>;

    /// # Errors
    ///
    /// Returns `Storage` if the writes cannot be made durable.
    fn commit(&self, ctx: ContextId) -> Result<()>;

    /// # Errors
    ///
    /// Returns `Storage` on adapter failure.
    fn rollback(&self, ctx: ContextId) -> Result<()>;
}
