//! In-memory reference storage adapter
//!
//! Committed rows live in one map; each context with an open transaction
//! writes to a private overlay that is merged on commit and dropped on
//! rollback, so other contexts only ever read committed rows.

use parking_lot::Mutex;
use stateline_core_types::ContextId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::errors::{Result, StatelineError};
use crate::model::{Identity, KeyValue, StoredValue};
use crate::storage::{BatchKind, StoreManager, StoredObject};

/// Operation counters, for assertions on storage traffic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub finds: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub batches: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl StoreStats {
    /// Number of row writes
    pub fn writes(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

type Overlay = HashMap<Identity, Option<StoredObject>>;

#[derive(Default)]
struct Inner {
    rows: HashMap<Identity, StoredObject>,
    transactions: HashMap<ContextId, Overlay>,
    stats: StoreStats,
}

impl Inner {
    fn visible(&self, ctx: ContextId, identity: &Identity) -> Option<&StoredObject> {
        match self.transactions.get(&ctx).and_then(|o| o.get(identity)) {
            Some(entry) => entry.as_ref(),
            None => self.rows.get(identity),
        }
    }

    fn write(&mut self, ctx: ContextId, identity: Identity, row: Option<StoredObject>) {
        match self.transactions.get_mut(&ctx) {
            Some(overlay) => {
                overlay.insert(identity, row);
            }
            None => match row {
                Some(row) => {
                    self.rows.insert(identity, row);
                }
                None => {
                    self.rows.remove(&identity);
                }
            },
        }
    }

    fn check_version(
        &self,
        ctx: ContextId,
        identity: &Identity,
        expected: Option<i64>,
    ) -> Result<StoredObject> {
        let row = self
            .visible(ctx, identity)
            .cloned()
            .ok_or_else(|| StatelineError::ObjectNotFound {
                identity: identity.to_string(),
            })?;
        if expected.is_some() && row.version != expected {
            return Err(StatelineError::OptimisticConflict {
                identity: identity.to_string(),
                expected,
                actual: row.version,
            });
        }
        Ok(row)
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_surrogate: AtomicU64,
    direct_lookup: AtomicBool,
    fail_next_commit: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_surrogate: AtomicU64::new(1),
            direct_lookup: AtomicBool::new(true),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    pub fn set_direct_lookup(&self, enabled: bool) {
        self.direct_lookup.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `commit` fail with a storage error
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Simulate a concurrent writer bumping a committed row's version
    pub fn bump_version(&self, identity: &Identity) -> bool {
        let mut inner = self.inner.lock();
        match inner.rows.get_mut(identity) {
            Some(row) => {
                row.version = Some(row.version.unwrap_or(0) + 1);
                true
            }
            None => false,
        }
    }

    /// Committed row, bypassing any open transaction
    pub fn committed(&self, identity: &Identity) -> Option<StoredObject> {
        self.inner.lock().rows.get(identity).cloned()
    }

    pub fn committed_len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    /// Committed rows of one class
    pub fn committed_of_class(&self, class: &str) -> Vec<StoredObject> {
        let inner = self.inner.lock();
        let mut rows: Vec<StoredObject> = inner
            .rows
            .values()
            .filter(|row| row.class == class)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.identity.cmp(&b.identity));
        rows
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = StoreStats::default();
    }
}

impl StoreManager for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports_direct_lookup(&self) -> bool {
        self.direct_lookup.load(Ordering::SeqCst)
    }

    fn find_object(&self, ctx: ContextId, identity: &Identity) -> Result<Option<StoredObject>> {
        let mut inner = self.inner.lock();
        inner.stats.finds += 1;
        Ok(inner.visible(ctx, identity).cloned())
    }

    fn find_objects(
        &self,
        ctx: ContextId,
        identities: &[Identity],
    ) -> Result<Vec<Option<StoredObject>>> {
        let mut inner = self.inner.lock();
        inner.stats.finds += 1;
        Ok(identities
            .iter()
            .map(|identity| inner.visible(ctx, identity).cloned())
            .collect())
    }

    fn find_unique(
        &self,
        ctx: ContextId,
        class: &str,
        fields: &[usize],
        values: &[KeyValue],
    ) -> Result<Option<StoredObject>> {
        let mut inner = self.inner.lock();
        inner.stats.finds += 1;
        let matches = |row: &StoredObject| {
            row.class == class
                && fields.iter().zip(values).all(|(field, expected)| {
                    row.values.get(*field).and_then(StoredValue::as_key).as_ref() == Some(expected)
                })
        };

        let overlay = inner.transactions.get(&ctx);
        if let Some(overlay) = overlay {
            if let Some(row) = overlay.values().flatten().find(|row| matches(*row)) {
                return Ok(Some(row.clone()));
            }
        }
        Ok(inner
            .rows
            .values()
            .filter(|row| overlay.map_or(true, |o| !o.contains_key(&row.identity)))
            .find(|row| matches(*row))
            .cloned())
    }

    fn batch_start(&self, _ctx: ContextId, _kind: BatchKind) -> Result<()> {
        self.inner.lock().stats.batches += 1;
        Ok(())
    }

    fn insert(&self, ctx: ContextId, object: &StoredObject) -> Result<Option<Identity>> {
        let mut inner = self.inner.lock();
        inner.stats.inserts += 1;

        let assigned = match &object.identity {
            Identity::Temporary { class, .. } => Some(Identity::datastore(
                class.clone(),
                self.next_surrogate.fetch_add(1, Ordering::SeqCst),
            )),
            _ => None,
        };
        let identity = assigned.clone().unwrap_or_else(|| object.identity.clone());
        if inner.visible(ctx, &identity).is_some() {
            return Err(StatelineError::storage(
                "insert",
                format!("duplicate identity {}", identity),
            ));
        }

        let row = StoredObject {
            identity: identity.clone(),
            ..object.clone()
        };
        inner.write(ctx, identity, Some(row));
        Ok(assigned)
    }

    fn update(
        &self,
        ctx: ContextId,
        identity: &Identity,
        fields: &[(usize, StoredValue)],
        expected_version: Option<i64>,
        new_version: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stats.updates += 1;

        let mut row = inner.check_version(ctx, identity, expected_version)?;
        for (field, value) in fields {
            if *field >= row.values.len() {
                row.values.resize(field + 1, StoredValue::Null);
            }
            row.values[*field] = value.clone();
        }
        if new_version.is_some() {
            row.version = new_version;
        }
        inner.write(ctx, identity.clone(), Some(row));
        Ok(())
    }

    fn delete(
        &self,
        ctx: ContextId,
        identity: &Identity,
        expected_version: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stats.deletes += 1;
        inner.check_version(ctx, identity, expected_version)?;
        inner.write(ctx, identity.clone(), None);
        Ok(())
    }

    fn begin(&self, ctx: ContextId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.transactions.contains_key(&ctx) {
            return Err(StatelineError::storage(
                "begin",
                format!("transaction already open for {}", ctx),
            ));
        }
        inner.transactions.insert(ctx, Overlay::new());
        Ok(())
    }

    fn commit(&self, ctx: ContextId) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StatelineError::storage("commit", "injected commit failure"));
        }
        let mut inner = self.inner.lock();
        inner.stats.commits += 1;
        let overlay = inner.transactions.remove(&ctx).unwrap_or_default();
        for (identity, row) in overlay {
            match row {
                Some(row) => {
                    inner.rows.insert(identity, row);
                }
                None => {
                    inner.rows.remove(&identity);
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, ctx: ContextId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.stats.rollbacks += 1;
        inner.transactions.remove(&ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(identity: Identity, name: &str) -> StoredObject {
        StoredObject {
            identity,
            class: "Person".into(),
            version: Some(1),
            values: vec![StoredValue::Text(name.into())],
        }
    }

    #[test]
    fn test_temporary_insert_assigns_surrogate() {
        let store = MemoryStore::new();
        let ctx = ContextId::from_raw(1);
        let assigned = store
            .insert(ctx, &row(Identity::temporary("Person"), "Ann"))
            .unwrap()
            .unwrap();
        assert!(matches!(assigned, Identity::Datastore { .. }));
        assert!(store.committed(&assigned).is_some());
    }

    #[test]
    fn test_overlay_is_private_until_commit() {
        let store = MemoryStore::new();
        let writer = ContextId::from_raw(1);
        let reader = ContextId::from_raw(2);
        let id = Identity::single("Person", 1);

        store.begin(writer).unwrap();
        store.insert(writer, &row(id.clone(), "Ann")).unwrap();
        assert!(store.find_object(writer, &id).unwrap().is_some());
        assert!(store.find_object(reader, &id).unwrap().is_none());

        store.commit(writer).unwrap();
        assert!(store.find_object(reader, &id).unwrap().is_some());
    }

    #[test]
    fn test_rollback_discards_overlay() {
        let store = MemoryStore::new();
        let ctx = ContextId::from_raw(1);
        let id = Identity::single("Person", 1);

        store.begin(ctx).unwrap();
        store.insert(ctx, &row(id.clone(), "Ann")).unwrap();
        store.rollback(ctx).unwrap();
        assert!(store.find_object(ctx, &id).unwrap().is_none());
    }

    #[test]
    fn test_version_mismatch_is_conflict() {
        let store = MemoryStore::new();
        let ctx = ContextId::from_raw(1);
        let id = Identity::single("Person", 1);
        store.insert(ctx, &row(id.clone(), "Ann")).unwrap();
        store.bump_version(&id);

        let err = store
            .update(ctx, &id, &[(0, StoredValue::Text("Bob".into()))], Some(1), Some(2))
            .unwrap_err();
        assert!(err.is_optimistic());
        assert_eq!(store.committed(&id).unwrap().version, Some(2));
    }

    #[test]
    fn test_injected_commit_failure_fires_once() {
        let store = MemoryStore::new();
        let ctx = ContextId::from_raw(1);
        store.begin(ctx).unwrap();
        store.fail_next_commit();
        assert!(store.commit(ctx).is_err());
        assert!(store.commit(ctx).is_ok());
    }

    #[test]
    fn test_find_unique_matches_key_fields() {
        let store = MemoryStore::new();
        let ctx = ContextId::from_raw(1);
        store
            .insert(ctx, &row(Identity::single("Person", 1), "Ann"))
            .unwrap();
        let found = store
            .find_unique(ctx, "Person", &[0], &[KeyValue::Text("Ann".into())])
            .unwrap();
        assert_eq!(found.unwrap().identity, Identity::single("Person", 1));
        assert!(store
            .find_unique(ctx, "Person", &[0], &[KeyValue::Text("Zed".into())])
            .unwrap()
            .is_none());
    }
}
