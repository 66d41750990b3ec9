use std::sync::Arc;
use tracing::{debug, trace};

use crate::cache::{CachedObject, Level1Cache, Level2Cache};
use crate::config::{CacheMode, L1CacheKind};
use crate::model::{Identity, UniqueKey};

/// Counters for L2 write traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L2WriteStats {
    pub puts: u64,
    /// Incremental writes skipped because nothing changed
    pub skipped: u64,
    pub batches: u64,
}

/// Owns the L1 cache and mediates access to the shared L2
pub struct CacheCoordinator {
    l1: Level1Cache,
    l2: Arc<dyn Level2Cache>,
    retrieve_mode: CacheMode,
    store_mode: CacheMode,
    batch_size: usize,
    batch: Option<Vec<(Identity, Arc<CachedObject>)>>,
    stats: L2WriteStats,
}

impl CacheCoordinator {
    pub fn new(
        l1_kind: L1CacheKind,
        l2: Arc<dyn Level2Cache>,
        retrieve_mode: CacheMode,
        store_mode: CacheMode,
        batch_size: usize,
    ) -> Self {
        Self {
            l1: Level1Cache::new(l1_kind),
            l2,
            retrieve_mode,
            store_mode,
            batch_size: batch_size.max(1),
            batch: None,
            stats: L2WriteStats::default(),
        }
    }

    pub fn l1(&self) -> &Level1Cache {
        &self.l1
    }

    pub fn l1_mut(&mut self) -> &mut Level1Cache {
        &mut self.l1
    }

    pub fn l2(&self) -> &Arc<dyn Level2Cache> {
        &self.l2
    }

    pub fn retrieve_mode(&self) -> CacheMode {
        self.retrieve_mode
    }

    pub fn set_retrieve_mode(&mut self, mode: CacheMode) {
        self.retrieve_mode = mode;
    }

    pub fn store_mode(&self) -> CacheMode {
        self.store_mode
    }

    pub fn set_store_mode(&mut self, mode: CacheMode) {
        self.store_mode = mode;
    }

    pub fn stats(&self) -> L2WriteStats {
        self.stats
    }

    pub fn l2_get(&self, identity: &Identity) -> Option<Arc<CachedObject>> {
        if self.retrieve_mode == CacheMode::Bypass {
            return None;
        }
        self.l2.get(identity)
    }

    pub fn l2_get_unique(&self, key: &UniqueKey) -> Option<Identity> {
        if self.retrieve_mode == CacheMode::Bypass {
            return None;
        }
        self.l2.get_unique(key)
    }

    /// Write an entry incrementally
    ///
    /// Only the fields that differ from the current entry are applied; an
    /// entry with no changes is not written. Returns whether a write was
    /// issued or queued.
    pub fn l2_store(&mut self, entry: CachedObject) -> bool {
        if self.store_mode == CacheMode::Bypass {
            return false;
        }
        let identity = entry.identity.clone();
        let pending = self
            .batch
            .as_ref()
            .and_then(|batch| batch.iter().rev().find(|(id, _)| *id == identity))
            .map(|(_, e)| Arc::clone(e));
        let entry = match pending.or_else(|| self.l2.get(&identity)) {
            Some(existing) => {
                let changed = existing.diff(&entry);
                if changed.is_empty() {
                    trace!(identity = %identity, "l2 entry unchanged, write skipped");
                    self.stats.skipped += 1;
                    return false;
                }
                trace!(identity = %identity, changed = changed.len(), "l2 incremental write");
                existing.apply(&entry, &changed)
            }
            None => entry,
        };

        self.stats.puts += 1;
        let entry = Arc::new(entry);
        match self.batch.as_mut() {
            Some(batch) => {
                batch.push((identity, entry));
                if batch.len() >= self.batch_size {
                    self.flush_batch();
                }
            }
            None => self.l2.put(identity, entry),
        }
        true
    }

    pub fn l2_store_unique(&mut self, keys: Vec<(UniqueKey, Identity)>) {
        if self.store_mode == CacheMode::Bypass || keys.is_empty() {
            return;
        }
        self.l2.put_unique_all(keys);
    }

    pub fn l2_evict(&self, identity: &Identity) {
        self.l2.evict(identity);
    }

    pub fn begin_l2_batch(&mut self) {
        if self.batch.is_none() {
            self.batch = Some(Vec::with_capacity(self.batch_size));
        }
    }

    pub fn end_l2_batch(&mut self) {
        self.flush_batch();
        self.batch = None;
    }

    fn flush_batch(&mut self) {
        let Some(batch) = self.batch.as_mut() else {
            return;
        };
        if batch.is_empty() {
            return;
        }
        let entries = std::mem::take(batch);
        debug!(entries = entries.len(), "l2 batch write");
        self.stats.batches += 1;
        self.l2.put_all(entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SharedLevel2Cache;
    use crate::model::{FieldBitSet, StoredValue};

    fn entry(id: u64, name: &str) -> CachedObject {
        CachedObject {
            class: "Person".into(),
            identity: Identity::datastore("Person", id),
            version: Some(1),
            values: vec![StoredValue::Text(name.into())],
            loaded: FieldBitSet::with_all(1),
        }
    }

    fn coordinator(batch_size: usize) -> (CacheCoordinator, Arc<SharedLevel2Cache>) {
        let l2 = Arc::new(SharedLevel2Cache::new());
        let coordinator = CacheCoordinator::new(
            L1CacheKind::Strong,
            l2.clone(),
            CacheMode::Use,
            CacheMode::Use,
            batch_size,
        );
        (coordinator, l2)
    }

    #[test]
    fn test_unchanged_entry_is_skipped() {
        let (mut cc, _) = coordinator(10);
        assert!(cc.l2_store(entry(1, "Ann")));
        assert!(!cc.l2_store(entry(1, "Ann")));
        assert!(cc.l2_store(entry(1, "Bea")));
        assert_eq!(cc.stats().puts, 2);
        assert_eq!(cc.stats().skipped, 1);
    }

    #[test]
    fn test_batch_chunks_by_size() {
        let (mut cc, l2) = coordinator(2);
        cc.begin_l2_batch();
        cc.l2_store(entry(1, "a"));
        assert_eq!(l2.len(), 0);
        cc.l2_store(entry(2, "b"));
        assert_eq!(l2.len(), 2);
        cc.l2_store(entry(3, "c"));
        assert_eq!(l2.len(), 2);
        cc.end_l2_batch();
        assert_eq!(l2.len(), 3);
        assert_eq!(cc.stats().batches, 2);
    }

    #[test]
    fn test_bypass_modes() {
        let (mut cc, l2) = coordinator(10);
        cc.set_store_mode(CacheMode::Bypass);
        assert!(!cc.l2_store(entry(1, "Ann")));
        assert!(l2.is_empty());

        cc.set_store_mode(CacheMode::Use);
        cc.l2_store(entry(1, "Ann"));
        cc.set_retrieve_mode(CacheMode::Bypass);
        assert!(cc.l2_get(&Identity::datastore("Person", 1)).is_none());
        assert!(l2.contains(&Identity::datastore("Person", 1)));
    }
}
