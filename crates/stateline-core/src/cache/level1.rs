use lru::LruCache;
use std::collections::HashMap;

use crate::config::L1CacheKind;
use crate::errors::{Result, StatelineError};
use crate::model::{Identity, ObjectRef, UniqueKey};

/// Session-scoped identity → object cache with a unique-key index
///
/// Entries live in an unbounded LRU list; the capacity of the `Lru` policy
/// is enforced by [`evict_overflow`](Self::evict_overflow) so that entries
/// pinned by the transaction are never dropped.
pub struct Level1Cache {
    kind: L1CacheKind,
    entries: LruCache<Identity, ObjectRef>,
    unique: HashMap<UniqueKey, ObjectRef>,
    unique_by_object: HashMap<ObjectRef, Vec<UniqueKey>>,
}

impl Level1Cache {
    pub fn new(kind: L1CacheKind) -> Self {
        Self {
            kind,
            entries: LruCache::unbounded(),
            unique: HashMap::new(),
            unique_by_object: HashMap::new(),
        }
    }

    pub fn kind(&self) -> L1CacheKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: L1CacheKind) {
        self.kind = kind;
    }

    /// Look up and mark as recently used
    pub fn get(&mut self, identity: &Identity) -> Option<ObjectRef> {
        self.entries.get(identity).copied()
    }

    pub fn peek(&self, identity: &Identity) -> Option<ObjectRef> {
        self.entries.peek(identity).copied()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains(identity)
    }

    /// # Errors
    ///
    /// Returns `DuplicateTracker` if another object is cached under `identity`.
    pub fn put(&mut self, identity: Identity, obj: ObjectRef) -> Result<()> {
        if let Some(existing) = self.entries.peek(&identity) {
            if *existing != obj {
                return Err(StatelineError::DuplicateTracker {
                    identity: identity.to_string(),
                });
            }
        }
        self.entries.put(identity, obj);
        Ok(())
    }

    /// Replace the unique-key entries of `obj`
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTracker` if another cached object holds one of the keys.
    pub fn index_unique(&mut self, obj: ObjectRef, keys: Vec<UniqueKey>) -> Result<()> {
        for key in &keys {
            if let Some(other) = self.unique.get(key) {
                if *other != obj {
                    return Err(StatelineError::DuplicateTracker {
                        identity: key.to_string(),
                    });
                }
            }
        }
        self.unindex_unique(obj);
        for key in &keys {
            self.unique.insert(key.clone(), obj);
        }
        if !keys.is_empty() {
            self.unique_by_object.insert(obj, keys);
        }
        Ok(())
    }

    fn unindex_unique(&mut self, obj: ObjectRef) {
        if let Some(keys) = self.unique_by_object.remove(&obj) {
            for key in keys {
                self.unique.remove(&key);
            }
        }
    }

    pub fn get_unique(&self, key: &UniqueKey) -> Option<ObjectRef> {
        self.unique.get(key).copied()
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<ObjectRef> {
        let obj = self.entries.pop(identity)?;
        self.unindex_unique(obj);
        Some(obj)
    }

    /// Move the entry for `old` to `new`, keeping its unique keys
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTracker` if `new` is held by another object; the
    /// entry under `old` is left in place.
    pub fn replace_identity(&mut self, old: &Identity, new: Identity) -> Result<()> {
        let Some(obj) = self.entries.peek(old).copied() else {
            return Ok(());
        };
        if let Some(existing) = self.entries.peek(&new) {
            if *existing != obj {
                return Err(StatelineError::DuplicateTracker {
                    identity: new.to_string(),
                });
            }
        }
        self.entries.pop(old);
        self.entries.put(new, obj);
        Ok(())
    }

    /// Drop least-recently-used entries beyond the capacity
    ///
    /// Pinned entries are skipped. Returns the dropped handles.
    pub fn evict_overflow(&mut self, pinned: impl Fn(ObjectRef) -> bool) -> Vec<ObjectRef> {
        let L1CacheKind::Lru { capacity } = self.kind else {
            return Vec::new();
        };
        let excess = self.entries.len().saturating_sub(capacity);
        if excess == 0 {
            return Vec::new();
        }
        let victims: Vec<Identity> = self
            .entries
            .iter()
            .rev()
            .filter(|(_, obj)| !pinned(**obj))
            .take(excess)
            .map(|(identity, _)| identity.clone())
            .collect();
        victims
            .iter()
            .filter_map(|identity| self.remove(identity))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached handles, most recently used first
    pub fn objects(&self) -> Vec<ObjectRef> {
        self.entries.iter().map(|(_, obj)| *obj).collect()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn clear(&mut self) -> Vec<ObjectRef> {
        let objects = self.objects();
        self.entries.clear();
        self.unique.clear();
        self.unique_by_object.clear();
        objects
    }
}
