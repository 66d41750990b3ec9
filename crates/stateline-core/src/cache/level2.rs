//! Process-wide L2 cache backends
//!
//! One capability interface, a closed set of built-ins and a registry for
//! externally supplied backends. Every backend is internally synchronized
//! because contexts read and write it independently of each other.

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::errors::{Result, StatelineError};
use crate::model::{FieldBitSet, Identity, StoredValue, UniqueKey};

/// Immutable snapshot of a persistent object
#[derive(Debug, Clone, PartialEq)]
pub struct CachedObject {
    pub class: String,
    pub identity: Identity,
    pub version: Option<i64>,
    pub values: Vec<StoredValue>,
    pub loaded: FieldBitSet,
}

impl CachedObject {
    /// Slot used for the version in change diffs
    pub fn version_slot(&self) -> usize {
        self.values.len()
    }

    /// Fields of `newer` that differ from this entry, plus the version slot
    /// when the versions differ
    pub fn diff(&self, newer: &CachedObject) -> FieldBitSet {
        if self.class != newer.class || self.values.len() != newer.values.len() {
            let mut all = FieldBitSet::with_all(newer.values.len());
            all.insert(newer.version_slot());
            return all;
        }
        let mut changed: FieldBitSet = newer
            .loaded
            .iter()
            .filter(|&field| !self.loaded.contains(field) || self.values[field] != newer.values[field])
            .collect();
        if self.version != newer.version {
            changed.insert(newer.version_slot());
        }
        changed
    }

    /// This entry with the `changed` fields of `newer` applied
    pub fn apply(&self, newer: &CachedObject, changed: &FieldBitSet) -> CachedObject {
        if self.class != newer.class || self.values.len() != newer.values.len() {
            return newer.clone();
        }
        let mut merged = self.clone();
        for field in changed.iter() {
            if field == newer.version_slot() {
                merged.version = newer.version;
            } else if let Some(value) = newer.values.get(field) {
                merged.values[field] = value.clone();
                merged.loaded.insert(field);
            }
        }
        merged
    }
}

pub trait Level2Cache: Send + Sync {
    fn name(&self) -> &str;
    fn get(&self, identity: &Identity) -> Option<Arc<CachedObject>>;
    fn get_all(&self, identities: &[Identity]) -> HashMap<Identity, Arc<CachedObject>> {
        identities
            .iter()
            .filter_map(|id| self.get(id).map(|entry| (id.clone(), entry)))
            .collect()
    }
    fn put(&self, identity: Identity, entry: Arc<CachedObject>);
    fn put_all(&self, entries: Vec<(Identity, Arc<CachedObject>)>) {
        for (identity, entry) in entries {
            self.put(identity, entry);
        }
    }
    fn evict(&self, identity: &Identity);
    fn evict_all(&self);
    /// Drop entries whose concrete class is `class`
    fn evict_class(&self, class: &str);
    fn contains(&self, identity: &Identity) -> bool;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get_unique(&self, key: &UniqueKey) -> Option<Identity>;
    fn put_unique(&self, key: UniqueKey, identity: Identity);
    fn put_unique_all(&self, entries: Vec<(UniqueKey, Identity)>) {
        for (key, identity) in entries {
            self.put_unique(key, identity);
        }
    }
    fn remove_unique(&self, key: &UniqueKey);
}

/// Backend that stores nothing
#[derive(Debug, Default)]
pub struct NullLevel2Cache;

impl Level2Cache for NullLevel2Cache {
    fn name(&self) -> &str {
        "none"
    }
    fn get(&self, _identity: &Identity) -> Option<Arc<CachedObject>> {
        None
    }
    fn put(&self, _identity: Identity, _entry: Arc<CachedObject>) {}
    fn evict(&self, _identity: &Identity) {}
    fn evict_all(&self) {}
    fn evict_class(&self, _class: &str) {}
    fn contains(&self, _identity: &Identity) -> bool {
        false
    }
    fn len(&self) -> usize {
        0
    }
    fn get_unique(&self, _key: &UniqueKey) -> Option<Identity> {
        None
    }
    fn put_unique(&self, _key: UniqueKey, _identity: Identity) {}
    fn remove_unique(&self, _key: &UniqueKey) {}
}

/// Unbounded backend over a read/write-locked map
#[derive(Debug, Default)]
pub struct SharedLevel2Cache {
    entries: RwLock<HashMap<Identity, Arc<CachedObject>>>,
    unique: RwLock<HashMap<UniqueKey, Identity>>,
}

impl SharedLevel2Cache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Level2Cache for SharedLevel2Cache {
    fn name(&self) -> &str {
        "strong"
    }

    fn get(&self, identity: &Identity) -> Option<Arc<CachedObject>> {
        self.entries.read().get(identity).cloned()
    }

    fn get_all(&self, identities: &[Identity]) -> HashMap<Identity, Arc<CachedObject>> {
        let entries = self.entries.read();
        identities
            .iter()
            .filter_map(|id| entries.get(id).map(|entry| (id.clone(), Arc::clone(entry))))
            .collect()
    }

    fn put(&self, identity: Identity, entry: Arc<CachedObject>) {
        self.entries.write().insert(identity, entry);
    }

    fn put_all(&self, entries: Vec<(Identity, Arc<CachedObject>)>) {
        let mut map = self.entries.write();
        map.extend(entries);
    }

    fn evict(&self, identity: &Identity) {
        self.entries.write().remove(identity);
        self.unique.write().retain(|_, id| id != identity);
    }

    fn evict_all(&self) {
        self.entries.write().clear();
        self.unique.write().clear();
    }

    fn evict_class(&self, class: &str) {
        let mut removed = Vec::new();
        self.entries.write().retain(|id, entry| {
            let keep = entry.class != class;
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        self.unique.write().retain(|_, id| !removed.contains(id));
    }

    fn contains(&self, identity: &Identity) -> bool {
        self.entries.read().contains_key(identity)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn get_unique(&self, key: &UniqueKey) -> Option<Identity> {
        self.unique.read().get(key).cloned()
    }

    fn put_unique(&self, key: UniqueKey, identity: Identity) {
        self.unique.write().insert(key, identity);
    }

    fn remove_unique(&self, key: &UniqueKey) {
        self.unique.write().remove(key);
    }
}

/// Bounded backend evicting the least recently used entry
pub struct LruLevel2Cache {
    entries: Mutex<LruCache<Identity, Arc<CachedObject>>>,
    unique: RwLock<HashMap<UniqueKey, Identity>>,
}

impl LruLevel2Cache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            unique: RwLock::new(HashMap::new()),
        }
    }
}

impl Level2Cache for LruLevel2Cache {
    fn name(&self) -> &str {
        "lru"
    }

    fn get(&self, identity: &Identity) -> Option<Arc<CachedObject>> {
        self.entries.lock().get(identity).cloned()
    }

    fn put(&self, identity: Identity, entry: Arc<CachedObject>) {
        if let Some((dropped, _)) = self.entries.lock().push(identity.clone(), entry) {
            if dropped != identity {
                self.unique.write().retain(|_, id| *id != dropped);
            }
        }
    }

    fn evict(&self, identity: &Identity) {
        self.entries.lock().pop(identity);
        self.unique.write().retain(|_, id| id != identity);
    }

    fn evict_all(&self) {
        self.entries.lock().clear();
        self.unique.write().clear();
    }

    fn evict_class(&self, class: &str) {
        let mut entries = self.entries.lock();
        let doomed: Vec<Identity> = entries
            .iter()
            .filter(|(_, entry)| entry.class == class)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            entries.pop(id);
        }
        drop(entries);
        self.unique.write().retain(|_, id| !doomed.contains(id));
    }

    fn contains(&self, identity: &Identity) -> bool {
        self.entries.lock().contains(identity)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn get_unique(&self, key: &UniqueKey) -> Option<Identity> {
        self.unique.read().get(key).cloned()
    }

    fn put_unique(&self, key: UniqueKey, identity: Identity) {
        self.unique.write().insert(key, identity);
    }

    fn remove_unique(&self, key: &UniqueKey) {
        self.unique.write().remove(key);
    }
}

type BackendFactory = Box<dyn Fn(NonZeroUsize) -> Arc<dyn Level2Cache> + Send + Sync>;

/// Named L2 backends; built-ins are `strong`, `lru` and `none`
pub struct Level2CacheRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl Default for Level2CacheRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Level2CacheRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("strong", |_| Arc::new(SharedLevel2Cache::new()));
        registry.register("lru", |capacity| Arc::new(LruLevel2Cache::new(capacity)));
        registry.register("none", |_| Arc::new(NullLevel2Cache));
        registry
    }

    /// Register or replace a backend factory
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(NonZeroUsize) -> Arc<dyn Level2Cache> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` for unknown names or a zero capacity.
    pub fn create(&self, name: &str, capacity: usize) -> Result<Arc<dyn Level2Cache>> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| StatelineError::InvalidConfig {
            reason: "l2 capacity must be at least 1".to_string(),
        })?;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StatelineError::InvalidConfig {
                reason: format!("unknown l2 cache backend '{}'", name),
            })?;
        Ok(factory(capacity))
    }
}
