//! Lookup by identity and by unique key
//!
//! Order: L1, then L2, then a direct storage lookup, then inheritance
//! resolution and finally a hollow object that loads on first access.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::cache::CachedObject;
use crate::config::CacheMode;
use crate::context::ExecutionContext;
use crate::errors::{Result, StatelineError};
use crate::model::{Identity, KeyValue, ObjectRef, UniqueKey};
use crate::storage::StoredObject;
use crate::{log_op_end, log_op_error, log_op_start};

impl ExecutionContext {
    /// Find the object with `identity`
    ///
    /// With `validate`, an object not known to exist is checked against
    /// storage; a missing row removes it from L1 and fails. With
    /// `check_inheritance`, storage is asked for the concrete subclass when
    /// the identity names a class with subclasses. `known_class` skips that
    /// resolution.
    ///
    /// # Errors
    ///
    /// Returns `ClassNotPersistable`, `InvalidIdentity` when `known_class`
    /// does not fit the identity, `ObjectNotFound` when validation fails, or
    /// storage errors.
    pub fn find_by_identity(
        &mut self,
        identity: &Identity,
        validate: bool,
        check_inheritance: bool,
        known_class: Option<&str>,
    ) -> Result<ObjectRef> {
        self.ensure_open()?;
        log_op_start!(
            "find",
            context_id = self.id.as_u64(),
            identity = %identity,
            validate = validate
        );
        let start = Instant::now();
        let obj = self
            .find_internal(identity, validate, check_inheritance, known_class)
            .map_err(|e| {
                log_op_error!(
                    "find",
                    &e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    identity = %identity
                );
                e
            })?;
        self.evict_l1_overflow();
        log_op_end!("find", duration_ms = start.elapsed().as_millis() as u64);
        Ok(obj)
    }

    pub(crate) fn find_internal(
        &mut self,
        identity: &Identity,
        validate: bool,
        check_inheritance: bool,
        known_class: Option<&str>,
    ) -> Result<ObjectRef> {
        let requested = identity.class().to_string();
        self.metadata.class(&requested)?;
        if let Some(known) = known_class {
            self.metadata.class(known)?;
            if !self.metadata.is_assignable(known, &requested) {
                return Err(StatelineError::InvalidIdentity {
                    reason: format!("{} is not a subclass of {}", known, requested),
                });
            }
        }
        let id = self.normalize(identity)?;

        if let Some(obj) = self.cache.l1_mut().get(&id) {
            trace!(identity = %id, "l1 hit");
            if validate {
                self.validate_cached(obj, &id)?;
            }
            return Ok(obj);
        }
        if id.is_temporary() {
            return Err(StatelineError::InvalidIdentity {
                reason: format!("temporary identity {} is not managed here", id),
            });
        }

        if !self.pending_l2.contains(&id) {
            if let Some(entry) = self.cache.l2_get(&id) {
                trace!(identity = %id, "l2 hit");
                let obj = self.materialize_cached(&entry)?;
                if validate {
                    self.validate_cached(obj, &id)?;
                }
                return Ok(obj);
            }
        }

        if self.store.supports_direct_lookup() {
            match self.store.find_object(self.id, &id)? {
                Some(row) => return self.materialize_row(row),
                None if validate => {
                    return Err(StatelineError::ObjectNotFound {
                        identity: id.to_string(),
                    })
                }
                None => debug!(identity = %id, "direct lookup missed, creating hollow object"),
            }
        }

        let class = match known_class {
            Some(known) => known.to_string(),
            None if check_inheritance => self.resolve_class(&id, &requested),
            None => requested,
        };
        let meta = Arc::clone(self.metadata.class(&class)?);
        let obj = self.alloc(self.trackers.new_hollow(&meta, id.clone()));
        if let Err(e) = self.cache.l1_mut().put(id.clone(), obj) {
            self.release(obj);
            return Err(e);
        }
        if validate {
            match self.store.find_object(self.id, &id)? {
                Some(row) => self.load_row(obj, &row)?,
                None => {
                    self.forget(obj);
                    self.release(obj);
                    return Err(StatelineError::ObjectNotFound {
                        identity: id.to_string(),
                    });
                }
            }
        }
        Ok(obj)
    }

    /// Concrete class for `id`, falling back to the requested class
    fn resolve_class(&self, id: &Identity, requested: &str) -> String {
        let subclasses = self.metadata.subclasses(requested);
        if subclasses.is_empty() {
            return requested.to_string();
        }
        let mut candidates = vec![requested.to_string()];
        candidates.extend(subclasses);
        match self.store.class_for_identity(self.id, id, &candidates) {
            Ok(Some(class)) => class,
            Ok(None) => requested.to_string(),
            Err(err) => {
                debug!(identity = %id, error = %err, "class resolution failed, retrying by row");
                match self.store.find_object(self.id, id) {
                    Ok(Some(row)) if candidates.contains(&row.class) => row.class,
                    _ => requested.to_string(),
                }
            }
        }
    }

    /// Handle for a stored reference without fetching the row
    ///
    /// Referenced objects come back hollow unless already in L1, so loading
    /// one row never pulls in the whole graph.
    pub(crate) fn resolve_reference(&mut self, identity: &Identity) -> Result<ObjectRef> {
        let id = self.normalize(identity)?;
        if let Some(obj) = self.cache.l1().peek(&id) {
            return Ok(obj);
        }
        let class = self.resolve_class(&id, id.class());
        let meta = Arc::clone(self.metadata.class(&class)?);
        let obj = self.alloc(self.trackers.new_hollow(&meta, id.clone()));
        if let Err(e) = self.cache.l1_mut().put(id, obj) {
            self.release(obj);
            return Err(e);
        }
        Ok(obj)
    }

    /// Check a cached object still exists in storage
    fn validate_cached(&mut self, obj: ObjectRef, id: &Identity) -> Result<()> {
        let tracker = self.tracker(obj)?;
        let state = tracker.lifecycle_state();
        if state.is_new() || state.is_deleted() {
            return Ok(());
        }
        let row = self.store.find_object(self.id, id)?;
        let stored_version = row.as_ref().map(|row| row.version);
        if let Err(err) = self.tracker_mut(obj)?.validate(stored_version) {
            if err.is_not_found() {
                debug!(identity = %id, "validated object is gone, dropping from l1");
                self.cache.l2_evict(id);
                self.forget(obj);
                self.release(obj);
            }
            return Err(err);
        }
        if let Some(row) = row {
            if self.tracker(obj)?.loaded_fields().is_empty() {
                self.load_row(obj, &row)?;
            }
        }
        Ok(())
    }

    /// Register a stored row as a managed object
    fn materialize_row(&mut self, row: StoredObject) -> Result<ObjectRef> {
        let meta = Arc::clone(self.metadata.class(&row.class)?);
        let id = self.normalize(&row.identity)?;
        if let Some(existing) = self.cache.l1().peek(&id) {
            return Ok(existing);
        }
        let obj = self.alloc(self.trackers.new_hollow(&meta, id.clone()));
        if let Err(e) = self.cache.l1_mut().put(id.clone(), obj) {
            self.release(obj);
            return Err(e);
        }
        self.load_row(obj, &row)?;

        if meta.cacheable && self.cache.store_mode() == CacheMode::Use {
            let loaded = crate::model::FieldBitSet::with_all(meta.field_count());
            let entry = CachedObject {
                class: row.class.clone(),
                identity: id.clone(),
                version: row.version,
                values: row.values.clone(),
                loaded,
            };
            if self.cache.l2_store(entry) && self.tx.is_active() {
                self.l2_written_in_tx.insert(id.clone());
            }
            let keys = self.unique_keys_of_row(&meta, &row.values)?;
            self.cache
                .l2_store_unique(keys.into_iter().map(|k| (k, id.clone())).collect());
        }
        Ok(obj)
    }

    /// Register an L2 entry as a managed object
    fn materialize_cached(&mut self, entry: &CachedObject) -> Result<ObjectRef> {
        let meta = Arc::clone(self.metadata.class(&entry.class)?);
        let id = self.normalize(&entry.identity)?;
        if let Some(existing) = self.cache.l1().peek(&id) {
            return Ok(existing);
        }
        let obj = self.alloc(self.trackers.new_hollow(&meta, id.clone()));
        if let Err(e) = self.cache.l1_mut().put(id, obj) {
            self.release(obj);
            return Err(e);
        }
        let mut values = Vec::new();
        for field in entry.loaded.iter() {
            if let Some(stored) = entry.values.get(field) {
                values.push((field, self.from_stored(stored)?));
            }
        }
        let tracker = self.tracker_mut(obj)?;
        tracker.load_fields(values);
        tracker.set_version(entry.version);
        self.index_unique_keys(obj)?;
        Ok(obj)
    }

    /// Load a stored row into a tracker
    ///
    /// The object is already in L1, so references back to it resolve to the
    /// same handle.
    fn load_row(&mut self, obj: ObjectRef, row: &StoredObject) -> Result<()> {
        let field_count = self.class_of(obj)?.field_count();
        let mut values = Vec::with_capacity(field_count);
        for (field, stored) in row.values.iter().enumerate().take(field_count) {
            values.push((field, self.from_stored(stored)?));
        }
        let tracker = self.tracker_mut(obj)?;
        tracker.load_fields(values);
        tracker.set_version(row.version);
        self.index_unique_keys(obj)
    }

    pub(crate) fn index_unique_keys(&mut self, obj: ObjectRef) -> Result<()> {
        let keys = self.unique_keys_of(obj)?;
        self.cache.l1_mut().index_unique(obj, keys)
    }

    /// Index `obj` under its unique keys unless another cached object
    /// already holds one of them
    pub(crate) fn try_index_unique_keys(&mut self, obj: ObjectRef) {
        if let Err(err) = self.index_unique_keys(obj) {
            debug!(object = %obj, error = %err, "unique key not indexed");
        }
    }

    /// Find several objects at once, preserving order
    ///
    /// L1 and L2 hits are served first; the rest are fetched from storage
    /// in one call. With `validate`, every identity must exist; the first
    /// missing one is removed from L1 and reported.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` for a missing identity under `validate`,
    /// `ClassNotPersistable`, or storage errors.
    pub fn find_objects_by_id(
        &mut self,
        identities: &[Identity],
        validate: bool,
    ) -> Result<Vec<ObjectRef>> {
        self.ensure_open()?;
        log_op_start!(
            "find_objects",
            context_id = self.id.as_u64(),
            count = identities.len(),
            validate = validate
        );
        let start = Instant::now();
        let result = self.find_objects_internal(identities, validate);
        let objects = result.map_err(|e| {
            log_op_error!(
                "find_objects",
                &e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;
        self.evict_l1_overflow();
        log_op_end!(
            "find_objects",
            duration_ms = start.elapsed().as_millis() as u64,
            count = objects.len()
        );
        Ok(objects)
    }

    fn find_objects_internal(
        &mut self,
        identities: &[Identity],
        validate: bool,
    ) -> Result<Vec<ObjectRef>> {
        let ids = identities
            .iter()
            .map(|id| self.normalize(id))
            .collect::<Result<Vec<_>>>()?;
        let mut found: Vec<Option<ObjectRef>> = vec![None; ids.len()];
        let mut to_validate = Vec::new();

        for (i, id) in ids.iter().enumerate() {
            if let Some(obj) = self.cache.l1_mut().get(id) {
                found[i] = Some(obj);
                if validate {
                    to_validate.push(i);
                }
            }
        }

        let misses: Vec<Identity> = ids
            .iter()
            .zip(&found)
            .filter(|(id, obj)| obj.is_none() && !self.pending_l2.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        if !misses.is_empty() && self.cache.retrieve_mode() == CacheMode::Use {
            let hits = self.cache.l2().get_all(&misses);
            for (i, id) in ids.iter().enumerate() {
                if found[i].is_some() {
                    continue;
                }
                if let Some(entry) = hits.get(id) {
                    found[i] = Some(self.materialize_cached(entry)?);
                    if validate {
                        to_validate.push(i);
                    }
                }
            }
        }

        if validate {
            for i in to_validate {
                if let Some(obj) = found[i] {
                    self.validate_cached(obj, &ids[i])?;
                }
            }
        }

        let remaining: Vec<usize> = (0..ids.len()).filter(|i| found[*i].is_none()).collect();
        if remaining.is_empty() {
            return Ok(found.into_iter().flatten().collect());
        }
        let remaining_ids: Vec<Identity> = remaining.iter().map(|i| ids[*i].clone()).collect();
        if self.store.supports_direct_lookup() {
            let rows = self.store.find_objects(self.id, &remaining_ids)?;
            for (i, row) in remaining.iter().zip(rows) {
                match row {
                    Some(row) => found[*i] = Some(self.materialize_row(row)?),
                    None if validate => {
                        return Err(StatelineError::ObjectNotFound {
                            identity: ids[*i].to_string(),
                        })
                    }
                    None => found[*i] = Some(self.find_internal(&ids[*i], false, true, None)?),
                }
            }
        } else {
            for i in remaining {
                found[i] = Some(self.find_internal(&ids[i], validate, true, None)?);
            }
        }
        Ok(found.into_iter().flatten().collect())
    }

    /// Find the object whose declared unique key holds `values`
    ///
    /// Served from the L1 unique index, then the L2 unique index, then
    /// storage. A miss is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns `ClassNotPersistable`, `InvalidIdentity` if `fields` is not a
    /// declared unique key of the class, or storage errors.
    pub fn find_by_unique_key(
        &mut self,
        class: &str,
        fields: &[&str],
        values: Vec<KeyValue>,
    ) -> Result<Option<ObjectRef>> {
        self.ensure_open()?;
        log_op_start!(
            "find_unique",
            context_id = self.id.as_u64(),
            class = class
        );
        let start = Instant::now();
        let result = self.find_unique_internal(class, fields, values);
        let found = result.map_err(|e| {
            log_op_error!(
                "find_unique",
                &e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;
        log_op_end!(
            "find_unique",
            duration_ms = start.elapsed().as_millis() as u64,
            found = found.is_some()
        );
        Ok(found)
    }

    fn find_unique_internal(
        &mut self,
        class: &str,
        fields: &[&str],
        values: Vec<KeyValue>,
    ) -> Result<Option<ObjectRef>> {
        let meta = Arc::clone(self.metadata.class(class)?);
        let declared = meta
            .unique_keys
            .iter()
            .any(|key| key.len() == fields.len() && key.iter().zip(fields).all(|(a, b)| a == b));
        if !declared || values.len() != fields.len() {
            return Err(StatelineError::InvalidIdentity {
                reason: format!("({}) is not a unique key of {}", fields.join(","), class),
            });
        }
        let indices = fields
            .iter()
            .map(|f| meta.field_index(f))
            .collect::<Result<Vec<_>>>()?;
        let root = self.metadata.root_class(class)?;
        let key = UniqueKey::new(root, fields, values);

        if let Some(obj) = self.cache.l1().get_unique(&key) {
            trace!(key = %key, "l1 unique hit");
            return Ok(Some(obj));
        }
        if let Some(id) = self.cache.l2_get_unique(&key) {
            trace!(key = %key, "l2 unique hit");
            return self.find_internal(&id, false, true, None).map(Some);
        }

        let mut candidates = vec![class.to_string()];
        candidates.extend(self.metadata.subclasses(class));
        for candidate in candidates {
            if let Some(row) = self
                .store
                .find_unique(self.id, &candidate, &indices, &key.values)?
            {
                return self.materialize_row(row).map(Some);
            }
        }
        Ok(None)
    }
}
