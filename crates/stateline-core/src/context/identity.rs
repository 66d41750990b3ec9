//! Identity assignment and replacement

use std::time::Instant;

use tracing::debug;

use crate::context::ExecutionContext;
use crate::errors::{Result, StatelineError};
use crate::model::{ClassMetadata, Identity, IdentityStrategy, KeyValue, ObjectRef, Value};
use crate::{log_op_end, log_op_error, log_op_start};

impl ExecutionContext {
    /// Move every identity-keyed entry of `obj` from `old` to `new`
    ///
    /// The L1 entry, the enlistment entry, pending-L2 membership and
    /// reachability bookkeeping all move together. On failure nothing moves.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentity` if `obj` does not currently carry `old`, and
    /// `DuplicateTracker` if another object is cached under `new`.
    pub fn replace_identity(&mut self, obj: ObjectRef, old: &Identity, new: Identity) -> Result<()> {
        self.ensure_open()?;
        log_op_start!(
            "replace_identity",
            context_id = self.id.as_u64(),
            identity = %old,
            new_identity = %new
        );
        let start = Instant::now();
        self.replace_identity_internal(obj, old, new).map_err(|e| {
            log_op_error!(
                "replace_identity",
                &e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;
        log_op_end!(
            "replace_identity",
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(())
    }

    pub(crate) fn replace_identity_internal(
        &mut self,
        obj: ObjectRef,
        old: &Identity,
        new: Identity,
    ) -> Result<()> {
        let new = self.normalize(&new)?;
        let old = self.normalize(old)?;
        if self.tracker(obj)?.identity() != Some(&old) {
            return Err(StatelineError::InvalidIdentity {
                reason: format!("{} does not carry identity {}", obj, old),
            });
        }
        if old == new {
            return Ok(());
        }
        if self.enlisted.get(&new).is_some_and(|other| *other != obj) {
            return Err(StatelineError::DuplicateTracker {
                identity: new.to_string(),
            });
        }

        self.cache.l1_mut().replace_identity(&old, new.clone())?;
        if let Some(enlisted) = self.enlisted.remove(&old) {
            self.enlisted.insert(new.clone(), enlisted);
        }
        if self.pending_l2.remove(&old) {
            self.pending_l2.insert(new.clone());
        }
        if self.l2_written_in_tx.remove(&old) {
            self.l2_written_in_tx.insert(new.clone());
        }
        self.reachability.replace_identity(&old, &new);
        self.invocation.replace_identity(&old, &new);
        debug!(identity = %old, new_identity = %new, "identity replaced");
        self.tracker_mut(obj)?.set_identity(new);
        Ok(())
    }

    /// Identity for a newly persisted object
    ///
    /// Datastore identity starts temporary. Application identity is taken
    /// from the primary-key fields, or is temporary while one of them is
    /// unset.
    pub(crate) fn initial_identity(&self, obj: ObjectRef, class: &ClassMetadata) -> Result<Identity> {
        let root = self.metadata.root_class(&class.name)?;
        match class.identity {
            IdentityStrategy::Datastore => Ok(Identity::temporary(root)),
            IdentityStrategy::Application => Ok(self
                .application_identity(obj, class, &root)?
                .unwrap_or_else(|| Identity::temporary(root))),
        }
    }

    fn application_identity(
        &self,
        obj: ObjectRef,
        class: &ClassMetadata,
        root: &str,
    ) -> Result<Option<Identity>> {
        let tracker = self.tracker(obj)?;
        let mut keys: Vec<KeyValue> = Vec::new();
        for field in class.pk_fields() {
            match tracker.field_value(field) {
                Some(Value::Null) | None => return Ok(None),
                Some(value) => keys.push(value.as_key().ok_or_else(|| {
                    StatelineError::InvalidIdentity {
                        reason: format!(
                            "primary key {}.{} must be an int or text value",
                            class.name,
                            class.field_at(field).map_or("?", |f| f.name.as_str())
                        ),
                    }
                })?),
            }
        }
        Ok(Some(match keys.len() {
            1 => Identity::single(root, keys.remove(0)),
            _ => Identity::composite(root, keys),
        }))
    }

    /// Recompute an application identity from the primary key before insert
    pub(crate) fn refresh_application_identity(&mut self, obj: ObjectRef) -> Result<()> {
        let class = self.class_of(obj)?;
        if class.identity != IdentityStrategy::Application {
            return Ok(());
        }
        let root = self.metadata.root_class(&class.name)?;
        let computed = self.application_identity(obj, &class, &root)?.ok_or_else(|| {
            StatelineError::InvalidIdentity {
                reason: format!("primary key of {} is not set", class.name),
            }
        })?;
        let current = self.tracker(obj)?.identity().cloned();
        match current {
            Some(current) if current != computed => {
                self.replace_identity_internal(obj, &current, computed)
            }
            Some(_) => Ok(()),
            None => Err(StatelineError::internal(format!(
                "persistent object {} has no identity",
                obj
            ))),
        }
    }
}
