//! Managed bidirectional relations
//!
//! Edits of a bidirectional field are recorded per owner while the user
//! works. At flush the handler checks the recorded edits against each other
//! and then pushes every edit to the other side of its relation:
//!
//! - `Set` on a reference whose inverse is a reference (1:1)
//! - `Set` on a reference whose inverse is a collection (N:1)
//! - `Add`/`Remove` on a collection whose inverse is a reference (1:N)
//! - `Add`/`Remove` on a collection whose inverse is a collection (M:N)
//!
//! Fix-ups are written with `direct = false`, so they never record new edits
//! and the touched objects become indirectly dirty.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::errors::{Result, StatelineError};
use crate::model::{FieldKind, ObjectRef, Value};
use crate::tracker::LifecycleState;

/// One recorded edit of a bidirectional field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationChange {
    Set {
        field: usize,
        old: Option<ObjectRef>,
        new: Option<ObjectRef>,
    },
    Add {
        field: usize,
        element: ObjectRef,
    },
    Remove {
        field: usize,
        element: ObjectRef,
    },
}

impl RelationChange {
    pub fn field(&self) -> usize {
        match self {
            RelationChange::Set { field, .. }
            | RelationChange::Add { field, .. }
            | RelationChange::Remove { field, .. } => *field,
        }
    }
}

/// Edits recorded for one owner, in arrival order
#[derive(Debug, Default, Clone)]
pub struct RelationshipManager {
    changes: Vec<RelationChange>,
}

impl RelationshipManager {
    pub fn record(&mut self, change: RelationChange) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[RelationChange] {
        &self.changes
    }

    /// Last `Set` recorded for `field`
    fn last_set(&self, field: usize) -> Option<Option<ObjectRef>> {
        self.changes.iter().rev().find_map(|change| match change {
            RelationChange::Set { field: f, new, .. } if *f == field => Some(*new),
            _ => None,
        })
    }

    fn removed(&self, field: usize, element: ObjectRef) -> bool {
        self.changes.iter().any(|change| {
            matches!(change, RelationChange::Remove { field: f, element: e } if *f == field && *e == element)
        })
    }
}

/// Other side of one recorded edit
#[derive(Debug, Clone, Copy)]
struct Inverse {
    field: usize,
    is_collection: bool,
}

#[derive(Debug, Default)]
struct RelationPlan {
    edits: Vec<(ObjectRef, RelationChange, Inverse)>,
    skipped: usize,
}

#[derive(Debug, Default)]
pub struct ManagedRelationsHandler {
    managers: BTreeMap<ObjectRef, RelationshipManager>,
}

impl ManagedRelationsHandler {
    pub fn record(&mut self, owner: ObjectRef, change: RelationChange) {
        self.managers.entry(owner).or_default().record(change);
    }

    pub fn forget(&mut self, obj: ObjectRef) {
        self.managers.remove(&obj);
    }

    pub fn manager(&self, owner: ObjectRef) -> Option<&RelationshipManager> {
        self.managers.get(&owner)
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Number of owners with recorded edits
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn clear(&mut self) {
        self.managers.clear();
    }

    /// Check every recorded edit, then apply the consistent ones
    ///
    /// Edits that contradict an explicit edit of the other side are not
    /// applied. With strict checking the first contradiction fails before
    /// anything is applied, and the recorded edits are kept.
    ///
    /// # Errors
    ///
    /// Returns `InconsistentRelation` in strict mode, or any failure loading
    /// or updating the other side.
    pub fn execute(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        let plan = self.check(ctx)?;
        let skipped = plan.skipped;

        let mut applied = 0usize;
        for (owner, change, inverse) in plan.edits {
            if let Err(err) = apply(ctx, owner, change, inverse) {
                self.managers.clear();
                return Err(err);
            }
            applied += 1;
        }

        debug!(
            owners = self.managers.len(),
            applied = applied,
            skipped = skipped,
            "managed relations executed"
        );
        self.managers.clear();
        Ok(())
    }

    /// Consistency pass: the edits to apply, in owner then arrival order
    fn check(&self, ctx: &ExecutionContext) -> Result<RelationPlan> {
        let mut plan = RelationPlan::default();
        for (&owner, manager) in &self.managers {
            if !is_live(ctx, owner) {
                continue;
            }
            for &change in manager.changes() {
                let Some(inverse) = inverse_of(ctx, owner, change.field())? else {
                    continue;
                };
                if ctx.config.managed_relations_checks {
                    if let Some(reason) = self.contradiction(owner, change, inverse) {
                        let err = inconsistent(ctx, owner, change.field(), reason)?;
                        if ctx.config.managed_relations_strict {
                            return Err(err);
                        }
                        warn!(error = %err, "inconsistent relation edit not applied");
                        plan.skipped += 1;
                        continue;
                    }
                }
                plan.edits.push((owner, change, inverse));
            }
        }
        Ok(plan)
    }

    /// Reason `change` contradicts an explicit edit of the other side
    fn contradiction(
        &self,
        owner: ObjectRef,
        change: RelationChange,
        inverse: Inverse,
    ) -> Option<String> {
        let (target, adding) = match change {
            RelationChange::Set { new: Some(t), .. } => (t, true),
            RelationChange::Add { element, .. } => (element, true),
            RelationChange::Remove { element, .. } => (element, false),
            RelationChange::Set { new: None, .. } => return None,
        };
        let other = self.managers.get(&target)?;
        if inverse.is_collection {
            if adding && other.removed(inverse.field, owner) {
                return Some(format!("{} removed {} from the inverse collection", target, owner));
            }
            return None;
        }
        match other.last_set(inverse.field) {
            Some(Some(set_to)) if adding && set_to != owner => Some(format!(
                "{} set its inverse reference to {}",
                target, set_to
            )),
            Some(Some(set_to)) if !adding && set_to == owner => Some(format!(
                "{} set its inverse reference back to {}",
                target, owner
            )),
            _ => None,
        }
    }
}

fn is_live(ctx: &ExecutionContext, obj: ObjectRef) -> bool {
    ctx.lifecycle_state(obj)
        .is_ok_and(|state| !state.is_deleted() && state != LifecycleState::Detached)
}

fn inverse_of(ctx: &ExecutionContext, owner: ObjectRef, field: usize) -> Result<Option<Inverse>> {
    let class = ctx.class_of(owner)?;
    let Some((related, index)) = ctx.metadata.inverse_of(&class.name, field) else {
        return Ok(None);
    };
    Ok(related.field_at(index).map(|meta| Inverse {
        field: index,
        is_collection: matches!(meta.kind, FieldKind::Collection { .. }),
    }))
}

fn inconsistent(
    ctx: &ExecutionContext,
    owner: ObjectRef,
    field: usize,
    reason: String,
) -> Result<StatelineError> {
    let class = ctx.class_of(owner)?;
    Ok(StatelineError::InconsistentRelation {
        owner: owner.to_string(),
        class: class.name.clone(),
        field: class
            .field_at(field)
            .map_or_else(|| field.to_string(), |f| f.name.clone()),
        reason,
    })
}

fn apply(
    ctx: &mut ExecutionContext,
    owner: ObjectRef,
    change: RelationChange,
    inverse: Inverse,
) -> Result<()> {
    match change {
        RelationChange::Set { field, old, new } => {
            if let Some(old) = old.filter(|o| Some(*o) != new) {
                unlink(ctx, old, inverse, owner)?;
            }
            if let Some(new) = new {
                if !inverse.is_collection {
                    release_previous_partner(ctx, new, inverse.field, field, owner)?;
                }
                link(ctx, new, inverse, owner)?;
            }
        }
        RelationChange::Add { field, element } => {
            if !inverse.is_collection {
                release_previous_owner(ctx, element, inverse.field, field, owner)?;
            }
            link(ctx, element, inverse, owner)?;
        }
        RelationChange::Remove { element, .. } => unlink(ctx, element, inverse, owner)?,
    }
    Ok(())
}

fn current(ctx: &mut ExecutionContext, obj: ObjectRef, field: usize) -> Result<Value> {
    ctx.ensure_field_loaded(obj, field)?;
    Ok(ctx
        .tracker(obj)?
        .field_value(field)
        .cloned()
        .unwrap_or(Value::Null))
}

/// Make `target`'s inverse field point at (or contain) `owner`
fn link(ctx: &mut ExecutionContext, target: ObjectRef, inverse: Inverse, owner: ObjectRef) -> Result<()> {
    if !is_live(ctx, target) {
        return Ok(());
    }
    let value = current(ctx, target, inverse.field)?;
    if inverse.is_collection {
        let mut items = value.referenced();
        if items.contains(&owner) {
            return Ok(());
        }
        items.push(owner);
        debug!(target = %target, owner = %owner, "inverse collection element added");
        ctx.set_field(target, inverse.field, Value::Collection(items), false)
    } else {
        if value.as_ref_object() == Some(owner) {
            return Ok(());
        }
        debug!(target = %target, owner = %owner, "inverse reference set");
        ctx.set_field(target, inverse.field, Value::Ref(owner), false)
    }
}

/// Drop `owner` from `target`'s inverse field if it is there
fn unlink(ctx: &mut ExecutionContext, target: ObjectRef, inverse: Inverse, owner: ObjectRef) -> Result<()> {
    if !is_live(ctx, target) {
        return Ok(());
    }
    let value = current(ctx, target, inverse.field)?;
    if inverse.is_collection {
        let mut items = value.referenced();
        let before = items.len();
        items.retain(|item| *item != owner);
        if items.len() == before {
            return Ok(());
        }
        debug!(target = %target, owner = %owner, "inverse collection element removed");
        ctx.set_field(target, inverse.field, Value::Collection(items), false)
    } else {
        if value.as_ref_object() != Some(owner) {
            return Ok(());
        }
        debug!(target = %target, owner = %owner, "inverse reference cleared");
        ctx.set_field(target, inverse.field, Value::Null, false)
    }
}

/// 1:1: the object `target` pointed at before stops pointing back at it
fn release_previous_partner(
    ctx: &mut ExecutionContext,
    target: ObjectRef,
    inverse_field: usize,
    field: usize,
    owner: ObjectRef,
) -> Result<()> {
    if !is_live(ctx, target) {
        return Ok(());
    }
    let Some(previous) = current(ctx, target, inverse_field)?.as_ref_object() else {
        return Ok(());
    };
    if previous == owner || !is_live(ctx, previous) {
        return Ok(());
    }
    if current(ctx, previous, field)?.as_ref_object() == Some(target) {
        debug!(previous = %previous, target = %target, "previous partner released");
        ctx.set_field(previous, field, Value::Null, false)?;
    }
    Ok(())
}

/// 1:N: the collection `element` belonged to before loses it
fn release_previous_owner(
    ctx: &mut ExecutionContext,
    element: ObjectRef,
    inverse_field: usize,
    field: usize,
    owner: ObjectRef,
) -> Result<()> {
    if !is_live(ctx, element) {
        return Ok(());
    }
    let Some(previous) = current(ctx, element, inverse_field)?.as_ref_object() else {
        return Ok(());
    };
    if previous == owner || !is_live(ctx, previous) {
        return Ok(());
    }
    let mut items = current(ctx, previous, field)?.referenced();
    let before = items.len();
    items.retain(|item| *item != element);
    if items.len() != before {
        debug!(previous = %previous, element = %element, "element moved out of previous owner");
        ctx.set_field(previous, field, Value::Collection(items), false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateline_core_types::ContextId;

    fn handle(slot: u32) -> ObjectRef {
        ObjectRef {
            context: ContextId::from_raw(7),
            slot,
            generation: 0,
        }
    }

    #[test]
    fn test_records_per_owner_in_order() {
        let mut handler = ManagedRelationsHandler::default();
        let (a, b, c) = (handle(0), handle(1), handle(2));
        handler.record(a, RelationChange::Add { field: 1, element: b });
        handler.record(a, RelationChange::Remove { field: 1, element: c });
        handler.record(b, RelationChange::Set { field: 2, old: None, new: Some(a) });

        assert_eq!(handler.len(), 2);
        let changes = handler.manager(a).unwrap().changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0], RelationChange::Add { field: 1, element: b });

        handler.forget(a);
        assert!(handler.manager(a).is_none());
        handler.clear();
        assert!(handler.is_empty());
    }

    #[test]
    fn test_contradicting_inverse_reference_detected() {
        let mut handler = ManagedRelationsHandler::default();
        let (parent, child, other) = (handle(0), handle(1), handle(2));
        handler.record(parent, RelationChange::Add { field: 1, element: child });
        handler.record(child, RelationChange::Set { field: 2, old: None, new: Some(other) });

        let inverse = Inverse {
            field: 2,
            is_collection: false,
        };
        let change = RelationChange::Add { field: 1, element: child };
        assert!(handler.contradiction(parent, change, inverse).is_some());

        let agreeing = Inverse {
            field: 3,
            is_collection: false,
        };
        assert!(handler.contradiction(parent, change, agreeing).is_none());
    }

    #[test]
    fn test_add_contradicts_explicit_remove_on_collection_side() {
        let mut handler = ManagedRelationsHandler::default();
        let (student, course) = (handle(0), handle(1));
        handler.record(student, RelationChange::Add { field: 1, element: course });
        handler.record(course, RelationChange::Remove { field: 1, element: student });

        let inverse = Inverse {
            field: 1,
            is_collection: true,
        };
        let change = RelationChange::Add { field: 1, element: course };
        assert!(handler.contradiction(student, change, inverse).is_some());
    }
}
