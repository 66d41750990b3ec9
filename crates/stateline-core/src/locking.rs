use std::collections::HashMap;

use crate::model::ObjectRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    #[default]
    None,
    OptimisticRead,
    OptimisticWrite,
    PessimisticRead,
    PessimisticWrite,
}

impl LockMode {
    /// Commit must bump the version even if the object is unmodified
    pub fn requires_version_bump(&self) -> bool {
        matches!(self, LockMode::OptimisticWrite | LockMode::PessimisticWrite)
    }
}

/// Lock modes held by the current transaction
///
/// Keyed by handle rather than identity so identity replacement needs no
/// migration here.
#[derive(Debug, Default)]
pub struct LockManager {
    modes: HashMap<ObjectRef, LockMode>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&mut self, obj: ObjectRef, mode: LockMode) {
        if mode == LockMode::None {
            self.modes.remove(&obj);
        } else {
            self.modes.insert(obj, mode);
        }
    }

    pub fn lock_mode(&self, obj: ObjectRef) -> LockMode {
        self.modes.get(&obj).copied().unwrap_or_default()
    }

    pub fn unlock(&mut self, obj: ObjectRef) {
        self.modes.remove(&obj);
    }

    /// Objects whose lock mode forces a version bump, in handle order
    pub fn version_bump_candidates(&self) -> Vec<ObjectRef> {
        let mut out: Vec<ObjectRef> = self
            .modes
            .iter()
            .filter(|(_, mode)| mode.requires_version_bump())
            .map(|(obj, _)| *obj)
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn clear(&mut self) {
        self.modes.clear();
    }
}
