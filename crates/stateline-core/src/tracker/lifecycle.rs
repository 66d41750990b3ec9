use std::fmt;

/// Lifecycle state of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Transient,
    PersistentNew,
    PersistentClean,
    PersistentDirty,
    /// Persistent, field values not loaded
    Hollow,
    PersistentDeleted,
    PersistentNewDeleted,
    Detached,
}

impl LifecycleState {
    /// Managed by a context and backed (or to be backed) by storage
    pub fn is_persistent(&self) -> bool {
        !matches!(self, LifecycleState::Transient | LifecycleState::Detached)
    }

    pub fn is_new(&self) -> bool {
        matches!(
            self,
            LifecycleState::PersistentNew | LifecycleState::PersistentNewDeleted
        )
    }

    pub fn is_deleted(&self) -> bool {
        matches!(
            self,
            LifecycleState::PersistentDeleted | LifecycleState::PersistentNewDeleted
        )
    }

    /// Has changes not yet committed
    pub fn is_transactional_dirty(&self) -> bool {
        matches!(
            self,
            LifecycleState::PersistentNew
                | LifecycleState::PersistentDirty
                | LifecycleState::PersistentDeleted
                | LifecycleState::PersistentNewDeleted
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Transient => "TRANSIENT",
            LifecycleState::PersistentNew => "P_NEW",
            LifecycleState::PersistentClean => "P_CLEAN",
            LifecycleState::PersistentDirty => "P_DIRTY",
            LifecycleState::Hollow => "HOLLOW",
            LifecycleState::PersistentDeleted => "P_DELETED",
            LifecycleState::PersistentNewDeleted => "P_NEW_DELETED",
            LifecycleState::Detached => "DETACHED",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(LifecycleState::Hollow.is_persistent());
        assert!(!LifecycleState::Detached.is_persistent());
        assert!(LifecycleState::PersistentNewDeleted.is_new());
        assert!(LifecycleState::PersistentNewDeleted.is_deleted());
        assert!(!LifecycleState::PersistentClean.is_transactional_dirty());
        assert_eq!(LifecycleState::PersistentDirty.to_string(), "P_DIRTY");
    }
}
