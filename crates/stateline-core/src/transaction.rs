//! Per-context transaction state machine
//!
//! ```text
//! Inactive ──begin──> Active ──pre_commit──> Committing ──post_commit──> Inactive
//!                       │
//!                       └──pre_rollback──> RollingBack ──post_rollback──> Inactive
//! ```
//! A failed commit moves `Committing` to `RollingBack`.

use chrono::{DateTime, Utc};
use stateline_core_types::TxId;

use crate::errors::{Result, StatelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Inactive,
    Active,
    Committing,
    RollingBack,
}

impl TransactionStatus {
    /// Begun and not yet finished (includes the boundary phases)
    pub fn is_active(&self) -> bool {
        !matches!(self, TransactionStatus::Inactive)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Inactive => write!(f, "INACTIVE"),
            TransactionStatus::Active => write!(f, "ACTIVE"),
            TransactionStatus::Committing => write!(f, "COMMITTING"),
            TransactionStatus::RollingBack => write!(f, "ROLLING_BACK"),
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    status: TransactionStatus,
    id: Option<TxId>,
    optimistic: bool,
    began_at: Option<DateTime<Utc>>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            status: TransactionStatus::Inactive,
            id: None,
            optimistic: false,
            began_at: None,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Id of the current transaction, if one is running
    pub fn id(&self) -> Option<&TxId> {
        self.id.as_ref()
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic
    }

    pub fn began_at(&self) -> Option<DateTime<Utc>> {
        self.began_at
    }

    fn guard(&self, op: &str, allowed: &[TransactionStatus]) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(StatelineError::InvalidTransactionState {
                op: op.to_string(),
                state: self.status.to_string(),
            })
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidTransactionState` unless inactive.
    pub fn begin(&mut self, optimistic: bool) -> Result<&TxId> {
        self.guard("begin", &[TransactionStatus::Inactive])?;
        self.status = TransactionStatus::Active;
        self.optimistic = optimistic;
        self.began_at = Some(Utc::now());
        Ok(&*self.id.insert(TxId::new()))
    }

    /// # Errors
    ///
    /// Returns `InvalidTransactionState` unless active.
    pub fn start_commit(&mut self) -> Result<()> {
        self.guard("commit", &[TransactionStatus::Active])?;
        self.status = TransactionStatus::Committing;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidTransactionState` unless active or committing.
    pub fn start_rollback(&mut self) -> Result<()> {
        self.guard(
            "rollback",
            &[TransactionStatus::Active, TransactionStatus::Committing],
        )?;
        self.status = TransactionStatus::RollingBack;
        Ok(())
    }

    /// Return to `Inactive` after either boundary
    pub fn finish(&mut self) {
        self.status = TransactionStatus::Inactive;
        self.id = None;
        self.optimistic = false;
        self.began_at = None;
    }
}
