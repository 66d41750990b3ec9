use thiserror::Error;

/// Result type alias using StatelineError
pub type Result<T> = std::result::Result<T, StatelineError>;

// ========== Error Facility ==========

/// Canonical error kind taxonomy
///
/// Every failure raised by the engine maps to exactly one kind. Kinds carry a
/// stable code for programmatic handling, tests and log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // User errors
    InvalidInput,
    ClassNotPersistable,
    WrongContext,
    StaleReference,
    NotDetachable,
    DuplicateObject,
    InvalidState,
    TransactionState,
    InconsistentRelation,
    UnsupportedOption,

    // Lookup
    NotFound,

    // Concurrency
    OptimisticConflict,

    // Aggregated commit/rollback/batch failures
    TransitionFailed,
    BatchFailed,
    FlushIncomplete,

    // Integration
    Persistence,
    Serialization,

    // Unrecoverable
    Fatal,
    Internal,
}

impl ErrorKind {
    /// Get the stable error code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "ERR_INVALID_INPUT",
            ErrorKind::ClassNotPersistable => "ERR_CLASS_NOT_PERSISTABLE",
            ErrorKind::WrongContext => "ERR_WRONG_CONTEXT",
            ErrorKind::StaleReference => "ERR_STALE_REFERENCE",
            ErrorKind::NotDetachable => "ERR_NOT_DETACHABLE",
            ErrorKind::DuplicateObject => "ERR_DUPLICATE_OBJECT",
            ErrorKind::InvalidState => "ERR_INVALID_STATE",
            ErrorKind::TransactionState => "ERR_TRANSACTION_STATE",
            ErrorKind::InconsistentRelation => "ERR_INCONSISTENT_RELATION",
            ErrorKind::UnsupportedOption => "ERR_UNSUPPORTED_OPTION",
            ErrorKind::NotFound => "ERR_NOT_FOUND",
            ErrorKind::OptimisticConflict => "ERR_OPTIMISTIC_CONFLICT",
            ErrorKind::TransitionFailed => "ERR_TRANSITION_FAILED",
            ErrorKind::BatchFailed => "ERR_BATCH_FAILED",
            ErrorKind::FlushIncomplete => "ERR_FLUSH_INCOMPLETE",
            ErrorKind::Persistence => "ERR_PERSISTENCE",
            ErrorKind::Serialization => "ERR_SERIALIZATION",
            ErrorKind::Fatal => "ERR_FATAL",
            ErrorKind::Internal => "ERR_INTERNAL",
        }
    }

    /// User errors are caused by the caller and are never retried
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidInput
                | ErrorKind::ClassNotPersistable
                | ErrorKind::WrongContext
                | ErrorKind::StaleReference
                | ErrorKind::NotDetachable
                | ErrorKind::DuplicateObject
                | ErrorKind::InvalidState
                | ErrorKind::TransactionState
                | ErrorKind::InconsistentRelation
                | ErrorKind::UnsupportedOption
        )
    }
}

/// Canonical structured error record
///
/// Built from a [`StatelineError`] for logging and for callers that prefer a
/// flat classification over matching on variants.
#[derive(Debug, Clone)]
pub struct SlError {
    kind: ErrorKind,
    op: Option<String>,
    identity: Option<String>,
    message: String,
    nested: Vec<SlError>,
}

impl SlError {
    /// Create a new error with the specified kind
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            op: None,
            identity: None,
            message: String::new(),
            nested: Vec::new(),
        }
    }

    /// Add operation context
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Add identity context
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Add custom message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Add nested failures (aggregates)
    pub fn with_nested(mut self, nested: Vec<SlError>) -> Self {
        self.nested = nested;
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Get the operation context, if any
    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    /// Get the identity context, if any
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get nested failures of an aggregate
    pub fn nested(&self) -> &[SlError] {
        &self.nested
    }
}

impl std::fmt::Display for SlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code())?;
        if let Some(op) = &self.op {
            write!(f, " in operation '{}'", op)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(identity) = &self.identity {
            write!(f, " (identity: {})", identity)?;
        }
        if !self.nested.is_empty() {
            write!(f, " ({} nested)", self.nested.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for SlError {}

// ========== End Error Facility ==========

/// Error taxonomy for Stateline operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatelineError {
    // ===== User Errors =====
    /// Class is not known to the metadata registry
    #[error("Class is not persistable: {class}")]
    ClassNotPersistable { class: String },

    /// Field name is not declared by the class
    #[error("Unknown field '{field}' on class {class}")]
    UnknownField { class: String, field: String },

    /// Value does not fit the declared field kind
    #[error("Type mismatch on {class}.{field}: {reason}")]
    TypeMismatch {
        class: String,
        field: String,
        reason: String,
    },

    /// Identity is malformed or does not match the class
    #[error("Invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    /// Object handle belongs to another execution context
    #[error("Object is managed by context {actual}, not by context {expected}")]
    WrongContext { expected: String, actual: String },

    /// Object handle refers to a released slot
    #[error("Object reference is stale (slot {slot})")]
    StaleObjectRef { slot: u32 },

    /// Class does not allow detachment
    #[error("Class {class} is not detachable")]
    NotDetachable { class: String },

    /// A second object was offered for an identity that already has a tracker
    #[error("Another object is already managed under identity {identity}")]
    DuplicateTracker { identity: String },

    /// Lifecycle transition is not allowed from the current state
    #[error("Cannot {op} object in state {state}")]
    InvalidStateTransition { op: String, state: String },

    /// Operation requires a persistent object
    #[error("Object is not persistent: cannot {op}")]
    NotPersistent { op: String },

    /// Operation requires an active transaction
    #[error("No active transaction for {op}")]
    TransactionNotActive { op: String },

    /// Transaction is in the wrong state for the operation
    #[error("Cannot {op}: transaction is {state}")]
    InvalidTransactionState { op: String, state: String },

    /// Execution context was closed
    #[error("Execution context is closed")]
    ContextClosed,

    /// Option cannot be changed after the context is opened
    #[error("Option {option} cannot be changed at runtime")]
    UnsupportedOption { option: String },

    /// Configuration value is invalid
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Bidirectional relation sides disagree (strict managed relations)
    #[error("Inconsistent relation {class}.{field} on {owner}: {reason}")]
    InconsistentRelation {
        owner: String,
        class: String,
        field: String,
        reason: String,
    },

    // ===== Lookup Errors =====
    /// Object does not exist in the datastore
    #[error("Object not found: {identity}")]
    ObjectNotFound { identity: String },

    // ===== Concurrency Errors =====
    /// Datastore version differs from the version this context read
    #[error("Optimistic conflict on {identity}: expected version {expected:?}, found {actual:?}")]
    OptimisticConflict {
        identity: String,
        expected: Option<i64>,
        actual: Option<i64>,
    },

    // ===== Aggregate Errors =====
    /// One or more optimistic conflicts raised by a single flush
    #[error("Flush raised {} optimistic conflict(s)", .failures.len())]
    OptimisticConflicts { failures: Vec<StatelineError> },

    /// Lifecycle callbacks failed during commit or rollback
    #[error("{} object(s) failed to transition during {phase}", .failures.len())]
    TransitionFailures {
        phase: String,
        failures: Vec<StatelineError>,
    },

    /// Batch persist failed for one or more objects
    #[error("Batch persist failed for {} object(s)", .failures.len())]
    PersistAllFailed { failures: Vec<StatelineError> },

    /// Flush still had dirty objects after the configured number of rounds
    #[error("Flush incomplete after {rounds} round(s): {residual} object(s) still dirty")]
    FlushIncomplete { rounds: usize, residual: usize },

    // ===== Integration Errors =====
    /// Storage adapter failure
    #[error("Storage error in {op}: {message}")]
    Storage { op: String, message: String },

    /// Serialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    // ===== Unrecoverable Errors =====
    /// Unrecoverable failure, retrying is pointless
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StatelineError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StatelineError::ClassNotPersistable { .. } => ErrorKind::ClassNotPersistable,
            StatelineError::UnknownField { .. }
            | StatelineError::TypeMismatch { .. }
            | StatelineError::InvalidIdentity { .. }
            | StatelineError::NotPersistent { .. }
            | StatelineError::InvalidConfig { .. } => ErrorKind::InvalidInput,
            StatelineError::WrongContext { .. } => ErrorKind::WrongContext,
            StatelineError::StaleObjectRef { .. } => ErrorKind::StaleReference,
            StatelineError::NotDetachable { .. } => ErrorKind::NotDetachable,
            StatelineError::DuplicateTracker { .. } => ErrorKind::DuplicateObject,
            StatelineError::InvalidStateTransition { .. } | StatelineError::ContextClosed => {
                ErrorKind::InvalidState
            }
            StatelineError::TransactionNotActive { .. }
            | StatelineError::InvalidTransactionState { .. } => ErrorKind::TransactionState,
            StatelineError::UnsupportedOption { .. } => ErrorKind::UnsupportedOption,
            StatelineError::InconsistentRelation { .. } => ErrorKind::InconsistentRelation,
            StatelineError::ObjectNotFound { .. } => ErrorKind::NotFound,
            StatelineError::OptimisticConflict { .. }
            | StatelineError::OptimisticConflicts { .. } => ErrorKind::OptimisticConflict,
            StatelineError::TransitionFailures { .. } => ErrorKind::TransitionFailed,
            StatelineError::PersistAllFailed { .. } => ErrorKind::BatchFailed,
            StatelineError::FlushIncomplete { .. } => ErrorKind::FlushIncomplete,
            StatelineError::Storage { .. } => ErrorKind::Persistence,
            StatelineError::Serialization { .. } => ErrorKind::Serialization,
            StatelineError::Fatal { .. } => ErrorKind::Fatal,
            StatelineError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Caller-caused failure, surfaced immediately and never retried
    pub fn is_user_error(&self) -> bool {
        self.kind().is_user_error()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Single conflict or an aggregate of conflicts
    pub fn is_optimistic(&self) -> bool {
        self.kind() == ErrorKind::OptimisticConflict
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Whether re-running the unit of work can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::OptimisticConflict | ErrorKind::Persistence
        )
    }

    /// Failures carried by an aggregate error (empty for single errors)
    pub fn nested(&self) -> &[StatelineError] {
        match self {
            StatelineError::OptimisticConflicts { failures }
            | StatelineError::TransitionFailures { failures, .. }
            | StatelineError::PersistAllFailed { failures } => failures,
            _ => &[],
        }
    }

    /// Identity named by the error, if any
    pub fn identity(&self) -> Option<&str> {
        match self {
            StatelineError::ObjectNotFound { identity }
            | StatelineError::OptimisticConflict { identity, .. }
            | StatelineError::DuplicateTracker { identity } => Some(identity),
            StatelineError::InconsistentRelation { owner, .. } => Some(owner),
            _ => None,
        }
    }

    /// Build a storage error for the given adapter operation
    pub fn storage(op: impl Into<String>, message: impl Into<String>) -> Self {
        StatelineError::Storage {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Build an internal-invariant error
    pub fn internal(message: impl Into<String>) -> Self {
        StatelineError::Internal {
            message: message.into(),
        }
    }
}

impl From<StatelineError> for SlError {
    fn from(err: StatelineError) -> Self {
        let kind = err.kind();
        let mut out = SlError::new(kind).with_message(err.to_string());
        if let Some(identity) = err.identity() {
            out = out.with_identity(identity.to_string());
        }
        match err {
            StatelineError::TransitionFailures { phase, failures } => out
                .with_op(phase)
                .with_nested(failures.into_iter().map(SlError::from).collect()),
            StatelineError::OptimisticConflicts { failures } => out
                .with_op("flush")
                .with_nested(failures.into_iter().map(SlError::from).collect()),
            StatelineError::PersistAllFailed { failures } => out
                .with_op("persist_all")
                .with_nested(failures.into_iter().map(SlError::from).collect()),
            StatelineError::Storage { op, .. } => out.with_op(op),
            StatelineError::NotPersistent { op }
            | StatelineError::TransactionNotActive { op }
            | StatelineError::InvalidStateTransition { op, .. }
            | StatelineError::InvalidTransactionState { op, .. } => out.with_op(op),
            _ => out,
        }
    }
}

/// Conversion from serde_json::Error to StatelineError
impl From<serde_json::Error> for StatelineError {
    fn from(err: serde_json::Error) -> Self {
        StatelineError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Conversion from toml parse errors to StatelineError
impl From<toml::de::Error> for StatelineError {
    fn from(err: toml::de::Error) -> Self {
        StatelineError::InvalidConfig {
            reason: err.to_string(),
        }
    }
}
