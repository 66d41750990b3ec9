//! Error helpers for stateline-store
//!
//! Store failures are reported as core `StatelineError`s so the execution
//! context can classify them like any other adapter failure.

use stateline_core::errors::StatelineError;

/// Result type alias using StatelineError
pub type Result<T> = std::result::Result<T, StatelineError>;

/// Create a migration error
pub fn migration_error(migration_id: &str, reason: &str) -> StatelineError {
    StatelineError::storage(
        "migration",
        format!("Migration {} failed: {}", migration_id, reason),
    )
}

/// Create a checksum mismatch error
pub fn checksum_mismatch(migration_id: &str, expected: &str, actual: &str) -> StatelineError {
    StatelineError::Fatal {
        message: format!(
            "Checksum mismatch for migration {}: expected {}, got {}",
            migration_id, expected, actual
        ),
    }
}

/// Create a database error from rusqlite::Error
pub fn from_rusqlite(err: rusqlite::Error) -> StatelineError {
    StatelineError::storage("sqlite", err.to_string())
}

/// Wrap a rusqlite failure with the adapter operation that hit it
pub fn sqlite_op(op: &'static str) -> impl Fn(rusqlite::Error) -> StatelineError {
    move |err| StatelineError::storage(op, err.to_string())
}

/// Row column held JSON that no longer decodes
pub fn corrupt_row(identity_key: &str, err: &serde_json::Error) -> StatelineError {
    StatelineError::Serialization {
        message: format!("row {} is not decodable: {}", identity_key, err),
    }
}
