//! Stateline Store - SQLite storage adapter for the execution context
//!
//! Provides:
//! - SQLite schema with migrations framework
//! - `SqliteStore`, a `StoreManager` whose per-context transactions are
//!   real SQLite transactions
//! - Row encoding for stored objects

pub mod db;
pub mod errors;
pub mod migrations;
pub mod repo;

// Re-export key types
pub use errors::Result;
pub use repo::SqliteStore;
