//! Repository layer persisting stored objects to SQLite

pub mod rows;
pub mod sqlite_store;

pub use sqlite_store::SqliteStore;
