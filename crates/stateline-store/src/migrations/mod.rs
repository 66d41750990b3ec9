//! Migration framework
//!
//! - Embedded SQL migrations applied in order
//! - Idempotent application recorded in `schema_version`
//! - Checksums guard against a schema edited after it was applied

mod checksums;
mod embedded;
mod runner;

pub use runner::{applied_migrations, apply_migrations};
