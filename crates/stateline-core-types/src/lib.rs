//! Core types shared across Stateline crates
//!
//! This crate provides foundational types used by the engine, its logging
//! facility and the storage adapters:
//!
//! - **Correlation types**: ContextId, TxId
//! - **Schema constants**: Canonical field keys and event names

pub mod correlation;
pub mod schema;

pub use correlation::{ContextId, TxId};
