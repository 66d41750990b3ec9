//! Stateline Core - object lifecycle and cache coherency engine
//!
//! This crate coordinates the runtime side of an object persistence layer:
//! - Execution contexts (units of work) with an arena of object trackers
//! - Identity-keyed L1 cache and a shared, snapshot-based L2 cache
//! - Dirty tracking, an ordered flush engine and an operation queue
//! - Managed bidirectional relations and persistence-by-reachability
//! - Transaction boundaries, lock-driven version bumps, attach and detach
//!
//! Storage is pluggable through [`storage::StoreManager`]; an in-memory
//! adapter ships in [`storage::memory`].

pub mod cache;
pub mod config;
pub mod context;
pub mod errors;
pub mod factory;
pub mod flush;
pub mod locking;
pub mod logging_facility;
pub mod model;
pub mod reachability;
pub mod relations;
pub mod storage;
pub mod tracker;
pub mod transaction;

// Re-export commonly used types
pub use cache::{CacheCoordinator, CachedObject, Level2Cache, Level2CacheRegistry};
pub use config::{CacheMode, ContextConfig, ContextOption, FactoryConfig, FlushMode, L1CacheKind};
pub use context::{ExecutionContext, FlushOutcome, InvocationScope, SharedExecutionContext};
pub use errors::{ErrorKind, Result, SlError, StatelineError};
pub use factory::ContextFactory;
pub use locking::LockMode;
pub use model::{
    ClassMetadata, FieldMetadata, Identity, KeyValue, MetadataRegistry, ObjectRef, UniqueKey,
    Value,
};
pub use storage::{MemoryStore, StoreManager};
pub use tracker::{DetachedObject, LifecycleState, StateTracker};
pub use transaction::TransactionStatus;
