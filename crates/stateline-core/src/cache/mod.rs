//! Two-level cache coordination
//!
//! L1 is private to one execution context and maps identities to live
//! handles. L2 is shared by every context of a factory and holds immutable
//! snapshots.

pub mod coordinator;
pub mod level1;
pub mod level2;

pub use coordinator::{CacheCoordinator, L2WriteStats};
pub use level1::Level1Cache;
pub use level2::{
    CachedObject, Level2Cache, Level2CacheRegistry, LruLevel2Cache, NullLevel2Cache,
    SharedLevel2Cache,
};
