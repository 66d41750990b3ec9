pub mod bitset;
pub mod identity;
pub mod metadata;
pub mod value;

pub use bitset::FieldBitSet;
pub use identity::{Identity, KeyValue, UniqueKey};
pub use metadata::{ClassMetadata, FieldKind, FieldMetadata, IdentityStrategy, MetadataRegistry};
pub use value::{ObjectRef, StoredValue, Value};
