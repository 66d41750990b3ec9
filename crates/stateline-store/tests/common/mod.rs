use std::path::Path;
use std::sync::Arc;

use stateline_core::{
    ClassMetadata, ContextFactory, ExecutionContext, FactoryConfig, FieldMetadata, Identity,
    MetadataRegistry,
};
use stateline_store::SqliteStore;

/// `Person` (versioned, unique `email`) and `Account` (application identity)
#[allow(dead_code)]
pub fn registry() -> MetadataRegistry {
    let mut reg = MetadataRegistry::new();
    reg.register(
        ClassMetadata::new("Person")
            .versioned()
            .unique(&["email"])
            .field(FieldMetadata::basic("name"))
            .field(FieldMetadata::basic("email")),
    )
    .unwrap();
    reg.register(
        ClassMetadata::new("Account")
            .application_identity()
            .field(FieldMetadata::basic("number").primary_key())
            .field(FieldMetadata::basic("owner")),
    )
    .unwrap();
    reg
}

/// Factory over the database file at `path`
#[allow(dead_code)]
pub fn factory(path: &Path) -> (Arc<SqliteStore>, ContextFactory) {
    let store = Arc::new(SqliteStore::open(path).unwrap());
    let factory = ContextFactory::new(registry(), store.clone(), FactoryConfig::default()).unwrap();
    (store, factory)
}

/// Persist a new `Person` in an implicit transaction
#[allow(dead_code)]
pub fn committed_person(ctx: &mut ExecutionContext, name: &str, email: &str) -> Identity {
    let person = ctx.new_object("Person").unwrap();
    ctx.set(person, "name", name).unwrap();
    ctx.set(person, "email", email).unwrap();
    let person = ctx.persist(person).unwrap();
    ctx.identity_of(person).unwrap().unwrap()
}
