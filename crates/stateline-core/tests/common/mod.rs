use std::sync::Arc;

use stateline_core::{
    ClassMetadata, ContextConfig, ContextFactory, ExecutionContext, FactoryConfig, FieldMetadata,
    Identity, MemoryStore, MetadataRegistry, ObjectRef,
};

/// Classes shared by the integration tests
///
/// - `Person` (versioned, unique `email`) and its subclass `Employee`
/// - `Parent.children` / `Child.parent`, a managed 1:N relation
/// - `Holder.item` referencing `Item`, for reachability; `Holder.spare`
///   does not cascade persist
/// - `Account`, application identity over `number`
#[allow(dead_code)]
pub fn registry() -> MetadataRegistry {
    let mut reg = MetadataRegistry::new();
    reg.register(
        ClassMetadata::new("Person")
            .versioned()
            .unique(&["email"])
            .field(FieldMetadata::basic("name"))
            .field(FieldMetadata::basic("email"))
            .field(FieldMetadata::reference("friend", "Person")),
    )
    .unwrap();
    reg.register(
        ClassMetadata::new("Employee")
            .extends("Person")
            .field(FieldMetadata::basic("salary")),
    )
    .unwrap();
    reg.register(
        ClassMetadata::new("Parent")
            .field(FieldMetadata::basic("name"))
            .field(FieldMetadata::collection("children", "Child").mapped_by("parent")),
    )
    .unwrap();
    reg.register(
        ClassMetadata::new("Child")
            .field(FieldMetadata::basic("name"))
            .field(FieldMetadata::reference("parent", "Parent")),
    )
    .unwrap();
    reg.register(
        ClassMetadata::new("Holder")
            .field(FieldMetadata::basic("name"))
            .field(FieldMetadata::reference("item", "Item"))
            .field(FieldMetadata::reference("spare", "Item").no_cascade_persist()),
    )
    .unwrap();
    reg.register(ClassMetadata::new("Item").field(FieldMetadata::basic("label")))
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

/// Factory over a fresh in-memory store with default settings
#[allow(dead_code)]
pub fn factory() -> (Arc<MemoryStore>, ContextFactory) {
    factory_with(FactoryConfig::default())
}

#[allow(dead_code)]
pub fn factory_with(config: FactoryConfig) -> (Arc<MemoryStore>, ContextFactory) {
    let store = Arc::new(MemoryStore::new());
    let factory = ContextFactory::new(registry(), store.clone(), config).unwrap();
    (store, factory)
}

/// Factory whose contexts use `context`
#[allow(dead_code)]
pub fn factory_with_context(context: ContextConfig) -> (Arc<MemoryStore>, ContextFactory) {
    factory_with(FactoryConfig {
        context,
        ..FactoryConfig::default()
    })
}

/// Persist a new `Person` outside a transaction and return it with its identity
#[allow(dead_code)]
pub fn committed_person(ctx: &mut ExecutionContext, name: &str, email: &str) -> (ObjectRef, Identity) {
    let person = ctx.new_object("Person").unwrap();
    ctx.set(person, "name", name).unwrap();
    ctx.set(person, "email", email).unwrap();
    let person = ctx.persist(person).unwrap();
    let identity = ctx.identity_of(person).unwrap().unwrap();
    (person, identity)
}

/// Text value of a stored row's field
#[allow(dead_code)]
pub fn stored_text(store: &MemoryStore, identity: &Identity, field: usize) -> Option<String> {
    store
        .committed(identity)
        .and_then(|row| match row.values.get(field) {
            Some(stateline_core::model::StoredValue::Text(text)) => Some(text.clone()),
            _ => None,
        })
}

/// Persist a new object with one text field outside a transaction
#[allow(dead_code)]
pub fn committed_named(
    ctx: &mut ExecutionContext,
    class: &str,
    field: &str,
    text: &str,
) -> (ObjectRef, Identity) {
    let obj = ctx.new_object(class).unwrap();
    ctx.set(obj, field, text).unwrap();
    let obj = ctx.persist(obj).unwrap();
    let identity = ctx.identity_of(obj).unwrap().unwrap();
    (obj, identity)
}
