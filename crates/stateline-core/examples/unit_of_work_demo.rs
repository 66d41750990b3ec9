//! Walk through one unit of work against the in-memory store
//!
//! - Persist a small object graph in a transaction
//! - Read it back from a second context through the shared L2 cache
//! - Edit a detached copy and attach it again
//!
//! Run with `RUST_LOG=stateline=debug` to see the flush and cache events.

use std::sync::Arc;

use stateline_core::logging_facility::{init, Profile};
use stateline_core::model::StoredValue;
use stateline_core::{
    ClassMetadata, ContextFactory, FactoryConfig, FieldMetadata, MemoryStore, MetadataRegistry,
    Value,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init(Profile::Development);

    let mut registry = MetadataRegistry::new();
    registry.register(
        ClassMetadata::new("Author")
            .versioned()
            .field(FieldMetadata::basic("name"))
            .field(FieldMetadata::collection("books", "Book").mapped_by("author")),
    )?;
    registry.register(
        ClassMetadata::new("Book")
            .field(FieldMetadata::basic("title"))
            .field(FieldMetadata::reference("author", "Author")),
    )?;

    let store = Arc::new(MemoryStore::new());
    let factory = ContextFactory::new(registry, store.clone(), FactoryConfig::default())?;

    // Unit of work 1: an author with one book
    let mut ctx = factory.open()?;
    ctx.begin()?;
    let author = ctx.new_object("Author")?;
    ctx.set(author, "name", "Ursula")?;
    let author = ctx.persist(author)?;
    let book = ctx.new_object("Book")?;
    ctx.set(book, "title", "The Dispossessed")?;
    let book = ctx.persist(book)?;
    ctx.add_to_collection(author, "books", book)?;
    ctx.commit()?;

    let author_id = ctx.identity_of(author)?.ok_or("author has no identity")?;
    println!("committed {} ({} rows)", author_id, store.committed_len());
    println!("book.author = {:?}", ctx.get(book, "author")?);

    // Unit of work 2: another context is served from L2
    let mut reader = factory.open()?;
    let found = reader.find_by_identity(&author_id, true, true, None)?;
    println!(
        "second context sees name={:?} version={:?}",
        reader.get(found, "name")?,
        reader.version_of(found)?
    );

    // Detached edit, attached in a third context
    let mut copy = reader.detach_copy(found)?;
    copy.set_value(0, StoredValue::Text("Ursula K. Le Guin".to_string()));
    let mut writer = factory.open()?;
    writer.begin()?;
    let attached = writer.attach_copy(&copy)?;
    writer.commit()?;
    println!(
        "after attach: name={:?} version={:?}",
        writer.get(attached, "name")?,
        writer.version_of(attached)?
    );
    assert_eq!(
        writer.get(attached, "name")?,
        Value::text("Ursula K. Le Guin")
    );

    ctx.close()?;
    reader.close()?;
    writer.close()?;
    Ok(())
}
