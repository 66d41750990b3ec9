//! Schema migrations compiled into the adapter

/// One ordered schema step
pub struct Migration {
    pub id: &'static str,
    pub sql: &'static str,
}

/// All embedded migrations, oldest first
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            id: "001_objects",
            sql: include_str!("../../migrations/001_objects.sql"),
        },
        Migration {
            id: "002_store_metadata",
            sql: include_str!("../../migrations/002_store_metadata.sql"),
        },
    ]
}
