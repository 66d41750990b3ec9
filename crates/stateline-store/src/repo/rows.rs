//! Row encoding for the `objects` table
//!
//! The identity is stored as its JSON form, which doubles as the primary
//! key; field values are one JSON array per row.

use rusqlite::{Connection, OptionalExtension};
use stateline_core::model::{Identity, StoredValue};
use stateline_core::storage::StoredObject;

use crate::errors::{corrupt_row, sqlite_op, Result};

const SELECT_COLUMNS: &str = "SELECT identity_key, class, version, fields_json FROM objects";

/// Primary-key form of an identity
///
/// # Errors
///
/// Returns `Serialization` if the identity cannot be encoded.
pub fn identity_key(identity: &Identity) -> Result<String> {
    Ok(serde_json::to_string(identity)?)
}

/// Surrogate column value for datastore identities
pub fn surrogate_of(identity: &Identity) -> Option<i64> {
    match identity {
        Identity::Datastore { id, .. } => i64::try_from(*id).ok(),
        _ => None,
    }
}

struct RawRow {
    identity_key: String,
    class: String,
    version: Option<i64>,
    fields_json: String,
}

impl RawRow {
    fn decode(self) -> Result<StoredObject> {
        let identity: Identity = serde_json::from_str(&self.identity_key)
            .map_err(|e| corrupt_row(&self.identity_key, &e))?;
        let values: Vec<StoredValue> = serde_json::from_str(&self.fields_json)
            .map_err(|e| corrupt_row(&self.identity_key, &e))?;
        Ok(StoredObject {
            identity,
            class: self.class,
            version: self.version,
            values,
        })
    }
}

fn raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        identity_key: row.get(0)?,
        class: row.get(1)?,
        version: row.get(2)?,
        fields_json: row.get(3)?,
    })
}

/// # Errors
///
/// Returns `Storage` on query failure and `Serialization` for undecodable rows.
pub fn read_row(conn: &Connection, identity: &Identity) -> Result<Option<StoredObject>> {
    let key = identity_key(identity)?;
    let row = conn
        .query_row(
            &format!("{} WHERE identity_key = ?1", SELECT_COLUMNS),
            [&key],
            raw,
        )
        .optional()
        .map_err(sqlite_op("find"))?;
    row.map(RawRow::decode).transpose()
}

/// Concrete class of a stored row
///
/// # Errors
///
/// Returns `Storage` on query failure.
pub fn read_class(conn: &Connection, identity: &Identity) -> Result<Option<String>> {
    let key = identity_key(identity)?;
    conn.query_row(
        "SELECT class FROM objects WHERE identity_key = ?1",
        [&key],
        |row| row.get(0),
    )
    .optional()
    .map_err(sqlite_op("find_class"))
}

/// Every row of one concrete class, in key order
///
/// # Errors
///
/// Returns `Storage` on query failure and `Serialization` for undecodable rows.
pub fn rows_of_class(conn: &Connection, class: &str) -> Result<Vec<StoredObject>> {
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE class = ?1 ORDER BY identity_key",
            SELECT_COLUMNS
        ))
        .map_err(sqlite_op("find_class_rows"))?;
    let raws = stmt
        .query_map([class], raw)
        .map_err(sqlite_op("find_class_rows"))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sqlite_op("find_class_rows"))?;
    raws.into_iter().map(RawRow::decode).collect()
}

/// Insert or replace the row for `object.identity`
///
/// # Errors
///
/// Returns `Storage` on write failure.
pub fn write_row(conn: &Connection, object: &StoredObject) -> Result<()> {
    let key = identity_key(&object.identity)?;
    let fields_json = serde_json::to_string(&object.values)?;
    conn.execute(
        "INSERT INTO objects (identity_key, class, surrogate, version, fields_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(identity_key) DO UPDATE SET
            class = excluded.class,
            version = excluded.version,
            fields_json = excluded.fields_json,
            updated_at = excluded.updated_at",
        rusqlite::params![
            key,
            object.class,
            surrogate_of(&object.identity),
            object.version,
            fields_json,
            chrono::Utc::now().timestamp(),
        ],
    )
    .map_err(sqlite_op("write"))?;
    Ok(())
}

/// # Errors
///
/// Returns `Storage` on write failure.
pub fn delete_row(conn: &Connection, identity: &Identity) -> Result<bool> {
    let key = identity_key(identity)?;
    let deleted = conn
        .execute("DELETE FROM objects WHERE identity_key = ?1", [&key])
        .map_err(sqlite_op("delete"))?;
    Ok(deleted > 0)
}

/// # Errors
///
/// Returns `Storage` on query failure.
pub fn count_rows(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))
        .map_err(sqlite_op("count"))?;
    Ok(usize::try_from(count).unwrap_or_default())
}

/// Highest surrogate key in use
///
/// # Errors
///
/// Returns `Storage` on query failure.
pub fn max_surrogate(conn: &Connection) -> Result<u64> {
    let max: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(surrogate), 0) FROM objects",
            [],
            |row| row.get(0),
        )
        .map_err(sqlite_op("max_surrogate"))?;
    Ok(u64::try_from(max).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::apply_migrations;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        conn
    }

    fn person(id: u64, name: &str) -> StoredObject {
        StoredObject {
            identity: Identity::datastore("Person", id),
            class: "Person".to_string(),
            version: Some(1),
            values: vec![
                StoredValue::Text(name.to_string()),
                StoredValue::Ref(Identity::datastore("Person", 99)),
            ],
        }
    }

    #[test]
    fn test_row_survives_write_and_read() {
        let conn = conn();
        let row = person(1, "Ann");

        write_row(&conn, &row).unwrap();

        assert_eq!(read_row(&conn, &row.identity).unwrap(), Some(row.clone()));
        assert_eq!(
            read_class(&conn, &row.identity).unwrap().as_deref(),
            Some("Person")
        );
        assert_eq!(max_surrogate(&conn).unwrap(), 1);
    }

    #[test]
    fn test_write_replaces_existing_row() {
        let conn = conn();
        write_row(&conn, &person(1, "Ann")).unwrap();

        let mut changed = person(1, "Annie");
        changed.version = Some(2);
        write_row(&conn, &changed).unwrap();

        assert_eq!(count_rows(&conn).unwrap(), 1);
        assert_eq!(read_row(&conn, &changed.identity).unwrap(), Some(changed));
    }

    #[test]
    fn test_application_identity_has_no_surrogate() {
        let conn = conn();
        let row = StoredObject {
            identity: Identity::single("Account", "A-1"),
            class: "Account".to_string(),
            version: None,
            values: vec![StoredValue::Text("A-1".to_string())],
        };

        write_row(&conn, &row).unwrap();

        assert_eq!(surrogate_of(&row.identity), None);
        assert_eq!(max_surrogate(&conn).unwrap(), 0);
        assert_eq!(rows_of_class(&conn, "Account").unwrap(), vec![row.clone()]);
        assert!(delete_row(&conn, &row.identity).unwrap());
        assert!(!delete_row(&conn, &row.identity).unwrap());
    }

    #[test]
    fn test_undecodable_row_is_serialization_error() {
        let conn = conn();
        conn.execute(
            "INSERT INTO objects (identity_key, class, version, fields_json, updated_at)
             VALUES ('not json', 'Person', NULL, '[]', 0)",
            [],
        )
        .unwrap();

        let err = rows_of_class(&conn, "Person").unwrap_err();

        assert_eq!(err.kind(), stateline_core::ErrorKind::Serialization);
    }
}
