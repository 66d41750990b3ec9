//! SQLite storage adapter
//!
//! Committed rows are read through one shared connection. Each context that
//! begins a transaction gets its own connection with an open SQLite
//! transaction, so its writes stay invisible to other contexts until
//! commit. In WAL mode readers never wait on those writers.

use parking_lot::Mutex;
use rusqlite::Connection;
use stateline_core::errors::StatelineError;
use stateline_core::model::{Identity, KeyValue, StoredValue};
use stateline_core::storage::{StoreManager, StoredObject};
use stateline_core_types::ContextId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db;
use crate::errors::{sqlite_op, Result};
use crate::migrations::apply_migrations;
use crate::repo::rows;

type TxConnection = Arc<Mutex<Connection>>;

pub struct SqliteStore {
    path: PathBuf,
    reader: Mutex<Connection>,
    transactions: Mutex<HashMap<ContextId, TxConnection>>,
    next_surrogate: AtomicU64,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("open_transactions", &self.transactions.lock().len())
            .finish()
    }
}

impl SqliteStore {
    /// Open (and migrate) the database file at `path`
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the file cannot be opened or migrated, and
    /// `Fatal` if it was migrated by an incompatible build.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut conn = db::open(&path)?;
        apply_migrations(&mut conn)?;
        let max = rows::max_surrogate(&conn)?;
        debug!(path = %path.display(), max_surrogate = max, "sqlite store opened");
        Ok(Self {
            path,
            reader: Mutex::new(conn),
            transactions: Mutex::new(HashMap::new()),
            next_surrogate: AtomicU64::new(max + 1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed row, ignoring every open transaction
    ///
    /// # Errors
    ///
    /// Returns `Storage` on query failure.
    pub fn committed(&self, identity: &Identity) -> Result<Option<StoredObject>> {
        rows::read_row(&self.reader.lock(), identity)
    }

    /// Number of committed rows
    ///
    /// # Errors
    ///
    /// Returns `Storage` on query failure.
    pub fn committed_len(&self) -> Result<usize> {
        rows::count_rows(&self.reader.lock())
    }

    /// Contexts with an open SQLite transaction
    pub fn open_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Run `f` on the context's transaction connection, or on the shared
    /// connection (autocommit) when it has none
    fn with_conn<T>(&self, ctx: ContextId, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let tx_conn = self.transactions.lock().get(&ctx).cloned();
        match tx_conn {
            Some(conn) => f(&conn.lock()),
            None => f(&self.reader.lock()),
        }
    }
}

/// Visible row whose version matches `expected` when one is given
fn check_version(
    conn: &Connection,
    identity: &Identity,
    expected: Option<i64>,
) -> Result<StoredObject> {
    let row = rows::read_row(conn, identity)?.ok_or_else(|| StatelineError::ObjectNotFound {
        identity: identity.to_string(),
    })?;
    if expected.is_some() && row.version != expected {
        return Err(StatelineError::OptimisticConflict {
            identity: identity.to_string(),
            expected,
            actual: row.version,
        });
    }
    Ok(row)
}

impl StoreManager for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn find_object(&self, ctx: ContextId, identity: &Identity) -> Result<Option<StoredObject>> {
        self.with_conn(ctx, |conn| rows::read_row(conn, identity))
    }

    fn find_unique(
        &self,
        ctx: ContextId,
        class: &str,
        fields: &[usize],
        values: &[KeyValue],
    ) -> Result<Option<StoredObject>> {
        self.with_conn(ctx, |conn| {
            Ok(rows::rows_of_class(conn, class)?.into_iter().find(|row| {
                fields.iter().zip(values).all(|(field, expected)| {
                    row.values.get(*field).and_then(StoredValue::as_key).as_ref() == Some(expected)
                })
            }))
        })
    }

    fn class_for_identity(
        &self,
        ctx: ContextId,
        identity: &Identity,
        candidates: &[String],
    ) -> Result<Option<String>> {
        let class = self.with_conn(ctx, |conn| rows::read_class(conn, identity))?;
        Ok(class.filter(|class| candidates.iter().any(|c| c == class)))
    }

    fn insert(&self, ctx: ContextId, object: &StoredObject) -> Result<Option<Identity>> {
        let assigned = match &object.identity {
            Identity::Temporary { class, .. } => Some(Identity::datastore(
                class.clone(),
                self.next_surrogate.fetch_add(1, Ordering::SeqCst),
            )),
            _ => None,
        };
        let identity = assigned.clone().unwrap_or_else(|| object.identity.clone());
        self.with_conn(ctx, |conn| {
            if rows::read_class(conn, &identity)?.is_some() {
                return Err(StatelineError::storage(
                    "insert",
                    format!("duplicate identity {}", identity),
                ));
            }
            rows::write_row(
                conn,
                &StoredObject {
                    identity: identity.clone(),
                    ..object.clone()
                },
            )
        })?;
        Ok(assigned)
    }

    fn update(
        &self,
        ctx: ContextId,
        identity: &Identity,
        fields: &[(usize, StoredValue)],
        expected_version: Option<i64>,
        new_version: Option<i64>,
    ) -> Result<()> {
        self.with_conn(ctx, |conn| {
            let mut row = check_version(conn, identity, expected_version)?;
            for (field, value) in fields {
                if *field >= row.values.len() {
                    row.values.resize(field + 1, StoredValue::Null);
                }
                row.values[*field] = value.clone();
            }
            if new_version.is_some() {
                row.version = new_version;
            }
            rows::write_row(conn, &row)
        })
    }

    fn delete(
        &self,
        ctx: ContextId,
        identity: &Identity,
        expected_version: Option<i64>,
    ) -> Result<()> {
        self.with_conn(ctx, |conn| {
            check_version(conn, identity, expected_version)?;
            rows::delete_row(conn, identity).map(|_| ())
        })
    }

    fn begin(&self, ctx: ContextId) -> Result<()> {
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&ctx) {
            return Err(StatelineError::storage(
                "begin",
                format!("transaction already open for {}", ctx),
            ));
        }
        let conn = db::open(&self.path)?;
        conn.execute_batch("BEGIN DEFERRED")
            .map_err(sqlite_op("begin"))?;
        transactions.insert(ctx, Arc::new(Mutex::new(conn)));
        debug!(context_id = ctx.as_u64(), "sqlite transaction begun");
        Ok(())
    }

    fn commit(&self, ctx: ContextId) -> Result<()> {
        let Some(conn) = self.transactions.lock().remove(&ctx) else {
            return Ok(());
        };
        let conn = conn.lock();
        if let Err(err) = conn.execute_batch("COMMIT") {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                warn!(context_id = ctx.as_u64(), error = %rollback_err, "rollback after failed commit failed");
            }
            return Err(sqlite_op("commit")(err));
        }
        debug!(context_id = ctx.as_u64(), "sqlite transaction committed");
        Ok(())
    }

    fn rollback(&self, ctx: ContextId) -> Result<()> {
        let Some(conn) = self.transactions.lock().remove(&ctx) else {
            return Ok(());
        };
        conn.lock()
            .execute_batch("ROLLBACK")
            .map_err(sqlite_op("rollback"))?;
        debug!(context_id = ctx.as_u64(), "sqlite transaction rolled back");
        Ok(())
    }
}
