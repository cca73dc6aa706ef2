//! SQLite store: schema migrations, shared connection, transactions
//!
//! All engine state lives in one SQLite file opened in WAL mode. Writers
//! share a single `Connection` behind `Arc<Mutex<..>>`; every multi-row
//! mutation goes through `with_tx` / `with_immediate_tx` so a sub-range
//! either commits in full or not at all.

use crate::error::{Result, SyncError};
use num_bigint::BigInt;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Run schema migrations from SQL files
///
/// Reads all .sql files from the specified directory and executes them in
/// file-name order (`00_`, `01_`, ...). All SQL files must use
/// "IF NOT EXISTS" clauses so re-running is a no-op.
///
/// Example:
/// ```no_run
/// # use restakeflow::pipeline::db::run_schema_migrations;
/// let mut conn = rusqlite::Connection::open("restakeflow.db").unwrap();
/// run_schema_migrations(&mut conn, "sql").unwrap();
/// ```
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<()> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(SyncError::Schema(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)
            .map_err(|e| SyncError::Schema(format!("{}: {}", filename, e)))?;
        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database file. Does not run migrations.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self::from_connection(conn))
    }

    /// Open the database and bring its schema up to date.
    pub fn open_and_migrate(db_path: &str, schema_dir: &str) -> Result<Self> {
        let mut conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_schema_migrations(&mut conn, schema_dir)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection outside any explicit transaction.
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|_| SyncError::LockPoisoned)?;
        f(&conn)
    }

    /// Run `f` in a deferred transaction; commit on `Ok`, roll back on `Err`.
    pub fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        self.with_behavior(TransactionBehavior::Deferred, f)
    }

    /// Like `with_tx` but takes the write lock up front (`BEGIN IMMEDIATE`),
    /// so read-modify-write sequences inside `f` are atomic against other
    /// writers on the same file.
    pub fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        self.with_behavior(TransactionBehavior::Immediate, f)
    }

    fn with_behavior<T, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|_| SyncError::LockPoisoned)?;
        let tx = conn.transaction_with_behavior(behavior)?;
        // Dropping an uncommitted Transaction rolls it back.
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// Amounts are stored as decimal TEXT to keep full precision.
pub fn amount_to_sql(value: &BigInt) -> String {
    value.to_string()
}

pub fn amount_from_sql(text: &str) -> Result<BigInt> {
    text.parse::<BigInt>()
        .map_err(|e| SyncError::Corrupt(format!("amount {:?}: {}", text, e)))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let (file, store) = create_test_store();
        drop(store);

        let mut conn = Connection::open(file.path()).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('checkpoints', 'event_log', 'operators', 'allocations', 'metric_buckets')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_missing_schema_dir() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = run_schema_migrations(&mut conn, "/nonexistent/schema").unwrap_err();
        assert!(matches!(err, SyncError::Schema(_)));
    }

    #[test]
    fn test_failed_closure_rolls_back() {
        let (_file, store) = create_test_store();

        let result: Result<()> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO checkpoints (key, cursor, updated_at) VALUES ('k', 1, 0)",
                [],
            )?;
            Err(SyncError::Source("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_amount_text_roundtrip_preserves_precision() {
        let big: BigInt = "115792089237316195423570985008687907853269984665640564039457584007913129639935"
            .parse()
            .unwrap();
        assert_eq!(amount_from_sql(&amount_to_sql(&big)).unwrap(), big);
        assert!(matches!(amount_from_sql("1.5"), Err(SyncError::Corrupt(_))));
    }
}
