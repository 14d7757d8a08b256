//! Connection management, pragmas, migrations and transaction helpers.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Transaction};

use crate::error::StoreError;

const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT_MS: u64 = 30_000;
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const RETRY_MAX_ATTEMPTS: u32 = 10;

/// Handle to the embedded database. Cheap to clone; all clones share the
/// single writer connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database at `path` and applies migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS as i64)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Runs `f` against the shared connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }

    /// Runs `f` inside a transaction, committing on success.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs `f` inside a transaction, retrying with exponential backoff
    /// while the engine reports busy/locked. Backoff starts at 500 ms and
    /// doubles, up to 10 attempts.
    pub fn with_retry<T>(
        &self,
        f: impl Fn(&Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut backoff = RETRY_INITIAL_BACKOFF;
        let mut attempts = 0u32;

        loop {
            match self.with_tx(&f) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() => {
                    attempts += 1;
                    if attempts >= RETRY_MAX_ATTEMPTS {
                        return Err(StoreError::BusyExhausted { attempts });
                    }
                    tracing::debug!(
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "transaction busy, will retry"
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                     version INTEGER PRIMARY KEY,
                     label TEXT NOT NULL,
                     applied_at_ms INTEGER NOT NULL
                 )",
            )?;

            let current: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )?;
            if current > SCHEMA_VERSION {
                return Err(StoreError::Constraint(format!(
                    "schema version {current} is newer than supported {SCHEMA_VERSION}"
                )));
            }
            if current < 1 {
                apply_migration_v1(tx)?;
                record_migration(tx, 1, "baseline_tables")?;
            }
            Ok(())
        })
    }
}

fn record_migration(tx: &Transaction, version: i64, label: &str) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO schema_migrations (version, label, applied_at_ms) VALUES (?1, ?2, ?3)",
        params![version, label, dt_to_ms(Utc::now())],
    )?;
    Ok(())
}

fn apply_migration_v1(tx: &Transaction) -> Result<(), StoreError> {
    tx.execute_batch(
        "CREATE TABLE tasks (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             image_ref TEXT NOT NULL UNIQUE,
             name TEXT NOT NULL,
             author TEXT NOT NULL DEFAULT '',
             description TEXT NOT NULL DEFAULT '',
             created_at_ms INTEGER NOT NULL
         );
         CREATE INDEX tasks_name ON tasks (name);
         CREATE INDEX tasks_author ON tasks (author);

         CREATE TABLE task_configurations (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             task_id INTEGER NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
             name TEXT NOT NULL,
             value TEXT NOT NULL,
             UNIQUE (task_id, name, value)
         );

         CREATE TABLE task_executions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             task_id INTEGER NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
             submitter_id INTEGER NOT NULL DEFAULT 0,
             status TEXT NOT NULL DEFAULT 'pending',
             container_id TEXT NOT NULL DEFAULT '',
             exit_code INTEGER,
             error_message TEXT NOT NULL DEFAULT '',
             runner_token TEXT NOT NULL UNIQUE,
             started_at_ms INTEGER,
             finished_at_ms INTEGER,
             input_parameters TEXT NOT NULL DEFAULT '',
             created_at_ms INTEGER NOT NULL
         );
         CREATE INDEX task_executions_status ON task_executions (status);
         CREATE INDEX task_executions_container ON task_executions (container_id);
         CREATE INDEX task_executions_queue
             ON task_executions (created_at_ms) WHERE started_at_ms IS NULL;

         CREATE TABLE task_execution_logs (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             execution_id INTEGER NOT NULL REFERENCES task_executions (id) ON DELETE CASCADE,
             timestamp_us INTEGER NOT NULL,
             source TEXT NOT NULL,
             clock INTEGER NOT NULL,
             message TEXT NOT NULL,
             UNIQUE (execution_id, timestamp_us, source, clock)
         );

         CREATE TABLE task_execution_files (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             execution_id INTEGER NOT NULL REFERENCES task_executions (id) ON DELETE CASCADE,
             filename TEXT NOT NULL,
             storage_path TEXT NOT NULL,
             file_size INTEGER NOT NULL,
             mime_type TEXT NOT NULL DEFAULT 'application/octet-stream',
             is_output INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX task_execution_files_execution ON task_execution_files (execution_id);

         CREATE TABLE runners (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL UNIQUE,
             token TEXT NOT NULL UNIQUE,
             contacted_at_ms INTEGER,
             created_at_ms INTEGER NOT NULL
         );",
    )?;
    Ok(())
}

/// Millisecond storage form used for all instants except log timestamps,
/// which keep the protocol's microsecond resolution.
pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
