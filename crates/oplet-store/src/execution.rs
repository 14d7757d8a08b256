//! Execution queue and lifecycle repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use oplet_model::{LogSource, TaskExecutionStatus};

use crate::entities::{NewTaskExecution, TaskExecution, TaskExecutionFile, TaskExecutionLog};
use crate::error::StoreError;
use crate::store::{dt_to_ms, ms_to_dt, Store};
use crate::token::{random_token, RUNNER_TOKEN_BYTES};

const EXECUTION_COLUMNS: &str = "id, task_id, submitter_id, status, container_id, exit_code, \
     error_message, runner_token, started_at_ms, finished_at_ms, input_parameters, created_at_ms";

/// Partial update reported by a runner for one execution.
#[derive(Clone, Debug, Default)]
pub struct ExecutionStatusUpdate {
    pub status: TaskExecutionStatus,
    pub container_id: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Repository over `task_executions` and its child tables.
#[derive(Clone)]
pub struct ExecutionRepository {
    store: Store,
}

impl ExecutionRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Inserts a pending execution with a freshly generated runner token.
    pub fn create(&self, new: NewTaskExecution) -> Result<TaskExecution, StoreError> {
        let token = random_token(RUNNER_TOKEN_BYTES);
        let created_at = Utc::now();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_executions
                     (task_id, submitter_id, status, runner_token, input_parameters, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.task_id,
                    new.submitter_id,
                    TaskExecutionStatus::Pending.as_str(),
                    token,
                    new.input_parameters,
                    dt_to_ms(created_at),
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
                params![id],
                map_execution,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get(&self, id: i64) -> Result<TaskExecution, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
                params![id],
                map_execution,
            )
            .map_err(StoreError::from)
        })
    }

    /// Atomically claims the oldest pending execution.
    ///
    /// The claim selects and updates the target row in one statement so
    /// that at most one concurrent caller observes any given row; the
    /// per-execution runner token is regenerated as part of the claim.
    /// Returns `None` when no execution is pending.
    pub fn lease_next(&self) -> Result<Option<TaskExecution>, StoreError> {
        self.store.with_retry(|tx| {
            let token = random_token(RUNNER_TOKEN_BYTES);
            let now = dt_to_ms(Utc::now());
            tx.query_row(
                &format!(
                    "UPDATE task_executions
                     SET started_at_ms = ?1, runner_token = ?2
                     WHERE id = (
                         SELECT id FROM task_executions
                         WHERE started_at_ms IS NULL
                         ORDER BY created_at_ms ASC, id ASC
                         LIMIT 1
                     )
                     RETURNING {EXECUTION_COLUMNS}"
                ),
                params![now, token],
                map_execution,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    /// Clears the lease of a crashed runner: `started_at` is reset, the
    /// runner token rotated and the status moved back to `pending` so the
    /// row becomes claimable again.
    pub fn requeue(&self, id: i64) -> Result<TaskExecution, StoreError> {
        let token = random_token(RUNNER_TOKEN_BYTES);
        self.store.with_tx(|tx| {
            tx.query_row(
                &format!(
                    "UPDATE task_executions
                     SET started_at_ms = NULL, runner_token = ?2, status = ?3,
                         container_id = '', exit_code = NULL, error_message = ''
                     WHERE id = ?1
                     RETURNING {EXECUTION_COLUMNS}"
                ),
                params![id, token, TaskExecutionStatus::Pending.as_str()],
                map_execution,
            )
            .map_err(StoreError::from)
        })
    }

    /// Applies a partial status report; absent fields keep their stored
    /// values.
    pub fn apply_status_update(
        &self,
        id: i64,
        update: &ExecutionStatusUpdate,
    ) -> Result<(), StoreError> {
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE task_executions SET
                     status = ?2,
                     container_id = COALESCE(?3, container_id),
                     exit_code = COALESCE(?4, exit_code),
                     error_message = COALESCE(?5, error_message),
                     started_at_ms = COALESCE(?6, started_at_ms),
                     finished_at_ms = COALESCE(?7, finished_at_ms)
                 WHERE id = ?1",
                params![
                    id,
                    update.status.as_str(),
                    update.container_id,
                    update.exit_code,
                    update.error_message,
                    update.started_at.map(dt_to_ms),
                    update.finished_at.map(dt_to_ms),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Marks the execution finished. Status derives from the outcome: exit
    /// code zero with an empty error message means `succeeded`, anything
    /// else `failed`.
    pub fn set_completed(
        &self,
        id: i64,
        exit_code: i64,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let status = if exit_code == 0 && error_message.is_empty() {
            TaskExecutionStatus::Succeeded
        } else {
            TaskExecutionStatus::Failed
        };
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE task_executions
                 SET status = ?2, exit_code = ?3, error_message = ?4, finished_at_ms = ?5
                 WHERE id = ?1",
                params![id, status.as_str(), exit_code, error_message, dt_to_ms(Utc::now())],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Appends one log line. Returns `false` when the
    /// `(execution, timestamp, source, clock)` tuple is already stored, so
    /// client retries are idempotent.
    pub fn append_log(
        &self,
        execution_id: i64,
        timestamp: i64,
        source: LogSource,
        clock: u32,
        message: &str,
    ) -> Result<bool, StoreError> {
        self.store.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO task_execution_logs
                     (execution_id, timestamp_us, source, clock, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![execution_id, timestamp, source.as_str(), clock, message],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn logs(&self, execution_id: i64) -> Result<Vec<TaskExecutionLog>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, timestamp_us, source, clock, message
                 FROM task_execution_logs
                 WHERE execution_id = ?1
                 ORDER BY timestamp_us ASC, clock ASC",
            )?;
            let rows = stmt.query_map(params![execution_id], map_log)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Records a stored artifact. `filename` is the parameter name for
    /// inputs and the in-container basename for outputs.
    pub fn add_file(
        &self,
        execution_id: i64,
        filename: &str,
        storage_path: &str,
        file_size: i64,
        mime_type: &str,
        is_output: bool,
    ) -> Result<TaskExecutionFile, StoreError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_execution_files
                     (execution_id, filename, storage_path, file_size, mime_type, is_output)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![execution_id, filename, storage_path, file_size, mime_type, is_output],
            )?;
            let id = conn.last_insert_rowid();
            Ok(TaskExecutionFile {
                id,
                execution_id,
                filename: filename.to_string(),
                storage_path: storage_path.to_string(),
                file_size,
                mime_type: mime_type.to_string(),
                is_output,
            })
        })
    }

    pub fn files(
        &self,
        execution_id: i64,
        is_output: bool,
    ) -> Result<Vec<TaskExecutionFile>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, execution_id, filename, storage_path, file_size, mime_type, is_output
                 FROM task_execution_files
                 WHERE execution_id = ?1 AND is_output = ?2
                 ORDER BY filename ASC",
            )?;
            let rows = stmt.query_map(params![execution_id, is_output], map_file)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn file_by_name(
        &self,
        execution_id: i64,
        filename: &str,
    ) -> Result<TaskExecutionFile, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT id, execution_id, filename, storage_path, file_size, mime_type, is_output
                 FROM task_execution_files
                 WHERE execution_id = ?1 AND filename = ?2",
                params![execution_id, filename],
                map_file,
            )
            .map_err(StoreError::from)
        })
    }

    /// Executions that have not reached a terminal state.
    pub fn list_running(&self) -> Result<Vec<TaskExecution>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_executions
                 WHERE status NOT IN ('succeeded', 'failed', 'killed')
                 ORDER BY created_at_ms ASC"
            ))?;
            let rows = stmt.query_map([], map_execution)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn count_by_status(&self, status: TaskExecutionStatus) -> Result<i64, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM task_executions WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// Deletes logs, then file records, then executions created before
    /// `older_than`. Returns the ids of the removed executions so the
    /// caller can drop their blob directories.
    pub fn cleanup_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let cutoff = dt_to_ms(older_than);
        self.store.with_tx(|tx| {
            let mut stmt =
                tx.prepare("SELECT id FROM task_executions WHERE created_at_ms < ?1")?;
            let ids: Vec<i64> = stmt
                .query_map(params![cutoff], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            drop(stmt);

            tx.execute(
                "DELETE FROM task_execution_logs WHERE execution_id IN
                     (SELECT id FROM task_executions WHERE created_at_ms < ?1)",
                params![cutoff],
            )?;
            tx.execute(
                "DELETE FROM task_execution_files WHERE execution_id IN
                     (SELECT id FROM task_executions WHERE created_at_ms < ?1)",
                params![cutoff],
            )?;
            tx.execute(
                "DELETE FROM task_executions WHERE created_at_ms < ?1",
                params![cutoff],
            )?;
            Ok(ids)
        })
    }

    /// Deletes one execution with its logs and file records.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            tx.execute(
                "DELETE FROM task_execution_logs WHERE execution_id = ?1",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM task_execution_files WHERE execution_id = ?1",
                params![id],
            )?;
            let changed = tx.execute("DELETE FROM task_executions WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }
}

fn map_execution(row: &Row<'_>) -> Result<TaskExecution, rusqlite::Error> {
    let status: String = row.get(3)?;
    Ok(TaskExecution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        submitter_id: row.get(2)?,
        status: TaskExecutionStatus::from_str(&status)
            .unwrap_or(TaskExecutionStatus::Pending),
        container_id: row.get(4)?,
        exit_code: row.get(5)?,
        error_message: row.get(6)?,
        runner_token: row.get(7)?,
        started_at: row.get::<_, Option<i64>>(8)?.map(ms_to_dt),
        finished_at: row.get::<_, Option<i64>>(9)?.map(ms_to_dt),
        input_parameters: row.get(10)?,
        created_at: ms_to_dt(row.get(11)?),
    })
}

fn map_log(row: &Row<'_>) -> Result<TaskExecutionLog, rusqlite::Error> {
    let source: String = row.get(3)?;
    Ok(TaskExecutionLog {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        timestamp: row.get(2)?,
        source: LogSource::from_str(&source).unwrap_or(LogSource::System),
        clock: row.get(4)?,
        message: row.get(5)?,
    })
}

fn map_file(row: &Row<'_>) -> Result<TaskExecutionFile, rusqlite::Error> {
    Ok(TaskExecutionFile {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        filename: row.get(2)?,
        storage_path: row.get(3)?,
        file_size: row.get(4)?,
        mime_type: row.get(5)?,
        is_output: row.get(6)?,
    })
}
