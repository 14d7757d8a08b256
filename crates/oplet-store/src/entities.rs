//! Entity rows owned by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use oplet_model::{LogSource, TaskExecutionStatus};

/// A task template bound to an image reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// Globally unique image reference, e.g. `registry/example/hello:latest`.
    pub image_ref: String,
    pub name: String,
    pub author: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Admin-set `(name, value)` pairs applied to every execution.
    pub configurations: Vec<TaskConfiguration>,
}

/// Fields required to create a task.
#[derive(Clone, Debug, Default)]
pub struct NewTask {
    pub image_ref: String,
    pub name: String,
    pub author: String,
    pub description: String,
    pub configurations: Vec<TaskConfiguration>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskConfiguration {
    pub name: String,
    pub value: String,
}

/// One attempt to run a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: i64,
    pub task_id: i64,
    pub submitter_id: i64,
    pub status: TaskExecutionStatus,
    /// Opaque container id, empty until the runner assigns one.
    pub container_id: String,
    pub exit_code: Option<i64>,
    pub error_message: String,
    /// Rotated on every lease; empty means the row predates schema v1 seeds.
    pub runner_token: String,
    /// Set atomically with the first lease; a non-null value fences the row
    /// from all other runners.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Opaque JSON captured from the submission form.
    pub input_parameters: String,
    pub created_at: DateTime<Utc>,
}

/// Fields required to enqueue an execution.
#[derive(Clone, Debug, Default)]
pub struct NewTaskExecution {
    pub task_id: i64,
    pub submitter_id: i64,
    pub input_parameters: String,
}

/// One recorded output line, append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskExecutionLog {
    pub id: i64,
    pub execution_id: i64,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    pub source: LogSource,
    pub clock: u32,
    pub message: String,
}

/// A stored artifact, either submitted input or produced output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskExecutionFile {
    pub id: i64,
    pub execution_id: i64,
    /// Input parameter name for inputs, in-container basename for outputs.
    pub filename: String,
    pub storage_path: String,
    pub file_size: i64,
    pub mime_type: String,
    pub is_output: bool,
}

/// A registered worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,
    pub name: String,
    /// Secret bearer token, 32-byte hex.
    pub token: String,
    pub contacted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
