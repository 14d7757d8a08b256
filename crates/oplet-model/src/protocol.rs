//! Wire models for the runner protocol.
//!
//! All bodies are JSON except file transfer: input downloads are raw octet
//! streams and output uploads are `multipart/form-data`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{LogSource, TaskExecutionStatus};

/// Response to `POST /runner/heartbeat`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub id: i64,
    pub name: String,
    pub contacted_at: DateTime<Utc>,
}

/// Lease returned by `GET /runner/request-task`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequestResponse {
    pub execution_id: i64,
    pub task_id: i64,
    pub image_ref: String,
    pub environment: HashMap<String, String>,
    /// Opaque JSON blob captured at submission time.
    pub input_parameters: String,
    pub runner_token: String,
    pub inputs_dir: String,
    pub outputs_dir: String,
    pub created_at: DateTime<Utc>,
}

/// State-transition report sent to `POST /runner/tasks/{id}/status`.
///
/// Absent fields leave the stored value untouched; partial updates are the
/// norm since the runner learns container id, timestamps and exit code
/// incrementally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub status: TaskExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Microseconds since the Unix epoch, stamped by the runner.
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub execution_id: i64,
    pub status: TaskExecutionStatus,
    pub updated_at: DateTime<Utc>,
}

/// One recorded output line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    pub source: LogSource,
    pub message: String,
    /// Monotonic counter within one streaming session; part of the
    /// server-side dedup key.
    pub clock: u32,
}

/// Batch submitted to `POST /runner/tasks/{id}/trace`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskTraceRequest {
    pub logs: Vec<LogEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskTraceResponse {
    pub execution_id: i64,
    /// Count of entries actually stored; duplicates are dropped silently.
    pub logs_added: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputFileInfo {
    pub filename: String,
    pub file_size: i64,
    pub mime_type: String,
}

/// Response to `GET /runner/tasks/{id}/inputs` without a `file` selector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskInputsResponse {
    pub execution_id: i64,
    pub files: Vec<InputFileInfo>,
}

/// Receipt for `POST /runner/tasks/{id}/outputs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOutputsResponse {
    pub execution_id: i64,
    pub files_stored: usize,
    pub message: String,
}
