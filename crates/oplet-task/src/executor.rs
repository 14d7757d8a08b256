//! Container executor seam shared by the Docker driver and the runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// In-container mount point for submitted input files.
pub const INPUTS_DIR: &str = "/oplet/inputs";
/// In-container directory scanned for produced outputs.
pub const OUTPUTS_DIR: &str = "/oplet/outputs";

/// Byte stream handed to the executor for one input file. Consumed exactly
/// once, by the tar packer inside the pipeline.
pub type InputStream = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Progress callback. Invocations are serialized per execution and stop
/// after the first terminal state.
pub type ChangeCallback = Arc<dyn Fn(Execution) + Send + Sync>;

/// One container execution request.
pub struct ExecutionRequest {
    pub image_ref: String,
    pub environment: HashMap<String, String>,
    /// Input name to content; the name is also the in-container filename
    /// under `inputs_dir`.
    pub inputs: HashMap<String, InputStream>,
    pub inputs_dir: String,
    pub outputs_dir: String,
    /// Deadline over the whole pipeline; `None` means unbounded.
    pub timeout: Option<Duration>,
    pub on_change: ChangeCallback,
}

/// States of the execution pipeline, in transition order. From any
/// non-terminal state the pipeline may jump directly to `Failed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionState {
    #[default]
    ProcessingRequest,
    PullingImage,
    ImagePulled,
    CreatingContainer,
    ContainerCreated,
    UploadingFiles,
    FilesUploaded,
    StartingContainer,
    ContainerStarted,
    Running,
    ContainerFinished,
    DownloadingFiles,
    FilesDownloaded,
    Succeeded,
    Failed,
    Killed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }
}

/// Snapshot delivered with every state transition.
#[derive(Clone, Debug, Default)]
pub struct Execution {
    pub state: ExecutionState,
    /// Empty until the runtime assigns one; preserved on failure for
    /// forensic lookup.
    pub container_id: String,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<ExecutionError>,
    /// Raw tar archive of the outputs directory, set at `FilesDownloaded`.
    /// An execution without outputs carries an empty archive.
    pub outputs: Option<Bytes>,
}

/// Machine-readable failure kinds of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    ImagePullFailed,
    ContainerFailed,
    Timeout,
    FileUploadFailed,
    FileDownloadFailed,
    DaemonError,
    ContainerNotFound,
}

impl ExecutionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImagePullFailed => "image-pull-failed",
            Self::ContainerFailed => "container-failed",
            Self::Timeout => "timeout",
            Self::FileUploadFailed => "file-upload-failed",
            Self::FileDownloadFailed => "file-download-failed",
            Self::DaemonError => "daemon-error",
            Self::ContainerNotFound => "container-not-found",
        }
    }
}

/// Pipeline failure with its kind and, once known, the container involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub container_id: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            container_id: None,
        }
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ExecutionErrorKind::ContainerNotFound
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.container_id {
            Some(id) => write!(f, "{} (container: {}): {}", self.kind.as_str(), id, self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// One combined stdout/stderr line with its runtime timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Stream of container log lines; an `Err` item ends the stream.
pub type LogStream = mpsc::Receiver<Result<LogLine, ExecutionError>>;

/// Driver realizing one execution against a container runtime.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Launches the pipeline and returns immediately; progress arrives
    /// through the request's callback.
    async fn execute(&self, request: ExecutionRequest) -> Result<(), ExecutionError>;

    /// Follows the container's combined stdout/stderr with timestamps.
    /// Fails with `ContainerNotFound` when the id is unknown.
    async fn logs(&self, container_id: &str) -> Result<LogStream, ExecutionError>;
}
