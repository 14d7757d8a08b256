//! The runner loop: heartbeat, lease polling and execution dispatch.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use oplet_model::{LogEntry, LogSource, TaskExecutionStatus, TaskRequestResponse, TaskStatusRequest};
use oplet_task::executor::{
    Execution, ExecutionRequest, ExecutionState, Executor, InputStream,
};

use crate::client::{Client, ClientError};
use crate::config::RunnerConfig;

const LOG_FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Long-running worker driving the whole lease/execute/report cycle.
pub struct Runner {
    client: Arc<Client>,
    executor: Arc<dyn Executor>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(config: RunnerConfig, executor: Arc<dyn Executor>) -> Result<Self, ClientError> {
        let client = Arc::new(Client::new(&config.server_url, config.token.clone())?);
        Ok(Self {
            client,
            executor,
            config,
        })
    }

    /// Runs until `shutdown` is cancelled. A failed heartbeat or a failed
    /// execution is logged and the loop continues.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut poll = tokio::time::interval(self.config.execution_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("runner shutting down");
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = self.client.send_heartbeat().await {
                        tracing::warn!(error = %err, "failed to send heartbeat");
                    }
                }
                _ = poll.tick() => {
                    if let Err(err) = self.execute_next_task().await {
                        tracing::error!(error = %err, "task execution error");
                    }
                }
            }
        }
    }

    async fn execute_next_task(&self) -> Result<(), ClientError> {
        let Some(lease) = self.client.request_task().await? else {
            return Ok(());
        };

        tracing::info!(
            execution_id = lease.execution_id,
            task_id = lease.task_id,
            image_ref = %lease.image_ref,
            "received task assignment"
        );
        self.execute_task(lease).await
    }

    async fn execute_task(&self, lease: TaskRequestResponse) -> Result<(), ClientError> {
        let execution_id = lease.execution_id;

        if let Err(err) = self
            .client
            .update_status(
                execution_id,
                &TaskStatusRequest {
                    status: TaskExecutionStatus::PullingImage,
                    container_id: None,
                    exit_code: None,
                    error: None,
                    started_at: Some(Utc::now()),
                    finished_at: None,
                    timestamp: Utc::now().timestamp_micros(),
                },
            )
            .await
        {
            tracing::warn!(execution_id, error = %err, "failed to update task status");
        }

        let inputs = match self.download_input_files(execution_id).await {
            Ok(inputs) => inputs,
            Err(err) => {
                tracing::error!(execution_id, error = %err, "failed to download input files");
                self.report_failure(execution_id, &format!("file-download-failed: {err}"))
                    .await;
                return Err(err);
            }
        };

        let request = ExecutionRequest {
            image_ref: lease.image_ref.clone(),
            environment: lease.environment.clone(),
            inputs,
            inputs_dir: lease.inputs_dir.clone(),
            outputs_dir: lease.outputs_dir.clone(),
            timeout: None,
            on_change: self.spawn_change_dispatcher(execution_id),
        };

        if let Err(err) = self.executor.execute(request).await {
            tracing::error!(execution_id, error = %err, "task execution failed");
            self.report_failure(execution_id, &err.to_string()).await;
        }
        Ok(())
    }

    async fn report_failure(&self, execution_id: i64, error: &str) {
        let report = TaskStatusRequest {
            status: TaskExecutionStatus::Failed,
            container_id: None,
            exit_code: None,
            error: Some(error.to_string()),
            started_at: None,
            finished_at: Some(Utc::now()),
            timestamp: Utc::now().timestamp_micros(),
        };
        if let Err(err) = self.client.update_status(execution_id, &report).await {
            tracing::warn!(execution_id, error = %err, "failed to update failed task status");
        }
    }

    /// Downloads every declared input, keyed by parameter name so the
    /// executor materializes each file at `inputs_dir/<name>`.
    async fn download_input_files(
        &self,
        execution_id: i64,
    ) -> Result<HashMap<String, InputStream>, ClientError> {
        let mut inputs = HashMap::new();
        for info in self.client.list_input_files(execution_id).await? {
            match self
                .client
                .download_input_file(execution_id, &info.filename)
                .await
            {
                Ok(stream) => {
                    tracing::info!(
                        execution_id,
                        parameter_name = %info.filename,
                        "downloaded input file"
                    );
                    inputs.insert(info.filename, stream);
                }
                Err(err) => {
                    tracing::warn!(
                        execution_id,
                        parameter_name = %info.filename,
                        error = %err,
                        "failed to download input file"
                    );
                }
            }
        }
        Ok(inputs)
    }

    /// Creates the executor callback. Snapshots flow through a channel to a
    /// dispatcher task so reports stay in emission order.
    fn spawn_change_dispatcher(&self, execution_id: i64) -> oplet_task::executor::ChangeCallback {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Execution>();
        let client = self.client.clone();
        let executor = self.executor.clone();

        tokio::spawn(async move {
            while let Some(execution) = receiver.recv().await {
                handle_change(&client, &executor, execution_id, execution).await;
            }
        });

        Arc::new(move |execution| {
            let _ = sender.send(execution);
        })
    }
}

async fn handle_change(
    client: &Arc<Client>,
    executor: &Arc<dyn Executor>,
    execution_id: i64,
    execution: Execution,
) {
    // The initial snapshot carries no progress; the stored status is
    // already `pending` and reporting it after `pulling_image` would walk
    // the state machine backwards.
    if execution.state == ExecutionState::ProcessingRequest {
        return;
    }

    let report = status_request(&execution);
    if let Err(err) = client.update_status(execution_id, &report).await {
        tracing::warn!(
            execution_id,
            status = %report.status,
            error = %err,
            "failed to update task status"
        );
    }

    match execution.state {
        ExecutionState::ContainerStarted => {
            spawn_log_streamer(
                client.clone(),
                executor.clone(),
                execution_id,
                execution.container_id.clone(),
            );
        }
        ExecutionState::FilesDownloaded => {
            if let Some(outputs) = &execution.outputs {
                upload_outputs(client, execution_id, outputs).await;
            }
        }
        ExecutionState::Succeeded => {
            tracing::info!(execution_id, "task execution succeeded");
        }
        ExecutionState::Failed => {
            tracing::error!(execution_id, error = ?execution.error, "task execution failed");
        }
        _ => {}
    }
}

fn status_request(execution: &Execution) -> TaskStatusRequest {
    TaskStatusRequest {
        status: map_state_to_status(execution.state),
        container_id: (!execution.container_id.is_empty())
            .then(|| execution.container_id.clone()),
        exit_code: execution.exit_code,
        error: execution.error.as_ref().map(|err| err.to_string()),
        started_at: execution.started_at,
        finished_at: execution.finished_at,
        timestamp: Utc::now().timestamp_micros(),
    }
}

pub(crate) fn map_state_to_status(state: ExecutionState) -> TaskExecutionStatus {
    match state {
        ExecutionState::ProcessingRequest => TaskExecutionStatus::Pending,
        ExecutionState::PullingImage => TaskExecutionStatus::PullingImage,
        ExecutionState::ImagePulled => TaskExecutionStatus::ImagePulled,
        ExecutionState::CreatingContainer => TaskExecutionStatus::CreatingContainer,
        ExecutionState::ContainerCreated => TaskExecutionStatus::ContainerCreated,
        ExecutionState::UploadingFiles => TaskExecutionStatus::UploadingFiles,
        ExecutionState::FilesUploaded => TaskExecutionStatus::FilesUploaded,
        ExecutionState::StartingContainer => TaskExecutionStatus::StartingContainer,
        ExecutionState::ContainerStarted => TaskExecutionStatus::ContainerStarted,
        ExecutionState::Running => TaskExecutionStatus::Running,
        ExecutionState::ContainerFinished => TaskExecutionStatus::Finished,
        ExecutionState::DownloadingFiles => TaskExecutionStatus::DownloadingFiles,
        ExecutionState::FilesDownloaded => TaskExecutionStatus::FilesDownloaded,
        ExecutionState::Succeeded => TaskExecutionStatus::Succeeded,
        ExecutionState::Failed => TaskExecutionStatus::Failed,
        ExecutionState::Killed => TaskExecutionStatus::Killed,
    }
}

/// Follows the container's log stream, assigns the session-local clock and
/// flushes batches every second. Exits when the stream ends or the
/// container disappears.
fn spawn_log_streamer(
    client: Arc<Client>,
    executor: Arc<dyn Executor>,
    execution_id: i64,
    container_id: String,
) {
    tokio::spawn(async move {
        let mut stream = match executor.logs(&container_id).await {
            Ok(stream) => stream,
            Err(err) if err.is_not_found() => return,
            Err(err) => {
                tracing::error!(
                    execution_id,
                    container_id = %container_id,
                    error = %err,
                    "failed to get container logs"
                );
                return;
            }
        };

        let mut local_clock: u32 = 0;
        let mut pending: Vec<LogEntry> = Vec::new();
        let mut flush = tokio::time::interval(LOG_FLUSH_INTERVAL);

        loop {
            tokio::select! {
                item = stream.recv() => match item {
                    Some(Ok(line)) => {
                        local_clock += 1;
                        pending.push(LogEntry {
                            timestamp: line.timestamp.timestamp_micros(),
                            source: LogSource::Container,
                            message: line.message,
                            clock: local_clock,
                        });
                    }
                    Some(Err(err)) => {
                        if !err.is_not_found() {
                            tracing::warn!(
                                execution_id,
                                container_id = %container_id,
                                error = %err,
                                "log stream failed"
                            );
                        }
                        break;
                    }
                    None => break,
                },
                _ = flush.tick() => {
                    submit_pending(&client, execution_id, &mut pending).await;
                }
            }
        }

        submit_pending(&client, execution_id, &mut pending).await;
        tracing::info!(execution_id, "stopped streaming logs");
    });
}

async fn submit_pending(client: &Client, execution_id: i64, pending: &mut Vec<LogEntry>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    if let Err(err) = client.submit_logs(execution_id, batch).await {
        tracing::warn!(execution_id, error = %err, "failed to submit logs");
    }
}

async fn upload_outputs(client: &Client, execution_id: i64, archive: &[u8]) {
    let files = match walk_output_archive(archive) {
        Ok(files) => files,
        Err(err) => {
            tracing::error!(execution_id, error = %err, "failed to read output archive");
            return;
        }
    };
    if files.is_empty() {
        return;
    }

    match client.upload_output_files(execution_id, files).await {
        Ok(receipt) => {
            tracing::info!(
                execution_id,
                files_stored = receipt.files_stored,
                "uploaded output files"
            );
        }
        Err(err) => {
            tracing::error!(execution_id, error = %err, "failed to upload output files");
        }
    }
}

/// Extracts the regular entries of an output tar archive as
/// `(basename, content)` pairs.
pub(crate) fn walk_output_archive(
    archive: &[u8],
) -> Result<Vec<(String, Vec<u8>)>, std::io::Error> {
    let mut reader = tar::Archive::new(archive);
    let mut files = Vec::new();

    for entry in reader.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let Some(name) = entry
            .path()?
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
        else {
            continue;
        };
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        files.push((name, content));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_covers_the_full_chain() {
        assert_eq!(
            map_state_to_status(ExecutionState::ProcessingRequest),
            TaskExecutionStatus::Pending
        );
        assert_eq!(
            map_state_to_status(ExecutionState::ContainerFinished),
            TaskExecutionStatus::Finished
        );
        assert_eq!(
            map_state_to_status(ExecutionState::Succeeded),
            TaskExecutionStatus::Succeeded
        );
        assert_eq!(
            map_state_to_status(ExecutionState::Killed),
            TaskExecutionStatus::Killed
        );
    }

    #[test]
    fn walk_output_archive_extracts_regular_files_by_basename() {
        let mut builder = tar::Builder::new(Vec::new());
        let content = b"hello world";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "outputs/out.txt", content.as_slice())
            .unwrap();
        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_size(0);
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_mode(0o755);
        builder
            .append_data(&mut dir_header, "outputs/", std::io::empty())
            .unwrap();
        let archive = builder.into_inner().unwrap();

        let files = walk_output_archive(&archive).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "out.txt");
        assert_eq!(files[0].1, content);
    }

    #[test]
    fn walk_output_archive_handles_empty_archives() {
        assert!(walk_output_archive(&[]).unwrap().is_empty());
    }

    #[test]
    fn status_request_carries_known_fields_only() {
        let execution = Execution {
            state: ExecutionState::ContainerStarted,
            container_id: "cafebabe".into(),
            ..Default::default()
        };
        let report = status_request(&execution);
        assert_eq!(report.status, TaskExecutionStatus::ContainerStarted);
        assert_eq!(report.container_id.as_deref(), Some("cafebabe"));
        assert!(report.exit_code.is_none());
        assert!(report.finished_at.is_none());
        assert!(report.timestamp > 0);
    }
}
