//! Docker realization of the execution pipeline.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::executor::{
    ChangeCallback, Execution, ExecutionError, ExecutionErrorKind, ExecutionRequest,
    ExecutionState, Executor, InputStream, LogLine, LogStream,
};

const INPUTS_VOLUME: &str = "oplet-inputs";
const OUTPUTS_VOLUME: &str = "oplet-outputs";
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);
const LOG_CHANNEL_CAPACITY: usize = 64;

/// `Executor` backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerExecutor {
    client: Docker,
}

impl DockerExecutor {
    /// Connects with the environment defaults (`DOCKER_HOST` or the local
    /// socket).
    pub fn new() -> Result<Self, ExecutionError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|err| daemon_error(format!("failed to create docker client: {err}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    async fn pull_image(&self, image_ref: &str) -> Result<(), ExecutionError> {
        tracing::info!(image = image_ref, "pulling image");
        let options = CreateImageOptions::<String> {
            from_image: image_ref.to_string(),
            ..Default::default()
        };
        let mut progress = self.client.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|err| {
                ExecutionError::new(
                    ExecutionErrorKind::ImagePullFailed,
                    format!("failed to pull image {image_ref}: {err}"),
                )
            })?;
        }
        tracing::info!(image = image_ref, "image pulled");
        Ok(())
    }

    async fn create_container(&self, request: &ExecutionRequest) -> Result<String, ExecutionError> {
        let env: Vec<String> = request
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let host_config = HostConfig {
            network_mode: Some("bridge".to_string()),
            // The executor owns the cleanup boundary.
            auto_remove: Some(false),
            mounts: Some(vec![
                Mount {
                    typ: Some(MountTypeEnum::VOLUME),
                    source: Some(INPUTS_VOLUME.to_string()),
                    target: Some(request.inputs_dir.clone()),
                    ..Default::default()
                },
                Mount {
                    typ: Some(MountTypeEnum::VOLUME),
                    source: Some(OUTPUTS_VOLUME.to_string()),
                    target: Some(request.outputs_dir.clone()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let config = Config {
            image: Some(request.image_ref.clone()),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|err| daemon_error(format!("failed to create container: {err}")))?;

        tracing::debug!(container_id = %created.id, image = %request.image_ref, "container created");
        Ok(created.id)
    }

    async fn upload_inputs(
        &self,
        container_id: &str,
        inputs_dir: &str,
        inputs: HashMap<String, InputStream>,
    ) -> Result<(), ExecutionError> {
        let archive = pack_inputs(inputs).await.map_err(|err| {
            err.with_container(container_id)
        })?;

        let options = UploadToContainerOptions::<String> {
            path: inputs_dir.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(container_id, Some(options), archive)
            .await
            .map_err(|err| {
                ExecutionError::new(
                    ExecutionErrorKind::FileUploadFailed,
                    format!("failed to copy files to container: {err}"),
                )
                .with_container(container_id)
            })?;

        tracing::debug!(container_id, "input files uploaded");
        Ok(())
    }

    /// Reads the outputs directory back as one tar archive. A missing
    /// directory yields an empty archive, not an error.
    async fn download_outputs(
        &self,
        container_id: &str,
        outputs_dir: &str,
    ) -> Result<Bytes, ExecutionError> {
        let options = DownloadFromContainerOptions {
            path: outputs_dir.to_string(),
        };
        let mut stream = self
            .client
            .download_from_container(container_id, Some(options));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(err) if is_docker_not_found(&err) => {
                    tracing::debug!(container_id, outputs_dir, "no output files found");
                    return Ok(Bytes::new());
                }
                Err(err) => {
                    return Err(ExecutionError::new(
                        ExecutionErrorKind::FileDownloadFailed,
                        format!("error downloading files: {err}"),
                    )
                    .with_container(container_id));
                }
            }
        }
        Ok(Bytes::from(archive))
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64, ExecutionError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut wait = self.client.wait_container(container_id, Some(options));
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit surfaces as an error item carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(daemon_error(format!("error waiting for container: {err}"))
                .with_container(container_id)),
            None => Err(daemon_error("container wait stream ended unexpectedly")
                .with_container(container_id)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), ExecutionError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(container_id, Some(options)).await {
            Ok(()) => {
                tracing::debug!(container_id, "container removed");
                Ok(())
            }
            Err(err) if is_docker_not_found(&err) => Ok(()),
            Err(err) => Err(daemon_error(format!("failed to remove container: {err}"))
                .with_container(container_id)),
        }
    }

    /// Cleanup always runs detached under a fresh deadline so a cancelled
    /// pipeline cannot orphan the container.
    fn spawn_cleanup(&self, container_id: String) {
        let executor = self.clone();
        tokio::spawn(async move {
            let removed =
                tokio::time::timeout(CLEANUP_TIMEOUT, executor.remove(&container_id)).await;
            match removed {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(container_id = %container_id, error = %err, "failed to cleanup container");
                }
                Err(_) => {
                    tracing::warn!(container_id = %container_id, "container cleanup timed out");
                }
            }
        });
    }

    /// Drives the pipeline, emitting one callback per transition. The
    /// caller handles the terminal failure emission and cleanup.
    async fn drive(
        &self,
        request: &mut ExecutionRequest,
        execution: &mut Execution,
        emit: &ChangeCallback,
    ) -> Result<(), ExecutionError> {
        execution.state = ExecutionState::PullingImage;
        emit(execution.clone());
        self.pull_image(&request.image_ref).await?;

        execution.state = ExecutionState::ImagePulled;
        emit(execution.clone());

        execution.state = ExecutionState::CreatingContainer;
        emit(execution.clone());
        let container_id = self.create_container(request).await?;
        execution.container_id = container_id.clone();
        execution.state = ExecutionState::ContainerCreated;
        emit(execution.clone());

        let inputs = std::mem::take(&mut request.inputs);
        if !inputs.is_empty() {
            execution.state = ExecutionState::UploadingFiles;
            emit(execution.clone());
            self.upload_inputs(&container_id, &request.inputs_dir, inputs)
                .await?;
            execution.state = ExecutionState::FilesUploaded;
            emit(execution.clone());
        }

        execution.started_at = Some(Utc::now());
        execution.state = ExecutionState::StartingContainer;
        emit(execution.clone());
        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| {
                daemon_error(format!("failed to start container: {err}"))
                    .with_container(container_id.as_str())
            })?;

        execution.state = ExecutionState::ContainerStarted;
        emit(execution.clone());
        execution.state = ExecutionState::Running;
        emit(execution.clone());

        let exit_code = self.wait_container(&container_id).await?;
        execution.exit_code = Some(exit_code);
        execution.finished_at = Some(Utc::now());
        execution.state = ExecutionState::ContainerFinished;
        emit(execution.clone());

        execution.state = ExecutionState::DownloadingFiles;
        emit(execution.clone());
        let outputs = self
            .download_outputs(&container_id, &request.outputs_dir)
            .await?;
        execution.outputs = Some(outputs);
        execution.state = ExecutionState::FilesDownloaded;
        emit(execution.clone());

        if exit_code == 0 {
            execution.state = ExecutionState::Succeeded;
            emit(execution.clone());
            Ok(())
        } else {
            Err(ExecutionError::new(
                ExecutionErrorKind::ContainerFailed,
                format!("container exited with code {exit_code}"),
            )
            .with_container(container_id.as_str()))
        }
    }

    async fn run(&self, mut request: ExecutionRequest) {
        let emit = request.on_change.clone();
        let mut execution = Execution::default();
        emit(execution.clone());

        let result = match request.timeout {
            Some(timeout) if !timeout.is_zero() => {
                match tokio::time::timeout(
                    timeout,
                    self.drive(&mut request, &mut execution, &emit),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::new(
                        ExecutionErrorKind::Timeout,
                        format!("execution exceeded timeout of {timeout:?}"),
                    )),
                }
            }
            _ => self.drive(&mut request, &mut execution, &emit).await,
        };

        if !execution.container_id.is_empty() {
            self.spawn_cleanup(execution.container_id.clone());
        }

        match result {
            Ok(()) => {
                tracing::info!(
                    container_id = %execution.container_id,
                    exit_code = execution.exit_code,
                    "container execution completed"
                );
            }
            Err(mut err) => {
                if err.container_id.is_none() && !execution.container_id.is_empty() {
                    err = err.with_container(execution.container_id.clone());
                }
                tracing::error!(
                    container_id = %execution.container_id,
                    error = %err,
                    "container execution failed"
                );
                execution.error = Some(err);
                execution.state = ExecutionState::Failed;
                emit(execution);
            }
        }
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<(), ExecutionError> {
        tracing::info!(image = %request.image_ref, "starting container execution");
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run(request).await;
        });
        Ok(())
    }

    async fn logs(&self, container_id: &str) -> Result<LogStream, ExecutionError> {
        // Probe first so unknown ids fail eagerly instead of mid-stream.
        self.client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| {
                if is_docker_not_found(&err) {
                    ExecutionError::new(
                        ExecutionErrorKind::ContainerNotFound,
                        format!("no such container: {container_id}"),
                    )
                } else {
                    daemon_error(format!("failed to get container logs: {err}"))
                }
                .with_container(container_id)
            })?;

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            follow: true,
            ..Default::default()
        };
        let mut raw = self.client.logs(container_id, Some(options));
        let (sender, receiver) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let container_id = container_id.to_string();

        tokio::spawn(async move {
            while let Some(item) = raw.next().await {
                match item {
                    Ok(output) => {
                        for line in parse_log_output(&output) {
                            if sender.send(Ok(line)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let mapped = if is_docker_not_found(&err) {
                            ExecutionError::new(
                                ExecutionErrorKind::ContainerNotFound,
                                format!("no such container: {container_id}"),
                            )
                        } else {
                            daemon_error(format!("log stream failed: {err}"))
                        }
                        .with_container(container_id.as_str());
                        let _ = sender.send(Err(mapped)).await;
                        return;
                    }
                }
            }
        });

        Ok(receiver)
    }
}

/// Reads every input stream fully and packs them into one tar archive with
/// the input name as the member path.
async fn pack_inputs(inputs: HashMap<String, InputStream>) -> Result<Bytes, ExecutionError> {
    let mut builder = tar::Builder::new(Vec::new());

    for (name, mut stream) in inputs {
        let mut content = Vec::new();
        stream.read_to_end(&mut content).await.map_err(|err| {
            ExecutionError::new(
                ExecutionErrorKind::FileUploadFailed,
                format!("failed to read input {name}: {err}"),
            )
        })?;

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, &name, content.as_slice())
            .map_err(|err| {
                ExecutionError::new(
                    ExecutionErrorKind::FileUploadFailed,
                    format!("failed to write tar entry for {name}: {err}"),
                )
            })?;
    }

    let archive = builder.into_inner().map_err(|err| {
        ExecutionError::new(
            ExecutionErrorKind::FileUploadFailed,
            format!("failed to finish tar archive: {err}"),
        )
    })?;
    Ok(Bytes::from(archive))
}

/// Splits one log frame into timestamp-parsed lines. With `timestamps`
/// enabled the runtime prefixes every line with an RFC 3339 instant.
fn parse_log_output(output: &LogOutput) -> Vec<LogLine> {
    let bytes = match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message } => message,
        LogOutput::StdIn { .. } => return Vec::new(),
    };

    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(' ') {
            Some((prefix, rest)) => match DateTime::parse_from_rfc3339(prefix) {
                Ok(timestamp) => LogLine {
                    timestamp: timestamp.with_timezone(&Utc),
                    message: rest.to_string(),
                },
                Err(_) => LogLine {
                    timestamp: Utc::now(),
                    message: line.to_string(),
                },
            },
            None => LogLine {
                timestamp: Utc::now(),
                message: line.to_string(),
            },
        })
        .collect()
}

fn daemon_error(message: impl Into<String>) -> ExecutionError {
    ExecutionError::new(ExecutionErrorKind::DaemonError, message)
}

fn is_docker_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pack_inputs_produces_named_entries() {
        let mut inputs: HashMap<String, InputStream> = HashMap::new();
        inputs.insert(
            "greeting".to_string(),
            Box::new(std::io::Cursor::new(b"world".to_vec())),
        );

        let archive = pack_inputs(inputs).await.unwrap();
        let mut reader = tar::Archive::new(archive.as_ref());
        let mut entries = reader.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "greeting");
        assert_eq!(entry.header().size().unwrap(), 5);
    }

    #[test]
    fn parse_log_output_splits_timestamp_prefix() {
        let frame = LogOutput::StdOut {
            message: Bytes::from_static(
                b"2024-05-01T10:00:00.123456789Z hello there\n2024-05-01T10:00:01Z second\n",
            ),
        };
        let lines = parse_log_output(&frame);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "hello there");
        assert_eq!(lines[1].message, "second");
        assert!(lines[1].timestamp > lines[0].timestamp);
    }

    #[test]
    fn parse_log_output_keeps_unprefixed_lines() {
        let frame = LogOutput::StdErr {
            message: Bytes::from_static(b"no timestamp here\n"),
        };
        let lines = parse_log_output(&frame);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "no timestamp here");
    }
}
