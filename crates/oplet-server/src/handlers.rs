//! Runner protocol endpoints, mounted under `/runner`.

use std::path::Path as FsPath;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

use oplet_model::{
    HeartbeatResponse, InputFileInfo, LogSource, TaskExecutionStatus, TaskInputsResponse,
    TaskOutputsResponse, TaskRequestResponse, TaskStatusRequest, TaskStatusResponse,
    TaskTraceRequest, TaskTraceResponse,
};
use oplet_store::{ExecutionStatusUpdate, Runner, TaskExecution};
use oplet_task::{INPUTS_DIR, OUTPUTS_DIR};

use crate::auth::require_runner;
use crate::environment::build_environment;
use crate::error::ApiError;
use crate::state::AppState;

const LEASE_POLL_WINDOW: Duration = Duration::from_secs(30);
const LEASE_POLL_INTERVAL: Duration = Duration::from_secs(3);
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Builds the full application router with the protocol nested under
/// `/runner`.
pub fn router(state: AppState) -> Router {
    Router::new().nest("/runner", protocol_router(state))
}

fn protocol_router(state: AppState) -> Router {
    Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/request-task", get(request_task))
        .route("/tasks/:execution_id/inputs", get(task_inputs))
        .route("/tasks/:execution_id/outputs", post(task_outputs))
        .route("/tasks/:execution_id/status", post(task_status))
        .route("/tasks/:execution_id/trace", post(task_trace))
        .layer(from_fn_with_state(state.clone(), require_runner))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

async fn heartbeat(Extension(runner): Extension<Runner>) -> Json<HeartbeatResponse> {
    tracing::debug!(runner_id = runner.id, runner_name = %runner.name, "heartbeat received");
    Json(HeartbeatResponse {
        id: runner.id,
        name: runner.name,
        contacted_at: Utc::now(),
    })
}

/// Long-poll lease. Retries the atomic claim every three seconds within a
/// thirty-second window and answers 204 when nothing became available.
async fn request_task(
    State(state): State<AppState>,
    Extension(runner): Extension<Runner>,
) -> Result<Response, ApiError> {
    let executions = state.executions();
    let deadline = Instant::now() + LEASE_POLL_WINDOW;

    loop {
        if let Some(execution) = executions.lease_next()? {
            let response = lease_response(&state, &execution).await?;
            tracing::info!(
                runner_id = runner.id,
                execution_id = execution.id,
                task_id = execution.task_id,
                "task assigned to runner"
            );
            return Ok(Json(response).into_response());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
        tokio::time::sleep(remaining.min(LEASE_POLL_INTERVAL)).await;
    }
}

async fn lease_response(
    state: &AppState,
    execution: &TaskExecution,
) -> Result<TaskRequestResponse, ApiError> {
    let task = state.tasks().get(execution.task_id)?;

    let environment = match state.provider.fetch_definition(&task.image_ref).await {
        Ok(definition) => build_environment(
            &definition,
            &execution.input_parameters,
            &task.configurations,
        ),
        Err(err) => {
            tracing::warn!(
                execution_id = execution.id,
                image_ref = %task.image_ref,
                error = %err,
                "could not fetch task definition"
            );
            Default::default()
        }
    };

    Ok(TaskRequestResponse {
        execution_id: execution.id,
        task_id: execution.task_id,
        image_ref: task.image_ref,
        environment,
        input_parameters: execution.input_parameters.clone(),
        runner_token: execution.runner_token.clone(),
        inputs_dir: INPUTS_DIR.to_string(),
        outputs_dir: OUTPUTS_DIR.to_string(),
        created_at: execution.created_at,
    })
}

async fn task_status(
    State(state): State<AppState>,
    Extension(runner): Extension<Runner>,
    Path(execution_id): Path<i64>,
    Json(request): Json<TaskStatusRequest>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    if request.timestamp <= 0 {
        return Err(ApiError::bad_request("timestamp is required"));
    }

    let executions = state.executions();
    let execution = executions
        .get(execution_id)
        .map_err(|_| ApiError::not_found("execution"))?;

    let mut update = ExecutionStatusUpdate {
        status: request.status,
        container_id: request.container_id.clone(),
        exit_code: request.exit_code,
        error_message: request.error.clone(),
        started_at: request.started_at,
        finished_at: request.finished_at,
    };
    if request.status.is_terminal() && update.finished_at.is_none() {
        update.finished_at = Some(Utc::now());
    }
    executions.apply_status_update(execution.id, &update)?;

    // An exit-code-bearing terminal report goes through the completion
    // primitive, which derives the final succeeded/failed status.
    if matches!(
        request.status,
        TaskExecutionStatus::Succeeded | TaskExecutionStatus::Failed
    ) {
        if let Some(exit_code) = request.exit_code {
            executions.set_completed(
                execution.id,
                exit_code,
                request.error.as_deref().unwrap_or(""),
            )?;
        }
    }

    let message = format!("Status changed to: {}", request.status);
    if let Err(err) = executions.append_log(
        execution.id,
        request.timestamp,
        LogSource::System,
        request.timestamp as u32,
        &message,
    ) {
        tracing::warn!(
            execution_id = execution.id,
            error = %err,
            "could not add status change log"
        );
    }

    tracing::info!(
        runner_id = runner.id,
        execution_id = execution.id,
        status = %request.status,
        "task status updated"
    );
    Ok(Json(TaskStatusResponse {
        execution_id: execution.id,
        status: request.status,
        updated_at: Utc::now(),
    }))
}

async fn task_trace(
    State(state): State<AppState>,
    Extension(runner): Extension<Runner>,
    Path(execution_id): Path<i64>,
    Json(request): Json<TaskTraceRequest>,
) -> Result<Json<TaskTraceResponse>, ApiError> {
    if request.logs.is_empty() {
        return Err(ApiError::bad_request("logs are required"));
    }
    for (index, entry) in request.logs.iter().enumerate() {
        if entry.message.is_empty() {
            return Err(ApiError::bad_request(format!(
                "log message is required for entry {index}"
            )));
        }
        if entry.timestamp <= 0 {
            return Err(ApiError::bad_request(format!(
                "log timestamp is required for entry {index}"
            )));
        }
    }

    let executions = state.executions();
    let execution = executions
        .get(execution_id)
        .map_err(|_| ApiError::not_found("execution"))?;

    let mut logs_added = 0;
    for entry in &request.logs {
        match executions.append_log(
            execution.id,
            entry.timestamp,
            entry.source,
            entry.clock,
            &entry.message,
        ) {
            Ok(true) => logs_added += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    execution_id = execution.id,
                    error = %err,
                    "could not add log entry"
                );
            }
        }
    }

    tracing::debug!(
        runner_id = runner.id,
        execution_id = execution.id,
        logs_added,
        "logs added to execution"
    );
    Ok(Json(TaskTraceResponse {
        execution_id: execution.id,
        logs_added,
    }))
}

#[derive(Debug, Deserialize)]
struct InputsQuery {
    file: Option<String>,
}

async fn task_inputs(
    State(state): State<AppState>,
    Extension(runner): Extension<Runner>,
    Path(execution_id): Path<i64>,
    Query(query): Query<InputsQuery>,
) -> Result<Response, ApiError> {
    let executions = state.executions();
    let execution = executions
        .get(execution_id)
        .map_err(|_| ApiError::not_found("execution"))?;

    let input_files = executions.files(execution.id, false)?;

    if let Some(filename) = query.file {
        let Some(file) = input_files.iter().find(|f| f.filename == filename) else {
            return Err(ApiError::not_found("input file"));
        };

        let handle = tokio::fs::File::open(&file.storage_path)
            .await
            .map_err(|err| ApiError::internal(format!("could not open input file: {err}")))?;
        let body = Body::from_stream(ReaderStream::new(handle));

        tracing::info!(
            execution_id = execution.id,
            filename = %file.filename,
            size = file.file_size,
            "input file downloaded"
        );
        return Ok((
            [
                (header::CONTENT_TYPE, file.mime_type.clone()),
                (header::CONTENT_LENGTH, file.file_size.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file.filename),
                ),
            ],
            body,
        )
            .into_response());
    }

    let files = input_files
        .into_iter()
        .map(|file| InputFileInfo {
            filename: file.filename,
            file_size: file.file_size,
            mime_type: file.mime_type,
        })
        .collect();

    tracing::debug!(
        runner_id = runner.id,
        execution_id = execution.id,
        "input files listed"
    );
    Ok(Json(TaskInputsResponse {
        execution_id: execution.id,
        files,
    })
    .into_response())
}

async fn task_outputs(
    State(state): State<AppState>,
    Extension(runner): Extension<Runner>,
    Path(execution_id): Path<i64>,
    mut multipart: Multipart,
) -> Result<Json<TaskOutputsResponse>, ApiError> {
    let executions = state.executions();
    let execution = executions
        .get(execution_id)
        .map_err(|_| ApiError::not_found("execution"))?;

    let mut files_stored = 0;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        ApiError::bad_request(format!("could not parse multipart form: {err}"))
    })? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let filename = basename(&file_name);
        let content = field.bytes().await.map_err(|err| {
            ApiError::bad_request(format!("could not read multipart field: {err}"))
        })?;

        match store_output_file(&state, execution.id, &filename, &content) {
            Ok(()) => files_stored += 1,
            Err(err) => {
                tracing::warn!(
                    execution_id = execution.id,
                    filename = %filename,
                    error = %err,
                    "could not store output file"
                );
            }
        }
    }

    tracing::info!(
        runner_id = runner.id,
        execution_id = execution.id,
        files_stored,
        "output files stored"
    );
    Ok(Json(TaskOutputsResponse {
        execution_id: execution.id,
        files_stored,
        message: format!("Stored {files_stored} output files"),
    }))
}

fn store_output_file(
    state: &AppState,
    execution_id: i64,
    filename: &str,
    content: &[u8],
) -> Result<(), ApiError> {
    let stored = state
        .files
        .store_output(execution_id, filename, content)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    state.executions().add_file(
        execution_id,
        &stored.original_name,
        &stored.stored_path.to_string_lossy(),
        stored.size,
        &stored.mime_type,
        true,
    )?;
    Ok(())
}

fn basename(name: &str) -> String {
    FsPath::new(name)
        .file_name()
        .map(|base| base.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}
