//! Router-level tests for the runner protocol.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use oplet_files::FileStorage;
use oplet_model::TaskExecutionStatus;
use oplet_server::{router, AppState};
use oplet_store::{
    NewTask, NewTaskExecution, Runner, Store, Task, TaskConfiguration, TaskExecution,
};
use oplet_task::{Definition, Input, InputType, Provider, ProviderError, ValueType};

struct StaticProvider(Definition);

#[async_trait]
impl Provider for StaticProvider {
    async fn fetch_definition(&self, _image_ref: &str) -> Result<Definition, ProviderError> {
        Ok(self.0.clone())
    }
}

struct Harness {
    app: Router,
    state: AppState,
    runner: Runner,
    task: Task,
    _data_dir: tempfile::TempDir,
}

fn hello_definition() -> Definition {
    Definition {
        name: "hello".into(),
        image_ref: "registry/example/hello:latest".into(),
        inputs: vec![Input {
            name: "greeting".into(),
            input_type: InputType::Env,
            value_type: ValueType::Text,
            description: String::new(),
            required: true,
        }],
        configuration: vec![Input {
            name: "LOG_LEVEL".into(),
            input_type: InputType::Env,
            value_type: ValueType::Text,
            description: String::new(),
            required: false,
        }],
        ..Default::default()
    }
}

fn harness() -> Harness {
    let store = Store::open_in_memory().expect("open store");
    let data_dir = tempfile::tempdir().expect("tempdir");
    let files = FileStorage::new(data_dir.path());
    let state = AppState::new(
        store.clone(),
        files,
        Arc::new(StaticProvider(hello_definition())),
    );

    let task = state
        .tasks()
        .create(NewTask {
            image_ref: "registry/example/hello:latest".into(),
            name: "hello".into(),
            configurations: vec![TaskConfiguration {
                name: "LOG_LEVEL".into(),
                value: "debug".into(),
            }],
            ..Default::default()
        })
        .expect("create task");
    let runner = state.runners().create("test-runner").expect("create runner");

    Harness {
        app: router(state.clone()),
        state,
        runner,
        task,
        _data_dir: data_dir,
    }
}

fn enqueue(harness: &Harness) -> TaskExecution {
    harness
        .state
        .executions()
        .create(NewTaskExecution {
            task_id: harness.task.id,
            submitter_id: 1,
            input_parameters: r#"{"greeting":"world"}"#.into(),
        })
        .expect("create execution")
}

fn authed(harness: &Harness, method: Method, uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", harness.runner.token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn requests_without_token_are_forbidden() {
    let harness = harness();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/runner/heartbeat")
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn requests_with_unknown_token_are_forbidden() {
    let harness = harness();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/runner/heartbeat")
        .header(header::AUTHORIZATION, "Bearer deadbeef")
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn heartbeat_answers_identity_and_stamps_contact() {
    let harness = harness();
    let response = harness
        .app
        .clone()
        .oneshot(authed(&harness, Method::POST, "/runner/heartbeat", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["id"], harness.runner.id);
    assert_eq!(json["name"], "test-runner");

    let stored = harness
        .state
        .runners()
        .get_by_name("test-runner")
        .unwrap();
    assert!(stored.contacted_at.is_some());
}

#[tokio::test]
async fn request_task_leases_with_environment_and_dirs() {
    let harness = harness();
    let execution = enqueue(&harness);

    let response = harness
        .app
        .clone()
        .oneshot(authed(&harness, Method::GET, "/runner/request-task", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["execution_id"], execution.id);
    assert_eq!(json["task_id"], harness.task.id);
    assert_eq!(json["image_ref"], "registry/example/hello:latest");
    assert_eq!(json["environment"]["greeting"], "world");
    assert_eq!(json["environment"]["LOG_LEVEL"], "debug");
    assert_eq!(json["inputs_dir"], "/oplet/inputs");
    assert_eq!(json["outputs_dir"], "/oplet/outputs");
    // The lease rotates the per-execution token.
    assert_ne!(json["runner_token"], execution.runner_token.as_str());

    let leased = harness.state.executions().get(execution.id).unwrap();
    assert!(leased.started_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn request_task_times_out_with_no_content() {
    let harness = harness();
    let response = harness
        .app
        .clone()
        .oneshot(authed(&harness, Method::GET, "/runner/request-task", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn status_reports_update_execution_and_add_system_log() {
    let harness = harness();
    let execution = enqueue(&harness);

    let body = serde_json::json!({
        "status": "container_started",
        "container_id": "cafebabe",
        "started_at": "2024-05-01T10:00:00Z",
        "timestamp": 1_714_557_600_000_000i64,
    });
    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::POST,
            &format!("/runner/tasks/{}/status", execution.id),
            Body::from(body.to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = harness.state.executions().get(execution.id).unwrap();
    assert_eq!(stored.status, TaskExecutionStatus::ContainerStarted);
    assert_eq!(stored.container_id, "cafebabe");
    assert!(stored.started_at.is_some());

    let logs = harness.state.executions().logs(execution.id).unwrap();
    assert!(logs
        .iter()
        .any(|log| log.message == "Status changed to: container_started"));
}

#[tokio::test]
async fn terminal_status_with_exit_code_derives_completion() {
    let harness = harness();
    let execution = enqueue(&harness);

    let body = serde_json::json!({
        "status": "succeeded",
        "exit_code": 0,
        "timestamp": 1_714_557_700_000_000i64,
    });
    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::POST,
            &format!("/runner/tasks/{}/status", execution.id),
            Body::from(body.to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = harness.state.executions().get(execution.id).unwrap();
    assert_eq!(stored.status, TaskExecutionStatus::Succeeded);
    assert_eq!(stored.exit_code, Some(0));
    assert!(stored.finished_at.is_some());
}

#[tokio::test]
async fn status_for_unknown_execution_is_not_found() {
    let harness = harness();
    let body = serde_json::json!({"status": "running", "timestamp": 1i64});
    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::POST,
            "/runner/tasks/999/status",
            Body::from(body.to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn trace_counts_only_newly_stored_entries() {
    let harness = harness();
    let execution = enqueue(&harness);
    let uri = format!("/runner/tasks/{}/trace", execution.id);

    let entries = |clocks: &[u32]| {
        serde_json::json!({
            "logs": clocks
                .iter()
                .map(|clock| serde_json::json!({
                    "timestamp": 1_714_557_600_000_000i64 + i64::from(*clock),
                    "source": "container",
                    "message": format!("line {clock}"),
                    "clock": clock,
                }))
                .collect::<Vec<_>>(),
        })
    };

    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::POST,
            &uri,
            Body::from(entries(&[1, 2, 3]).to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["logs_added"], 3);

    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::POST,
            &uri,
            Body::from(entries(&[1, 2, 3, 4]).to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["logs_added"], 1);

    assert_eq!(harness.state.executions().logs(execution.id).unwrap().len(), 4);
}

#[tokio::test]
async fn empty_trace_batch_is_rejected() {
    let harness = harness();
    let execution = enqueue(&harness);
    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::POST,
            &format!("/runner/tasks/{}/trace", execution.id),
            Body::from(r#"{"logs":[]}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn inputs_are_listed_and_downloadable() {
    let harness = harness();
    let execution = enqueue(&harness);

    let stored = harness
        .state
        .files
        .store_input(execution.id, "greeting", "hello world".as_bytes())
        .unwrap();
    harness
        .state
        .executions()
        .add_file(
            execution.id,
            &stored.original_name,
            &stored.stored_path.to_string_lossy(),
            stored.size,
            &stored.mime_type,
            false,
        )
        .unwrap();

    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::GET,
            &format!("/runner/tasks/{}/inputs", execution.id),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["files"][0]["filename"], "greeting");
    assert_eq!(json["files"][0]["file_size"], 11);

    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::GET,
            &format!("/runner/tasks/{}/inputs?file=greeting", execution.id),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(disposition.contains("attachment"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"hello world");
}

#[tokio::test]
async fn missing_input_file_is_not_found() {
    let harness = harness();
    let execution = enqueue(&harness);
    let response = harness
        .app
        .clone()
        .oneshot(authed(
            &harness,
            Method::GET,
            &format!("/runner/tasks/{}/inputs?file=absent", execution.id),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn output_upload_stores_blob_and_record() {
    let harness = harness();
    let execution = enqueue(&harness);

    let boundary = "oplet-test-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"out.txt\"; filename=\"out.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         hello world\r\n\
         --{boundary}--\r\n"
    );
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/runner/tasks/{}/outputs", execution.id))
        .header(header::AUTHORIZATION, format!("Bearer {}", harness.runner.token))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();

    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["files_stored"], 1);
    assert_eq!(json["message"], "Stored 1 output files");

    let outputs = harness.state.executions().files(execution.id, true).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].filename, "out.txt");
    assert_eq!(outputs[0].file_size, 11);
    assert!(std::path::Path::new(&outputs[0].storage_path).exists());
}
