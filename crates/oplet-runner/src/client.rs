//! Typed HTTP client for the runner protocol.

use std::time::Duration;

use futures::TryStreamExt;
use reqwest::{multipart, StatusCode, Url};
use thiserror::Error;
use tokio_util::io::StreamReader;

use oplet_model::{
    HeartbeatResponse, InputFileInfo, LogEntry, TaskInputsResponse, TaskOutputsResponse,
    TaskRequestResponse, TaskStatusRequest, TaskTraceRequest, TaskTraceResponse,
};
use oplet_task::executor::InputStream;

/// Comfortably above the coordinator's 30 s long-poll cap.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} failed with status {status}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
    },
}

/// Client bound to one coordinator and one bearer token.
#[derive(Clone, Debug)]
pub struct Client {
    base: Url,
    token: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(server_url: &str, token: impl Into<String>) -> Result<Self, ClientError> {
        let base = Url::parse(server_url).map_err(|err| ClientError::InvalidUrl {
            url: server_url.to_string(),
            message: err.to_string(),
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("oplet-runner/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Ok(Self {
            base,
            token: token.into(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base.join(path).map_err(|err| ClientError::InvalidUrl {
            url: format!("{}{path}", self.base),
            message: err.to_string(),
        })
    }

    pub async fn send_heartbeat(&self) -> Result<HeartbeatResponse, ClientError> {
        let url = self.endpoint("/runner/heartbeat")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        expect_ok(&response, "heartbeat")?;
        Ok(response.json().await?)
    }

    /// Long-polls for the next lease; `None` means no task is available.
    pub async fn request_task(&self) -> Result<Option<TaskRequestResponse>, ClientError> {
        let url = self.endpoint("/runner/request-task")?;
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        expect_ok(&response, "task request")?;
        Ok(Some(response.json().await?))
    }

    pub async fn update_status(
        &self,
        execution_id: i64,
        request: &TaskStatusRequest,
    ) -> Result<(), ClientError> {
        let url = self.endpoint(&format!("/runner/tasks/{execution_id}/status"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        expect_ok(&response, "status update")
    }

    pub async fn submit_logs(
        &self,
        execution_id: i64,
        logs: Vec<LogEntry>,
    ) -> Result<TaskTraceResponse, ClientError> {
        let url = self.endpoint(&format!("/runner/tasks/{execution_id}/trace"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&TaskTraceRequest { logs })
            .send()
            .await?;
        expect_ok(&response, "log submission")?;
        Ok(response.json().await?)
    }

    pub async fn list_input_files(
        &self,
        execution_id: i64,
    ) -> Result<Vec<InputFileInfo>, ClientError> {
        let url = self.endpoint(&format!("/runner/tasks/{execution_id}/inputs"))?;
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        expect_ok(&response, "input listing")?;
        let listing: TaskInputsResponse = response.json().await?;
        Ok(listing.files)
    }

    /// Streams one input file; the caller hands the stream straight to the
    /// executor's tar packer.
    pub async fn download_input_file(
        &self,
        execution_id: i64,
        filename: &str,
    ) -> Result<InputStream, ClientError> {
        let mut url = self.endpoint(&format!("/runner/tasks/{execution_id}/inputs"))?;
        url.query_pairs_mut().append_pair("file", filename);
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        expect_ok(&response, "input download")?;

        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(Box::new(StreamReader::new(stream)))
    }

    /// Uploads output files as one multipart request; the field name and
    /// filename both carry the in-container basename.
    pub async fn upload_output_files(
        &self,
        execution_id: i64,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<TaskOutputsResponse, ClientError> {
        let url = self.endpoint(&format!("/runner/tasks/{execution_id}/outputs"))?;

        let mut form = multipart::Form::new();
        for (name, content) in files {
            let part = multipart::Part::bytes(content).file_name(name.clone());
            form = form.part(name, part);
        }

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        expect_ok(&response, "output upload")?;
        Ok(response.json().await?)
    }
}

fn expect_ok(response: &reqwest::Response, endpoint: &'static str) -> Result<(), ClientError> {
    if response.status() != StatusCode::OK {
        return Err(ClientError::Status {
            endpoint,
            status: response.status(),
        });
    }
    Ok(())
}
