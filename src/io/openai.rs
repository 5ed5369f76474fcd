//! External batch API seam and its OpenAI-compatible implementation.
//!
//! The tracker only sees [`BatchApi`]: submit a group of work items, poll a
//! submission, fetch a finished payload. Remote status strings are mapped onto
//! the closed [`RemoteState`] set here; anything unrecognised is rejected at
//! this boundary instead of leaking inward.
use std::time::Duration;

use base64::Engine;
use reqwest::StatusCode;
use reqwest::blocking::{Client, multipart};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::params::RunParams;
use crate::io::rows::WorkItem;
use crate::types::RemoteState;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Errors surfaced by a [`BatchApi`] implementation. All of them are transient
/// from the tracker's point of view except `NotFound`, which marks a stale
/// submission id, and `NothingToSubmit`, which completes the batch empty.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("submission `{0}` not found")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("unrecognised remote status `{0}`")]
    UnrecognizedStatus(String),
    /// Every row of the batch was rejected before upload; nothing was sent.
    #[error("no submittable rows in batch")]
    NothingToSubmit,
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(e.to_string())
    }
}

/// Request counters reported by the remote job, when available
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

/// One poll answer, already reduced to a [`RemoteState`]
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: RemoteState,
    /// Where the finished payload can be fetched from (e.g. an output file id)
    pub result_location: Option<String>,
    pub error: Option<String>,
    pub counts: Option<RequestCounts>,
}

impl StatusReport {
    pub fn new(state: RemoteState) -> Self {
        Self {
            state,
            result_location: None,
            error: None,
            counts: None,
        }
    }
}

/// What the tracker hands to the API for one submission
#[derive(Debug, Clone, Copy)]
pub struct BatchSubmission<'a> {
    pub seq: u32,
    /// 1-based attempt number for this batch
    pub attempt: u32,
    pub items: &'a [WorkItem],
}

pub trait BatchApi {
    fn submit_batch(&self, submission: &BatchSubmission<'_>) -> Result<String, ApiError>;
    fn poll_status(&self, submission_id: &str) -> Result<StatusReport, ApiError>;
    fn fetch_result(&self, result_location: &str) -> Result<String, ApiError>;
}

impl<T: BatchApi + ?Sized> BatchApi for &T {
    fn submit_batch(&self, submission: &BatchSubmission<'_>) -> Result<String, ApiError> {
        (**self).submit_batch(submission)
    }
    fn poll_status(&self, submission_id: &str) -> Result<StatusReport, ApiError> {
        (**self).poll_status(submission_id)
    }
    fn fetch_result(&self, result_location: &str) -> Result<String, ApiError> {
        (**self).fetch_result(result_location)
    }
}

/// Request body knobs for chat-completion requests
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl RequestOptions {
    pub fn from_params(params: &RunParams) -> Self {
        Self {
            model: params.model.clone(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        }
    }
}

/// Blocking client for the OpenAI `/v1/batches` workflow
pub struct OpenAiBatchClient {
    http: Client,
    base_url: String,
    api_key: String,
    options: RequestOptions,
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    request_counts: Option<RequestCounts>,
    #[serde(default)]
    errors: Option<BatchErrors>,
}

#[derive(Deserialize)]
struct BatchErrors {
    #[serde(default)]
    data: Vec<BatchErrorEntry>,
}

#[derive(Deserialize)]
struct BatchErrorEntry {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl OpenAiBatchClient {
    pub fn new(api_key: String, base_url: Option<String>, options: RequestOptions) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            options,
        })
    }

    /// Build from `OPENAI_API_KEY` / `OPENAI_BASE_URL`.
    pub fn from_env(options: RequestOptions) -> crate::error::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| crate::error::Error::MissingArgument {
                arg: "OPENAI_API_KEY".to_string(),
            })?;
        let base_url = std::env::var("OPENAI_BASE_URL").ok();
        Ok(Self::new(api_key, base_url, options)?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn check(resp: reqwest::blocking::Response, not_found_id: Option<&str>) -> Result<reqwest::blocking::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = not_found_id {
                return Err(ApiError::NotFound(id.to_string()));
            }
        }
        let body = resp.text().unwrap_or_default();
        Err(ApiError::Http {
            status: status.as_u16(),
            body,
        })
    }

    fn upload_input(&self, jsonl: Vec<u8>, seq: u32) -> Result<String, ApiError> {
        let part = multipart::Part::bytes(jsonl)
            .file_name(format!("batch_{seq:03}.jsonl"))
            .mime_str("application/jsonl")?;
        let form = multipart::Form::new().text("purpose", "batch").part("file", part);
        let resp = self
            .http
            .post(self.url("files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()?;
        let file: FileObject = Self::check(resp, None)?
            .json()
            .map_err(|e| ApiError::Malformed(e.to_string()))?;
        debug!(seq, file_id = %file.id, "Uploaded batch input");
        Ok(file.id)
    }
}

/// Render one chat-completion request line for `item`. Fails only when the
/// row's image cannot be read.
pub fn request_line(item: &WorkItem, options: &RequestOptions) -> std::io::Result<String> {
    let image = std::fs::read(&item.image_path)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(image);
    let line = json!({
        "custom_id": format!("row_{}", item.index),
        "method": "POST",
        "url": "/v1/chat/completions",
        "body": {
            "model": options.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": item.prompt },
                    { "type": "image_url", "image_url": { "url": format!("data:image/jpeg;base64,{encoded}") } }
                ]
            }],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        }
    });
    Ok(line.to_string())
}

/// JSONL input for `items`, plus the indices of rows left out because their
/// image could not be read. Skipped rows surface as missing after the merge.
pub fn batch_input(items: &[WorkItem], options: &RequestOptions) -> (String, Vec<usize>) {
    let mut jsonl = String::new();
    let mut skipped = Vec::new();
    for item in items {
        match request_line(item, options) {
            Ok(line) => {
                jsonl.push_str(&line);
                jsonl.push('\n');
            }
            Err(e) => {
                warn!(index = item.index, image = %item.image_path, "Skipping row, cannot read image: {}", e);
                skipped.push(item.index);
            }
        }
    }
    (jsonl, skipped)
}

/// Map an OpenAI batch status string onto [`RemoteState`].
pub fn map_remote_status(status: &str) -> Result<RemoteState, ApiError> {
    match status {
        "validating" => Ok(RemoteState::Pending),
        "in_progress" | "finalizing" | "cancelling" => Ok(RemoteState::Running),
        "completed" => Ok(RemoteState::Succeeded),
        "failed" | "expired" | "cancelled" => Ok(RemoteState::Failed),
        other => Err(ApiError::UnrecognizedStatus(other.to_string())),
    }
}

impl BatchApi for OpenAiBatchClient {
    fn submit_batch(&self, submission: &BatchSubmission<'_>) -> Result<String, ApiError> {
        let (jsonl, skipped) = batch_input(submission.items, &self.options);
        if skipped.len() == submission.items.len() {
            return Err(ApiError::NothingToSubmit);
        }
        if !skipped.is_empty() {
            warn!(seq = submission.seq, skipped = skipped.len(), "Submitting batch without unreadable rows");
        }
        let file_id = self.upload_input(jsonl.into_bytes(), submission.seq)?;

        let body = json!({
            "input_file_id": file_id,
            "endpoint": "/v1/chat/completions",
            "completion_window": "24h",
            "metadata": {
                "batch_seq": submission.seq.to_string(),
                "attempt": submission.attempt.to_string(),
            }
        });
        let resp = self
            .http
            .post(self.url("batches"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;
        let batch: BatchObject = Self::check(resp, None)?
            .json()
            .map_err(|e| ApiError::Malformed(e.to_string()))?;
        info!(seq = submission.seq, batch_id = %batch.id, status = %batch.status, "Created remote batch");
        Ok(batch.id)
    }

    fn poll_status(&self, submission_id: &str) -> Result<StatusReport, ApiError> {
        let resp = self
            .http
            .get(self.url(&format!("batches/{submission_id}")))
            .bearer_auth(&self.api_key)
            .send()?;
        let batch: BatchObject = Self::check(resp, Some(submission_id))?
            .json()
            .map_err(|e| ApiError::Malformed(e.to_string()))?;

        let mut state = map_remote_status(&batch.status)?;
        let mut error = batch.errors.and_then(|errs| {
            let joined: Vec<String> = errs
                .data
                .into_iter()
                .map(|e| {
                    format!(
                        "{}: {}",
                        e.code.unwrap_or_else(|| "error".to_string()),
                        e.message.unwrap_or_default()
                    )
                })
                .collect();
            (!joined.is_empty()).then(|| joined.join("; "))
        });
        if state == RemoteState::Failed && error.is_none() {
            error = Some(format!("remote batch ended as `{}`", batch.status));
        }
        if state == RemoteState::Succeeded && batch.output_file_id.is_none() {
            warn!(batch_id = %batch.id, error_file = ?batch.error_file_id, "Completed batch has no output file");
            state = RemoteState::Failed;
            error = Some("completed without output file".to_string());
        }

        Ok(StatusReport {
            state,
            result_location: batch.output_file_id,
            error,
            counts: batch.request_counts,
        })
    }

    fn fetch_result(&self, result_location: &str) -> Result<String, ApiError> {
        let resp = self
            .http
            .get(self.url(&format!("files/{result_location}/content")))
            .bearer_auth(&self.api_key)
            .send()?;
        Ok(Self::check(resp, Some(result_location))?.text()?)
    }
}
