//! HTTP request execution for workflow steps
//!
//! Single-request contract consumed by the engine: compose the URL and
//! headers, encode the body (JSON or multipart), apply the timeout, classify
//! the response into typed errors, retry transient failures with backoff,
//! poll asynchronous jobs to completion, and download opaque responses to
//! temporary files. Every error message is masked before it leaves here.

use crate::error::{FlowError, Result};
use crate::http::pool::ConnectionPool;
use crate::models::{parse_duration, AuthConfig, HttpMethod, RetryConfig, StepConfig};
use crate::security::SecretMasker;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Terminal poll statuses that mean the job will never succeed.
const FAILURE_STATUSES: [&str; 3] = ["failed", "error", "cancelled"];

/// Polling configuration for asynchronous jobs
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub completion_field: String,
    pub completion_values: Vec<String>,
    pub result_field: Option<String>,
    pub poll_url_template: Option<String>,
}

/// Everything needed to execute one step's HTTP request
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub endpoint: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub payload: Option<Value>,
    pub timeout: Option<Duration>,
    pub download_response: bool,
    pub upload_files: Option<HashMap<String, String>>,
    pub poll: Option<PollConfig>,
    pub retry: Option<RetryConfig>,
}

impl RequestSpec {
    /// Build a request spec from a step config and its rendered payload.
    pub fn from_step(step: &StepConfig, payload: Option<Value>) -> Result<Self> {
        let poll = if step.poll_for_completion {
            Some(PollConfig {
                interval: parse_duration(&step.poll_interval)?,
                timeout: parse_duration(&step.poll_timeout)?,
                completion_field: step.completion_field.clone(),
                completion_values: step.completion_values.clone(),
                result_field: step.result_field.clone(),
                poll_url_template: step.poll_url_template.clone(),
            })
        } else {
            None
        };
        Ok(Self {
            endpoint: step.endpoint.clone(),
            method: step.method,
            headers: step.headers.clone(),
            payload,
            timeout: step.timeout_duration()?,
            download_response: step.download_response,
            upload_files: step.upload_files.clone(),
            poll,
            retry: step.retry.clone(),
        })
    }
}

/// Outcome of executing a request, including how many retries it took
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub value: Value,
    pub retry_count: u32,
}

/// HTTP client for workflow API calls with auth, retry, and polling support.
#[derive(Debug, Clone)]
pub struct WorkflowHttpClient {
    base_url: String,
    default_timeout: Duration,
    auth: Option<AuthConfig>,
    service_name: Option<String>,
    pool: Arc<ConnectionPool>,
    masker: SecretMasker,
}

impl WorkflowHttpClient {
    pub fn new(base_url: impl Into<String>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_timeout: DEFAULT_TIMEOUT,
            auth: None,
            service_name: None,
            pool,
            masker: SecretMasker::new(),
        }
    }

    pub fn set_base_url(&mut self, base_url: impl Into<String>) {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
    }

    pub fn set_auth(&mut self, auth: AuthConfig) {
        self.auth = Some(auth);
    }

    /// Service name used to key the shared circuit breaker, if any.
    pub fn set_service_name(&mut self, service: impl Into<String>) {
        self.service_name = Some(service.into());
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute a request spec: retries around the initial request, then
    /// polling if the step submits an asynchronous job.
    pub async fn execute(
        &self,
        spec: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<HttpOutcome> {
        let mut retry_count = 0u32;
        let value = loop {
            match self.execute_once(spec, cancel).await {
                Ok(value) => break value,
                Err(e) => {
                    let Some(retry) = &spec.retry else {
                        return Err(e);
                    };
                    if !e.is_retriable() {
                        return Err(e);
                    }
                    retry_count += 1;
                    if retry_count > retry.limit {
                        let last_error = self.masker.mask_str(&e.to_string());
                        warn!(
                            endpoint = %spec.endpoint,
                            retries = retry.limit,
                            "request failed after exhausting retries: {last_error}"
                        );
                        return Err(FlowError::RetryExhausted {
                            retries: retry.limit,
                            last_error,
                        });
                    }
                    let delay = retry.backoff_delay(retry.base_delay()?, retry_count);
                    warn!(
                        endpoint = %spec.endpoint,
                        attempt = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "request failed, retrying: {}",
                        self.masker.mask_str(&e.to_string())
                    );
                    sleep_cancellable(delay, cancel).await?;
                }
            }
        };

        let value = match &spec.poll {
            Some(poll) => self.poll_for_completion(&value, poll, cancel).await?,
            None => value,
        };
        Ok(HttpOutcome { value, retry_count })
    }

    /// One attempt: send the request and classify the response.
    async fn execute_once(&self, spec: &RequestSpec, cancel: &CancellationToken) -> Result<Value> {
        let url = self.join_url(&spec.endpoint);
        let headers = self.compose_headers(spec);
        let timeout = self.attempt_timeout(spec)?;
        let method = spec.method.as_reqwest();

        debug!(
            method = %method,
            url = %url,
            "sending request (headers: {:?})",
            self.masker.mask_headers(&headers)
        );

        let multipart = match &spec.upload_files {
            Some(uploads) => Some(build_multipart(uploads, spec.payload.as_ref()).await?),
            None => None,
        };
        let payload = spec.payload.clone();
        let is_get = spec.method == HttpMethod::Get;

        let send = self.pool.request(
            method,
            &url,
            self.service_name.as_deref(),
            move |mut builder| {
                for (key, value) in &headers {
                    builder = builder.header(key, value);
                }
                builder = builder.timeout(timeout);
                if let Some(form) = multipart {
                    builder = builder.multipart(form);
                } else if let Some(payload) = &payload {
                    if !is_get {
                        builder = builder.json(payload);
                    }
                }
                builder
            },
        );
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FlowError::Execution("execution cancelled".to_string()));
            }
            result = send => result?,
        };

        let response = self.check_status(response).await?;

        if spec.download_response {
            self.download_to_file(response).await
        } else {
            parse_response(response).await
        }
    }

    /// Reject 4xx with typed errors, masking the response body.
    ///
    /// Server errors never reach here: the pool converts 5xx responses to
    /// `FlowError::Server` inside the circuit-breaker wrapper.
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        debug_assert!(status.as_u16() < 500);
        if status.as_u16() < 400 {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let body = if body.trim().is_empty() {
            "no response body".to_string()
        } else {
            self.masker.mask_str(&body)
        };
        Err(if status.as_u16() == 401 {
            FlowError::Authentication { body }
        } else {
            FlowError::Client {
                status: status.as_u16(),
                body,
            }
        })
    }

    /// Stream a 2xx response body to a temporary file, returning the path.
    ///
    /// A body that is itself a bare URL (some generators return a link to
    /// the artifact) is followed and its content saved instead.
    async fn download_to_file(&self, response: reqwest::Response) -> Result<Value> {
        let bytes = response
            .bytes()
            .await
            .map_err(crate::http::pool::map_send_error)?;

        let content: Vec<u8> = match std::str::from_utf8(&bytes) {
            Ok(text)
                if (text.trim().starts_with("http://") || text.trim().starts_with("https://"))
                    && !text.trim().contains(char::is_whitespace) =>
            {
                let file_url = text.trim().to_string();
                debug!(url = %file_url, "response body is a URL, downloading target");
                let file_response = self
                    .pool
                    .request(reqwest::Method::GET, &file_url, None, |b| {
                        b.timeout(self.default_timeout)
                    })
                    .await?;
                let file_response = self.check_status(file_response).await?;
                file_response
                    .bytes()
                    .await
                    .map_err(crate::http::pool::map_send_error)?
                    .to_vec()
            }
            _ => bytes.to_vec(),
        };

        let mut file = tempfile::Builder::new()
            .prefix("apiflow-")
            .tempfile()?;
        file.write_all(&content)?;
        let (_, path) = file
            .keep()
            .map_err(|e| FlowError::Io(e.error))?;
        let path = path.to_string_lossy().into_owned();
        info!(path = %path, bytes = content.len(), "downloaded response to file");
        Ok(Value::String(path))
    }

    /// Poll a job URL until a terminal status is reached.
    async fn poll_for_completion(
        &self,
        initial: &Value,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let Some(poll_url) = self.extract_poll_url(initial, poll) else {
            warn!("no poll URL found in job submission response");
            return Ok(initial.clone());
        };

        let auth_headers = self
            .auth
            .as_ref()
            .map(|a| a.to_request_headers())
            .unwrap_or_default();
        let start = Instant::now();

        while start.elapsed() < poll.timeout {
            let headers = auth_headers.clone();
            let timeout = self.default_timeout;
            let response = self
                .pool
                .request(
                    reqwest::Method::GET,
                    &poll_url,
                    self.service_name.as_deref(),
                    move |mut builder| {
                        for (key, value) in &headers {
                            builder = builder.header(key, value);
                        }
                        builder.timeout(timeout)
                    },
                )
                .await?;
            let response = self.check_status(response).await?;
            let data = parse_response(response).await?;

            let status = data
                .get(&poll.completion_field)
                .and_then(Value::as_str)
                .map(str::to_string);
            debug!(status = ?status, url = %poll_url, "polled job status");

            if let Some(status) = status {
                if poll.completion_values.contains(&status) {
                    info!(status = %status, "job completed");
                    if let Some(result_field) = &poll.result_field {
                        if let Some(result) = get_nested_field(&data, result_field) {
                            return Ok(result);
                        }
                    }
                    return Ok(data);
                }
                if FAILURE_STATUSES.contains(&status.as_str()) {
                    return Err(FlowError::Execution(format!(
                        "job failed with status: {status}"
                    )));
                }
            }

            sleep_cancellable(poll.interval, cancel).await?;
        }

        Err(FlowError::Timeout(format!(
            "job polling timed out after {}s",
            poll.timeout.as_secs()
        )))
    }

    /// Derive the poll URL from a job submission response.
    ///
    /// Recognizes a Replicate-style `urls.get`, or an `id` combined with a
    /// `{job_id}` template (default `{base}/jobs/{id}`).
    fn extract_poll_url(&self, response: &Value, poll: &PollConfig) -> Option<String> {
        let map = response.as_object()?;
        if let Some(url) = map
            .get("urls")
            .and_then(|urls| urls.get("get"))
            .and_then(Value::as_str)
        {
            return Some(url.to_string());
        }
        let id = match map.get("id")? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(match &poll.poll_url_template {
            Some(template) => template.replace("{job_id}", &id),
            None => format!("{}/jobs/{id}", self.base_url),
        })
    }

    fn join_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Merge headers: client defaults, then auth, then step headers.
    fn compose_headers(&self, spec: &RequestSpec) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());
        if let Some(auth) = &self.auth {
            headers.extend(auth.to_request_headers());
        }
        headers.extend(spec.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        let has_content_type = headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"));
        let json_body = matches!(
            &spec.payload,
            Some(Value::Object(_)) | Some(Value::Array(_))
        );
        if json_body && !has_content_type && spec.upload_files.is_none() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        headers
    }

    fn attempt_timeout(&self, spec: &RequestSpec) -> Result<Duration> {
        if let Some(retry) = &spec.retry {
            if let Some(timeout) = retry.attempt_timeout()? {
                return Ok(timeout);
            }
        }
        Ok(spec.timeout.unwrap_or(self.default_timeout))
    }
}

/// Parse a response body: JSON when the content type says so or the body
/// looks like JSON, plain text otherwise.
async fn parse_response(response: reqwest::Response) -> Result<Value> {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let text = response
        .text()
        .await
        .map_err(crate::http::pool::map_send_error)?;

    let looks_like_json = {
        let trimmed = text.trim();
        trimmed.starts_with('{') || trimmed.starts_with('[')
    };
    if content_type.contains("application/json") || looks_like_json {
        if let Ok(value) = serde_json::from_str(&text) {
            return Ok(value);
        }
    }
    Ok(Value::String(text))
}

/// Encode uploads as multipart, carrying the JSON payload as form fields.
async fn build_multipart(
    uploads: &HashMap<String, String>,
    payload: Option<&Value>,
) -> Result<Form> {
    let mut form = Form::new();
    for (field, path) in uploads {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let file_name = std::path::Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| field.clone());
                form = form.part(field.clone(), Part::bytes(bytes).file_name(file_name));
            }
            Err(e) => {
                warn!(path = %path, "file not found for upload: {e}");
            }
        }
    }
    if let Some(Value::Object(fields)) = payload {
        for (key, value) in fields {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), text);
        }
    }
    Ok(form)
}

/// Extract specific fields from a response into a new object.
///
/// Keys are the configured output names; values come from dotted-path
/// lookups. Missing paths omit the key.
pub fn extract_fields(response: &Value, mapping: &HashMap<String, String>) -> Value {
    let mut result = serde_json::Map::new();
    for (output_key, field_path) in mapping {
        if let Some(value) = get_nested_field(response, field_path) {
            result.insert(output_key.clone(), value);
        }
    }
    Value::Object(result)
}

/// Walk a dotted path into JSON data; integer parts index into arrays.
pub fn get_nested_field(data: &Value, field_path: &str) -> Option<Value> {
    let mut current = data;
    for part in field_path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => {
                let index: usize = part.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(FlowError::Execution("execution cancelled".to_string())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
