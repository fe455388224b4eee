//! Core data models for apiflow workflows

use crate::error::{FlowError, Result};
use crate::secrets::{resolve_placeholders, SecretsProvider};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

// Input validation limits
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_WORKFLOW_NAME_LEN: usize = 63;
pub const MAX_STEP_COUNT: usize = 1_000;

static WORKFLOW_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid workflow name regex"));
static STEP_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("valid step name regex"));
// Retry delays accept decimals; polling intervals and step timeouts do not.
static DURATION_DECIMAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\.?\d*|\.\d+)[smh]$").expect("valid decimal duration regex"));
static DURATION_STRICT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[smh]$").expect("valid strict duration regex"));

/// Parse a duration literal with an integer magnitude (`30s`, `10m`, `2h`).
///
/// Used for step timeouts and polling intervals. Decimal magnitudes are
/// rejected here; see [`parse_duration_decimal`] for retry delays.
///
/// # Example
///
/// ```
/// use apiflow::models::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("5s")?, Duration::from_secs(5));
/// assert_eq!(parse_duration("1m")?, Duration::from_secs(60));
/// assert!(parse_duration("5ms").is_err());
/// # Ok::<(), apiflow::error::FlowError>(())
/// ```
pub fn parse_duration(value: &str) -> Result<Duration> {
    if !DURATION_STRICT_RE.is_match(value) {
        return Err(FlowError::Validation(format!(
            "Duration must be in format '5s', '1m', or '2h', got '{value}'"
        )));
    }
    let (magnitude, unit) = value.split_at(value.len() - 1);
    let n: u64 = magnitude
        .parse()
        .map_err(|_| FlowError::Validation(format!("Invalid duration '{value}'")))?;
    Ok(Duration::from_secs(n.saturating_mul(unit_seconds(unit))))
}

/// Parse a duration literal that permits a decimal magnitude (`1.5s`, `.5m`).
///
/// Used for retry delays and per-attempt retry timeouts.
pub fn parse_duration_decimal(value: &str) -> Result<Duration> {
    if !DURATION_DECIMAL_RE.is_match(value) {
        return Err(FlowError::Validation(format!(
            "Duration must be in format '5s', '1.5m', or '2h', got '{value}'"
        )));
    }
    let (magnitude, unit) = value.split_at(value.len() - 1);
    let n: f64 = magnitude
        .parse()
        .map_err(|_| FlowError::Validation(format!("Invalid duration '{value}'")))?;
    Duration::try_from_secs_f64(n * unit_seconds(unit) as f64)
        .map_err(|_| FlowError::Validation(format!("Duration '{value}' out of range")))
}

fn unit_seconds(unit: &str) -> u64 {
    match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => unreachable!("unit checked by regex"),
    }
}

/// Authentication configuration for workflow APIs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        header_name: String,
        api_key: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Custom {
        custom_headers: HashMap<String, String>,
    },
}

impl AuthConfig {
    /// Validate required fields for the selected variant.
    pub fn validate(&self) -> Result<()> {
        match self {
            AuthConfig::None => Ok(()),
            AuthConfig::Bearer { token } if token.is_empty() => Err(FlowError::Validation(
                "Bearer auth requires a non-empty 'token' field".to_string(),
            )),
            AuthConfig::ApiKey {
                header_name,
                api_key,
            } if header_name.is_empty() || api_key.is_empty() => Err(FlowError::Validation(
                "API key auth requires 'header_name' and 'api_key' fields".to_string(),
            )),
            AuthConfig::Basic { username, password }
                if username.is_empty() || password.is_empty() =>
            {
                Err(FlowError::Validation(
                    "Basic auth requires 'username' and 'password' fields".to_string(),
                ))
            }
            AuthConfig::Custom { custom_headers } if custom_headers.is_empty() => Err(
                FlowError::Validation("Custom auth requires 'custom_headers' field".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Resolve `${NAME}` placeholders in auth fields against a secrets provider.
    pub fn resolve_env_vars(&self, secrets: &dyn SecretsProvider) -> Result<AuthConfig> {
        Ok(match self {
            AuthConfig::None => AuthConfig::None,
            AuthConfig::Bearer { token } => AuthConfig::Bearer {
                token: resolve_placeholders(token, secrets)?,
            },
            AuthConfig::ApiKey {
                header_name,
                api_key,
            } => AuthConfig::ApiKey {
                header_name: header_name.clone(),
                api_key: resolve_placeholders(api_key, secrets)?,
            },
            AuthConfig::Basic { username, password } => AuthConfig::Basic {
                username: resolve_placeholders(username, secrets)?,
                password: resolve_placeholders(password, secrets)?,
            },
            AuthConfig::Custom { custom_headers } => {
                let mut resolved = HashMap::with_capacity(custom_headers.len());
                for (key, value) in custom_headers {
                    resolved.insert(key.clone(), resolve_placeholders(value, secrets)?);
                }
                AuthConfig::Custom {
                    custom_headers: resolved,
                }
            }
        })
    }

    /// Convert auth config to HTTP request headers.
    pub fn to_request_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        match self {
            AuthConfig::None => {}
            AuthConfig::Bearer { token } => {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            AuthConfig::ApiKey {
                header_name,
                api_key,
            } => {
                headers.insert(header_name.clone(), api_key.clone());
            }
            AuthConfig::Basic { username, password } => {
                let credentials = BASE64.encode(format!("{username}:{password}"));
                headers.insert("Authorization".to_string(), format!("Basic {credentials}"));
            }
            AuthConfig::Custom { custom_headers } => {
                headers.extend(
                    custom_headers
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
        }
        headers
    }
}

/// Backoff strategy for retry delays
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// Retry configuration for workflow steps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub limit: u32,
    /// Initial delay between retries, e.g. "5s", "1.5m"
    pub delay: String,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.limit) {
            return Err(FlowError::Validation(format!(
                "Retry limit must be between 1 and 10, got {}",
                self.limit
            )));
        }
        parse_duration_decimal(&self.delay)?;
        if let Some(timeout) = &self.timeout {
            parse_duration_decimal(timeout)?;
        }
        Ok(())
    }

    /// Base delay as a duration.
    pub fn base_delay(&self) -> Result<Duration> {
        parse_duration_decimal(&self.delay)
    }

    /// Per-attempt timeout, if configured.
    pub fn attempt_timeout(&self) -> Result<Option<Duration>> {
        self.timeout
            .as_deref()
            .map(parse_duration_decimal)
            .transpose()
    }

    /// Delay before retry `attempt` (1-based from the first retry).
    ///
    /// constant: base; linear: base * attempt; exponential: base * 2^(attempt-1).
    pub fn backoff_delay(&self, base: Duration, attempt: u32) -> Duration {
        match self.backoff {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            }
        }
    }
}

/// HTTP methods
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }
}

fn default_poll_interval() -> String {
    "10s".to_string()
}

fn default_poll_timeout() -> String {
    "30m".to_string()
}

fn default_completion_field() -> String {
    "status".to_string()
}

fn default_completion_values() -> Vec<String> {
    vec!["completed".to_string(), "succeeded".to_string()]
}

/// Configuration for a single workflow step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step identifier
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// API endpoint path, starting with '/'
    pub endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,

    // Execution control
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,

    // Request configuration
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    // File handling
    #[serde(default)]
    pub download_response: bool,
    /// Files to upload (field name -> local path); switches to multipart
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_files: Option<HashMap<String, String>>,

    // Async job handling
    #[serde(default)]
    pub poll_for_completion: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,
    #[serde(default = "default_completion_field")]
    pub completion_field: String,
    #[serde(default = "default_completion_values")]
    pub completion_values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_url_template: Option<String>,

    // Error handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,

    // Response processing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_transform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract_fields: Option<HashMap<String, String>>,

    // Object storage passthrough
    #[serde(default)]
    pub store_in_r2: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r2_bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r2_key_template: Option<String>,
}

impl StepConfig {
    /// Validate a single step in isolation. Cross-step checks (duplicate
    /// names, dependency references) happen in the parser and resolver.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FlowError::Validation("Step name cannot be empty".to_string()));
        }
        if !STEP_NAME_RE.is_match(&self.name) {
            return Err(FlowError::Validation(format!(
                "Step name '{}' can only contain alphanumeric characters and underscores",
                self.name
            )));
        }
        if !self.endpoint.starts_with('/') {
            return Err(FlowError::Validation(format!(
                "Endpoint for step '{}' must start with '/'",
                self.name
            )));
        }
        if self.payload.is_some() && self.payload_template.is_some() {
            return Err(FlowError::Validation(format!(
                "Step '{}' cannot specify both 'payload' and 'payload_template'",
                self.name
            )));
        }
        if let Some(max_parallel) = self.max_parallel {
            if !(1..=10).contains(&max_parallel) {
                return Err(FlowError::Validation(format!(
                    "max_parallel for step '{}' must be between 1 and 10",
                    self.name
                )));
            }
        }
        if let Some(timeout) = &self.timeout {
            parse_duration(timeout)?;
        }
        parse_duration(&self.poll_interval)?;
        parse_duration(&self.poll_timeout)?;
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }

    /// Step timeout as a duration, if configured.
    pub fn timeout_duration(&self) -> Result<Option<Duration>> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }

    /// Context key under which the effective response is stored.
    pub fn context_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.name)
    }
}

/// Monitoring and notification configuration (passthrough to observers)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitoringConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<Value>,
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
}

fn default_logging_level() -> String {
    "INFO".to_string()
}

/// Complete workflow configuration parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Unique workflow identifier
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // Scheduling (validated, emitted; an external scheduler consumes it)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    // API configuration
    pub api_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Global template variables, seeded into the execution context
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Workflow steps
    pub steps: Vec<StepConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringConfig>,
}

impl WorkflowConfig {
    /// Validate the workflow-level fields and every step.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FlowError::Validation(
                "Workflow name cannot be empty".to_string(),
            ));
        }
        if self.name.len() > MAX_WORKFLOW_NAME_LEN {
            return Err(FlowError::Validation(format!(
                "Workflow name must be {MAX_WORKFLOW_NAME_LEN} characters or less"
            )));
        }
        if !WORKFLOW_NAME_RE.is_match(&self.name) {
            return Err(FlowError::Validation(format!(
                "Workflow name '{}' can only contain alphanumeric characters, underscores, and hyphens",
                self.name
            )));
        }
        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err(FlowError::Validation(
                "api_base must be a valid URL starting with http:// or https://".to_string(),
            ));
        }
        if let Some(schedule) = &self.schedule {
            crate::schedule::validate_cron(schedule)?;
        }
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        if self.steps.is_empty() {
            return Err(FlowError::Validation(
                "Workflow must define at least one step".to_string(),
            ));
        }
        if self.steps.len() > MAX_STEP_COUNT {
            return Err(FlowError::Validation(format!(
                "Step count {} exceeds limit of {MAX_STEP_COUNT}",
                self.steps.len()
            )));
        }

        let mut seen = std::collections::HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            step.validate()?;
            if !seen.insert(step.name.as_str()) {
                return Err(FlowError::Validation(format!(
                    "Duplicate step name '{}'",
                    step.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve `${NAME}` placeholders in auth fields and string variables.
    ///
    /// An unresolved placeholder is a fatal configuration error.
    pub fn resolve_env_vars(&self, secrets: &dyn SecretsProvider) -> Result<WorkflowConfig> {
        let mut resolved = self.clone();
        if let Some(auth) = &self.auth {
            resolved.auth = Some(auth.resolve_env_vars(secrets)?);
        }
        for value in resolved.variables.values_mut() {
            if let Value::String(s) = value {
                *value = Value::String(resolve_placeholders(s, secrets)?);
            }
        }
        Ok(resolved)
    }
}

/// Result of executing a single workflow step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time: Duration,
    pub retry_count: u32,
    /// Zero-based index of the phase in which the step ran
    pub execution_order: usize,
}

/// Result of executing a complete workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_name: String,
    pub success: bool,
    pub step_results: HashMap<String, StepResult>,
    pub total_execution_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
