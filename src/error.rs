//! Error types for apiflow

use thiserror::Error;

/// apiflow error types
#[derive(Error, Debug)]
pub enum FlowError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Configuration rejected at load time
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Unresolved `${NAME}` placeholder
    #[error("Environment variable '{0}' not found")]
    MissingEnvVar(String),

    /// Step depends on an unknown step or parallel group
    #[error("Step '{step}' depends on unknown step or group '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    /// Cycle in the dependency graph
    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    /// Resolver made no progress with steps remaining
    #[error("Cannot resolve dependencies for steps: {0:?}")]
    UnresolvableDependencies(Vec<String>),

    /// Template render failure or missing path
    #[error("Template error in step '{step}': {message}")]
    Template { step: String, message: String },

    /// Rendered template is not valid JSON
    #[error("Rendered payload for step '{step}' is not valid JSON: {message}")]
    TemplateParse { step: String, message: String },

    /// 401 from upstream
    #[error("Authentication failed (HTTP 401): {body}")]
    Authentication { body: String },

    /// 4xx other than 401
    #[error("HTTP {status}: {body}")]
    Client { status: u16, body: String },

    /// 5xx
    #[error("HTTP {status}: {body}")]
    Server { status: u16, body: String },

    /// Connect/DNS/socket failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request, poll, or attempt timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Circuit breaker refusing calls
    #[error("Circuit breaker open for service '{service}'")]
    CircuitOpen { service: String },

    /// All retries consumed; carries the (masked) last error
    #[error("Request failed after {retries} retries: {last_error}")]
    RetryExhausted { retries: u32, last_error: String },

    /// Engine-level abort
    #[error("Execution error: {0}")]
    Execution(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Whether a retry loop may re-attempt after this error.
    ///
    /// Server errors, transport failures, and timeouts are transient;
    /// everything else surfaces immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FlowError::Server { .. } | FlowError::Transport(_) | FlowError::Timeout(_)
        )
    }
}

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(FlowError::Server {
            status: 500,
            body: "boom".into()
        }
        .is_retriable());
        assert!(FlowError::Transport("connection refused".into()).is_retriable());
        assert!(FlowError::Timeout("request timed out after 5s".into()).is_retriable());

        assert!(!FlowError::Authentication {
            body: "bad token".into()
        }
        .is_retriable());
        assert!(!FlowError::Client {
            status: 404,
            body: "missing".into()
        }
        .is_retriable());
        assert!(!FlowError::CircuitOpen {
            service: "llm".into()
        }
        .is_retriable());
        assert!(!FlowError::Validation("nope".into()).is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = FlowError::MissingDependency {
            step: "b".into(),
            dependency: "a".into(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'b' depends on unknown step or group 'a'"
        );

        let err = FlowError::RetryExhausted {
            retries: 3,
            last_error: "HTTP 503".into(),
        };
        assert!(err.to_string().contains("after 3 retries"));
    }
}
