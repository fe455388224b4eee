//! Secrets providers consumed during configuration loading
//!
//! The core never loads secrets files itself; it consumes a resolved
//! key -> value capability. `${NAME}` placeholders in auth fields and
//! workflow variables are resolved through a [`SecretsProvider`] at load
//! time, and an unresolved placeholder is a fatal configuration error.

use crate::error::{FlowError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

/// Read-only lookup over a resolved secret store.
pub trait SecretsProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment as a secrets provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretsProvider for EnvSecrets {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// In-memory key -> value mapping, for tests and pre-resolved stores.
#[derive(Debug, Clone, Default)]
pub struct MapSecrets {
    values: HashMap<String, String>,
}

impl MapSecrets {
    pub fn new(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl SecretsProvider for MapSecrets {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Substitute every `${NAME}` placeholder in `input` from the provider.
///
/// A placeholder with no matching key fails with
/// [`FlowError::MissingEnvVar`]; text without placeholders passes through
/// unchanged.
pub fn resolve_placeholders(input: &str, secrets: &dyn SecretsProvider) -> Result<String> {
    let mut result = String::with_capacity(input.len());
    let mut last_index = 0;

    for capture in PLACEHOLDER_RE.captures_iter(input) {
        let matched = capture.get(0).expect("match always has a full capture");
        let name = capture.get(1).expect("match always has a name group").as_str();
        let value = secrets
            .get(name)
            .ok_or_else(|| FlowError::MissingEnvVar(name.to_string()))?;
        result.push_str(&input[last_index..matched.start()]);
        result.push_str(&value);
        last_index = matched.end();
    }

    result.push_str(&input[last_index..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_full_placeholder() {
        let secrets = MapSecrets::new([("TOKEN".to_string(), "abc".to_string())]);
        assert_eq!(resolve_placeholders("${TOKEN}", &secrets).unwrap(), "abc");
    }

    #[test]
    fn test_resolve_embedded_placeholder() {
        let secrets = MapSecrets::new([("USER".to_string(), "alice".to_string())]);
        assert_eq!(
            resolve_placeholders("Bearer ${USER}-key", &secrets).unwrap(),
            "Bearer alice-key"
        );
    }

    #[test]
    fn test_resolve_multiple_placeholders() {
        let mut secrets = MapSecrets::default();
        secrets.insert("A", "1");
        secrets.insert("B", "2");
        assert_eq!(
            resolve_placeholders("${A}:${B}", &secrets).unwrap(),
            "1:2"
        );
    }

    #[test]
    fn test_missing_placeholder_is_fatal() {
        let secrets = MapSecrets::default();
        assert!(matches!(
            resolve_placeholders("${NOPE}", &secrets),
            Err(FlowError::MissingEnvVar(name)) if name == "NOPE"
        ));
    }

    #[test]
    fn test_plain_text_passes_through() {
        let secrets = MapSecrets::default();
        assert_eq!(
            resolve_placeholders("no placeholders here", &secrets).unwrap(),
            "no placeholders here"
        );
    }

    #[test]
    fn test_env_secrets_reads_process_env() {
        std::env::set_var("APIFLOW_TEST_SECRET", "shh");
        assert_eq!(
            EnvSecrets.get("APIFLOW_TEST_SECRET"),
            Some("shh".to_string())
        );
        std::env::remove_var("APIFLOW_TEST_SECRET");
    }
}
