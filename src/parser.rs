//! YAML parser with validation for workflow configurations

use crate::error::{FlowError, Result};
use crate::models::{WorkflowConfig, MAX_YAML_SIZE};
use crate::resolver::DependencyResolver;
use std::fs;
use std::path::Path;

/// Parse and validate a workflow configuration from a YAML file.
///
/// # Errors
///
/// * [`FlowError::Io`] - the file cannot be read
/// * [`FlowError::YamlParse`] - malformed YAML
/// * [`FlowError::Validation`] - any field-level rule fails
/// * [`FlowError::MissingDependency`] / [`FlowError::CircularDependency`] -
///   the dependency graph is invalid
pub fn parse_workflow_file<P: AsRef<Path>>(path: P) -> Result<WorkflowConfig> {
    let content = fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Parse and validate a workflow configuration from a YAML string.
///
/// Validates everything that can be rejected before execution: field
/// grammars, auth variant requirements, unique step names, the cron
/// schedule, and the dependency graph (references and cycles).
pub fn parse_workflow_yaml(content: &str) -> Result<WorkflowConfig> {
    if content.len() > MAX_YAML_SIZE {
        return Err(FlowError::Validation(format!(
            "Workflow YAML exceeds {MAX_YAML_SIZE} byte limit (size: {} bytes)",
            content.len()
        )));
    }

    let config: WorkflowConfig = serde_yaml::from_str(content)?;
    config.validate()?;

    // Reject missing references and cycles at load time
    DependencyResolver::build(&config.steps)?;

    Ok(config)
}
