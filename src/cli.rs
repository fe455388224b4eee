//! CLI interface for apiflow

use crate::engine::ExecutionEngine;
use crate::error::FlowError;
use crate::logging::{init_logging, LogConfig, LogFormat};
use crate::parser::parse_workflow_file;
use crate::resolver::resolve_phases;
use crate::secrets::EnvSecrets;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

/// Exit codes for CLI drivers built atop the engine.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_VALIDATION_FAILURE: i32 = 1;
pub const EXIT_EXECUTION_FAILURE: i32 = 2;
pub const EXIT_MISSING_SECRET: i32 = 3;

/// apiflow - Declarative YAML workflow engine for orchestrating HTTP APIs
#[derive(Parser, Debug)]
#[command(name = "apiflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Declarative YAML workflow engine for orchestrating HTTP APIs", long_about = None)]
pub struct Cli {
    /// Log level or filter directive (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a workflow once
    Run {
        /// Path to workflow YAML file
        workflow: PathBuf,
    },

    /// Validate workflow YAML, auth, and dependency graph
    Validate {
        /// Path to workflow YAML file
        workflow: PathBuf,
    },

    /// Show the resolved execution phases without running anything
    Phases {
        /// Path to workflow YAML file
        workflow: PathBuf,
    },
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let format = match self.log_format.as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        init_logging(&LogConfig {
            filter: self.log_level.clone(),
            format,
        })
    }

    /// Execute the CLI command, returning the process exit code.
    pub async fn execute(&self) -> i32 {
        match &self.command {
            Commands::Run { workflow } => self.run_workflow(workflow).await,
            Commands::Validate { workflow } => self.validate_workflow(workflow),
            Commands::Phases { workflow } => self.show_phases(workflow),
        }
    }

    async fn run_workflow(&self, path: &PathBuf) -> i32 {
        info!("Loading workflow from: {:?}", path);
        let config = match parse_workflow_file(path) {
            Ok(config) => config,
            Err(e) => return report_load_error(e),
        };
        // Construction ends with env resolution; a missing secret surfaces
        // here as a typed error, never from execution
        let config = match config.resolve_env_vars(&EnvSecrets) {
            Ok(config) => config,
            Err(e) => return report_load_error(e),
        };

        let engine = ExecutionEngine::default();
        let result = engine.execute_workflow(&config).await;

        for name in sorted_step_names(&result) {
            let step = &result.step_results[name];
            println!(
                "  {} [{}] phase {} ({:.2}s, {} retries)",
                step.name,
                if step.success { "ok" } else { "failed" },
                step.execution_order,
                step.execution_time.as_secs_f64(),
                step.retry_count
            );
        }

        if result.success {
            println!(
                "Workflow '{}' completed in {:.2}s",
                result.workflow_name,
                result.total_execution_time.as_secs_f64()
            );
            EXIT_SUCCESS
        } else {
            let error = result.error.as_deref().unwrap_or("unknown error");
            error!("Workflow failed: {error}");
            eprintln!("Workflow '{}' failed: {error}", result.workflow_name);
            EXIT_EXECUTION_FAILURE
        }
    }

    fn validate_workflow(&self, path: &PathBuf) -> i32 {
        info!("Validating workflow: {:?}", path);
        match parse_workflow_file(path) {
            Ok(config) => {
                println!("Workflow '{}' is valid", config.name);
                println!("Steps: {}", config.steps.len());
                if let Some(schedule) = &config.schedule {
                    println!("Schedule: {schedule}");
                }
                EXIT_SUCCESS
            }
            Err(e) => report_load_error(e),
        }
    }

    fn show_phases(&self, path: &PathBuf) -> i32 {
        let config = match parse_workflow_file(path) {
            Ok(config) => config,
            Err(e) => return report_load_error(e),
        };
        match resolve_phases(&config.steps) {
            Ok(phases) => {
                for (index, phase) in phases.iter().enumerate() {
                    println!("Phase {}: {}", index, phase.step_names().join(", "));
                }
                EXIT_SUCCESS
            }
            Err(e) => report_load_error(e),
        }
    }
}

fn report_load_error(e: FlowError) -> i32 {
    error!("Workflow rejected: {e}");
    eprintln!("Error: {e}");
    match e {
        FlowError::MissingEnvVar(_) => EXIT_MISSING_SECRET,
        _ => EXIT_VALIDATION_FAILURE,
    }
}

fn sorted_step_names(result: &crate::models::WorkflowResult) -> Vec<&String> {
    let mut names: Vec<&String> = result.step_results.keys().collect();
    names.sort_by_key(|name| {
        (
            result.step_results[*name].execution_order,
            name.to_string(),
        )
    });
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::parse_from(["apiflow", "validate", "workflow.yaml"]);
        assert!(matches!(cli.command, Commands::Validate { .. }));
    }

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["apiflow", "run", "workflow.yaml"]);
        assert!(matches!(cli.command, Commands::Run { .. }));
    }

    #[test]
    fn test_cli_parse_phases() {
        let cli = Cli::parse_from(["apiflow", "phases", "workflow.yaml"]);
        assert!(matches!(cli.command, Commands::Phases { .. }));
    }

    #[test]
    fn test_cli_log_flags() {
        let cli = Cli::parse_from([
            "apiflow",
            "--log-level",
            "debug",
            "--log-format",
            "pretty",
            "validate",
            "w.yaml",
        ]);
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_format, "pretty");
    }

    #[test]
    fn test_validate_missing_file_is_validation_failure() {
        let cli = Cli::parse_from(["apiflow", "validate", "/definitely/not/here.yaml"]);
        match &cli.command {
            Commands::Validate { workflow } => {
                assert_eq!(cli.validate_workflow(workflow), EXIT_VALIDATION_FAILURE);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_run_missing_secret_exit_code() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
name: needs_secret
api_base: https://api.example.com
auth:
  type: bearer
  token: "${APIFLOW_TEST_UNSET_SECRET_XYZ}"
steps:
  - name: s1
    endpoint: /run
"#,
        )
        .unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let cli = Cli::parse_from(["apiflow", "run", &path]);
        // Resolution fails before any request is attempted
        assert_eq!(cli.execute().await, EXIT_MISSING_SECRET);
    }
}
