//! Workflow execution engine
//!
//! Drives execution phases produced by the resolver: sequential steps run
//! one at a time, parallel groups fan out as tasks bounded by an optional
//! semaphore and a hard wall-clock cap. All engine-local state (step
//! results, the execution context) is touched only from the engine's own
//! task; concurrency exists purely in outbound HTTP calls.

use crate::error::{FlowError, Result};
use crate::http::client::{extract_fields, HttpOutcome, RequestSpec, WorkflowHttpClient};
use crate::http::pool::ConnectionPool;
use crate::models::{StepConfig, StepResult, WorkflowConfig, WorkflowResult};
use crate::resolver::{resolve_phases, ExecutionPhase};
use crate::security::{SecretMasker, SecureLogger};
use crate::storage::ObjectStore;
use crate::template::TemplateRenderer;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hard wall-clock cap on gathering one parallel group.
const PARALLEL_PHASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Engine for executing workflows with dependency management.
///
/// Consumes a fully-constructed workflow: validation and `${NAME}`
/// resolution belong to load time, execution starts here.
pub struct ExecutionEngine {
    pool: Arc<ConnectionPool>,
    object_store: Option<Arc<dyn ObjectStore>>,
    renderer: TemplateRenderer,
    masker: SecretMasker,
    logger: SecureLogger,
    cancel: CancellationToken,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(Arc::new(ConnectionPool::default()))
    }
}

impl ExecutionEngine {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            object_store: None,
            renderer: TemplateRenderer::new(),
            masker: SecretMasker::new(),
            logger: SecureLogger::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach the object storage collaborator for `store_in_r2` steps.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Token that cancels in-flight HTTP calls, retries, and polls.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a complete workflow.
    ///
    /// Never panics or errors at the surface: failures are recorded in the
    /// returned [`WorkflowResult`] with every message masked. Step results
    /// produced before a fatal abort are preserved.
    pub async fn execute_workflow(&self, workflow: &WorkflowConfig) -> WorkflowResult {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        info!(workflow = %workflow.name, run_id = %run_id, "starting workflow execution");

        let mut step_results = HashMap::new();
        match self.run_workflow(workflow, &mut step_results).await {
            Ok(()) => {
                let total = start.elapsed();
                info!(
                    workflow = %workflow.name,
                    run_id = %run_id,
                    elapsed_ms = total.as_millis() as u64,
                    "workflow completed successfully"
                );
                WorkflowResult {
                    workflow_name: workflow.name.clone(),
                    success: true,
                    step_results,
                    total_execution_time: total,
                    error: None,
                }
            }
            Err(e) => {
                let message = self
                    .masker
                    .mask_str(&format!("Workflow '{}' failed: {e}", workflow.name));
                error!(workflow = %workflow.name, run_id = %run_id, "{message}");
                WorkflowResult {
                    workflow_name: workflow.name.clone(),
                    success: false,
                    step_results,
                    total_execution_time: start.elapsed(),
                    error: Some(message),
                }
            }
        }
    }

    async fn run_workflow(
        &self,
        workflow: &WorkflowConfig,
        step_results: &mut HashMap<String, StepResult>,
    ) -> Result<()> {
        let mut client = WorkflowHttpClient::new(&workflow.api_base, self.pool.clone());
        if let Some(auth) = &workflow.auth {
            client.set_auth(auth.clone());
        }
        // Workflows against the same origin share one breaker
        if let Ok(origin) = ConnectionPool::origin_of(&workflow.api_base) {
            client.set_service_name(origin);
        }
        let client = Arc::new(client);

        let mut context = Map::new();
        for (key, value) in &workflow.variables {
            context.insert(key.clone(), value.clone());
        }

        let phases = resolve_phases(&workflow.steps)?;
        for (phase_index, phase) in phases.iter().enumerate() {
            info!(
                phase = phase_index + 1,
                steps = phase.steps.len(),
                "executing phase"
            );
            self.run_phase(phase, phase_index, &client, &mut context, step_results)
                .await?;
        }
        Ok(())
    }

    /// Run one phase: ungrouped steps strictly in order, then each parallel
    /// group fanned out.
    async fn run_phase(
        &self,
        phase: &ExecutionPhase,
        phase_index: usize,
        client: &Arc<WorkflowHttpClient>,
        context: &mut Map<String, Value>,
        step_results: &mut HashMap<String, StepResult>,
    ) -> Result<()> {
        let mut groups: Vec<(String, Vec<&StepConfig>)> = Vec::new();
        for step in &phase.steps {
            match &step.parallel_group {
                Some(label) => match groups.iter_mut().find(|(name, _)| name.as_str() == label.as_str()) {
                    Some((_, members)) => members.push(step),
                    None => groups.push((label.clone(), vec![step])),
                },
                None => {
                    let result = self.run_single_step(step, phase_index, client, context).await;
                    self.record_result(step, result, context, step_results)?;
                }
            }
        }

        for (label, members) in groups {
            debug!(group = %label, members = members.len(), "executing parallel group");
            let results = self
                .run_parallel_group(&members, phase_index, client, context)
                .await?;
            for (step, result) in members.iter().zip(results) {
                self.record_result(step, result, context, step_results)?;
            }
        }
        Ok(())
    }

    /// Execute one step inline on the engine task.
    async fn run_single_step(
        &self,
        step: &StepConfig,
        phase_index: usize,
        client: &Arc<WorkflowHttpClient>,
        context: &Map<String, Value>,
    ) -> StepResult {
        let start = Instant::now();
        let spec = match self.prepare_spec(step, context) {
            Ok(spec) => spec,
            Err(e) => return self.failed_result(step, phase_index, start, 0, &e),
        };
        let outcome = client.execute(&spec, &self.cancel).await;
        self.finish_step(step, phase_index, start, outcome, context)
            .await
    }

    /// Fan a parallel group out as tasks, bounded by the group's declared
    /// `max_parallel` and a hard wall-clock cap.
    async fn run_parallel_group(
        &self,
        members: &[&StepConfig],
        phase_index: usize,
        client: &Arc<WorkflowHttpClient>,
        context: &Map<String, Value>,
    ) -> Result<Vec<StepResult>> {
        let max_parallel = members
            .iter()
            .filter_map(|step| step.max_parallel)
            .min();
        let semaphore = max_parallel
            .filter(|limit| *limit < members.len())
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let group_cancel = self.cancel.child_token();

        // Payloads render against the context as it stood when the phase
        // began; sibling outputs are never visible to each other.
        let mut tasks: Vec<(Instant, std::result::Result<JoinHandle<Result<HttpOutcome>>, FlowError>)> =
            Vec::with_capacity(members.len());
        for step in members {
            let start = Instant::now();
            match self.prepare_spec(step, context) {
                Ok(spec) => {
                    let client = client.clone();
                    let cancel = group_cancel.clone();
                    let semaphore = semaphore.clone();
                    let handle = tokio::spawn(async move {
                        let _permit = match &semaphore {
                            Some(s) => Some(s.clone().acquire_owned().await.map_err(|_| {
                                FlowError::Execution("parallel group semaphore closed".to_string())
                            })?),
                            None => None,
                        };
                        client.execute(&spec, &cancel).await
                    });
                    tasks.push((start, Ok(handle)));
                }
                Err(e) => tasks.push((start, Err(e))),
            }
        }

        // Tasks run concurrently; awaiting them in order against a shared
        // deadline gives the group-level wall-clock cap.
        let deadline = tokio::time::Instant::now() + PARALLEL_PHASE_TIMEOUT;
        let mut results = Vec::with_capacity(members.len());
        for (index, (start, task)) in tasks.into_iter().enumerate() {
            let step = members[index];
            let result = match task {
                Err(render_error) => {
                    self.failed_result(step, phase_index, start, 0, &render_error)
                }
                Ok(handle) => match tokio::time::timeout_at(deadline, handle).await {
                    Ok(join_result) => {
                        let outcome = join_result.unwrap_or_else(|e| {
                            Err(FlowError::Execution(format!("task panicked: {e}")))
                        });
                        self.finish_step(step, phase_index, start, outcome, context)
                            .await
                    }
                    Err(_) => {
                        group_cancel.cancel();
                        return Err(FlowError::Execution(
                            "parallel execution timed out".to_string(),
                        ));
                    }
                },
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Render the payload and build the request spec for a step.
    fn prepare_spec(&self, step: &StepConfig, context: &Map<String, Value>) -> Result<RequestSpec> {
        let payload = match &step.payload_template {
            Some(template) => Some(self.renderer.render_json(
                &step.name,
                template,
                &Value::Object(context.clone()),
            )?),
            None => step.payload.clone(),
        };
        RequestSpec::from_step(step, payload)
    }

    /// Turn an HTTP outcome into a step result, applying field extraction,
    /// object storage handoff, and the response transform.
    async fn finish_step(
        &self,
        step: &StepConfig,
        phase_index: usize,
        start: Instant,
        outcome: Result<HttpOutcome>,
        context: &Map<String, Value>,
    ) -> StepResult {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return self.failed_result(step, phase_index, start, 0, &e),
        };

        let mut value = outcome.value;
        if let Some(mapping) = &step.extract_fields {
            value = extract_fields(&value, mapping);
        }

        if step.store_in_r2 {
            if let Some(bucket) = &step.r2_bucket {
                value = self.store_artifact(step, bucket, value, context).await;
            }
        }

        if let Some(transform) = &step.response_transform {
            let mut transform_context = context.clone();
            transform_context.insert("response".to_string(), value.clone());
            match self.renderer.render_loose(
                &step.name,
                transform,
                &Value::Object(transform_context),
            ) {
                Ok(transformed) => value = transformed,
                Err(e) => {
                    // A broken transform keeps the untransformed response
                    warn!(
                        step = %step.name,
                        "response transform failed: {}",
                        self.masker.mask_str(&e.to_string())
                    );
                }
            }
        }

        debug!(
            step = %step.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "step completed successfully"
        );
        StepResult {
            name: step.name.clone(),
            success: true,
            response_data: Some(value),
            error: None,
            execution_time: start.elapsed(),
            retry_count: outcome.retry_count,
            execution_order: phase_index,
        }
    }

    /// Hand a file result to the object store, producing the
    /// `{file_path, object_url}` record that enters the context.
    async fn store_artifact(
        &self,
        step: &StepConfig,
        bucket: &str,
        value: Value,
        context: &Map<String, Value>,
    ) -> Value {
        let Value::String(path) = &value else {
            return value;
        };
        if !std::path::Path::new(path).exists() {
            return value;
        }

        let key = step
            .r2_key_template
            .as_ref()
            .and_then(|template| {
                self.renderer
                    .render(&step.name, template, &Value::Object(context.clone()))
                    .map_err(|e| {
                        warn!(step = %step.name, "object key template failed: {e}");
                        e
                    })
                    .ok()
            })
            .unwrap_or_else(|| format!("workflow/{}/{}", step.name, Uuid::new_v4()));

        let url = match &self.object_store {
            Some(store) => match store.put_file(bucket, &key, std::path::Path::new(path)).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(
                        step = %step.name,
                        "object store upload failed: {}",
                        self.masker.mask_str(&e.to_string())
                    );
                    return value;
                }
            },
            None => {
                warn!(step = %step.name, "no object store configured, recording placeholder URL");
                format!("https://storage.invalid/{bucket}/{key}")
            }
        };
        serde_json::json!({ "file_path": path, "object_url": url })
    }

    fn failed_result(
        &self,
        step: &StepConfig,
        phase_index: usize,
        start: Instant,
        retry_count: u32,
        error: &FlowError,
    ) -> StepResult {
        let message = self.masker.mask_str(&error.to_string());
        self.logger
            .error(format!("step '{}' failed: {message}", step.name));
        StepResult {
            name: step.name.clone(),
            success: false,
            response_data: None,
            error: Some(message),
            execution_time: start.elapsed(),
            retry_count,
            execution_order: phase_index,
        }
    }

    /// Record a step result, extend the context on success, and abort the
    /// workflow on a fatal failure.
    fn record_result(
        &self,
        step: &StepConfig,
        result: StepResult,
        context: &mut Map<String, Value>,
        step_results: &mut HashMap<String, StepResult>,
    ) -> Result<()> {
        let fatal = !result.success && !step.continue_on_error;
        let error = result.error.clone();

        if result.success {
            if let Some(data) = &result.response_data {
                context.insert(step.context_key().to_string(), data.clone());
            }
        } else if step.continue_on_error {
            warn!(step = %step.name, "step failed but continue_on_error is set, continuing");
        }
        step_results.insert(result.name.clone(), result);

        if fatal {
            return Err(FlowError::Execution(format!(
                "Step '{}' failed: {}",
                step.name,
                error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(())
    }
}
