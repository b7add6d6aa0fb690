/// Execution Orchestrator
///
/// Runs one fired flow: trigger node first (index -1), then every step strictly in array
/// order. Each node's step log is persisted before the next node starts because later
/// steps read earlier results from the shared accumulator. The first reported failure
/// ends the run; the run log is finalized exactly once, `completed` or `failed`.

use crate::error::{EngineError, EngineResult};
use crate::flow::{Flow, FlowStatus, FlowStorage, NodeSpec, TriggerKind};
use crate::runtime::logs::{summarize_result, ExecutionLogStorage, RunError, RunStatus, TRIGGER_INDEX};
use crate::runtime::registry::{failure_message, is_failure, NodeRegistry, PriorResults, RunContext};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use uuid::Uuid;

/// Body the Job Scheduler posts to the execution endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub flow_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub trigger_input: Value,
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub execution_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub results: PriorResults,
}

enum NodeOutcome {
    /// Carries the step key of the completed log
    Succeeded(String),
    Failed(RunError),
}

#[derive(Debug)]
pub struct ExecutionOrchestrator {
    flows: FlowStorage,
    logs: ExecutionLogStorage,
    registry: Arc<NodeRegistry>,
}

impl ExecutionOrchestrator {
    pub fn new(flows: FlowStorage, logs: ExecutionLogStorage, registry: Arc<NodeRegistry>) -> Self {
        Self { flows, logs, registry }
    }

    /// Execute a fired flow end to end.
    ///
    /// Returns `StepFailed` when a node reports failure so the hosting runtime can engage
    /// its retry path; the run log is already `failed` by then.
    pub async fn execute(&self, request: ExecutionRequest) -> EngineResult<RunReport> {
        let execution_id = self.resolve_execution_id(request.execution_id.as_deref()).await?;
        let started_at = Utc::now();
        let clock = Instant::now();

        tracing::info!("🚀 Starting flow execution: {} (run {})", request.flow_id, execution_id);

        let flow = match self.load_runnable_flow(&request).await {
            Ok(flow) => flow,
            Err(e) => {
                self.record_unrunnable(&execution_id, &request, &e).await;
                return Err(e);
            }
        };

        self.logs
            .create_run(&execution_id, &flow.id, &request.user_id, flow.steps.len(), started_at)
            .await?;

        let ctx = RunContext {
            flow_id: flow.id.clone(),
            user_id: request.user_id.clone(),
            execution_id: execution_id.clone(),
            trigger_input: request.trigger_input.clone(),
            started_at,
        };
        let mut results = PriorResults::new();

        let outcome = self.run_nodes(&flow, &ctx, &mut results).await;
        let duration_ms = clock.elapsed().as_millis() as i64;

        // One-shot time triggers self-disarm whatever the outcome
        if flow.trigger_kind() == Some(TriggerKind::AbsoluteTime) {
            match self.flows.set_activation(&flow.id, FlowStatus::Draft, None).await {
                Ok(()) => tracing::info!("🔕 One-shot trigger disarmed for flow: {}", flow.id),
                Err(e) => tracing::error!("❌ Failed to disarm flow {}: {:#}", flow.id, e),
            }
        }

        match outcome {
            Ok(steps_completed) => {
                self.logs
                    .finalize_run(&execution_id, RunStatus::Completed, Utc::now(), duration_ms, None)
                    .await?;
                tracing::info!(
                    "🎉 Flow '{}' run {} completed: {} steps in {}ms",
                    flow.id,
                    execution_id,
                    steps_completed,
                    duration_ms
                );
                Ok(RunReport {
                    execution_id,
                    flow_id: flow.id,
                    status: RunStatus::Completed,
                    steps_total: flow.steps.len(),
                    steps_completed,
                    results,
                })
            }
            Err(failure) => {
                if let Err(e) = self
                    .logs
                    .finalize_run(&execution_id, RunStatus::Failed, Utc::now(), duration_ms, Some(&failure))
                    .await
                {
                    tracing::error!("❌ Failed to finalize run {}: {:#}", execution_id, e);
                }
                tracing::error!(
                    "❌ Flow '{}' run {} failed after {}ms: {}",
                    flow.id,
                    execution_id,
                    duration_ms,
                    failure.message
                );
                Err(EngineError::StepFailed {
                    execution_id,
                    node_id: failure.node_id.unwrap_or_default(),
                    name: failure.name.unwrap_or_default(),
                    message: failure.message,
                })
            }
        }
    }

    /// Each attempt gets its own run log, so a reused id gets a fresh suffix
    async fn resolve_execution_id(&self, requested: Option<&str>) -> EngineResult<String> {
        let Some(id) = requested.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok(Uuid::new_v4().to_string());
        };
        if self.logs.run_exists(id).await? {
            let suffix = Uuid::new_v4().simple().to_string();
            let retry_id = format!("{}-retry-{}", id, &suffix[..8]);
            tracing::info!("🔁 Execution id {} already used, recording attempt as {}", id, retry_id);
            return Ok(retry_id);
        }
        Ok(id.to_string())
    }

    async fn load_runnable_flow(&self, request: &ExecutionRequest) -> EngineResult<Flow> {
        let flow = self
            .flows
            .get_flow(&request.flow_id)
            .await
            .map_err(|e| EngineError::FailedPrecondition(format!("{:#}", e)))?
            .ok_or_else(|| EngineError::NotFound(format!("Flow not found: {}", request.flow_id)))?;

        if flow.creator_id != request.user_id {
            return Err(EngineError::PermissionDenied(format!(
                "User {} may not run flow {}",
                request.user_id, flow.id
            )));
        }
        if flow.steps.is_empty() {
            return Err(EngineError::FailedPrecondition(format!("Flow {} has no steps", flow.id)));
        }
        Ok(flow)
    }

    /// A run that could not start still leaves a failed run log behind
    async fn record_unrunnable(&self, execution_id: &str, request: &ExecutionRequest, error: &EngineError) {
        tracing::warn!("⚠️ Flow {} cannot run: {}", request.flow_id, error);
        let now = Utc::now();
        let failure = RunError {
            message: error.to_string(),
            node_id: None,
            name: None,
            index: None,
        };
        let recorded = async {
            self.logs
                .create_run(execution_id, &request.flow_id, &request.user_id, 0, now)
                .await?;
            self.logs
                .finalize_run(execution_id, RunStatus::Failed, now, 0, Some(&failure))
                .await
        }
        .await;
        if let Err(e) = recorded {
            tracing::error!("❌ Failed to record unrunnable run {}: {:#}", execution_id, e);
        }
    }

    /// Trigger then steps. `Ok(n)` = all succeeded with `n` steps completed.
    async fn run_nodes(
        &self,
        flow: &Flow,
        ctx: &RunContext,
        results: &mut PriorResults,
    ) -> Result<usize, RunError> {
        if let Some(trigger) = &flow.trigger {
            match self.run_node(TRIGGER_INDEX, trigger, ctx, results).await {
                NodeOutcome::Succeeded(_) => {}
                NodeOutcome::Failed(failure) => return Err(failure),
            }
        }

        let mut completed = 0;
        for (index, step) in flow.steps.iter().enumerate() {
            tracing::info!(
                "📍 Step {}/{}: executing '{}' in run {}",
                index + 1,
                flow.steps.len(),
                step.node_id,
                ctx.execution_id
            );

            match self.run_node(index as i64, step, ctx, results).await {
                NodeOutcome::Succeeded(key) => {
                    completed += 1;
                    if let Err(e) = self.logs.set_steps_completed(&ctx.execution_id, completed).await {
                        let failure = storage_failure(index as i64, step, e);
                        self.mark_step_failed(&ctx.execution_id, &key, &failure.message).await;
                        return Err(failure);
                    }
                }
                NodeOutcome::Failed(failure) => return Err(failure),
            }
        }
        Ok(completed)
    }

    /// Best effort: a run that fails on bookkeeping must not leave its step looking healthy
    async fn mark_step_failed(&self, execution_id: &str, key: &str, message: &str) {
        if let Err(e) = self.logs.fail_step(execution_id, key, message).await {
            tracing::error!("❌ Failed to mark step '{}' of run {} as failed: {:#}", key, execution_id, e);
        }
    }

    /// Execute one node with its step log bracketing the call
    async fn run_node(&self, index: i64, spec: &NodeSpec, ctx: &RunContext, results: &mut PriorResults) -> NodeOutcome {
        let executor = self.registry.get(&spec.node_id);
        let name = spec
            .prop_str("name")
            .map(str::to_string)
            .or_else(|| executor.as_ref().map(|e| e.name().to_string()))
            .unwrap_or_else(|| spec.node_id.clone());

        let started_at = Utc::now();
        let clock = Instant::now();
        let key = match self
            .logs
            .start_step(&ctx.execution_id, index, &spec.node_id, &name, started_at)
            .await
        {
            Ok(key) => key,
            Err(e) => return NodeOutcome::Failed(storage_failure(index, spec, e)),
        };

        let result = match executor {
            Some(executor) => executor.run(ctx, &spec.props, results).await,
            None => Err(anyhow::anyhow!("Unknown node type: {}", spec.node_id)),
        };
        let duration_ms = clock.elapsed().as_millis() as i64;

        let (status, summary, error) = match &result {
            Ok(value) if is_failure(value) => (RunStatus::Failed, Some(summarize_result(value)), Some(failure_message(value))),
            Ok(value) => (RunStatus::Completed, Some(summarize_result(value)), None),
            Err(e) => (RunStatus::Failed, None, Some(format!("{:#}", e))),
        };

        if let Err(e) = self
            .logs
            .finish_step(&ctx.execution_id, &key, status, Utc::now(), duration_ms, summary.as_ref(), error.as_deref())
            .await
        {
            let failure = storage_failure(index, spec, e);
            self.mark_step_failed(&ctx.execution_id, &key, &failure.message).await;
            return NodeOutcome::Failed(failure);
        }

        match (status, result) {
            (RunStatus::Completed, Ok(value)) => {
                tracing::info!("✅ Node '{}' completed in {}ms", key, duration_ms);
                results.insert(key.clone(), value);
                NodeOutcome::Succeeded(key)
            }
            _ => {
                let message = error.unwrap_or_else(|| "Node reported failure".to_string());
                tracing::warn!("⏸️ Node '{}' failed, stopping run {}: {}", key, ctx.execution_id, message);
                NodeOutcome::Failed(RunError {
                    message,
                    node_id: Some(spec.node_id.clone()),
                    name: Some(name),
                    index: Some(index),
                })
            }
        }
    }
}

fn storage_failure(index: i64, spec: &NodeSpec, e: anyhow::Error) -> RunError {
    RunError {
        message: format!("Failed to persist step log: {:#}", e),
        node_id: Some(spec.node_id.clone()),
        name: Some(spec.display_name()),
        index: Some(index),
    }
}
