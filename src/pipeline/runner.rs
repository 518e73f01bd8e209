//! The scheduler loop: runs components in stable topological order,
//! feeding each its predecessors' outputs and checkpointing every result.
//!
//! Failure semantics: executor errors are absorbed into error outcomes and
//! the run continues; checkpoint failures propagate and fail the session.
//! Pause is observed between components only; cancellation is observed
//! between components and at every outbound call inside an executor.

use crate::analysis::context::JobRequest;
use crate::checkpoint::{ArtifactStatus, CheckpointStore};
use crate::errors::{DispatchError, ErrorKind, StorageError};
use crate::pipeline::component::{
    ComponentInput, ComponentOutcome, ComponentRegistry, ComponentStatus,
};
use crate::pipeline::normalize;
use crate::session::progress::ProgressPublisher;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a run stopped before reaching the last component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Paused,
    Cancelled,
}

/// Everything one run needs: identity, job, control flags and the channel
/// progress events go out on.
pub struct RunContext {
    pub session_id: String,
    pub job: JobRequest,
    /// Reuse checkpointed results for components that already succeeded
    pub resume: bool,
    /// Results carried over from a paused run in the same process
    pub seed: BTreeMap<String, ComponentOutcome>,
    pub pause: Arc<AtomicBool>,
    pub cancel: CancellationToken,
    pub progress: ProgressPublisher,
}

/// Result of one scheduler pass over the pipeline.
#[derive(Debug)]
pub struct RunOutcome {
    pub outcomes: BTreeMap<String, ComponentOutcome>,
    pub halted: Option<Halt>,
}

impl RunOutcome {
    /// Names of required components that did not produce a usable result.
    pub fn failed_required(&self, registry: &ComponentRegistry) -> Vec<String> {
        registry
            .names()
            .into_iter()
            .filter(|name| {
                registry.get(name).is_some_and(|c| c.required)
                    && !self.outcomes.get(name).is_some_and(|o| o.is_ok())
            })
            .collect()
    }
}

/// Drives one session through the registered pipeline.
pub struct PipelineRunner {
    components: Arc<ComponentRegistry>,
    store: Arc<CheckpointStore>,
    component_deadline: Duration,
}

impl PipelineRunner {
    pub fn new(
        components: Arc<ComponentRegistry>,
        store: Arc<CheckpointStore>,
        component_deadline: Duration,
    ) -> Self {
        Self {
            components,
            store,
            component_deadline,
        }
    }

    /// Execute the pipeline for one session. Returns the per-component
    /// outcome map, or the storage error that forced the session down.
    pub async fn run(&self, ctx: &RunContext) -> Result<RunOutcome, StorageError> {
        let order = self.components.execution_order();
        let total = order.len();
        let mut outcomes = ctx.seed.clone();
        // Components that actually executed during this pass. A checkpointed
        // result is only reusable while none of its dependencies re-ran.
        let mut refreshed: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut halted = None;

        for (index, name) in order.iter().enumerate() {
            let step = index + 1;

            if ctx.cancel.is_cancelled() {
                tracing::info!(session = %ctx.session_id, "cancellation observed between components");
                halted = Some(Halt::Cancelled);
                break;
            }
            if ctx.pause.load(Ordering::SeqCst) {
                tracing::info!(session = %ctx.session_id, next = %name, "pause observed between components");
                halted = Some(Halt::Paused);
                break;
            }

            // Results carried over from a paused run need no re-execution
            // and no duplicate artifact.
            if let Some(existing) = outcomes.get(name)
                && existing.is_ok()
            {
                ctx.progress.publish(step, total, name, existing.status, "carried over");
                continue;
            }

            let Some(definition) = self.components.get(name) else {
                continue;
            };
            let upstream_changed = definition.dependencies.iter().any(|d| refreshed.contains(d));

            // On resume, a checkpointed success short-circuits the executor,
            // unless something upstream produced a fresh result this pass.
            if ctx.resume
                && !upstream_changed
                && let Ok(artifact) = self.store.load_artifact(&ctx.session_id, name)
                && artifact.status != ArtifactStatus::Error
            {
                tracing::info!(session = %ctx.session_id, component = %name, "reloaded from checkpoint");
                outcomes.insert(name.clone(), ComponentOutcome::skipped(artifact.payload));
                ctx.progress.publish(
                    step,
                    total,
                    name,
                    ComponentStatus::SkippedFromCheckpoint,
                    "reloaded from checkpoint",
                );
                continue;
            }

            let input = ComponentInput {
                session_id: ctx.session_id.clone(),
                job: ctx.job.clone(),
                previous_results: definition
                    .dependencies
                    .iter()
                    .filter_map(|dep| outcomes.get(dep).map(|o| (dep.clone(), o.value.clone())))
                    .collect(),
            };

            tracing::info!(session = %ctx.session_id, component = %name, step, total, "executing component");
            let outcome = self.execute_one(&definition.name, &definition, &input, ctx).await;

            if matches!(outcome.kind, Some(ErrorKind::Cancelled)) {
                // The executor saw the token trip mid-call.
                halted = Some(Halt::Cancelled);
                outcomes.insert(name.clone(), outcome);
                break;
            }

            self.append_outcome(&ctx.session_id, &definition, &outcome)?;
            ctx.progress.publish(step, total, name, outcome.status, describe(&outcome));
            refreshed.insert(name.clone());
            outcomes.insert(name.clone(), outcome);
        }

        Ok(RunOutcome { outcomes, halted })
    }

    async fn execute_one(
        &self,
        name: &str,
        definition: &crate::pipeline::component::ComponentDefinition,
        input: &ComponentInput,
        ctx: &RunContext,
    ) -> ComponentOutcome {
        let executed = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return ComponentOutcome::error(name, ErrorKind::Cancelled, "session cancelled");
            }
            result = tokio::time::timeout(
                self.component_deadline,
                definition.executor.execute(input, &ctx.cancel),
            ) => result,
        };

        match executed {
            Ok(Ok(raw)) => {
                let normalized = normalize::normalize(name, raw);
                if (definition.validator)(&normalized) {
                    ComponentOutcome::ok(normalized)
                } else {
                    tracing::warn!(component = %name, "result failed validation");
                    ComponentOutcome::error(name, ErrorKind::ValidationFailed, "validation_failed")
                }
            }
            Ok(Err(err)) => {
                let kind = classify_executor_error(&err);
                if kind == ErrorKind::Cancelled && !ctx.cancel.is_cancelled() {
                    // A provider reported "cancelled" without the session
                    // being cancelled; treat it as an upstream failure.
                    return ComponentOutcome::error(name, ErrorKind::ServerError, &err.to_string());
                }
                tracing::warn!(component = %name, %kind, error = %err, "component failed");
                ComponentOutcome::error(name, kind, &err.to_string())
            }
            Err(_) => {
                tracing::warn!(component = %name, "component deadline elapsed");
                ComponentOutcome::error(name, ErrorKind::Timeout, "component deadline elapsed")
            }
        }
    }

    fn append_outcome(
        &self,
        session_id: &str,
        definition: &crate::pipeline::component::ComponentDefinition,
        outcome: &ComponentOutcome,
    ) -> Result<(), StorageError> {
        let status = match outcome.status {
            ComponentStatus::Error => ArtifactStatus::Error,
            _ if outcome.value.get("fallback_used").and_then(Value::as_bool) == Some(true) => {
                ArtifactStatus::FallbackUsed
            }
            _ => ArtifactStatus::Ok,
        };
        self.store.append(
            session_id,
            &definition.name,
            &definition.category,
            status,
            outcome.value.clone(),
        )?;
        Ok(())
    }
}

fn describe(outcome: &ComponentOutcome) -> &'static str {
    match outcome.status {
        ComponentStatus::Ok => "completed",
        ComponentStatus::Error => "failed",
        ComponentStatus::SkippedFromCheckpoint => "reloaded from checkpoint",
    }
}

fn classify_executor_error(err: &anyhow::Error) -> ErrorKind {
    if let Some(dispatch) = err.downcast_ref::<DispatchError>() {
        return dispatch.kind();
    }
    if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return ErrorKind::Timeout;
    }
    ErrorKind::ServerError
}
