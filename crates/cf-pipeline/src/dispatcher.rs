//! Single-step dispatch with budget gating, timeouts, and bounded retries.
//!
//! The dispatcher never returns an error: every outcome, including budget
//! rejections and exhausted retries, becomes a [`StepResult`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use cf_core::{
    Artifact, ArtifactData, FailureClass, ParamsExt, StepEntry, StepFailure, StepPosition,
    StepResult, StepSpec, StepType,
};
use cf_core::step::PARAM_INDEX;

use crate::adapter::{AdapterOutput, AdapterRequest, StepAdapter};
use crate::estimate::step_cost;
use crate::registry::AdapterRegistry;
use crate::workspace::ChainWorkspace;

/// Tolerance for floating point budget comparisons.
pub(crate) const BUDGET_EPSILON: f64 = 1e-9;

/// Retry and timeout policy applied to every adapter call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-call timeout when a step has no `timeout_secs` param.
    pub default_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            default_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retry number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Invokes one adapter per step, applying the [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct StepDispatcher {
    registry: Arc<AdapterRegistry>,
    workspace: Arc<ChainWorkspace>,
    policy: RetryPolicy,
}

impl StepDispatcher {
    pub fn new(registry: Arc<AdapterRegistry>, workspace: Arc<ChainWorkspace>) -> Self {
        Self {
            registry,
            workspace,
            policy: RetryPolicy::default(),
        }
    }

    /// Builder: override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn workspace(&self) -> &ChainWorkspace {
        &self.workspace
    }

    /// Estimated cost of one call of `spec`.
    pub fn estimate(&self, spec: &StepSpec) -> f64 {
        step_cost(&self.registry, spec)
    }

    /// Execute one step against `input`.
    ///
    /// The estimate is checked against `budget_remaining` before any adapter
    /// call. Transient failures and timeouts are retried up to
    /// `max_retries` times; everything else fails on the first attempt.
    pub async fn execute(
        &self,
        position: StepPosition,
        spec: &StepSpec,
        input: Option<&Artifact>,
        budget_remaining: Option<f64>,
        cancel: &CancellationToken,
    ) -> StepResult {
        let entry = StepEntry::Step(spec.clone());
        if !spec.enabled {
            tracing::info!(step = %position, step_type = %spec.step_type, "Skipping disabled step");
            return StepResult::skipped(position, entry);
        }
        if spec.step_type == StepType::Select {
            return select(position, spec, input);
        }

        let started = Instant::now();
        let adapter = match self.registry.resolve(spec.step_type, &spec.model) {
            Ok(adapter) => adapter,
            Err(e) => {
                return StepResult::failed(
                    position,
                    entry,
                    StepFailure::new(FailureClass::Validation, e.to_string()),
                );
            }
        };

        let estimate = adapter.estimate_cost(spec.step_type, &spec.params).max(0.0);
        if let Some(remaining) = budget_remaining {
            if estimate > remaining + BUDGET_EPSILON {
                tracing::warn!(
                    step = %position,
                    estimate,
                    remaining,
                    "Step estimate exceeds remaining budget; not dispatching"
                );
                return StepResult::failed(
                    position,
                    entry,
                    StepFailure::budget_exceeded(estimate, remaining),
                );
            }
        }

        let scratch_dir = match self.workspace.scratch_dir(position) {
            Ok(dir) => dir,
            Err(e) => {
                return StepResult::failed(
                    position,
                    entry,
                    StepFailure::new(FailureClass::Provider, format!("scratch dir: {e}")),
                );
            }
        };

        let timeout = spec.timeout().unwrap_or(self.policy.default_timeout);
        let request = AdapterRequest {
            step_type: spec.step_type,
            model: spec.model.clone(),
            input: input.cloned(),
            params: spec.params.clone(),
            scratch_dir,
            label: format!("{position} {}", spec.label()),
        };

        let max_attempts = self.policy.max_retries + 1;
        let mut attempt = 0;
        let failure = loop {
            if cancel.is_cancelled() {
                break StepFailure::cancelled("chain cancelled before the call was made");
            }
            attempt += 1;

            tracing::info!(
                step = %position,
                step_type = %spec.step_type,
                model = %spec.model,
                attempt,
                "Dispatching step"
            );

            match call_adapter(Arc::clone(&adapter), request.clone(), timeout).await {
                Ok(output) => {
                    let cost = output.cost.unwrap_or(estimate).max(0.0);
                    let duration = started.elapsed().as_secs_f64();
                    tracing::info!(
                        step = %position,
                        step_type = %spec.step_type,
                        attempt,
                        cost,
                        duration_secs = duration,
                        "Step succeeded"
                    );
                    let artifact = into_step_artifact(output, spec, cost);
                    return StepResult::success(position, entry, artifact)
                        .with_accounting(duration, cost, attempt);
                }
                Err(failure) if failure.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        step = %position,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable failure: {failure}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            break StepFailure::cancelled("chain cancelled during retry backoff");
                        }
                    }
                }
                Err(failure) => break failure,
            }
        };

        tracing::warn!(
            step = %position,
            step_type = %spec.step_type,
            attempts = attempt,
            "Step failed: {failure}"
        );
        StepResult::failed(position, entry, failure).with_accounting(
            started.elapsed().as_secs_f64(),
            0.0,
            attempt,
        )
    }
}

/// Run one blocking adapter call on the blocking pool under `timeout`.
///
/// A timed-out call keeps running on its thread; its result is discarded.
async fn call_adapter(
    adapter: Arc<dyn StepAdapter>,
    request: AdapterRequest,
    timeout: Duration,
) -> Result<AdapterOutput, StepFailure> {
    let handle = tokio::task::spawn_blocking(move || adapter.execute(&request));
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(e))) => Err(StepFailure::from(e)),
        Ok(Err(join_err)) => Err(StepFailure::new(
            FailureClass::Provider,
            format!("adapter panicked: {join_err}"),
        )),
        Err(_) => Err(StepFailure::timeout(timeout.as_secs_f64())),
    }
}

fn into_step_artifact(output: AdapterOutput, spec: &StepSpec, cost: f64) -> Artifact {
    // Every non-select type declares its output kind.
    let kind = spec
        .step_type
        .produces()
        .unwrap_or(cf_core::ArtifactKind::StructuredData);
    output
        .into_artifact(kind)
        .with_meta("step_type", spec.step_type.as_str())
        .with_meta("model", spec.model.as_str())
        .with_meta("cost", cost)
}

/// Built-in `select`: pick one member output out of a collection.
fn select(position: StepPosition, spec: &StepSpec, input: Option<&Artifact>) -> StepResult {
    let entry = StepEntry::Step(spec.clone());
    let started = Instant::now();
    let items = match input.map(|a| &a.data) {
        Some(ArtifactData::Collection(items)) => items,
        _ => {
            return StepResult::failed(
                position,
                entry,
                StepFailure::new(
                    FailureClass::Validation,
                    "select needs the collection produced by a collect_all group",
                ),
            )
            .with_accounting(0.0, 0.0, 1);
        }
    };

    let picked = match spec.params.u64_param(PARAM_INDEX) {
        Some(index) => match items.get(index as usize) {
            Some(Some(artifact)) => Ok((index as usize, artifact.clone())),
            Some(None) => Err(format!("group member {index} did not succeed")),
            None => Err(format!(
                "index {index} is out of range for {} members",
                items.len()
            )),
        },
        None => items
            .iter()
            .enumerate()
            .find_map(|(i, a)| a.clone().map(|a| (i, a)))
            .ok_or_else(|| "no group member succeeded".to_string()),
    };

    let elapsed = started.elapsed().as_secs_f64();
    match picked {
        Ok((index, artifact)) => {
            tracing::info!(step = %position, member = index, "Selected group member output");
            StepResult::success(position, entry, artifact.with_meta("selected_member", index))
                .with_accounting(elapsed, 0.0, 1)
        }
        Err(message) => StepResult::failed(
            position,
            entry,
            StepFailure::new(FailureClass::Validation, message),
        )
        .with_accounting(elapsed, 0.0, 1),
    }
}
