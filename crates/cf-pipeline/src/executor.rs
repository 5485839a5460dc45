//! Chain executor: walks the steps of a [`ChainConfig`] in order, threading the
//! current artifact through simple steps and parallel groups, with budget
//! tracking, intermediate persistence, cancellation, and progress reporting.

use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;

use cf_core::{
    Artifact, ArtifactData, ChainConfig, ChainResult, ChainStatus, FailureClass, MergeStrategy,
    Result, RunId, StepEntry, StepPosition, StepResult, StepStatus,
};

use crate::context::{ExecutionContext, StepProgress};
use crate::dispatcher::{StepDispatcher, BUDGET_EPSILON};
use crate::group::ParallelGroupExecutor;
use crate::workspace::ChainWorkspace;

/// Runs one chain top to bottom.
///
/// State machine: `NotStarted -> Running -> (Completed | Aborted)`. Step N+1
/// never starts before step N's result is recorded.
#[derive(Debug, Clone)]
pub struct ChainExecutor {
    dispatcher: StepDispatcher,
    groups: ParallelGroupExecutor,
}

impl ChainExecutor {
    pub fn new(dispatcher: StepDispatcher) -> Self {
        let groups = ParallelGroupExecutor::new(dispatcher.clone());
        Self { dispatcher, groups }
    }

    /// Execute `config`, returning the terminal [`ChainResult`].
    ///
    /// In-chain failures never surface as errors: a failed step aborts the
    /// chain unless it carries `continue_on_error`, and budget or cancellation
    /// failures always abort.
    pub async fn execute(
        &self,
        config: &ChainConfig,
        ctx: &ExecutionContext,
        run_id: RunId,
    ) -> ChainResult {
        let mut result = ChainResult::new(run_id, &config.name);
        let started = Instant::now();
        result.status = ChainStatus::Running;
        tracing::info!(
            run_id = %run_id,
            chain = %config.name,
            steps = config.steps.len(),
            "Chain running"
        );

        let mut current: Option<Artifact> = config.initial_input.clone();
        let mut remaining = config.budget;
        let total = config.steps.len();

        for (index, entry) in config.steps.iter().enumerate() {
            if ctx.cancellation.is_cancelled() {
                tracing::info!(step = index, "Chain cancelled");
                abort(&mut result, "cancelled");
                break;
            }

            let mut step = match entry {
                StepEntry::Step(spec) => {
                    self.dispatcher
                        .execute(
                            StepPosition::top(index),
                            spec,
                            current.as_ref(),
                            remaining,
                            &ctx.cancellation,
                        )
                        .await
                }
                StepEntry::Group(group) => {
                    self.groups
                        .execute(index, group, current.as_ref(), remaining, &ctx.cancellation)
                        .await
                }
            };

            result.total_cost += step.cost;
            if let Some(budget) = remaining.as_mut() {
                *budget -= step.cost;
            }

            match step.status {
                StepStatus::Success => {
                    if config.save_intermediates {
                        match persist_step(&ctx.workspace, entry, &step) {
                            Ok(paths) => step.saved_paths = paths,
                            Err(e) => {
                                tracing::warn!(step = index, "Failed to persist intermediate: {e}");
                                result
                                    .warnings
                                    .push(format!("step {index}: intermediate not saved: {e}"));
                            }
                        }
                    }
                    current = step.output.clone();
                }
                StepStatus::Failed | StepStatus::Cancelled => {
                    let class = step.error.as_ref().map(|e| e.class);
                    let message = step
                        .error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| step.status.to_string());
                    let fatal = matches!(
                        class,
                        Some(FailureClass::BudgetExceeded) | Some(FailureClass::Cancelled)
                    ) || ctx.cancellation.is_cancelled();

                    if !fatal && entry.continue_on_error() {
                        tracing::warn!(
                            step = index,
                            "Step failed, continuing with previous artifact: {message}"
                        );
                        result
                            .warnings
                            .push(format!("step {index} failed and was skipped over: {message}"));
                    } else {
                        let reason = if ctx.cancellation.is_cancelled() {
                            "cancelled".to_string()
                        } else {
                            format!("step {index} ({}) failed: {message}", entry.type_tag())
                        };
                        abort(&mut result, reason);
                    }
                }
                StepStatus::Skipped => {}
            }

            // Actual spend can exceed the pre-dispatch estimate.
            if let (false, Some(budget), Some(left)) = (result.aborted, config.budget, remaining) {
                if left < -BUDGET_EPSILON {
                    let reason = format!(
                        "budget exceeded: spent ${:.4} of ${budget:.4} after step {index}",
                        result.total_cost
                    );
                    abort(&mut result, reason);
                }
            }

            let progress = StepProgress {
                completed: index + 1,
                total,
                label: format!("{index} {}", entry.label()),
                status: step.status,
                cost: step.cost,
            };
            ctx.progress.send(&progress);
            tracing::info!(
                "[{:.0}%] {} {} (cost ${:.4})",
                progress.percent(),
                progress.label,
                step.status,
                step.cost
            );

            result.steps.push(step);
            if result.aborted {
                break;
            }
        }

        if !result.aborted {
            result.status = ChainStatus::Completed;
        }
        if let Some(last) = result.steps.iter().rposition(|s| s.is_success()) {
            let step = &mut result.steps[last];
            result.final_output = match keep_final_output(&ctx.workspace, step) {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(step = last, "Failed to keep final output: {e}");
                    result
                        .warnings
                        .push(format!("final output not saved to the output dir: {e}"));
                    step.output.clone()
                }
            };
        }
        result.total_duration_secs = started.elapsed().as_secs_f64();
        result.finished_at = Some(Utc::now());

        tracing::info!(
            run_id = %run_id,
            status = %result.status,
            cost = result.total_cost,
            duration_secs = result.total_duration_secs,
            "Chain finished"
        );
        result
    }
}

fn abort(result: &mut ChainResult, reason: impl Into<String>) {
    let reason = reason.into();
    tracing::warn!("Chain aborted: {reason}");
    result.status = ChainStatus::Aborted;
    result.aborted = true;
    result.abort_reason = Some(reason);
}

/// Copy a final output that lives in the temp dir into the output dir, so
/// temp cleanup cannot take it, and return it pointing at the copies.
/// Reuses the intermediates when they were already saved.
fn keep_final_output(workspace: &ChainWorkspace, step: &mut StepResult) -> Result<Option<Artifact>> {
    let Some(output) = step.output.clone() else {
        return Ok(None);
    };
    if !workspace.holds(&output) {
        return Ok(Some(output));
    }
    if step.saved_paths.is_empty() {
        step.saved_paths = persist_step(workspace, &step.spec, step)?;
    }
    tracing::debug!(step = %step.position, saved = step.saved_paths.len(), "Kept final output");
    Ok(Some(relocate(output, &step.saved_paths)))
}

/// Point file-backed parts of `artifact` at `saved`, which lists one path per
/// present item in the order [`persist_step`] writes them.
fn relocate(artifact: Artifact, saved: &[PathBuf]) -> Artifact {
    let Artifact {
        kind,
        data,
        metadata,
    } = artifact;
    let data = match data {
        ArtifactData::Collection(items) => {
            let mut saved = saved.iter();
            let items = items
                .into_iter()
                .map(|item| {
                    let item = item?;
                    Some(match saved.next() {
                        Some(path) => relocate(item, std::slice::from_ref(path)),
                        None => item,
                    })
                })
                .collect();
            ArtifactData::Collection(items)
        }
        ArtifactData::Path(original) => {
            ArtifactData::Path(saved.first().cloned().unwrap_or(original))
        }
        other => other,
    };
    Artifact {
        kind,
        data,
        metadata,
    }
}

/// Save a successful step's output. A collect_all group saves every
/// successful member under its member position; anything else saves its
/// single output under the step index.
fn persist_step(
    workspace: &ChainWorkspace,
    entry: &StepEntry,
    step: &StepResult,
) -> Result<Vec<PathBuf>> {
    let mut saved = Vec::new();
    match entry {
        StepEntry::Group(group) if group.merge_strategy == MergeStrategy::CollectAll => {
            for member in step.members.iter().filter(|m| m.is_success()) {
                let (StepEntry::Step(spec), Some(output)) = (&member.spec, &member.output) else {
                    continue;
                };
                let name = spec.output_filename.clone().unwrap_or_else(|| {
                    ChainWorkspace::intermediate_name(
                        member.position,
                        spec.step_type.as_str(),
                        output,
                    )
                });
                saved.push(workspace.persist(output, &name)?);
            }
        }
        _ => {
            let Some(output) = &step.output else {
                return Ok(saved);
            };
            // A group's single output is named after the winning member's type.
            let type_tag = match entry {
                StepEntry::Step(spec) => spec.step_type.as_str(),
                StepEntry::Group(_) => output
                    .meta("step_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_else(|| entry.type_tag()),
            };
            let name = entry
                .output_filename()
                .map(str::to_string)
                .unwrap_or_else(|| {
                    ChainWorkspace::intermediate_name(step.position, type_tag, output)
                });
            saved.push(workspace.persist(output, &name)?);
        }
    }
    Ok(saved)
}
