//! PipelineManager: the entry point that turns a definition file into a
//! persisted [`ChainResult`].
//!
//! Order of operations for one run: load, apply overrides, validate
//! compatibility, estimate cost, gate on budget, confirm, execute, write the
//! report. Everything before execution fails fast with an [`Error`]; once
//! execution begins the outcome is always a [`ChainResult`] with a report on
//! disk.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cf_core::{Artifact, ChainConfig, ChainResult, CostEstimate, Error, Result, RunId};

use crate::context::{ExecutionContext, ProgressSender};
use crate::dispatcher::{RetryPolicy, StepDispatcher, BUDGET_EPSILON};
use crate::estimate::estimate_chain;
use crate::executor::ChainExecutor;
use crate::loader::ConfigLoader;
use crate::registry::{AdapterRegistry, ModelInfo};
use crate::report::write_report;
use crate::validator::CompatibilityValidator;
use crate::workspace::ChainWorkspace;

/// Callback deciding whether a run may proceed at the given estimate and budget.
pub type ConfirmHook = Arc<dyn Fn(&CostEstimate, Option<f64>) -> bool + Send + Sync>;

/// Per-invocation overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replaces the definition's `initial_input` with a text prompt.
    pub input_text: Option<String>,
    /// Skip the confirmation hook.
    pub no_confirm: bool,
    /// Replaces the definition's `budget`.
    pub budget_override: Option<f64>,
}

impl RunOptions {
    pub fn no_confirm() -> Self {
        Self {
            no_confirm: true,
            ..Self::default()
        }
    }

    pub fn with_input_text(mut self, text: impl Into<String>) -> Self {
        self.input_text = Some(text.into());
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget_override = Some(budget);
        self
    }
}

/// A loaded, validated and priced chain, ready to execute.
#[derive(Debug, Clone)]
pub struct PreparedChain {
    pub config: ChainConfig,
    pub estimate: CostEstimate,
    pub warnings: Vec<String>,
}

/// Coordinates loading, validation, estimation, execution and reporting.
#[derive(Clone)]
pub struct PipelineManager {
    registry: Arc<AdapterRegistry>,
    policy: RetryPolicy,
    confirm: Option<ConfirmHook>,
    cancellation: CancellationToken,
    progress: Arc<ProgressSender>,
}

impl fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineManager")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("confirm", &self.confirm.is_some())
            .finish_non_exhaustive()
    }
}

impl PipelineManager {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            registry,
            policy: RetryPolicy::default(),
            confirm: None,
            cancellation: CancellationToken::new(),
            progress: Arc::new(ProgressSender::noop()),
        }
    }

    /// Builder: override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder: ask `hook` before executing unless the run opts out.
    pub fn with_confirmation(
        mut self,
        hook: impl Fn(&CostEstimate, Option<f64>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.confirm = Some(Arc::new(hook));
        self
    }

    /// Builder: share a cancellation token with the caller.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Builder: report step progress to `progress`.
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Every registered `(step_type, model)` pair. Never invokes an adapter.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.registry.list_models()
    }

    /// Load a definition without validating compatibility.
    pub fn load(&self, path: &Path) -> Result<ChainConfig> {
        ConfigLoader::new(&self.registry).load(path)
    }

    /// Pre-run cost estimate of `config`.
    pub fn estimate(&self, config: &ChainConfig) -> CostEstimate {
        estimate_chain(&self.registry, config)
    }

    /// Load and check a definition file without executing anything.
    pub fn validate(&self, path: &Path, options: &RunOptions) -> Result<PreparedChain> {
        let config = self.load(path)?;
        self.prepare(config, options)
    }

    /// Apply overrides, check compatibility, estimate, and gate on budget.
    pub fn prepare(&self, mut config: ChainConfig, options: &RunOptions) -> Result<PreparedChain> {
        if let Some(text) = &options.input_text {
            config.initial_input = Some(Artifact::text(text.clone()));
        }
        if let Some(budget) = options.budget_override {
            ChainConfig::check_budget(Some(budget))?;
            config.budget = Some(budget);
        }

        let warnings = CompatibilityValidator::new().validate(&config)?;
        let estimate = self.estimate(&config);

        if let Some(budget) = config.budget {
            if estimate.total > budget + BUDGET_EPSILON {
                tracing::warn!(
                    chain = %config.name,
                    estimate = estimate.total,
                    budget,
                    "Estimate exceeds budget, refusing to run"
                );
                return Err(Error::BudgetExceeded {
                    estimate: estimate.total,
                    budget,
                });
            }
        }

        tracing::info!(
            chain = %config.name,
            estimate = estimate.total,
            upper_bound = estimate.upper_bound,
            warnings = warnings.len(),
            "Chain prepared"
        );
        Ok(PreparedChain {
            config,
            estimate,
            warnings,
        })
    }

    /// Load `path` and run it to a terminal state.
    pub async fn run_chain(&self, path: &Path, options: &RunOptions) -> Result<ChainResult> {
        let config = self.load(path)?;
        self.run_config(config, options).await
    }

    /// Run an already-loaded chain.
    ///
    /// Returns `Err` only for failures before execution starts. An aborted
    /// run is an `Ok` result with `aborted` set.
    pub async fn run_config(&self, config: ChainConfig, options: &RunOptions) -> Result<ChainResult> {
        let prepared = self.prepare(config, options)?;
        self.execute(prepared, options).await
    }

    /// Confirm and execute a prepared chain, then persist its report.
    pub async fn execute(&self, prepared: PreparedChain, options: &RunOptions) -> Result<ChainResult> {
        let PreparedChain {
            config,
            estimate,
            warnings,
        } = prepared;

        if !options.no_confirm {
            if let Some(confirm) = &self.confirm {
                if !confirm(&estimate, config.budget) {
                    tracing::info!(chain = %config.name, "Run declined at confirmation");
                    return Err(Error::Declined);
                }
            }
        }
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled("cancelled before execution".into()));
        }

        let run_id = RunId::new();
        let workspace = Arc::new(ChainWorkspace::new(&config, &run_id)?);
        let dispatcher = StepDispatcher::new(Arc::clone(&self.registry), Arc::clone(&workspace))
            .with_policy(self.policy.clone());
        let ctx = ExecutionContext::new(Arc::clone(&workspace))
            .with_cancellation(self.cancellation.clone())
            .with_progress(Arc::clone(&self.progress));

        let mut result = ChainExecutor::new(dispatcher).execute(&config, &ctx, run_id).await;
        result.estimate = Some(estimate);
        let mut all_warnings = warnings;
        all_warnings.append(&mut result.warnings);
        result.warnings = all_warnings;

        if let Err(e) = write_report(&mut result, workspace.output_dir()) {
            tracing::error!(run_id = %run_id, "Failed to write chain report: {e}");
            result.report_path = None;
            result.warnings.push(format!("report not written: {e}"));
        }

        // Temp cleanup happens when the last workspace handle drops.
        drop(ctx);
        drop(workspace);
        Ok(result)
    }
}
