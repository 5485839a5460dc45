//! Execution records: per-step results, the chain result, and cost estimates.
//!
//! In-chain failures are data. A failed step produces a [`StepResult`] with a
//! [`StepFailure`] rather than an `Err`, and the chain executor decides whether
//! to abort or continue from it.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::error::AdapterError;
use crate::ids::RunId;
use crate::step::{StepEntry, StepPosition};

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Classification of an in-chain failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Validation,
    Provider,
    Timeout,
    BudgetExceeded,
    /// Every member of a parallel group failed.
    Aggregate,
    Cancelled,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Validation => write!(f, "validation"),
            Self::Provider => write!(f, "provider"),
            Self::Timeout => write!(f, "timeout"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::Aggregate => write!(f, "aggregate"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Typed failure carried by a failed [`StepResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub class: FailureClass,
    pub message: String,
}

impl StepFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn timeout(after_secs: f64) -> Self {
        Self::new(
            FailureClass::Timeout,
            format!("adapter call timed out after {after_secs:.1}s"),
        )
    }

    pub fn budget_exceeded(estimate: f64, remaining: f64) -> Self {
        Self::new(
            FailureClass::BudgetExceeded,
            format!("estimated ${estimate:.4} exceeds remaining budget ${remaining:.4}"),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Cancelled, message)
    }

    /// Whether the dispatcher may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class, FailureClass::Transient | FailureClass::Timeout)
    }
}

impl From<AdapterError> for StepFailure {
    fn from(e: AdapterError) -> Self {
        let class = match &e {
            AdapterError::Transient(_) => FailureClass::Transient,
            AdapterError::Validation(_) => FailureClass::Validation,
            AdapterError::Provider(_) => FailureClass::Provider,
        };
        Self::new(class, e.message())
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome of one step, group, or group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Skipped,
    Success,
    Failed,
    /// A first_success straggler stopped after another member won.
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Record of one executed (or skipped) step.
///
/// `output` is present iff `status` is success; `error` is present iff
/// `status` is failed or cancelled. A parallel group carries its members'
/// results in `members`, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub position: StepPosition,
    pub spec: StepEntry,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    pub duration_secs: f64,
    pub cost: f64,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub saved_paths: Vec<PathBuf>,
}

impl StepResult {
    pub fn skipped(position: StepPosition, spec: StepEntry) -> Self {
        Self {
            position,
            spec,
            status: StepStatus::Skipped,
            output: None,
            error: None,
            duration_secs: 0.0,
            cost: 0.0,
            attempt_count: 0,
            members: Vec::new(),
            saved_paths: Vec::new(),
        }
    }

    pub fn success(position: StepPosition, spec: StepEntry, output: Artifact) -> Self {
        Self {
            status: StepStatus::Success,
            output: Some(output),
            ..Self::skipped(position, spec)
        }
    }

    pub fn failed(position: StepPosition, spec: StepEntry, error: StepFailure) -> Self {
        let status = if error.class == FailureClass::Cancelled {
            StepStatus::Cancelled
        } else {
            StepStatus::Failed
        };
        Self {
            status,
            error: Some(error),
            ..Self::skipped(position, spec)
        }
    }

    /// Builder: record timing and billing.
    #[must_use]
    pub fn with_accounting(mut self, duration_secs: f64, cost: f64, attempt_count: u32) -> Self {
        self.duration_secs = duration_secs;
        self.cost = cost;
        self.attempt_count = attempt_count;
        self
    }

    /// Builder: attach nested member results.
    #[must_use]
    pub fn with_members(mut self, members: Vec<StepResult>) -> Self {
        self.members = members;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn label(&self) -> String {
        self.spec.label()
    }
}

// ---------------------------------------------------------------------------
// Cost estimate
// ---------------------------------------------------------------------------

/// Pre-run estimate for one top-level step or group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCost {
    pub index: usize,
    pub label: String,
    /// Figure gated against the budget.
    pub estimate: f64,
    /// Every member billed, regardless of merge strategy.
    pub upper_bound: f64,
}

/// Pre-run cost estimate for a whole chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub total: f64,
    pub upper_bound: f64,
    pub per_step: Vec<StepCost>,
}

impl CostEstimate {
    pub fn push(&mut self, step: StepCost) {
        self.total += step.estimate;
        self.upper_bound += step.upper_bound;
        self.per_step.push(step);
    }

    /// Whether `total` fits within `budget` (always true when unset).
    pub fn fits(&self, budget: Option<f64>) -> bool {
        budget.map_or(true, |b| self.total <= b)
    }
}

// ---------------------------------------------------------------------------
// ChainResult
// ---------------------------------------------------------------------------

/// Chain run state machine: `NotStarted -> Running -> (Completed | Aborted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    NotStarted,
    Running,
    Completed,
    Aborted,
}

impl ChainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NOT_STARTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Durable record of one `run_chain` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainResult {
    pub run_id: RunId,
    pub chain_name: String,
    pub status: ChainStatus,
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub steps: Vec<StepResult>,
    pub total_cost: f64,
    pub total_duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<CostEstimate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl ChainResult {
    /// A fresh record in the `NotStarted` state.
    pub fn new(run_id: RunId, chain_name: impl Into<String>) -> Self {
        Self {
            run_id,
            chain_name: chain_name.into(),
            status: ChainStatus::NotStarted,
            aborted: false,
            abort_reason: None,
            steps: Vec::new(),
            total_cost: 0.0,
            total_duration_secs: 0.0,
            final_output: None,
            estimate: None,
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            report_path: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChainStatus::Completed
    }

    /// Every step and group member, depth first, in chain order.
    pub fn flatten(&self) -> Vec<&StepResult> {
        fn walk<'a>(results: &'a [StepResult], out: &mut Vec<&'a StepResult>) {
            for r in results {
                out.push(r);
                walk(&r.members, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| s.is_failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepSpec, StepType};

    fn entry() -> StepEntry {
        StepEntry::Step(StepSpec::new(StepType::TextToImage, "mock"))
    }

    #[test]
    fn adapter_error_classification() {
        let f = StepFailure::from(AdapterError::transient("502"));
        assert_eq!(f.class, FailureClass::Transient);
        assert!(f.is_retryable());
        assert_eq!(f.message, "502");

        let f = StepFailure::from(AdapterError::validation("bad size"));
        assert!(!f.is_retryable());
        assert!(StepFailure::timeout(3.0).is_retryable());
        assert!(!StepFailure::budget_exceeded(1.0, 0.5).is_retryable());
    }

    #[test]
    fn status_follows_constructor() {
        let ok = StepResult::success(StepPosition::top(0), entry(), Artifact::text("x"));
        assert!(ok.is_success());
        assert!(ok.error.is_none());

        let bad = StepResult::failed(
            StepPosition::top(1),
            entry(),
            StepFailure::new(FailureClass::Provider, "boom"),
        );
        assert!(bad.is_failed());
        assert!(bad.output.is_none());

        let cancelled = StepResult::failed(
            StepPosition::member(2, 1),
            entry(),
            StepFailure::cancelled("lost the race"),
        );
        assert_eq!(cancelled.status, StepStatus::Cancelled);
        assert!(!cancelled.is_failed());
    }

    #[test]
    fn estimate_accumulates() {
        let mut est = CostEstimate::default();
        est.push(StepCost {
            index: 0,
            label: "a".into(),
            estimate: 0.02,
            upper_bound: 0.02,
        });
        est.push(StepCost {
            index: 1,
            label: "group".into(),
            estimate: 0.01,
            upper_bound: 0.03,
        });
        assert!((est.total - 0.03).abs() < 1e-9);
        assert!((est.upper_bound - 0.05).abs() < 1e-9);
        assert!(est.fits(None));
        assert!(est.fits(Some(0.03)));
        assert!(!est.fits(Some(0.029)));
    }

    #[test]
    fn chain_status_serializes_upper() {
        assert_eq!(serde_json::to_string(&ChainStatus::Completed).unwrap(), "\"COMPLETED\"");
        assert_eq!(ChainStatus::NotStarted.to_string(), "NOT_STARTED");
        assert!(ChainStatus::Aborted.is_terminal());
        assert!(!ChainStatus::Running.is_terminal());
    }

    #[test]
    fn flatten_walks_members() {
        let member = StepResult::success(StepPosition::member(0, 0), entry(), Artifact::text("m"));
        let group = StepResult::success(StepPosition::top(0), entry(), Artifact::text("g"))
            .with_members(vec![member.clone(), member]);
        let mut result = ChainResult::new(RunId::new(), "c");
        result.steps.push(group);
        assert_eq!(result.flatten().len(), 3);
    }

    #[test]
    fn chain_result_json_roundtrip() {
        let mut result = ChainResult::new(RunId::new(), "demo");
        result.status = ChainStatus::Aborted;
        result.aborted = true;
        result.abort_reason = Some("step 1 failed".into());
        result.steps.push(
            StepResult::failed(
                StepPosition::top(0),
                entry(),
                StepFailure::new(FailureClass::Validation, "missing prompt"),
            )
            .with_accounting(0.2, 0.0, 1),
        );
        let json = serde_json::to_string_pretty(&result).unwrap();
        let back: ChainResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
