//! # cf-pipeline
//!
//! The chain execution engine.
//!
//! This crate provides:
//!
//! - **[`StepAdapter`]** trait -- one external generative operation, invoked
//!   with an input artifact and free-form params.
//! - **[`AdapterRegistry`]** -- adapters keyed by `(step_type, model)`.
//! - **[`ConfigLoader`]** and **[`CompatibilityValidator`]** -- definition
//!   parsing and static artifact-kind checks.
//! - **[`StepDispatcher`]** -- budget gating, timeouts and retries for one
//!   step.
//! - **[`ParallelGroupExecutor`]** -- bounded fan-out with `collect_all`,
//!   `first_success` and `best_quality` merging.
//! - **[`ChainExecutor`]** -- the sequential walk over a chain.
//! - **[`PipelineManager`]** -- load, validate, estimate, confirm, run, and
//!   write the execution record.

pub mod adapter;
pub mod context;
pub mod dispatcher;
pub mod estimate;
pub mod executor;
pub mod group;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod report;
pub mod validator;
pub mod workspace;

// Re-export key types at the crate root.
pub use adapter::{AdapterInfo, AdapterOutput, AdapterRequest, OutputPayload, StepAdapter};
pub use context::{ExecutionContext, ProgressSender, StepProgress};
pub use dispatcher::{RetryPolicy, StepDispatcher};
pub use estimate::estimate_chain;
pub use executor::ChainExecutor;
pub use group::ParallelGroupExecutor;
pub use loader::ConfigLoader;
pub use manager::{ConfirmHook, PipelineManager, PreparedChain, RunOptions};
pub use registry::{AdapterRegistry, ModelInfo};
pub use report::{load_report, write_report};
pub use validator::CompatibilityValidator;
pub use workspace::ChainWorkspace;
