//! cf-core: shared types, ids, errors, and pipeline definitions.
//!
//! This crate is the foundational dependency for the chainforge engine and
//! CLI, providing the artifact model, step and chain declarations, the
//! unified error type, and the execution-record types written to reports.

pub mod artifact;
pub mod config;
pub mod error;
pub mod ids;
pub mod result;
pub mod step;

// Re-export the most commonly used items at the crate root.
pub use artifact::{describe_kinds, Artifact, ArtifactData, ArtifactKind, MetaValue, Metadata};
pub use config::{ChainConfig, ConfigFormat, InitialInput};
pub use error::{AdapterError, Error, Result};
pub use ids::RunId;
pub use result::{
    ChainResult, ChainStatus, CostEstimate, FailureClass, StepCost, StepFailure, StepResult,
    StepStatus,
};
pub use step::{
    MergeStrategy, ParallelGroupSpec, Params, ParamsExt, StepEntry, StepPosition, StepSpec,
    StepType,
};
