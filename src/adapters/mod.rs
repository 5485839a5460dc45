//! Built-in step adapters shipped with the binary.
//!
//! - `mock`: deterministic placeholder outputs for rehearsing chains offline.
//! - `exec`: runs an external command per step.

pub mod exec;
pub mod mock;

use std::sync::Arc;

use cf_core::StepType;
use cf_pipeline::AdapterRegistry;

pub use exec::ExecAdapter;
pub use mock::MockAdapter;

/// Every step type that is served by an adapter rather than the engine.
pub fn adapter_step_types() -> Vec<StepType> {
    StepType::ALL
        .iter()
        .copied()
        .filter(|t| !t.is_builtin())
        .collect()
}

/// Registry with `mock` (the default model) and `exec` for every step type.
pub fn default_registry() -> AdapterRegistry {
    let types = adapter_step_types();
    let mut registry = AdapterRegistry::new();
    registry
        .register_all(&types, mock::MODEL, Arc::new(MockAdapter::new()))
        .register_all(&types, exec::MODEL, Arc::new(ExecAdapter::new()));
    tracing::debug!(adapters = registry.len(), "Built default adapter registry");
    registry
}
