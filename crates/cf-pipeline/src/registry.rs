//! Adapter registry keyed by `(step_type, model)`.
//!
//! The [`AdapterRegistry`] is resolved once per dispatch. Iteration order is
//! deterministic (step type, then model name), so [`AdapterRegistry::list_models`]
//! returns identical rows for an unchanged registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cf_core::{ArtifactKind, Error, Result, StepType};

use crate::adapter::StepAdapter;

/// Metadata row describing one registered `(step_type, model)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub step_type: StepType,
    pub model: String,
    pub description: String,
    pub cost_per_call: f64,
    pub required_params: Vec<String>,
    pub accepts: Vec<ArtifactKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<ArtifactKind>,
    /// Whether steps of this type without a `model` resolve to this one.
    pub is_default: bool,
}

/// Registry holding the adapters available to a chain run.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<(StepType, String), Arc<dyn StepAdapter>>,
    /// First model registered per step type.
    defaults: BTreeMap<StepType, String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for `step_type` under `model`, replacing any
    /// previous registration of the same pair.
    pub fn register(
        &mut self,
        step_type: StepType,
        model: impl Into<String>,
        adapter: Arc<dyn StepAdapter>,
    ) -> &mut Self {
        let model = model.into();
        self.defaults
            .entry(step_type)
            .or_insert_with(|| model.clone());
        self.adapters.insert((step_type, model), adapter);
        self
    }

    /// Register one adapter for several step types under the same model.
    pub fn register_all(
        &mut self,
        step_types: &[StepType],
        model: &str,
        adapter: Arc<dyn StepAdapter>,
    ) -> &mut Self {
        for &step_type in step_types {
            self.register(step_type, model, Arc::clone(&adapter));
        }
        self
    }

    /// Look up the adapter for a pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAdapter`] when nothing is registered.
    pub fn resolve(&self, step_type: StepType, model: &str) -> Result<Arc<dyn StepAdapter>> {
        self.adapters
            .get(&(step_type, model.to_string()))
            .cloned()
            .ok_or_else(|| Error::unknown_adapter(step_type, model))
    }

    pub fn contains(&self, step_type: StepType, model: &str) -> bool {
        self.adapters.contains_key(&(step_type, model.to_string()))
    }

    /// Model used for steps of `step_type` that do not name one.
    pub fn default_model(&self, step_type: StepType) -> Option<&str> {
        self.defaults.get(&step_type).map(String::as_str)
    }

    /// Models registered for `step_type`, in name order.
    pub fn models_for(&self, step_type: StepType) -> Vec<&str> {
        self.adapters
            .keys()
            .filter(|(t, _)| *t == step_type)
            .map(|(_, m)| m.as_str())
            .collect()
    }

    /// Describe every registered pair. Never invokes an adapter.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.adapters
            .iter()
            .map(|((step_type, model), adapter)| {
                let info = adapter.describe(*step_type);
                ModelInfo {
                    step_type: *step_type,
                    model: model.clone(),
                    description: info.description,
                    cost_per_call: info.cost_per_call,
                    required_params: info.required_params,
                    accepts: step_type.accepts().to_vec(),
                    produces: step_type.produces(),
                    is_default: self.default_model(*step_type) == Some(model.as_str()),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("models", &self.adapters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
