//! The [`StepAdapter`] trait is the uniform calling contract for providers.
//!
//! An adapter presents one blocking call per invocation. The engine owns all
//! concurrency: it runs each call on the blocking pool under a timeout, and
//! decides retries from the returned [`AdapterError`] classification.

use std::path::PathBuf;

use cf_core::{AdapterError, Artifact, ArtifactData, ArtifactKind, MetaValue, Metadata, Params, StepType};

/// Static description of an adapter for one step type.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterInfo {
    pub description: String,
    /// Nominal price of one call, in USD.
    pub cost_per_call: f64,
    /// Params that must be present in a step definition.
    pub required_params: Vec<String>,
}

impl AdapterInfo {
    pub fn new(description: impl Into<String>, cost_per_call: f64) -> Self {
        Self {
            description: description.into(),
            cost_per_call,
            required_params: Vec::new(),
        }
    }

    /// Builder: declare a required param.
    #[must_use]
    pub fn requires(mut self, param: impl Into<String>) -> Self {
        self.required_params.push(param.into());
        self
    }
}

/// Everything one adapter invocation receives. Owned so it can move onto the
/// blocking pool.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub step_type: StepType,
    pub model: String,
    pub input: Option<Artifact>,
    pub params: Params,
    /// Step-index-qualified scratch directory inside the chain's temp dir.
    pub scratch_dir: PathBuf,
    /// "3.1 text_to_image/mock" style label for logs.
    pub label: String,
}

impl AdapterRequest {
    /// The prompt text for this call: `params.prompt`, else a text input.
    pub fn prompt(&self) -> Option<&str> {
        self.params
            .get("prompt")
            .and_then(serde_json::Value::as_str)
            .or_else(|| self.input.as_ref().and_then(Artifact::as_text))
    }
}

/// Raw payload an adapter hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPayload {
    Bytes(Vec<u8>),
    Url(String),
    Path(PathBuf),
    Text(String),
}

/// A successful adapter result before the engine types it as an [`Artifact`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    pub payload: OutputPayload,
    /// Actual billed cost, when the provider reports one.
    pub cost: Option<f64>,
    pub metadata: Metadata,
}

impl AdapterOutput {
    pub fn new(payload: OutputPayload) -> Self {
        Self {
            payload,
            cost: None,
            metadata: Metadata::new(),
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::new(OutputPayload::Path(path.into()))
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(OutputPayload::Url(url.into()))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OutputPayload::Text(text.into()))
    }

    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self::new(OutputPayload::Bytes(bytes))
    }

    /// Builder: record the actual cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Builder: attach one metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Wrap the payload as an artifact of the step's declared output kind.
    pub fn into_artifact(self, kind: ArtifactKind) -> Artifact {
        let data = match self.payload {
            OutputPayload::Bytes(b) => ArtifactData::Inline(b),
            OutputPayload::Url(u) => ArtifactData::Url(u),
            OutputPayload::Path(p) => ArtifactData::Path(p),
            OutputPayload::Text(t) => ArtifactData::Text(t),
        };
        Artifact::new(kind, data).with_metadata(self.metadata)
    }
}

/// A provider-specific implementation of one or more step types.
///
/// Implementors must be cheap to share: the registry hands out
/// `Arc<dyn StepAdapter>` and concurrent group members may call `execute` on
/// the same adapter at once.
pub trait StepAdapter: Send + Sync {
    /// Describe this adapter as registered for `step_type`.
    fn describe(&self, step_type: StepType) -> AdapterInfo;

    /// Estimated cost of one call with `params`, in USD.
    ///
    /// Defaults to the nominal per-call price.
    fn estimate_cost(&self, step_type: StepType, _params: &Params) -> f64 {
        self.describe(step_type).cost_per_call
    }

    /// Perform the operation. Blocking; called on the engine's blocking pool.
    fn execute(&self, request: &AdapterRequest) -> Result<AdapterOutput, AdapterError>;
}
