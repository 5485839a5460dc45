//! Pipeline definition documents and the validated [`ChainConfig`].
//!
//! A definition is parsed in two phases. [`parse_document`] turns YAML or JSON
//! into the raw [`ChainDocument`], rejecting unknown keys so typos surface
//! early. The loader in `cf-pipeline` then resolves models against the
//! adapter registry and produces a [`ChainConfig`], which is read-only for the
//! rest of the run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::Result;
use crate::step::{MergeStrategy, Params, StepEntry};
use crate::Error;

/// Step `type` tag that marks a parallel group entry.
pub const PARALLEL_GROUP_TAG: &str = "parallel_group";

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Format detection
// ---------------------------------------------------------------------------

/// Serialization format of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.json` files are JSON; everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw documents
// ---------------------------------------------------------------------------

/// A pipeline definition exactly as written on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainDocument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub initial_input: Option<InitialInput>,
    pub steps: Vec<StepDocument>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub cleanup_temp: bool,
    #[serde(default)]
    pub save_intermediates: bool,
    #[serde(default)]
    pub budget: Option<f64>,
}

/// One entry of the `steps` list: a step, or a `parallel_group` with members.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDocument {
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub output_filename: Option<String>,
    #[serde(default)]
    pub members: Option<Vec<StepDocument>>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
}

impl StepDocument {
    pub fn is_group(&self) -> bool {
        self.step_type.trim().eq_ignore_ascii_case(PARALLEL_GROUP_TAG)
    }
}

/// The chain's starting input: a bare prompt string or an artifact reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialInput {
    Prompt(String),
    Reference(InputReference),
}

/// `{kind, path | url | text}` form of [`InitialInput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputReference {
    pub kind: ArtifactKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl InitialInput {
    /// Materialize the starting artifact. Exactly one of `path`, `url` or
    /// `text` must be set on a reference.
    pub fn into_artifact(self) -> Result<Artifact> {
        match self {
            InitialInput::Prompt(text) => Ok(Artifact::text(text)),
            InitialInput::Reference(r) => match (r.path, r.url, r.text) {
                (Some(path), None, None) => Ok(Artifact::from_path(r.kind, expand_path(&path))),
                (None, Some(url), None) => Ok(Artifact::from_url(r.kind, url)),
                (None, None, Some(text)) => {
                    if r.kind != ArtifactKind::Text {
                        return Err(Error::config(format!(
                            "initial_input: inline text requires kind 'text', got '{}'",
                            r.kind
                        )));
                    }
                    Ok(Artifact::text(text))
                }
                (None, None, None) => Err(Error::config(
                    "initial_input: one of 'path', 'url' or 'text' is required",
                )),
                _ => Err(Error::config(
                    "initial_input: 'path', 'url' and 'text' are mutually exclusive",
                )),
            },
        }
    }
}

/// Parse a definition document in the given format.
pub fn parse_document(content: &str, format: ConfigFormat) -> Result<ChainDocument> {
    match format {
        ConfigFormat::Json => serde_json::from_str(content)
            .map_err(|e| Error::config(format!("invalid JSON definition: {e}"))),
        ConfigFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid YAML definition: {e}"))),
    }
}

/// Expand a leading `~` against the home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

// ---------------------------------------------------------------------------
// Validated ChainConfig
// ---------------------------------------------------------------------------

/// A validated pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_input: Option<Artifact>,
    pub steps: Vec<StepEntry>,
    pub output_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    pub cleanup_temp: bool,
    pub save_intermediates: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
}

impl ChainConfig {
    /// A config with every global setting at its default.
    pub fn new(name: impl Into<String>, steps: Vec<StepEntry>) -> Self {
        Self {
            name: name.into(),
            description: None,
            initial_input: None,
            steps,
            output_dir: default_output_dir(),
            temp_dir: None,
            cleanup_temp: true,
            save_intermediates: false,
            budget: None,
        }
    }

    /// Builder: set the starting artifact.
    #[must_use]
    pub fn with_initial_input(mut self, input: Artifact) -> Self {
        self.initial_input = Some(input);
        self
    }

    /// Builder: set the cost ceiling.
    #[must_use]
    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Builder: set the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Builder: set the temp directory.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Builder: toggle intermediate persistence.
    #[must_use]
    pub fn with_save_intermediates(mut self, save: bool) -> Self {
        self.save_intermediates = save;
        self
    }

    #[must_use]
    pub fn with_cleanup_temp(mut self, cleanup: bool) -> Self {
        self.cleanup_temp = cleanup;
        self
    }

    /// Kind the first step receives: the initial artifact's, else text.
    pub fn input_kind(&self) -> ArtifactKind {
        self.initial_input
            .as_ref()
            .map(|a| a.kind)
            .unwrap_or(ArtifactKind::Text)
    }

    /// Reject a non-positive or non-finite budget.
    pub fn check_budget(budget: Option<f64>) -> Result<()> {
        match budget {
            Some(b) if !b.is_finite() || b <= 0.0 => Err(Error::config(format!(
                "budget must be a positive number, got {b}"
            ))),
            _ => Ok(()),
        }
    }

    /// Non-fatal observations about the global settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.steps.iter().all(|s| !s.enabled()) {
            warnings.push("every step is disabled; the chain will produce no output".into());
        }
        if !self.cleanup_temp && self.temp_dir.is_none() {
            warnings.push(
                "cleanup_temp is false without an explicit temp_dir; scratch files will pile up in the system temp dir"
                    .into(),
            );
        }
        if let Some(input) = &self.initial_input {
            if let Some(path) = input.local_path() {
                if !path.exists() {
                    warnings.push(format!("initial_input path {} does not exist", path.display()));
                }
            }
        }

        warnings
    }
}
