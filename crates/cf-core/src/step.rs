//! Step declarations: operation families, specs, parallel groups, and the
//! reserved params the engine itself interprets.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKind;

/// Free-form option mapping handed to adapters verbatim.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Param key: keep going when this step fails.
pub const PARAM_CONTINUE_ON_ERROR: &str = "continue_on_error";
/// Param key: per-call adapter timeout in seconds.
pub const PARAM_TIMEOUT_SECS: &str = "timeout_secs";
/// Longest accepted `timeout_secs` (one day).
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;
/// Param key: metadata metric a `best_quality` group maximises.
pub const PARAM_SCORE_BY: &str = "score_by";
/// Param key: which group member a `select` step picks.
pub const PARAM_INDEX: &str = "index";

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

/// Operation family of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    TextToImage,
    TextToVideo,
    ImageToImage,
    ImageToVideo,
    TextToSpeech,
    AddAudio,
    UpscaleImage,
    UpscaleVideo,
    SpeechToText,
    ImageUnderstanding,
    PromptGeneration,
    /// Built-in: pick one member output out of a `collect_all` collection.
    Select,
}

impl StepType {
    /// Every step type, in declaration order.
    pub const ALL: [StepType; 12] = [
        Self::TextToImage,
        Self::TextToVideo,
        Self::ImageToImage,
        Self::ImageToVideo,
        Self::TextToSpeech,
        Self::AddAudio,
        Self::UpscaleImage,
        Self::UpscaleVideo,
        Self::SpeechToText,
        Self::ImageUnderstanding,
        Self::PromptGeneration,
        Self::Select,
    ];

    /// Input kinds this operation family accepts.
    pub fn accepts(&self) -> &'static [ArtifactKind] {
        use ArtifactKind::*;
        match self {
            Self::TextToImage | Self::TextToVideo | Self::TextToSpeech => &[Text],
            Self::ImageToImage | Self::ImageToVideo | Self::UpscaleImage => &[Image],
            Self::ImageUnderstanding => &[Image],
            Self::AddAudio => &[Video, Audio],
            Self::UpscaleVideo => &[Video],
            Self::SpeechToText => &[Audio, Video],
            Self::PromptGeneration => &[Text, Image],
            Self::Select => &[StructuredData],
        }
    }

    /// Output kind, or `None` when it depends on the input (`select`).
    pub fn produces(&self) -> Option<ArtifactKind> {
        use ArtifactKind::*;
        match self {
            Self::TextToImage | Self::ImageToImage | Self::UpscaleImage => Some(Image),
            Self::TextToVideo | Self::ImageToVideo | Self::AddAudio | Self::UpscaleVideo => {
                Some(Video)
            }
            Self::TextToSpeech => Some(Audio),
            Self::SpeechToText | Self::ImageUnderstanding | Self::PromptGeneration => Some(Text),
            Self::Select => None,
        }
    }

    pub fn accepts_kind(&self, kind: ArtifactKind) -> bool {
        self.accepts().contains(&kind)
    }

    /// Built-in steps run inside the engine and need no adapter.
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::Select)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextToImage => "text_to_image",
            Self::TextToVideo => "text_to_video",
            Self::ImageToImage => "image_to_image",
            Self::ImageToVideo => "image_to_video",
            Self::TextToSpeech => "text_to_speech",
            Self::AddAudio => "add_audio",
            Self::UpscaleImage => "upscale_image",
            Self::UpscaleVideo => "upscale_video",
            Self::SpeechToText => "speech_to_text",
            Self::ImageUnderstanding => "image_understanding",
            Self::PromptGeneration => "prompt_generation",
            Self::Select => "select",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown step type '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// MergeStrategy
// ---------------------------------------------------------------------------

/// How a parallel group reduces its member outputs to one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    CollectAll,
    FirstSuccess,
    BestQuality,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CollectAll => write!(f, "collect_all"),
            Self::FirstSuccess => write!(f, "first_success"),
            Self::BestQuality => write!(f, "best_quality"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "collect_all" => Ok(Self::CollectAll),
            "first_success" => Ok(Self::FirstSuccess),
            "best_quality" => Ok(Self::BestQuality),
            other => Err(format!("unknown merge strategy '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Params helpers
// ---------------------------------------------------------------------------

/// Typed accessors over a [`Params`] mapping.
pub trait ParamsExt {
    fn flag(&self, key: &str) -> bool;
    fn str_param(&self, key: &str) -> Option<&str>;
    fn f64_param(&self, key: &str) -> Option<f64>;
    fn u64_param(&self, key: &str) -> Option<u64>;
}

impl ParamsExt for Params {
    fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => {
                matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
            }
            _ => false,
        }
    }

    fn str_param(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(serde_json::Value::as_str)
    }

    fn f64_param(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn u64_param(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// A single declared operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_type: StepType,
    pub model: String,
    #[serde(default)]
    pub params: Params,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
}

impl StepSpec {
    pub fn new(step_type: StepType, model: impl Into<String>) -> Self {
        Self {
            step_type,
            model: model.into(),
            params: Params::new(),
            enabled: true,
            output_filename: None,
        }
    }

    /// Builder: set one param.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Builder: set the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn continue_on_error(&self) -> bool {
        self.params.flag(PARAM_CONTINUE_ON_ERROR)
    }

    /// Per-call timeout from params, if one was given and is in range.
    pub fn timeout(&self) -> Option<Duration> {
        self.params
            .f64_param(PARAM_TIMEOUT_SECS)
            .filter(|secs| *secs > 0.0 && *secs <= MAX_TIMEOUT_SECS)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// "text_to_image/flux" style label for logs.
    pub fn label(&self) -> String {
        format!("{}/{}", self.step_type, self.model)
    }
}

/// A fan-out of steps sharing one input, reduced by a merge strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelGroupSpec {
    pub members: Vec<StepSpec>,
    pub max_workers: usize,
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub params: Params,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
}

impl ParallelGroupSpec {
    pub fn new(members: Vec<StepSpec>, merge_strategy: MergeStrategy) -> Self {
        let max_workers = members.len().max(1);
        Self {
            members,
            max_workers,
            merge_strategy,
            params: Params::new(),
            enabled: true,
            output_filename: None,
        }
    }

    /// Builder: bound the worker pool.
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Builder: set one group-level param.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn continue_on_error(&self) -> bool {
        self.params.flag(PARAM_CONTINUE_ON_ERROR)
    }

    pub fn score_by(&self) -> Option<&str> {
        self.params.str_param(PARAM_SCORE_BY)
    }

    pub fn enabled_members(&self) -> impl Iterator<Item = (usize, &StepSpec)> {
        self.members.iter().enumerate().filter(|(_, m)| m.enabled)
    }

    pub fn label(&self) -> String {
        format!("parallel_group[{}x {}]", self.members.len(), self.merge_strategy)
    }
}

/// One entry of a chain: a plain step or a parallel group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum StepEntry {
    Step(StepSpec),
    Group(ParallelGroupSpec),
}

impl StepEntry {
    pub fn enabled(&self) -> bool {
        match self {
            Self::Step(s) => s.enabled,
            Self::Group(g) => g.enabled,
        }
    }

    pub fn continue_on_error(&self) -> bool {
        match self {
            Self::Step(s) => s.continue_on_error(),
            Self::Group(g) => g.continue_on_error(),
        }
    }

    pub fn output_filename(&self) -> Option<&str> {
        match self {
            Self::Step(s) => s.output_filename.as_deref(),
            Self::Group(g) => g.output_filename.as_deref(),
        }
    }

    /// Tag used in generated file names and logs.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Step(s) => s.step_type.as_str(),
            Self::Group(_) => "parallel_group",
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Step(s) => s.label(),
            Self::Group(g) => g.label(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepPosition
// ---------------------------------------------------------------------------

/// Position of a step in the chain; group members also carry their index
/// within the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepPosition {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<usize>,
}

impl StepPosition {
    pub fn top(index: usize) -> Self {
        Self { index, member: None }
    }

    pub fn member(index: usize, member: usize) -> Self {
        Self {
            index,
            member: Some(member),
        }
    }

    /// Index-qualified prefix for files written on behalf of this step.
    pub fn file_prefix(&self) -> String {
        match self.member {
            Some(m) => format!("{}_{}", self.index, m),
            None => self.index.to_string(),
        }
    }
}

impl fmt::Display for StepPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.member {
            Some(m) => write!(f, "{}.{}", self.index, m),
            None => write!(f, "{}", self.index),
        }
    }
}
