//! Offline adapter producing deterministic placeholder artifacts.
//!
//! Useful for rehearsing a chain's shape, cost and persistence before paying
//! for real provider calls. Two params steer it:
//!
//! - `simulate_failure`: `transient`, `validation` or `provider`
//! - `simulate_delay_ms`: block for this long before answering

use std::fs;
use std::time::Duration;

use cf_core::{AdapterError, ArtifactKind, ParamsExt, StepType};
use cf_pipeline::{AdapterInfo, AdapterOutput, AdapterRequest, StepAdapter};

/// Model name the mock adapter registers under.
pub const MODEL: &str = "mock";

const DEFAULT_WIDTH: u64 = 1024;
const DEFAULT_HEIGHT: u64 = 1024;
const DEFAULT_DURATION_SECS: f64 = 5.0;

/// Nominal USD price of one call, per step type.
fn price(step_type: StepType) -> f64 {
    match step_type {
        StepType::TextToImage => 0.04,
        StepType::TextToVideo => 0.25,
        StepType::ImageToImage => 0.03,
        StepType::ImageToVideo => 0.20,
        StepType::TextToSpeech => 0.015,
        StepType::AddAudio => 0.01,
        StepType::UpscaleImage => 0.02,
        StepType::UpscaleVideo => 0.10,
        StepType::SpeechToText => 0.006,
        StepType::ImageUnderstanding => 0.01,
        StepType::PromptGeneration => 0.002,
        StepType::Select => 0.0,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MockAdapter;

impl MockAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl StepAdapter for MockAdapter {
    fn describe(&self, step_type: StepType) -> AdapterInfo {
        AdapterInfo::new(
            format!("Placeholder {step_type} output, no provider call"),
            price(step_type),
        )
    }

    fn execute(&self, request: &AdapterRequest) -> Result<AdapterOutput, AdapterError> {
        if let Some(ms) = request.params.u64_param("simulate_delay_ms") {
            std::thread::sleep(Duration::from_millis(ms));
        }
        if let Some(kind) = request.params.str_param("simulate_failure") {
            let message = format!("simulated {kind} failure in {}", request.label);
            return Err(match kind {
                "transient" => AdapterError::transient(message),
                "validation" => AdapterError::validation(message),
                _ => AdapterError::provider(message),
            });
        }

        let subject = describe_input(request);
        tracing::debug!(step = %request.label, "Mock adapter producing placeholder");

        let output = match request.step_type.produces() {
            Some(ArtifactKind::Text) => AdapterOutput::text(text_for(request.step_type, &subject)),
            Some(kind) => {
                let path = request
                    .scratch_dir
                    .join(format!("mock_output.{}", kind.default_extension()));
                let body = format!("{} placeholder\nsource: {subject}\n", request.step_type);
                fs::write(&path, body).map_err(|e| {
                    AdapterError::provider(format!("cannot write {}: {e}", path.display()))
                })?;
                with_media_meta(AdapterOutput::path(path), kind, request)
            }
            None => {
                return Err(AdapterError::validation(format!(
                    "{} is not served by adapters",
                    request.step_type
                )));
            }
        };

        Ok(output.with_meta("mock", true))
    }
}

/// Short description of what this call works from, for placeholder bodies.
fn describe_input(request: &AdapterRequest) -> String {
    if let Some(prompt) = request.prompt() {
        return prompt.to_string();
    }
    match &request.input {
        Some(artifact) => match artifact.local_path() {
            Some(path) => path.display().to_string(),
            None => format!("{} artifact", artifact.kind),
        },
        None => "nothing".to_string(),
    }
}

fn text_for(step_type: StepType, subject: &str) -> String {
    match step_type {
        StepType::PromptGeneration => format!("{subject}, cinematic lighting, highly detailed"),
        StepType::SpeechToText => format!("[transcript of {subject}]"),
        StepType::ImageUnderstanding => format!("[description of {subject}]"),
        _ => subject.to_string(),
    }
}

/// Resolution for images and video, duration for audio and video. Dimensions
/// carry over from the input unless params override them.
fn with_media_meta(output: AdapterOutput, kind: ArtifactKind, request: &AdapterRequest) -> AdapterOutput {
    let inherited = |key: &str| {
        request
            .input
            .as_ref()
            .and_then(|a| a.meta(key))
            .and_then(|v| v.as_f64())
    };
    let mut output = output;

    if matches!(kind, ArtifactKind::Image | ArtifactKind::Video) {
        let mut width = request
            .params
            .u64_param("width")
            .or_else(|| inherited("width").map(|w| w as u64))
            .unwrap_or(DEFAULT_WIDTH);
        let mut height = request
            .params
            .u64_param("height")
            .or_else(|| inherited("height").map(|h| h as u64))
            .unwrap_or(DEFAULT_HEIGHT);
        if matches!(request.step_type, StepType::UpscaleImage | StepType::UpscaleVideo) {
            let scale = request.params.u64_param("scale").unwrap_or(2);
            width *= scale;
            height *= scale;
        }
        output = output.with_meta("width", width as i64).with_meta("height", height as i64);
    }

    if matches!(kind, ArtifactKind::Audio | ArtifactKind::Video) {
        let duration = request
            .params
            .f64_param("duration")
            .or_else(|| inherited("duration"))
            .unwrap_or(DEFAULT_DURATION_SECS);
        output = output.with_meta("duration", duration);
    }

    output
}
