//! Arbitrary external command adapter.
//!
//! A general escape hatch for wiring local tools or provider CLIs into a
//! chain. Params:
//!
//! - `command` (required): program name or path
//! - `args`: list of arguments, with `{input}`, `{output}`, `{workspace}`
//!   and `{prompt}` substituted
//! - `output_extension`: extension of `{output}` (defaults per kind)
//! - `cost`: USD billed per call (defaults to 0)
//!
//! Text-producing steps may print to stdout instead of writing `{output}`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use cf_core::{AdapterError, ArtifactData, ArtifactKind, Params, ParamsExt, StepType};
use cf_pipeline::{AdapterInfo, AdapterOutput, AdapterRequest, StepAdapter};

/// Model name the exec adapter registers under.
pub const MODEL: &str = "exec";

/// `{name}` substitution over command arguments.
#[derive(Debug, Default, Clone)]
struct Template {
    vars: HashMap<&'static str, String>,
}

impl Template {
    fn with_var(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.vars.insert(key, value.into());
        self
    }

    fn substitute(&self, template: &str) -> String {
        let mut result = template.to_string();
        for (key, value) in &self.vars {
            result = result.replace(&format!("{{{key}}}"), value);
        }
        result
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExecAdapter;

impl ExecAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl StepAdapter for ExecAdapter {
    fn describe(&self, step_type: StepType) -> AdapterInfo {
        AdapterInfo::new(format!("Run an external command as {step_type}"), 0.0).requires("command")
    }

    fn estimate_cost(&self, _step_type: StepType, params: &Params) -> f64 {
        params.f64_param("cost").unwrap_or(0.0)
    }

    fn execute(&self, request: &AdapterRequest) -> Result<AdapterOutput, AdapterError> {
        let command = request
            .params
            .str_param("command")
            .ok_or_else(|| AdapterError::validation("missing required param 'command'"))?;
        let program = resolve_program(command)?;
        let kind = request.step_type.produces().ok_or_else(|| {
            AdapterError::validation(format!("{} is not served by adapters", request.step_type))
        })?;

        let extension = request
            .params
            .str_param("output_extension")
            .map(|e| e.trim_start_matches('.').to_string())
            .unwrap_or_else(|| kind.default_extension().to_string());
        let output_path = request.scratch_dir.join(format!("output.{extension}"));
        let input = stage_input(request)?;

        let template = Template::default()
            .with_var("input", input)
            .with_var("output", output_path.display().to_string())
            .with_var("workspace", request.scratch_dir.display().to_string())
            .with_var("prompt", request.prompt().unwrap_or_default());
        let args: Vec<String> = args_param(&request.params)?
            .iter()
            .map(|a| template.substitute(a))
            .collect();

        tracing::info!(step = %request.label, "exec: {} {}", program.display(), args.join(" "));

        let output = Command::new(&program)
            .args(&args)
            .current_dir(&request.scratch_dir)
            .output()
            .map_err(|e| AdapterError::provider(format!("failed to spawn {command}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::provider(format!(
                "{command} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let cost = request.params.f64_param("cost").unwrap_or(0.0);
        if output_path.is_file() {
            return Ok(AdapterOutput::path(output_path).with_cost(cost));
        }
        if kind == ArtifactKind::Text {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok(AdapterOutput::text(stdout).with_cost(cost));
        }
        Err(AdapterError::provider(format!(
            "{command} succeeded but did not write {}",
            output_path.display()
        )))
    }
}

/// Locate `command` on PATH unless it is already a path.
fn resolve_program(command: &str) -> Result<PathBuf, AdapterError> {
    let as_path = Path::new(command);
    if as_path.components().count() > 1 {
        if as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
        return Err(AdapterError::validation(format!("{command} does not exist")));
    }
    which::which(command)
        .map_err(|_| AdapterError::validation(format!("{command} not found in PATH")))
}

fn args_param(params: &Params) -> Result<Vec<String>, AdapterError> {
    match params.get("args") {
        None => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => Ok(s.clone()),
                serde_json::Value::Number(n) => Ok(n.to_string()),
                other => Err(AdapterError::validation(format!(
                    "'args' entries must be strings, got {other}"
                ))),
            })
            .collect(),
        Some(serde_json::Value::String(s)) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Some(other) => Err(AdapterError::validation(format!(
            "'args' must be a list, got {other}"
        ))),
    }
}

/// Value for `{input}`: a local path, a URL, or a scratch file holding inline
/// content. Empty when the step has no input.
fn stage_input(request: &AdapterRequest) -> Result<String, AdapterError> {
    let Some(artifact) = &request.input else {
        return Ok(String::new());
    };
    let write = |name: String, bytes: &[u8]| -> Result<String, AdapterError> {
        let path = request.scratch_dir.join(name);
        fs::write(&path, bytes)
            .map_err(|e| AdapterError::provider(format!("cannot stage input: {e}")))?;
        Ok(path.display().to_string())
    };
    match &artifact.data {
        ArtifactData::Path(p) => Ok(p.display().to_string()),
        ArtifactData::Url(u) => Ok(u.clone()),
        ArtifactData::Text(t) => write("input.txt".to_string(), t.as_bytes()),
        ArtifactData::Inline(bytes) => write(format!("input.{}", artifact.file_extension()), bytes),
        ArtifactData::Collection(_) => Err(AdapterError::validation(
            "exec cannot consume a collection; add a select step first",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cf_core::Artifact;

    fn request(step_type: StepType, input: Option<Artifact>, params: serde_json::Value) -> (AdapterRequest, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let params = match params {
            serde_json::Value::Object(map) => map,
            _ => Params::new(),
        };
        let request = AdapterRequest {
            step_type,
            model: MODEL.into(),
            input,
            params,
            scratch_dir: dir.path().to_path_buf(),
            label: format!("0 {step_type}/exec"),
        };
        (request, dir)
    }

    #[test]
    fn template_substitutes_known_vars() {
        let t = Template::default()
            .with_var("input", "/in.png")
            .with_var("output", "/out.png");
        assert_eq!(t.substitute("-i {input} -o {output} {other}"), "-i /in.png -o /out.png {other}");
    }

    #[test]
    fn missing_program_is_a_validation_error() {
        let (req, _dir) = request(
            StepType::TextToImage,
            None,
            serde_json::json!({"command": "nonexistent_tool_xyz_12345"}),
        );
        let err = ExecAdapter::new().execute(&req).unwrap_err();
        assert_matches!(err, AdapterError::Validation(_));
    }

    #[test]
    fn requires_command_param() {
        let info = ExecAdapter::new().describe(StepType::UpscaleImage);
        assert_eq!(info.required_params, vec!["command".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn copies_input_to_output() {
        let (req, dir) = request(
            StepType::UpscaleImage,
            None,
            serde_json::json!({"command": "cp", "args": ["{input}", "{output}"], "cost": 0.5}),
        );
        let source = dir.path().join("source.png");
        fs::write(&source, b"pixels").unwrap();
        let req = AdapterRequest {
            input: Some(Artifact::from_path(ArtifactKind::Image, &source)),
            ..req
        };

        let output = ExecAdapter::new().execute(&req).unwrap();
        assert_eq!(output.cost, Some(0.5));
        let artifact = output.into_artifact(ArtifactKind::Image);
        assert_eq!(fs::read(artifact.local_path().unwrap()).unwrap(), b"pixels");
    }

    #[cfg(unix)]
    #[test]
    fn text_steps_fall_back_to_stdout() {
        let (req, _dir) = request(
            StepType::PromptGeneration,
            Some(Artifact::text("a fox")),
            serde_json::json!({"command": "echo", "args": ["refined: {prompt}"]}),
        );
        let artifact = ExecAdapter::new()
            .execute(&req)
            .unwrap()
            .into_artifact(ArtifactKind::Text);
        assert_eq!(artifact.as_text(), Some("refined: a fox"));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_provider_error() {
        let (req, _dir) = request(StepType::TextToImage, None, serde_json::json!({"command": "false"}));
        let err = ExecAdapter::new().execute(&req).unwrap_err();
        assert_matches!(err, AdapterError::Provider(_));
    }
}
