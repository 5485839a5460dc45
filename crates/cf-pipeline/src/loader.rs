//! ConfigLoader: pipeline definition files to validated [`ChainConfig`]s.
//!
//! Parsing is pure: apart from reading the source file the loader never
//! touches the filesystem. Models are resolved against the
//! [`AdapterRegistry`] so every step is known to have an adapter before any
//! execution begins.

use std::path::Path;

use cf_core::config::{expand_path, parse_document, ChainDocument, StepDocument};
use cf_core::step::{MAX_TIMEOUT_SECS, PARAM_INDEX, PARAM_SCORE_BY, PARAM_TIMEOUT_SECS};
use cf_core::{
    ChainConfig, ConfigFormat, Error, MergeStrategy, ParallelGroupSpec, Params, ParamsExt, Result,
    StepEntry, StepSpec, StepType,
};

use crate::registry::AdapterRegistry;

/// Model name recorded for built-in steps.
pub const BUILTIN_MODEL: &str = "builtin";

/// Loads and structurally validates pipeline definitions.
#[derive(Debug, Clone, Copy)]
pub struct ConfigLoader<'a> {
    registry: &'a AdapterRegistry,
}

impl<'a> ConfigLoader<'a> {
    pub fn new(registry: &'a AdapterRegistry) -> Self {
        Self { registry }
    }

    /// Load a definition file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load(&self, path: &Path) -> Result<ChainConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "Loading chain definition");
        self.load_str(&content, ConfigFormat::from_path(path))
    }

    pub fn load_str(&self, content: &str, format: ConfigFormat) -> Result<ChainConfig> {
        let document = parse_document(content, format)?;
        self.from_document(document)
    }

    /// Validate a parsed document and resolve defaults.
    pub fn from_document(&self, document: ChainDocument) -> Result<ChainConfig> {
        if document.name.trim().is_empty() {
            return Err(Error::config("'name' must not be empty"));
        }
        if document.steps.is_empty() {
            return Err(Error::config("'steps' must contain at least one step"));
        }
        ChainConfig::check_budget(document.budget)?;

        let mut steps = Vec::with_capacity(document.steps.len());
        for (index, step) in document.steps.into_iter().enumerate() {
            let at = format!("steps[{index}]");
            let entry = if step.is_group() {
                StepEntry::Group(self.group(&at, step)?)
            } else {
                StepEntry::Step(self.step(&at, step)?)
            };
            steps.push(entry);
        }

        let initial_input = document
            .initial_input
            .map(|input| input.into_artifact())
            .transpose()?;

        Ok(ChainConfig {
            name: document.name,
            description: document.description,
            initial_input,
            steps,
            output_dir: expand_path(&document.output_dir),
            temp_dir: document.temp_dir.as_deref().map(expand_path),
            cleanup_temp: document.cleanup_temp,
            save_intermediates: document.save_intermediates,
            budget: document.budget,
        })
    }

    fn step(&self, at: &str, doc: StepDocument) -> Result<StepSpec> {
        if doc.members.is_some() || doc.max_workers.is_some() || doc.merge_strategy.is_some() {
            return Err(Error::config(format!(
                "{at}: 'members', 'max_workers' and 'merge_strategy' are only valid on a parallel_group"
            )));
        }
        let step_type: StepType = doc
            .step_type
            .parse()
            .map_err(|e: String| Error::config(format!("{at}: {e}")))?;
        check_reserved_params(at, &doc.params)?;

        if step_type.is_builtin() {
            if let Some(value) = doc.params.get(PARAM_INDEX) {
                if doc.params.u64_param(PARAM_INDEX).is_none() {
                    return Err(Error::config(format!(
                        "{at}: '{PARAM_INDEX}' must be a non-negative integer, got {value}"
                    )));
                }
            }
            return Ok(StepSpec {
                step_type,
                model: doc.model.unwrap_or_else(|| BUILTIN_MODEL.to_string()),
                params: doc.params,
                enabled: doc.enabled,
                output_filename: doc.output_filename,
            });
        }

        let model = match doc.model {
            Some(model) => model,
            None => self
                .registry
                .default_model(step_type)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::config(format!("{at}: no adapter is registered for {step_type}"))
                })?,
        };

        let adapter = self.registry.resolve(step_type, &model)?;
        let info = adapter.describe(step_type);
        for required in &info.required_params {
            if !doc.params.contains_key(required) {
                return Err(Error::config(format!(
                    "{at} ({step_type}/{model}): missing required param '{required}'"
                )));
            }
        }

        Ok(StepSpec {
            step_type,
            model,
            params: doc.params,
            enabled: doc.enabled,
            output_filename: doc.output_filename,
        })
    }

    fn group(&self, at: &str, doc: StepDocument) -> Result<ParallelGroupSpec> {
        if doc.model.is_some() {
            return Err(Error::config(format!(
                "{at}: a parallel_group has no model; set it on each member"
            )));
        }
        let members_doc = doc
            .members
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::config(format!("{at}: a parallel_group needs 'members'")))?;
        check_reserved_params(at, &doc.params)?;

        let mut members = Vec::with_capacity(members_doc.len());
        for (m, member) in members_doc.into_iter().enumerate() {
            let member_at = format!("{at}.members[{m}]");
            if member.is_group() {
                return Err(Error::config(format!(
                    "{member_at}: parallel groups cannot be nested"
                )));
            }
            let spec = self.step(&member_at, member)?;
            if spec.step_type.is_builtin() {
                return Err(Error::config(format!(
                    "{member_at}: '{}' cannot be a group member",
                    spec.step_type
                )));
            }
            members.push(spec);
        }

        let max_workers = doc.max_workers.unwrap_or(members.len());
        if max_workers == 0 {
            return Err(Error::config(format!("{at}: 'max_workers' must be at least 1")));
        }
        let merge_strategy = doc.merge_strategy.unwrap_or_default();
        if merge_strategy == MergeStrategy::BestQuality && doc.params.str_param(PARAM_SCORE_BY).is_none() {
            return Err(Error::config(format!(
                "{at}: best_quality needs params.{PARAM_SCORE_BY} naming a metadata metric"
            )));
        }

        Ok(ParallelGroupSpec {
            members,
            max_workers,
            merge_strategy,
            params: doc.params,
            enabled: doc.enabled,
            output_filename: doc.output_filename,
        })
    }
}

fn check_reserved_params(at: &str, params: &Params) -> Result<()> {
    if let Some(value) = params.get(PARAM_TIMEOUT_SECS) {
        match params.f64_param(PARAM_TIMEOUT_SECS) {
            Some(secs) if secs > 0.0 && secs <= MAX_TIMEOUT_SECS => {}
            _ => {
                return Err(Error::config(format!(
                    "{at}: '{PARAM_TIMEOUT_SECS}' must be a positive number of at most \
                     {MAX_TIMEOUT_SECS} seconds, got {value}"
                )));
            }
        }
    }
    Ok(())
}
