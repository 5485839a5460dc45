//! Static artifact-kind compatibility checks.
//!
//! Walks a [`ChainConfig`] tracking what kind of artifact would reach each
//! step, without invoking any adapter. The first mismatch is fatal; softer
//! observations come back as warnings.

use cf_core::step::PARAM_INDEX;
use cf_core::{
    describe_kinds, ArtifactKind, ChainConfig, Error, MergeStrategy, ParallelGroupSpec, ParamsExt,
    Result, StepEntry, StepSpec, StepType,
};

/// What the chain carries between two steps.
#[derive(Debug, Clone, PartialEq)]
enum Cursor {
    /// A single artifact of a known kind.
    Known(ArtifactKind),
    /// A `collect_all` collection; one slot per member, `None` for disabled.
    Collected(Vec<Option<ArtifactKind>>),
    /// One of several kinds, decided at runtime (first_success/best_quality
    /// over heterogeneous members).
    Mixed(Vec<ArtifactKind>),
}

impl Cursor {
    fn describe(&self) -> String {
        match self {
            Cursor::Known(kind) => kind.to_string(),
            Cursor::Collected(_) => "collection".to_string(),
            Cursor::Mixed(kinds) => format!("one of {}", describe_kinds(kinds)),
        }
    }

    fn accepted_by(&self, step_type: StepType) -> bool {
        match self {
            Cursor::Known(kind) => step_type.accepts_kind(*kind),
            Cursor::Collected(_) => step_type.accepts_kind(ArtifactKind::StructuredData),
            Cursor::Mixed(kinds) => kinds.iter().all(|k| step_type.accepts_kind(*k)),
        }
    }
}

/// Checks that every step accepts what the previous one produces.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompatibilityValidator;

impl CompatibilityValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate `config`, returning non-fatal warnings on success.
    pub fn validate(&self, config: &ChainConfig) -> Result<Vec<String>> {
        let mut warnings = config.validate();
        let mut cursor = Cursor::Known(config.input_kind());

        for (index, entry) in config.steps.iter().enumerate() {
            if !entry.enabled() {
                warnings.push(format!(
                    "step {index} ({}) is disabled; its input passes through unchanged",
                    entry.type_tag()
                ));
                continue;
            }

            let next = match entry {
                StepEntry::Step(spec) => step_output(index, spec, &cursor)?,
                StepEntry::Group(group) => group_output(index, group, &cursor)?,
            };

            if entry.continue_on_error() && next != cursor {
                warnings.push(format!(
                    "step {index} ({}) has continue_on_error but changes the artifact kind from {} to {}; a failure would feed {} to the next step",
                    entry.type_tag(),
                    cursor.describe(),
                    next.describe(),
                    cursor.describe(),
                ));
            }
            cursor = next;
        }

        if matches!(cursor, Cursor::Collected(_)) {
            warnings.push(
                "the chain ends on a collection; add a select step to pick a single output".into(),
            );
        }

        for warning in &warnings {
            tracing::debug!(chain = %config.name, "Validation warning: {warning}");
        }
        Ok(warnings)
    }
}

fn mismatch(index: usize, step_type: StepType, cursor: &Cursor) -> Error {
    Error::IncompatibleChain {
        step_index: index,
        step_type: step_type.to_string(),
        expected: describe_kinds(step_type.accepts()),
        found: cursor.describe(),
    }
}

fn step_output(index: usize, spec: &StepSpec, cursor: &Cursor) -> Result<Cursor> {
    if spec.step_type == StepType::Select {
        return select_output(index, spec, cursor);
    }
    if !cursor.accepted_by(spec.step_type) {
        return Err(mismatch(index, spec.step_type, cursor));
    }
    Ok(produced(spec.step_type, cursor))
}

/// Kind a step hands on. A step without a fixed output kind passes its input through.
fn produced(step_type: StepType, cursor: &Cursor) -> Cursor {
    match step_type.produces() {
        Some(kind) => Cursor::Known(kind),
        None => cursor.clone(),
    }
}

fn select_output(index: usize, spec: &StepSpec, cursor: &Cursor) -> Result<Cursor> {
    let Cursor::Collected(slots) = cursor else {
        return Err(mismatch(index, spec.step_type, cursor));
    };

    if let Some(pick) = spec.params.u64_param(PARAM_INDEX) {
        let pick = pick as usize;
        return match slots.get(pick) {
            Some(Some(kind)) => Ok(Cursor::Known(*kind)),
            Some(None) => Err(Error::config(format!(
                "step {index} (select): member {pick} of the collection is disabled"
            ))),
            None => Err(Error::config(format!(
                "step {index} (select): index {pick} is out of range for a collection of {}",
                slots.len()
            ))),
        };
    }

    let mut kinds: Vec<ArtifactKind> = slots.iter().flatten().copied().collect();
    kinds.sort();
    kinds.dedup();
    match kinds.as_slice() {
        [kind] => Ok(Cursor::Known(*kind)),
        [] => Err(Error::config(format!(
            "step {index} (select): the collection has no enabled members"
        ))),
        _ => Err(Error::config(format!(
            "step {index} (select): members produce {}; set params.{PARAM_INDEX} to pick one",
            describe_kinds(&kinds)
        ))),
    }
}

fn group_output(index: usize, group: &ParallelGroupSpec, cursor: &Cursor) -> Result<Cursor> {
    let mut slots = Vec::with_capacity(group.members.len());
    for member in &group.members {
        if !member.enabled {
            slots.push(None);
            continue;
        }
        if !cursor.accepted_by(member.step_type) {
            return Err(mismatch(index, member.step_type, cursor));
        }
        let out = match produced(member.step_type, cursor) {
            Cursor::Known(kind) => kind,
            // Pass-through members only reach here with a single known kind.
            _ => cursor_kind(cursor),
        };
        slots.push(Some(out));
    }

    // Every member disabled: the group is skipped at runtime.
    if slots.iter().all(Option::is_none) {
        return Ok(cursor.clone());
    }
    if group.merge_strategy == MergeStrategy::CollectAll {
        return Ok(Cursor::Collected(slots));
    }

    let mut kinds: Vec<ArtifactKind> = Vec::new();
    for kind in slots.into_iter().flatten() {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(match kinds.as_slice() {
        [kind] => Cursor::Known(*kind),
        _ => Cursor::Mixed(kinds),
    })
}

fn cursor_kind(cursor: &Cursor) -> ArtifactKind {
    match cursor {
        Cursor::Known(kind) => *kind,
        Cursor::Collected(_) => ArtifactKind::StructuredData,
        Cursor::Mixed(kinds) => kinds.first().copied().unwrap_or(ArtifactKind::StructuredData),
    }
}
