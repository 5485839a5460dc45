//! Per-run filesystem layout.
//!
//! A [`ChainWorkspace`] owns the output directory and the temp directory of
//! one chain run. Steps get index-qualified scratch directories so concurrent
//! group members never collide, and intermediates are written under
//! deterministic names. Dropping the workspace removes temp contents when
//! cleanup is enabled, on every exit path.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use cf_core::config::expand_path;
use cf_core::{Artifact, ArtifactData, ChainConfig, Result, RunId, StepPosition};

/// Filesystem layout of one chain run.
#[derive(Debug)]
pub struct ChainWorkspace {
    output_dir: PathBuf,
    temp_dir: PathBuf,
    /// The temp dir did not exist before this run.
    owns_temp_dir: bool,
    cleanup: bool,
    scratch_dirs: Mutex<Vec<PathBuf>>,
}

impl ChainWorkspace {
    /// Prepare the directories for a run of `config`.
    ///
    /// Without an explicit `temp_dir`, a `chainforge-<run id>` directory is
    /// created under the system temp dir.
    pub fn new(config: &ChainConfig, run_id: &RunId) -> Result<Self> {
        let output_dir = expand_path(&config.output_dir);
        let temp_dir = match &config.temp_dir {
            Some(dir) => expand_path(dir),
            None => std::env::temp_dir().join(format!("chainforge-{}", run_id.short())),
        };

        fs::create_dir_all(&output_dir)?;
        let owns_temp_dir = !temp_dir.exists();
        fs::create_dir_all(&temp_dir)?;

        tracing::debug!(
            output_dir = %output_dir.display(),
            temp_dir = %temp_dir.display(),
            "Prepared chain workspace"
        );

        Ok(Self {
            output_dir,
            temp_dir,
            owns_temp_dir,
            cleanup: config.cleanup_temp,
            scratch_dirs: Mutex::new(Vec::new()),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Scratch directory for the step at `position`, created on demand.
    pub fn scratch_dir(&self, position: StepPosition) -> Result<PathBuf> {
        let dir = self.temp_dir.join(position.file_prefix());
        fs::create_dir_all(&dir)?;
        let mut dirs = self.scratch_dirs.lock();
        if !dirs.contains(&dir) {
            dirs.push(dir.clone());
        }
        Ok(dir)
    }

    /// Whether `artifact` points at files under the temp dir, which cleanup
    /// would remove.
    pub fn holds(&self, artifact: &Artifact) -> bool {
        match &artifact.data {
            ArtifactData::Path(path) => path.starts_with(&self.temp_dir),
            ArtifactData::Collection(items) => items.iter().flatten().any(|a| self.holds(a)),
            _ => false,
        }
    }

    /// Deterministic intermediate file name: `<prefix>_<type>.<ext>`.
    pub fn intermediate_name(position: StepPosition, type_tag: &str, artifact: &Artifact) -> String {
        format!(
            "{}_{}.{}",
            position.file_prefix(),
            type_tag,
            artifact.file_extension()
        )
    }

    /// Write `artifact` into the output directory as `file_name`.
    ///
    /// Local files are copied, URLs are stored as pointer files, inline
    /// content is written as-is and collections as JSON.
    pub fn persist(&self, artifact: &Artifact, file_name: &str) -> Result<PathBuf> {
        let dest = self.output_dir.join(file_name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match &artifact.data {
            ArtifactData::Path(src) => {
                fs::copy(src, &dest)?;
            }
            ArtifactData::Url(url) => fs::write(&dest, format!("{url}\n"))?,
            ArtifactData::Text(text) => fs::write(&dest, text)?,
            ArtifactData::Inline(bytes) => fs::write(&dest, bytes)?,
            ArtifactData::Collection(_) => {
                let json = serde_json::to_string_pretty(artifact)?;
                fs::write(&dest, json)?;
            }
        }
        tracing::debug!(path = %dest.display(), kind = %artifact.kind, "Persisted artifact");
        Ok(dest)
    }

    fn remove_temp(&self) {
        if self.owns_temp_dir {
            if let Err(e) = fs::remove_dir_all(&self.temp_dir) {
                tracing::warn!("Failed to remove temp dir {}: {e}", self.temp_dir.display());
            }
            return;
        }
        for dir in self.scratch_dirs.lock().drain(..) {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!("Failed to remove scratch dir {}: {e}", dir.display());
            }
        }
    }
}

impl Drop for ChainWorkspace {
    fn drop(&mut self) {
        if self.cleanup {
            tracing::debug!(temp_dir = %self.temp_dir.display(), "Cleaning up temp files");
            self.remove_temp();
        }
    }
}
