//! Durable execution records.
//!
//! Every run writes one pretty-printed JSON [`ChainResult`] into the output
//! directory, completed or aborted.

use std::fs;
use std::path::{Path, PathBuf};

use cf_core::{ChainResult, Error, Result};

/// `chain_report_<timestamp>_<run id prefix>.json`
pub fn report_file_name(result: &ChainResult) -> String {
    format!(
        "chain_report_{}_{}.json",
        result.started_at.format("%Y%m%d_%H%M%S"),
        result.run_id.short()
    )
}

/// Write `result` into `output_dir`, recording the path on the result.
pub fn write_report(result: &mut ChainResult, output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(report_file_name(result));
    result.report_path = Some(path.clone());
    let json = serde_json::to_string_pretty(result)?;
    fs::write(&path, json)?;
    tracing::info!(path = %path.display(), status = %result.status, "Wrote chain report");
    Ok(path)
}

/// Read a stored execution record back.
pub fn load_report(path: &Path) -> Result<ChainResult> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Serialization(format!("{}: {e}", path.display())))
}
