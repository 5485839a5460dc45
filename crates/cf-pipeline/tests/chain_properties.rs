//! Engine property tests
//!
//! Whole-chain behaviour checked against a scripted adapter that records
//! every invocation: dispatch order, group ordering and cancellation,
//! budget and compatibility gates, continue-on-error and persistence.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use cf_core::{
    AdapterError, Artifact, ArtifactData, ChainConfig, ChainStatus, Error, MergeStrategy,
    ParallelGroupSpec, ParamsExt, RunId, StepEntry, StepSpec, StepStatus, StepType,
};
use cf_pipeline::{
    AdapterInfo, AdapterOutput, AdapterRegistry, AdapterRequest, ChainWorkspace,
    ParallelGroupExecutor, PipelineManager, RunOptions, StepAdapter, StepDispatcher,
};

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq)]
struct Call {
    step_type: StepType,
    tag: String,
    /// `tag` metadata of the input artifact, when it had one.
    input_tag: Option<String>,
}

/// Records calls; behaviour is driven by params:
/// `tag`, `delay_ms`, `fail`, `cost` (the estimate) and `actual_cost`.
#[derive(Default)]
struct Probe {
    calls: Mutex<Vec<Call>>,
}

impl Probe {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn tags(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.tag).collect()
    }
}

impl StepAdapter for Probe {
    fn describe(&self, _step_type: StepType) -> AdapterInfo {
        AdapterInfo::new("recording probe", 0.01)
    }

    fn estimate_cost(&self, _step_type: StepType, params: &cf_core::Params) -> f64 {
        params.f64_param("cost").unwrap_or(0.01)
    }

    fn execute(&self, request: &AdapterRequest) -> Result<AdapterOutput, AdapterError> {
        let tag = request.params.str_param("tag").unwrap_or("-").to_string();
        self.calls.lock().push(Call {
            step_type: request.step_type,
            tag: tag.clone(),
            input_tag: request
                .input
                .as_ref()
                .and_then(|a| a.meta("tag"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
        });

        if let Some(ms) = request.params.u64_param("delay_ms") {
            std::thread::sleep(Duration::from_millis(ms));
        }
        if request.params.flag("fail") {
            return Err(AdapterError::provider(format!("{tag} was told to fail")));
        }

        let path = request.scratch_dir.join(format!("{tag}.bin"));
        std::fs::write(&path, tag.as_bytes()).map_err(|e| AdapterError::provider(e.to_string()))?;
        let mut output = AdapterOutput::path(path).with_meta("tag", tag);
        if let Some(actual) = request.params.f64_param("actual_cost") {
            output = output.with_cost(actual);
        }
        Ok(output)
    }
}

fn registry(probe: &Arc<Probe>) -> Arc<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    let adapter: Arc<dyn StepAdapter> = probe.clone();
    registry.register_all(&StepType::ALL[..11], "probe", adapter);
    Arc::new(registry)
}

fn step(step_type: StepType, tag: &str) -> StepSpec {
    StepSpec::new(step_type, "probe").with_param("tag", tag)
}

fn chain(root: &Path, steps: Vec<StepEntry>) -> ChainConfig {
    ChainConfig::new("properties", steps)
        .with_output_dir(root.join("out"))
        .with_temp_dir(root.join("tmp"))
        .with_initial_input(Artifact::text("a paper boat on a canal"))
}

fn group_executor(probe: &Arc<Probe>, root: &Path) -> ParallelGroupExecutor {
    let config = chain(root, Vec::new());
    let workspace = Arc::new(ChainWorkspace::new(&config, &RunId::new()).unwrap());
    ParallelGroupExecutor::new(StepDispatcher::new(registry(probe), workspace))
}

#[tokio::test]
async fn test_sequential_dispatch_once_per_enabled_step_in_order() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![
            StepEntry::Step(step(StepType::TextToImage, "a")),
            StepEntry::Step(step(StepType::ImageToImage, "b").with_enabled(false)),
            StepEntry::Step(step(StepType::UpscaleImage, "c")),
            StepEntry::Step(step(StepType::ImageToVideo, "d")),
        ],
    );

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();

    assert_eq!(result.status, ChainStatus::Completed);
    assert_eq!(probe.tags(), vec!["a", "c", "d"]);
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
    assert_eq!(result.steps[1].attempt_count, 0);
}

#[tokio::test]
async fn test_collect_all_keeps_member_order_regardless_of_completion() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let groups = group_executor(&probe, root.path());
    let group = ParallelGroupSpec::new(
        vec![
            step(StepType::TextToImage, "slow").with_param("delay_ms", 200),
            step(StepType::TextToImage, "fast").with_param("delay_ms", 5),
            step(StepType::TextToImage, "medium").with_param("delay_ms", 80),
        ],
        MergeStrategy::CollectAll,
    );

    let input = Artifact::text("prompt");
    let result = groups
        .execute(0, &group, Some(&input), None, &CancellationToken::new())
        .await;

    assert!(result.is_success());
    let member_tags: Vec<_> = result
        .members
        .iter()
        .map(|m| m.output.as_ref().and_then(|o| o.meta("tag")).and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    assert_eq!(
        member_tags,
        vec![Some("slow".into()), Some("fast".into()), Some("medium".into())]
    );

    let Some(ArtifactData::Collection(items)) = result.output.as_ref().map(|o| &o.data) else {
        panic!("collect_all should produce a collection");
    };
    assert_eq!(items.len(), 3);
    let item_tags: Vec<_> = items
        .iter()
        .map(|i| i.as_ref().and_then(|a| a.meta("tag")).and_then(|v| v.as_str()))
        .collect();
    assert_eq!(item_tags, vec![Some("slow"), Some("fast"), Some("medium")]);
}

#[tokio::test]
async fn test_first_success_does_not_wait_for_slow_member() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let groups = group_executor(&probe, root.path());
    let group = ParallelGroupSpec::new(
        vec![
            step(StepType::TextToImage, "slow")
                .with_param("delay_ms", 1500)
                .with_param("fail", true),
            step(StepType::TextToImage, "fast").with_param("delay_ms", 10),
        ],
        MergeStrategy::FirstSuccess,
    );

    let input = Artifact::text("prompt");
    let started = Instant::now();
    let result = groups
        .execute(0, &group, Some(&input), None, &CancellationToken::new())
        .await;
    let elapsed = started.elapsed();

    assert!(result.is_success(), "group failed: {:?}", result.error);
    assert!(elapsed < Duration::from_millis(1000), "waited {elapsed:?}");
    let winner = result.output.as_ref().and_then(|o| o.meta("tag")).and_then(|v| v.as_str());
    assert_eq!(winner, Some("fast"));
    assert_eq!(result.members[0].status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_budget_below_estimate_dispatches_nothing() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![StepEntry::Step(
            step(StepType::TextToImage, "pricey").with_param("cost", 0.05),
        )],
    )
    .with_budget(0.01);

    let manager = PipelineManager::new(registry(&probe));
    let err = manager
        .run_config(config, &RunOptions::no_confirm())
        .await
        .unwrap_err();

    match err {
        Error::BudgetExceeded { estimate, budget } => {
            assert!((estimate - 0.05).abs() < 1e-9);
            assert!((budget - 0.01).abs() < 1e-9);
        }
        other => panic!("expected BudgetExceeded, got {other:?}"),
    }
    assert!(probe.calls().is_empty());
}

#[tokio::test]
async fn test_incompatible_chain_names_offending_step() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![
            StepEntry::Step(step(StepType::TextToImage, "img")),
            StepEntry::Step(step(StepType::AddAudio, "audio")),
        ],
    );

    let manager = PipelineManager::new(registry(&probe));
    let err = manager
        .run_config(config, &RunOptions::no_confirm())
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::IncompatibleChain { step_index: 1, .. }),
        "got {err:?}"
    );
    assert!(probe.calls().is_empty());
}

#[tokio::test]
async fn test_continue_on_error_feeds_previous_output_forward() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![
            StepEntry::Step(step(StepType::TextToImage, "first")),
            StepEntry::Step(
                step(StepType::ImageToImage, "second")
                    .with_param("fail", true)
                    .with_param("continue_on_error", true),
            ),
            StepEntry::Step(step(StepType::UpscaleImage, "third")),
        ],
    );

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();

    assert_eq!(result.status, ChainStatus::Completed);
    assert!(!result.aborted);
    assert_eq!(result.steps[1].status, StepStatus::Failed);
    assert_eq!(result.steps[2].status, StepStatus::Success);

    let third = probe.calls().into_iter().find(|c| c.tag == "third").unwrap();
    assert_eq!(third.input_tag.as_deref(), Some("first"));
    assert!(result.warnings.iter().any(|w| w.contains("step 1")));
}

#[test]
fn test_list_models_is_idempotent_and_free() {
    let probe = Arc::new(Probe::default());
    let manager = PipelineManager::new(registry(&probe));

    let first = manager.list_models();
    let second = manager.list_models();

    assert_eq!(first, second);
    assert_eq!(first.len(), 11);
    assert!(probe.calls().is_empty());
}

#[tokio::test]
async fn test_save_intermediates_writes_one_file_per_enabled_step() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![
            StepEntry::Step(step(StepType::TextToImage, "one")),
            StepEntry::Step(step(StepType::UpscaleImage, "two")),
        ],
    )
    .with_save_intermediates(true);

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();
    assert_eq!(result.status, ChainStatus::Completed);

    let mut artifacts: Vec<String> = std::fs::read_dir(root.path().join("out"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with("chain_report_"))
        .collect();
    artifacts.sort();
    assert_eq!(artifacts, vec!["0_text_to_image.bin", "1_upscale_image.bin"]);
    assert!(result.report_path.unwrap().is_file());
}

#[tokio::test]
async fn test_aborted_run_still_writes_report() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![
            StepEntry::Step(step(StepType::TextToImage, "ok")),
            StepEntry::Step(step(StepType::UpscaleImage, "boom").with_param("fail", true)),
            StepEntry::Step(step(StepType::ImageToVideo, "never")),
        ],
    );

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();

    assert_eq!(result.status, ChainStatus::Aborted);
    assert_eq!(probe.tags(), vec!["ok", "boom"]);
    let report = cf_pipeline::load_report(result.report_path.as_deref().unwrap()).unwrap();
    assert!(report.aborted);
    assert_eq!(report.steps.len(), 2);
    assert!(!root.path().join("tmp").exists());
}

#[tokio::test]
async fn test_final_output_survives_temp_cleanup() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![
            StepEntry::Step(step(StepType::TextToImage, "draft")),
            StepEntry::Step(step(StepType::UpscaleImage, "final")),
        ],
    );

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();
    assert_eq!(result.status, ChainStatus::Completed);
    assert!(!root.path().join("tmp").exists());

    let out = root.path().join("out");
    let final_path = result
        .final_output
        .as_ref()
        .and_then(|a| a.local_path())
        .map(Path::to_path_buf)
        .unwrap();
    assert_eq!(final_path, out.join("1_upscale_image.bin"));
    assert_eq!(std::fs::read(&final_path).unwrap(), b"final");
    assert_eq!(result.steps[1].saved_paths, vec![final_path.clone()]);
    assert!(!out.join("0_text_to_image.bin").exists());

    let report = cf_pipeline::load_report(result.report_path.as_deref().unwrap()).unwrap();
    let reported = report.final_output.as_ref().and_then(|a| a.local_path());
    assert_eq!(reported, Some(final_path.as_path()));
}

#[tokio::test]
async fn test_collect_all_final_output_survives_temp_cleanup() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let group = ParallelGroupSpec::new(
        vec![
            step(StepType::TextToImage, "left"),
            step(StepType::TextToImage, "right").with_param("fail", true),
            step(StepType::TextToImage, "centre"),
        ],
        MergeStrategy::CollectAll,
    );
    let config = chain(root.path(), vec![StepEntry::Group(group)]);

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();
    assert_eq!(result.status, ChainStatus::Completed);

    let Some(ArtifactData::Collection(items)) = result.final_output.as_ref().map(|a| &a.data) else {
        panic!("expected a collection");
    };
    let paths: Vec<_> = items
        .iter()
        .map(|i| i.as_ref().and_then(|a| a.local_path()).map(Path::to_path_buf))
        .collect();
    let out = root.path().join("out");
    assert_eq!(
        paths,
        vec![
            Some(out.join("0_0_text_to_image.bin")),
            None,
            Some(out.join("0_2_text_to_image.bin")),
        ]
    );
    assert!(paths.iter().flatten().all(|p| p.is_file()));
}

#[tokio::test]
async fn test_cleanup_disabled_keeps_scratch_files() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![
            StepEntry::Step(step(StepType::TextToImage, "kept")),
            StepEntry::Step(step(StepType::UpscaleImage, "also_kept")),
        ],
    )
    .with_cleanup_temp(false);

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();
    assert_eq!(result.status, ChainStatus::Completed);

    let tmp = root.path().join("tmp");
    assert_eq!(std::fs::read(tmp.join("0").join("kept.bin")).unwrap(), b"kept");
    assert_eq!(std::fs::read(tmp.join("1").join("also_kept.bin")).unwrap(), b"also_kept");
}

#[tokio::test]
async fn test_first_success_group_stays_within_budget() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let group = ParallelGroupSpec::new(
        vec![
            step(StepType::TextToImage, "a").with_param("cost", 0.04).with_param("fail", true),
            step(StepType::TextToImage, "b").with_param("cost", 0.04).with_param("fail", true),
            step(StepType::TextToImage, "c").with_param("cost", 0.04),
        ],
        MergeStrategy::FirstSuccess,
    );
    let config = chain(root.path(), vec![StepEntry::Group(group)]).with_budget(0.05);

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();

    assert_eq!(result.status, ChainStatus::Completed);
    assert!(result.total_cost <= 0.05 + 1e-9, "spent {}", result.total_cost);
    assert_eq!(probe.tags(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_actual_cost_over_budget_aborts_the_chain() {
    let root = tempdir().unwrap();
    let probe = Arc::new(Probe::default());
    let config = chain(
        root.path(),
        vec![
            StepEntry::Step(
                step(StepType::TextToImage, "underquoted")
                    .with_param("cost", 0.01)
                    .with_param("actual_cost", 0.5),
            ),
            StepEntry::Step(step(StepType::UpscaleImage, "never")),
        ],
    )
    .with_budget(0.1);

    let manager = PipelineManager::new(registry(&probe));
    let result = manager.run_config(config, &RunOptions::no_confirm()).await.unwrap();

    assert_eq!(result.status, ChainStatus::Aborted);
    assert!(result.abort_reason.as_deref().unwrap().contains("budget exceeded"));
    assert_eq!(probe.tags(), vec!["underquoted"]);
    assert_eq!(result.steps.len(), 1);
    assert!(result.report_path.unwrap().is_file());
}
