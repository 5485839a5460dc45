mod cli;

use std::io::{BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use tokio_util::sync::CancellationToken;

use cf_core::{Artifact, ArtifactData, ChainResult, CostEstimate, StepResult, StepType};
use cf_pipeline::{load_report, PipelineManager, PreparedChain, ProgressSender, RunOptions};
use chainforge::default_registry;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "chainforge=debug,cf_pipeline=debug,cf_core=debug".to_string()
        } else {
            "chainforge=info,cf_pipeline=info,cf_core=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let outcome = match cli.command {
        Commands::RunChain {
            config,
            no_confirm,
            input_text,
            budget,
        } => run_chain(
            &config,
            RunOptions {
                input_text,
                no_confirm,
                budget_override: budget,
            },
        ),
        Commands::ListModels { json, step_type } => list_models(json, step_type.as_deref()),
        Commands::Validate { config, budget } => validate_chain(&config, budget),
        Commands::Report { path, json } => show_report(&path, json),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = e
                .downcast_ref::<cf_core::Error>()
                .map_or(1, cf_core::Error::exit_code);
            ExitCode::from(code)
        }
    }
}

fn run_chain(config: &Path, options: RunOptions) -> Result<ExitCode> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling chain after the current step");
                interrupt.cancel();
            }
        });

        let manager = PipelineManager::new(Arc::new(default_registry()))
            .with_cancellation(cancel)
            .with_progress(ProgressSender::new(|p| {
                tracing::debug!(
                    "progress {}/{} ({:.0}%): {} {}",
                    p.completed,
                    p.total,
                    p.percent(),
                    p.label,
                    p.status
                );
            }))
            .with_confirmation(confirm_on_stdin);

        let prepared = manager.validate(config, &options)?;
        print_prepared(&prepared);

        let result = manager.execute(prepared, &options).await?;
        println!();
        print_result(&result);

        let code = if result.is_completed() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        };
        Ok::<_, anyhow::Error>(code)
    })
}

fn confirm_on_stdin(estimate: &CostEstimate, budget: Option<f64>) -> bool {
    let budget = budget.map(|b| format!(", budget ${b:.4}")).unwrap_or_default();
    print!(
        "Estimated cost ${:.4} (up to ${:.4}{}). Proceed? [y/N] ",
        estimate.total, estimate.upper_bound, budget
    );
    if std::io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
    }
}

fn list_models(json: bool, step_type: Option<&str>) -> Result<ExitCode> {
    let filter = step_type
        .map(|s| s.parse::<StepType>().map_err(cf_core::Error::config))
        .transpose()?;

    let manager = PipelineManager::new(Arc::new(default_registry()));
    let models: Vec<_> = manager
        .list_models()
        .into_iter()
        .filter(|m| filter.map_or(true, |t| m.step_type == t))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<20} {:<8} {:>9}  {:<22} DESCRIPTION",
        "STEP TYPE", "MODEL", "COST", "ACCEPTS -> PRODUCES"
    );
    for m in &models {
        let io = format!(
            "{} -> {}",
            cf_core::describe_kinds(&m.accepts),
            m.produces.map(|k| k.to_string()).unwrap_or_else(|| "-".into())
        );
        let default = if m.is_default { " (default)" } else { "" };
        println!(
            "{:<20} {:<8} ${:>8.4}  {:<22} {}{}",
            m.step_type.as_str(), m.model, m.cost_per_call, io, m.description, default
        );
        if !m.required_params.is_empty() {
            println!("{:<31}requires: {}", "", m.required_params.join(", "));
        }
    }
    if filter.map_or(true, |t| t == StepType::Select) {
        println!(
            "{:<20} {:<8} ${:>8.4}  {:<22} Pick one member of a collect_all group",
            StepType::Select.as_str(),
            "builtin",
            0.0,
            "structured_data -> *"
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn validate_chain(config: &Path, budget: Option<f64>) -> Result<ExitCode> {
    println!("Validating chain: {}", config.display());
    let manager = PipelineManager::new(Arc::new(default_registry()));
    let options = RunOptions {
        budget_override: budget,
        no_confirm: true,
        ..RunOptions::default()
    };
    let prepared = manager.validate(config, &options)?;
    println!("✓ Chain is valid");
    print_prepared(&prepared);
    Ok(ExitCode::SUCCESS)
}

fn show_report(path: &Path, json: bool) -> Result<ExitCode> {
    let result = load_report(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_prepared(prepared: &PreparedChain) {
    let config = &prepared.config;
    println!("Chain: {}", config.name);
    if let Some(description) = &config.description {
        println!("  {description}");
    }
    println!("Steps: {}", config.steps.len());
    for step in &prepared.estimate.per_step {
        println!("  {}. {:<40} ${:.4}", step.index, step.label, step.estimate);
    }
    print!("Estimated cost: ${:.4}", prepared.estimate.total);
    if prepared.estimate.upper_bound > prepared.estimate.total {
        print!(" (up to ${:.4})", prepared.estimate.upper_bound);
    }
    match config.budget {
        Some(budget) => println!(", budget ${budget:.4}"),
        None => println!(),
    }
    for warning in &prepared.warnings {
        println!("  warning: {warning}");
    }
}

fn print_result(result: &ChainResult) {
    println!("Run {} ({})", result.run_id, result.chain_name);
    for step in &result.steps {
        print_step(step, 1);
    }
    println!("Status: {}", result.status);
    if let Some(reason) = &result.abort_reason {
        println!("Reason: {reason}");
    }
    println!("Total cost: ${:.4}", result.total_cost);
    println!("Duration: {:.1}s", result.total_duration_secs);
    if let Some(output) = &result.final_output {
        println!("Final output: {}", describe_artifact(output));
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    if let Some(path) = &result.report_path {
        println!("Report: {}", path.display());
    }
}

fn print_step(step: &StepResult, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}[{}] {} {}  ${:.4}  {:.1}s",
        step.status,
        step.position,
        step.label(),
        step.cost,
        step.duration_secs
    );
    if let Some(error) = &step.error {
        println!("{indent}    {error}");
    }
    for path in &step.saved_paths {
        println!("{indent}    saved {}", path.display());
    }
    for member in &step.members {
        print_step(member, depth + 1);
    }
}

fn describe_artifact(artifact: &Artifact) -> String {
    match &artifact.data {
        ArtifactData::Path(p) => format!("{} {}", artifact.kind, p.display()),
        ArtifactData::Url(u) => format!("{} {u}", artifact.kind),
        ArtifactData::Text(t) => {
            let mut preview: String = t.chars().take(80).collect();
            if preview.len() < t.len() {
                preview.push_str("...");
            }
            format!("text \"{preview}\"")
        }
        ArtifactData::Inline(bytes) => format!("{} ({} bytes inline)", artifact.kind, bytes.len()),
        ArtifactData::Collection(items) => format!(
            "collection of {} ({} succeeded)",
            items.len(),
            items.iter().filter(|i| i.is_some()).count()
        ),
    }
}
