use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chainforge")]
#[command(author, version, about = "Declarative content-generation chains with cost budgets")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a chain definition to completion
    RunChain {
        /// Chain definition file (YAML, or JSON by extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Skip the cost confirmation prompt
        #[arg(long)]
        no_confirm: bool,

        /// Use this text as the initial input instead of the definition's
        #[arg(long)]
        input_text: Option<String>,

        /// Budget ceiling in USD, overriding the definition's
        #[arg(long, env = "CHAINFORGE_BUDGET")]
        budget: Option<f64>,
    },

    /// List registered step types and models (no adapter is invoked)
    ListModels {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Only show models for this step type
        #[arg(long)]
        step_type: Option<String>,
    },

    /// Load, check and price a chain definition without running it
    Validate {
        /// Chain definition file
        #[arg(short, long)]
        config: PathBuf,

        /// Budget ceiling in USD to check the estimate against
        #[arg(long, env = "CHAINFORGE_BUDGET")]
        budget: Option<f64>,
    },

    /// Print a stored execution report
    Report {
        /// Path to a chain_report_*.json file
        path: PathBuf,

        /// Print the raw JSON
        #[arg(long)]
        json: bool,
    },
}
