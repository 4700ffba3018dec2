mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use verdict_common::Config;

#[derive(Parser)]
#[command(name = "verdict-cli")]
#[command(about = "Verdict CLI - Prepare task files and re-render evaluation results", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add stub variants and clean generated code in a task file
    Prepare {
        /// Input task file (JSON Lines)
        #[arg(short, long)]
        input: String,

        /// Output task file (JSON Lines)
        #[arg(short, long)]
        output: String,

        /// Language tag preferred when extracting fenced code (e.g., python, rust)
        #[arg(short, long)]
        language: Option<String>,

        /// Add a dry_run variant that runs the tests on the untouched tree
        #[arg(long)]
        dry_run: bool,
    },

    /// Report duplicate ids and tasks the worker would skip
    Validate {
        /// Task file (JSON Lines)
        #[arg(short, long)]
        input: String,
    },

    /// Rebuild summary.csv and summary.md from a metric record file
    Summarize {
        /// Metric record file (JSON Lines)
        #[arg(short, long, default_value = "outputs/metrics.jsonl")]
        metrics: String,

        /// Output directory
        #[arg(short, long, default_value = "outputs")]
        output: String,

        /// Report title
        #[arg(short, long, default_value = "Evaluation Summary")]
        title: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Prepare {
            input,
            output,
            language,
            dry_run,
        } => {
            commands::prepare(&input, &output, language.as_deref(), dry_run).await?;
        }
        Commands::Validate { input } => {
            // Same variant selection the worker would use
            let config = Config::from_env().context("Invalid configuration")?;
            commands::validate(&input, &config.variants).await?;
        }
        Commands::Summarize {
            metrics,
            output,
            title,
        } => {
            commands::summarize(&metrics, &output, &title).await?;
        }
    }

    Ok(())
}
