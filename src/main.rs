//! nlbench CLI
//!
//! Benchmark language models across datasets with repeated trials and
//! bootstrap confidence intervals.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nlbench::{
    BackendKind, BenchmarkConfig, BenchmarkRunner, CliModelHub, DatasetLoader,
    JsonlDatasetProvider, ModelSpec, PairStatus, ReportBuilder, RunLedger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_LEDGER: &str = "nlbench_results.jsonl";

#[derive(Parser)]
#[command(name = "nlbench")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Markdown,
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Benchmark models on datasets
    Run {
        /// Benchmark configuration (YAML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Dataset definitions (glob pattern)
        #[arg(long, default_value = "datasets/*.yaml")]
        datasets: String,

        /// Directory holding `<dataset>/{train,val,test}.jsonl`
        #[arg(long, default_value = "data")]
        data_root: PathBuf,

        /// Models to benchmark, as `id` or `id@revision`
        #[arg(long = "model", required = true)]
        models: Vec<String>,

        /// Backend used for every listed model
        #[arg(long, default_value = "remote")]
        backend: BackendKind,

        /// Trials per (model, dataset) pair (overrides the config)
        #[arg(long)]
        trials: Option<usize>,

        /// Re-run pairs already in the ledger
        #[arg(long)]
        no_resume: bool,

        /// Re-run pairs even when resuming
        #[arg(long)]
        force: bool,

        /// Ledger file (overrides the config)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Cap the test split, for quick checks
        #[arg(long)]
        max_test_examples: Option<usize>,
    },

    /// Render a leaderboard from a ledger
    Report {
        #[arg(long, default_value = DEFAULT_LEDGER)]
        ledger: PathBuf,

        #[arg(long, value_enum, default_value = "markdown")]
        format: Format,

        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, default_value = "Benchmark Results")]
        title: String,
    },

    /// List ledger records
    Ledger {
        #[arg(long, default_value = DEFAULT_LEDGER)]
        ledger: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Run {
            config,
            datasets,
            data_root,
            models,
            backend,
            trials,
            no_resume,
            force,
            ledger,
            max_test_examples,
        } => {
            let mut config = match &config {
                Some(path) => BenchmarkConfig::load(path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => BenchmarkConfig::default(),
            };
            config.force |= force;
            if max_test_examples.is_some() {
                config.max_test_examples = max_test_examples;
            }
            let trials = trials.unwrap_or(config.trials);
            let resume = config.resume && !no_resume;

            let models = models
                .iter()
                .map(|id| ModelSpec::parse(id, backend))
                .collect::<Result<Vec<_>, _>>()?;
            let loader = DatasetLoader::load_glob(&datasets)
                .with_context(|| format!("loading datasets from {datasets}"))?;
            if loader.is_empty() {
                bail!("no dataset definitions match {datasets}");
            }

            let ledger_path = ledger
                .or_else(|| config.ledger_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER));
            let run_ledger = RunLedger::jsonl(&ledger_path)
                .with_context(|| format!("opening ledger {}", ledger_path.display()))?;

            tracing::info!(
                models = models.len(),
                datasets = loader.len(),
                trials,
                resume,
                ledger = %ledger_path.display(),
                "Starting benchmark"
            );

            let runner = BenchmarkRunner::new(
                config,
                Arc::new(CliModelHub),
                Arc::new(JsonlDatasetProvider::new(data_root)),
            );
            let records = runner.run(&models, loader.datasets(), trials, resume, &run_ledger)?;

            let mut builder = ReportBuilder::new("Benchmark Results")
                .with_stat_config(runner.config().stats.clone());
            builder.add_records(records);
            println!("{}", builder.build().to_text());
        }
        Commands::Report {
            ledger,
            format,
            output,
            title,
        } => {
            let run_ledger = RunLedger::jsonl(&ledger)
                .with_context(|| format!("opening ledger {}", ledger.display()))?;
            let mut builder = ReportBuilder::new(&title);
            builder.add_records(run_ledger.latest());
            let board = builder.build();

            let rendered = match format {
                Format::Markdown => board.to_markdown(),
                Format::Text => board.to_text(),
                Format::Json => board.to_json()?,
            };
            match output {
                Some(path) => std::fs::write(&path, rendered)
                    .with_context(|| format!("writing report {}", path.display()))?,
                None => println!("{rendered}"),
            }
        }
        Commands::Ledger { ledger } => {
            let run_ledger = RunLedger::jsonl(&ledger)
                .with_context(|| format!("opening ledger {}", ledger.display()))?;
            let records = run_ledger.records();
            println!("{} records in {}", records.len(), ledger.display());
            for record in records {
                let status = match &record.status {
                    PairStatus::Done { metrics } => metrics
                        .iter()
                        .map(|(name, m)| format!("{name}={:.4}", m.point))
                        .collect::<Vec<_>>()
                        .join(" "),
                    PairStatus::Failed { kind, message } => format!("FAILED {kind:?}: {message}"),
                };
                println!(
                    "  {} {} [{}] {}",
                    record.recorded_at.format("%Y-%m-%d %H:%M"),
                    record.key,
                    record.key.fingerprint.get(..8).unwrap_or(&record.key.fingerprint),
                    status
                );
            }
        }
    }

    Ok(())
}
