//! CLI command definitions for discovery-forge.
//!
//! Three commands: `run` drives a discovery run against the completion
//! service, `status` probes the service, and `inspect` prints a saved
//! checkpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::llm::LmStudioClient;
use crate::pipeline::{checkpoint, render_summary, CheckpointStore, PipelineConfig, RunController};

/// Staged hypothesis-to-thesis discovery pipeline.
#[derive(Parser)]
#[command(name = "discovery-forge")]
#[command(about = "Run a staged discovery pipeline against a local completion service")]
#[command(version)]
#[command(
    long_about = "discovery-forge takes a frontier problem through target selection, hypothesis generation, physics validation, engineering proposals, requirement challenges, synthesis and a final thesis.\n\nExample usage:\n  discovery-forge run \"Room-temperature superconductivity at ambient pressure\" --hypotheses 3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the discovery pipeline for a problem, or resume a saved run.
    Run(RunArgs),

    /// Probe the completion service and list its models.
    Status(StatusArgs),

    /// Print the summary of a saved checkpoint.
    Inspect(InspectArgs),
}

/// Arguments for `discovery-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Problem statement.
    #[arg(conflicts_with = "problem_file")]
    pub problem: Option<String>,

    /// Read the problem statement from a file.
    #[arg(short = 'f', long)]
    pub problem_file: Option<PathBuf>,

    /// Resume from a checkpoint file; completed stages are skipped.
    #[arg(long, conflicts_with_all = ["problem", "problem_file"])]
    pub resume: Option<PathBuf>,

    /// YAML file with per-role stage overrides.
    #[arg(long)]
    pub stages: Option<PathBuf>,

    /// Completion API base URL.
    #[arg(long)]
    pub api_base: Option<String>,

    /// Model used by every role.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Number of hypotheses to generate.
    #[arg(long)]
    pub hypotheses: Option<usize>,

    /// Requirement-challenge iterations per engineering proposal.
    #[arg(long)]
    pub iterations: Option<usize>,

    /// Synthesized solutions passed to the final write-up.
    #[arg(long)]
    pub final_proposals: Option<usize>,

    /// Attempts per completion call.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Streaming request timeout in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Output directory for checkpoints and artifacts.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Treat unparseable physics answers as infeasible.
    #[arg(long)]
    pub pessimistic: bool,

    /// Print the outcome as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `discovery-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Completion API base URL.
    #[arg(long)]
    pub api_base: Option<String>,

    /// Print the status as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `discovery-forge inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Run id to inspect; defaults to the latest run.
    pub run_id: Option<String>,

    /// Directory holding the checkpoints.
    #[arg(short = 'o', long)]
    pub results_dir: Option<PathBuf>,

    /// Print the full checkpoint as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_discovery_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Inspect(args) => run_inspect_command(args),
    }
}

// ============================================================================
// Run
// ============================================================================

fn build_config(args: &RunArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env().context("Invalid environment configuration")?;

    if let Some(path) = &args.stages {
        config
            .stages
            .load_overrides(path)
            .with_context(|| format!("Failed to load stage overrides from {}", path.display()))?;
    }
    if let Some(api_base) = &args.api_base {
        config = config.with_api_base(api_base.clone());
    }
    if let Some(model) = &args.model {
        config = config.with_model_for_all(model);
    }
    if let Some(n) = args.hypotheses {
        config = config.with_num_hypotheses(n);
    }
    if let Some(n) = args.iterations {
        config = config.with_challenge_iterations(n);
    }
    if let Some(n) = args.final_proposals {
        config = config.with_num_final_proposals(n);
    }
    if let Some(n) = args.max_attempts {
        config.retry = config.retry.clone().with_max_attempts(n);
    }
    if let Some(secs) = args.timeout_secs {
        config.retry = config
            .retry
            .clone()
            .with_request_timeout(Duration::from_secs(secs));
    }
    if let Some(dir) = &args.output {
        config = config.with_results_dir(dir.clone());
    }
    if args.pessimistic {
        config = config.with_assume_feasible_when_unparsed(false);
    }

    config.validate()?;
    Ok(config)
}

fn read_problem(args: &RunArgs) -> anyhow::Result<Option<String>> {
    if let Some(path) = &args.problem_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read problem file {}", path.display()))?;
        return Ok(Some(text));
    }
    Ok(args.problem.clone())
}

async fn run_discovery_command(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let client = LmStudioClient::new(&config.api_base, &config.api_key, config.retry.clone())?;
    let controller = Arc::new(RunController::new(Arc::new(client), config));

    let run_id = match (&args.resume, read_problem(&args)?) {
        (Some(path), _) => {
            let document = checkpoint::load(path)
                .with_context(|| format!("Failed to load checkpoint {}", path.display()))?;
            info!(
                run_id = %document.state.run_id,
                last_completed = %document.last_completed_step,
                "Resuming discovery run"
            );
            controller.start_from(document.state)?
        }
        (None, Some(problem)) => controller.start(&problem)?,
        (None, None) => anyhow::bail!("Provide a problem statement, --problem-file or --resume"),
    };

    let stopper = controller.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current call");
            let _ = stopper.stop();
        }
    });

    let outcome = controller.wait().await;
    signal.abort();

    let Some(outcome) = outcome else {
        anyhow::bail!("Discovery run {} did not finish", run_id);
    };

    if args.json {
        let report = serde_json::json!({
            "run_id": outcome.state.run_id,
            "status": outcome.status,
            "reason": outcome.reason,
            "last_completed": outcome.state.last_completed_label(),
            "summary": outcome.reports.summary,
            "discovery": outcome.reports.discovery,
            "thesis": outcome.reports.thesis,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Run {}: {}", outcome.state.run_id, outcome.status);
        if let Some(reason) = &outcome.reason {
            println!("Reason: {}", reason);
        }
        println!("Last completed stage: {}", outcome.state.last_completed_label());
        for path in [
            &outcome.reports.summary,
            &outcome.reports.discovery,
            &outcome.reports.thesis,
        ]
        .into_iter()
        .flatten()
        {
            println!("  {}", path.display());
        }
    }

    Ok(())
}

// ============================================================================
// Status
// ============================================================================

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env().context("Invalid environment configuration")?;
    if let Some(api_base) = args.api_base {
        config = config.with_api_base(api_base);
    }

    let client = LmStudioClient::new(&config.api_base, &config.api_key, config.retry.clone())?;
    let api_base = client.api_base().to_string();
    let controller = RunController::new(Arc::new(client), config);
    let status = controller.status().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if status.connected {
        println!("Connected to {}", api_base);
        println!(
            "Loaded model: {}",
            status.loaded_model.as_deref().unwrap_or("none")
        );
        for model in &status.models {
            println!("  - {}", model);
        }
    } else {
        println!("Cannot reach completion service at {}", api_base);
    }
    Ok(())
}

// ============================================================================
// Inspect
// ============================================================================

fn run_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let dir = match args.results_dir {
        Some(dir) => dir,
        None => PipelineConfig::from_env()?.results_dir,
    };
    let store = CheckpointStore::new(&dir);

    let document = match &args.run_id {
        Some(run_id) => store.load_run(run_id),
        None => store.load_latest(),
    }
    .with_context(|| format!("No checkpoint found in {}", dir.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        println!("Saved at: {}", document.saved_at.to_rfc3339());
        println!("Last completed stage: {}\n", document.last_completed_step);
        print!("{}", render_summary(&document.state));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "discovery-forge",
            "run",
            "Make diamond",
            "--hypotheses",
            "3",
            "--iterations",
            "2",
            "--pessimistic",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.problem.as_deref(), Some("Make diamond"));
        assert_eq!(args.hypotheses, Some(3));
        assert_eq!(args.iterations, Some(2));
        assert!(args.pessimistic);
    }

    #[test]
    fn test_resume_conflicts_with_problem() {
        let result = Cli::try_parse_from([
            "discovery-forge",
            "run",
            "Make diamond",
            "--resume",
            "results/latest_progress.json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_inspect_defaults() {
        let cli = Cli::try_parse_from(["discovery-forge", "inspect"]).unwrap();
        let Commands::Inspect(args) = cli.command else {
            panic!("expected inspect command");
        };
        assert!(args.run_id.is_none());
        assert!(!args.json);
    }
}
