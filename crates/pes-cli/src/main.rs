//! PES CLI - Plan → Execute → Summary evolutionary search
//!
//! Usage:
//!   pes init [path]               Write a starter pes.toml
//!   pes run -c pes.toml           Run (or resume) an evolution
//!   pes inspect <checkpoint>      Show population and lineage of a checkpoint

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pes_core::{EvaluatorConfig, PesConfig, ShutdownToken, SolutionId};
use pes_database::SolutionStore;
use pes_evaluator::{Evaluator, SandboxEvaluator};
use pes_orchestrator::{PesAgent, PhaseWorkers, StopReason, WorkerRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pes")]
#[command(author, version, about = "Plan-Execute-Summary evolutionary search")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level or filter directive, overrides [logger].level
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Destination file
        #[arg(default_value = "pes.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the evolution loop
    Run(RunArgs),

    /// Show the population stored in a checkpoint
    Inspect {
        /// Checkpoint directory, or a directory of checkpoint-iter-* entries
        checkpoint: PathBuf,

        /// Best solutions to list
        #[arg(short = 'k', long, default_value = "5")]
        top: usize,

        /// Print the ancestors and children of this solution
        #[arg(long, value_name = "ID")]
        lineage: Option<SolutionId>,

        /// Print memory status as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Resume from this checkpoint
    #[arg(long, value_name = "DIR")]
    checkpoint_path: Option<PathBuf>,

    /// Task description
    #[arg(long, conflicts_with = "task_file")]
    task: Option<String>,

    /// Read the task description from a file
    #[arg(long, value_name = "FILE")]
    task_file: Option<PathBuf>,

    /// Evaluation code file
    #[arg(long, value_name = "FILE")]
    eval_file: Option<PathBuf>,

    /// Seed solution file
    #[arg(long, value_name = "FILE")]
    initial_file: Option<PathBuf>,

    /// Output directory for iteration workspaces and checkpoints
    #[arg(long, value_name = "DIR")]
    workspace_path: Option<PathBuf>,

    #[arg(long)]
    max_iterations: Option<usize>,

    #[arg(long)]
    target_score: Option<f64>,

    /// Planner worker name
    #[arg(long)]
    planner: Option<String>,

    /// Executor worker name
    #[arg(long)]
    executor: Option<String>,

    /// Summarizer worker name
    #[arg(long)]
    summary: Option<String>,
}

/// Install the global subscriber; `RUST_LOG` wins over everything else
fn init_logging(verbose: bool, log_level: Option<&str>, configured: &str) -> Result<()> {
    let directive = match (log_level, verbose) {
        (Some(level), _) => level,
        (None, true) => "debug",
        (None, false) => configured,
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .with_context(|| format!("Invalid log level '{}'", directive))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path, force } => {
            init_logging(cli.verbose, cli.log_level.as_deref(), "info")?;
            cmd_init(path, force).await
        }
        Commands::Run(args) => {
            let config = load_config(&args)?;
            init_logging(cli.verbose, cli.log_level.as_deref(), &config.logger.level)?;
            cmd_run(config, args.checkpoint_path).await
        }
        Commands::Inspect {
            checkpoint,
            top,
            lineage,
            json,
        } => {
            init_logging(cli.verbose, cli.log_level.as_deref(), "warn")?;
            cmd_inspect(checkpoint, top, lineage, json).await
        }
    }
}

async fn cmd_init(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }

    let mut config = PesConfig::default();
    config.evolve.task = "Describe the task to evolve a solution for".to_string();
    config.evaluator.evaluate_file = Some(PathBuf::from("evaluate.py"));

    tokio::fs::write(&path, config.to_toml_string()?)
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;

    println!("Wrote starter configuration to {:?}", path);
    println!("Next steps:");
    println!("  1. Set [evolve].task and [evaluator].evaluate_file");
    println!("  2. Configure [workers.command_executor].command");
    println!("  3. pes run -c {}", path.display());
    Ok(())
}

/// Load the file and apply command-line overrides, then validate
fn load_config(args: &RunArgs) -> Result<PesConfig> {
    let mut config = PesConfig::load(&args.config)
        .with_context(|| format!("Failed to load {:?}", args.config))?;

    if let Some(task) = &args.task {
        config.evolve.task = task.clone();
    }
    if let Some(path) = &args.task_file {
        config.evolve.task = read_file(path, "task file")?;
    }
    if let Some(path) = &args.eval_file {
        config.evaluator.evaluate_file = Some(path.clone());
        config.evaluator.evaluate_code = None;
    }
    if let Some(path) = &args.initial_file {
        config.evolve.initial_code = read_file(path, "initial solution")?;
    }
    if let Some(path) = &args.workspace_path {
        config.evolve.output_path = path.clone();
        // Keep evaluations under the new output unless placed explicitly
        if config.evaluator.workspace_path == EvaluatorConfig::default().workspace_path {
            config.evaluator.workspace_path = path.join("evaluations");
        }
    }
    if let Some(max_iterations) = args.max_iterations {
        config.evolve.max_iterations = max_iterations;
    }
    if let Some(target_score) = args.target_score {
        config.evolve.target_score = target_score;
    }
    if let Some(name) = &args.planner {
        config.evolve.planner_name = name.clone();
    }
    if let Some(name) = &args.executor {
        config.evolve.executor_name = name.clone();
    }
    if let Some(name) = &args.summary {
        config.evolve.summary_name = name.clone();
    }

    config.validate()?;
    Ok(config)
}

fn read_file(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {} {:?}", what, path))
}

async fn cmd_run(config: PesConfig, checkpoint_path: Option<PathBuf>) -> Result<()> {
    let store = match &checkpoint_path {
        Some(path) => {
            let store = SolutionStore::restore(&config.database, path)
                .await
                .with_context(|| format!("Failed to restore checkpoint {:?}", path))?;
            info!(
                "Restored {} solutions: {}",
                store.len(),
                store.memory_status().summary_line()
            );
            store
        }
        None => SolutionStore::new(&config.database)?,
    };
    let store = Arc::new(store);

    let shutdown = ShutdownToken::new();
    let sandbox = Arc::new(SandboxEvaluator::new(
        config.evaluator.clone(),
        shutdown.clone(),
    )?);
    let evaluator: Arc<dyn Evaluator> = sandbox.clone();

    let registry = WorkerRegistry::with_builtins();
    let workers = PhaseWorkers::from_config(
        &registry,
        &config,
        Arc::clone(&store),
        Arc::clone(&evaluator),
    )?;

    spawn_signal_handler(shutdown.clone(), sandbox);

    let agent = PesAgent::new(config, store, evaluator, workers, shutdown);
    let outcome = agent.run().await?;

    println!();
    println!("Stop reason: {}", outcome.stop_reason);
    println!("Iterations persisted: {}", outcome.iterations_completed);
    match &outcome.best {
        Some(best) => {
            println!(
                "Best solution: {} (score {:.4}, island {}, iteration {})",
                best.id, best.score, best.island_id, best.iteration
            );
            println!("\n{}", best.content.trim_end());
        }
        None => println!("Best solution: none"),
    }
    if let Some(checkpoint) = &outcome.last_checkpoint {
        println!("\nCheckpoint: {}", checkpoint.display());
    }

    if let StopReason::Fatal(message) = outcome.stop_reason {
        bail!("Run failed: {}", message);
    }
    Ok(())
}

/// SIGINT/SIGTERM only set the token and interrupt the evaluator
fn spawn_signal_handler(shutdown: ShutdownToken, evaluator: Arc<SandboxEvaluator>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("Shutdown requested, abandoning the current iteration");
        shutdown.cancel();
        evaluator.interrupt().await;
    });
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn cmd_inspect(
    checkpoint: PathBuf,
    top: usize,
    lineage: Option<SolutionId>,
    json: bool,
) -> Result<()> {
    let store = SolutionStore::restore(&Default::default(), &checkpoint)
        .await
        .with_context(|| format!("Failed to read checkpoint {:?}", checkpoint))?;
    let status = store.memory_status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", status.summary_line());
    println!();
    for island in &status.islands {
        match (island.best_solution_id, island.best_score) {
            (Some(id), Some(score)) => println!(
                "  island {}: {} solutions, best {} ({:.4})",
                island.island_id, island.population, id, score
            ),
            _ => println!("  island {}: empty", island.island_id),
        }
    }

    println!("\nTop {}:", top);
    for solution in store.get_best_solutions(None, top) {
        let parent = solution
            .parent_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let assessment = solution
            .metadata
            .get("assessment")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        println!(
            "  {:>5}  score {:>10.4}  island {}  iter {:>4}  parent {:>5}  {}",
            solution.id, solution.score, solution.island_id, solution.iteration, parent, assessment
        );
    }

    if let Some(id) = lineage {
        let ancestors = store.get_parents_by_child_id(id)?;
        let children = store.get_children_by_parent_id(id)?;
        println!("\nLineage of {}:", id);
        for ancestor in &ancestors {
            println!("  ancestor {} ({:.4})", ancestor.id, ancestor.score);
        }
        for child in &children {
            println!("  child    {} ({:.4})", child.id, child.score);
        }
        if ancestors.is_empty() && children.is_empty() {
            println!("  no relatives");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_apply_before_validation() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("pes.toml");
        std::fs::write(
            &config_path,
            "[evolve]\ntask = \"from file\"\n\n[evaluator]\nevaluate_code = \"print(1)\"\n",
        )
        .unwrap();
        let initial = temp.path().join("seed.py");
        std::fs::write(&initial, "x = 1\n").unwrap();

        let cli = Cli::parse_from([
            "pes",
            "run",
            "-c",
            config_path.to_str().unwrap(),
            "--task",
            "from flag",
            "--initial-file",
            initial.to_str().unwrap(),
            "--workspace-path",
            "/tmp/pes-out",
            "--max-iterations",
            "7",
            "--planner",
            "custom_planner",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected the run subcommand");
        };
        let config = load_config(&args).unwrap();

        assert_eq!(config.evolve.task, "from flag");
        assert_eq!(config.evolve.initial_code, "x = 1\n");
        assert_eq!(config.evolve.max_iterations, 7);
        assert_eq!(config.evolve.planner_name, "custom_planner");
        assert_eq!(config.evolve.output_path, PathBuf::from("/tmp/pes-out"));
        assert_eq!(
            config.evaluator.workspace_path,
            PathBuf::from("/tmp/pes-out/evaluations")
        );
    }

    #[test]
    fn test_empty_task_is_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("pes.toml");
        std::fs::write(&config_path, "[evaluator]\nevaluate_code = \"print(1)\"\n").unwrap();

        let cli = Cli::parse_from(["pes", "run", "-c", config_path.to_str().unwrap()]);
        let Commands::Run(args) = cli.command else {
            panic!("expected the run subcommand");
        };
        let err = load_config(&args).unwrap_err();
        assert!(err.to_string().contains("evolve.task"));
    }
}
