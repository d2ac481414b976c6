//! Integration tests for the PES agent
//!
//! Runs the full cycle with the builtin workers and a `/bin/sh` evaluator:
//! - Score chaining across iterations on one island
//! - Target score, resume from checkpoint
//! - Failed iterations, retries and the failure breaker
//! - Shutdown during the execute phase

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use pes_core::{Context, Message, PesConfig, PesError, Phase, Result, ShutdownToken};
use pes_database::SolutionStore;
use pes_evaluator::{Evaluator, SandboxEvaluator};
use pes_orchestrator::workers::CommandPlanner;
use pes_orchestrator::{
    PesAgent, PhaseWorkers, StopReason, Worker, WorkerRegistry, ACTIVITY_FILE,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Config whose executor adds 0.3 to the parent and whose evaluator
/// scores a solution by its numeric content
fn incrementing_config(temp: &TempDir, max_iterations: usize) -> PesConfig {
    let toml = format!(
        r#"
[evolve]
task = "increment the number"
output_path = '{out}'
max_iterations = {max_iterations}
target_score = 10.0
initial_code = "0"
checkpoint_interval = 0

[database]
num_islands = 1
exploit_ratio = 1.0
seed = 7

[evaluator]
program = "sh"
evaluate_code = '''printf '{{"score": %s}}\n' "$(cat "$1")"'''
timeout_secs = 10
grace_period_secs = 1
workspace_path = '{evals}'
script_file_name = "evaluate.sh"
solution_file_name = "solution.txt"

[workers.command_executor]
command = ["sh", "-c", '''awk '{{printf "%.1f\n", $1 + 0.3}}' "$PES_PARENT_SOLUTION_PATH" > "$PES_SOLUTION_PATH"''']
timeout_secs = 10
"#,
        out = temp.path().join("out").display(),
        evals = temp.path().join("evals").display(),
        max_iterations = max_iterations,
    );
    let config = PesConfig::from_toml_str(&toml).expect("Failed to parse test config");
    config.validate().expect("Test config should be valid");
    config
}

fn build_agent(
    config: PesConfig,
    registry: &WorkerRegistry,
    store: Arc<SolutionStore>,
    shutdown: ShutdownToken,
) -> PesAgent {
    let evaluator: Arc<dyn Evaluator> = Arc::new(
        SandboxEvaluator::new(config.evaluator.clone(), shutdown.clone())
            .expect("Failed to build evaluator"),
    );
    let workers = PhaseWorkers::from_config(registry, &config, Arc::clone(&store), Arc::clone(&evaluator))
        .expect("Failed to build workers");
    PesAgent::new(config, store, evaluator, workers, shutdown)
}

fn new_store(config: &PesConfig) -> Arc<SolutionStore> {
    Arc::new(SolutionStore::new(&config.database).expect("Failed to create store"))
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {} but got {}",
        expected,
        actual
    );
}

/// Planner that fails on chosen calls and otherwise writes the default plan
struct FlakyPlanner {
    inner: CommandPlanner,
    calls: AtomicUsize,
    fails_when: fn(usize, &Context) -> bool,
}

#[async_trait]
impl Worker for FlakyPlanner {
    fn phase(&self) -> Phase {
        Phase::Planner
    }

    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(&self, context: &Context, message: Message) -> Result<Message> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if (self.fails_when)(call, context) {
            return Err(PesError::worker(Phase::Planner, "model unavailable"));
        }
        self.inner.run(context, message).await
    }
}

fn registry_with_flaky(fails_when: fn(usize, &Context) -> bool) -> WorkerRegistry {
    let mut registry = WorkerRegistry::with_builtins();
    registry.register(Phase::Planner, "flaky", move |deps| {
        Ok(Arc::new(FlakyPlanner {
            inner: CommandPlanner::from_deps(deps)?,
            calls: AtomicUsize::new(0),
            fails_when,
        }) as Arc<dyn Worker>)
    });
    registry
}

#[tokio::test]
async fn test_scores_chain_across_iterations() {
    let temp = TempDir::new().unwrap();
    let config = incrementing_config(&temp, 3);
    let store = new_store(&config);
    let agent = build_agent(
        config,
        &WorkerRegistry::with_builtins(),
        Arc::clone(&store),
        ShutdownToken::new(),
    );

    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::MaxIterations);
    assert_eq!(outcome.iterations_completed, 3);

    let solutions = store.get_solutions(&pes_database::SolutionFilter::all());
    assert_eq!(solutions.len(), 3);
    assert_close(solutions[0].score, 0.3);
    assert_close(solutions[1].score, 0.6);
    assert_close(solutions[2].score, 0.9);
    assert_eq!(solutions[0].parent_id, None);
    assert_eq!(solutions[1].parent_id, Some(solutions[0].id));
    assert_eq!(solutions[2].parent_id, Some(solutions[1].id));
    assert_eq!(solutions[2].metadata["assessment"], "IMPROVEMENT");
    assert!(solutions[2].summary.contains("IMPROVEMENT"));
    assert!(solutions[2].plan.contains("increment the number"));

    let status = store.memory_status();
    assert_eq!(status.island(0).unwrap().population, 3);
    assert_eq!(status.total_iterations, 3);

    let best = outcome.best.unwrap();
    assert_eq!(best.id, solutions[2].id);
    assert!(outcome.last_checkpoint.unwrap().ends_with("checkpoint-iter-2"));

    let activity = std::fs::read_to_string(temp.path().join("out").join(ACTIVITY_FILE)).unwrap();
    assert!(activity.contains("## Run Summary"));
    assert!(activity.contains("max iterations reached"));
}

#[tokio::test]
async fn test_stops_at_target_score() {
    let temp = TempDir::new().unwrap();
    let mut config = incrementing_config(&temp, 10);
    config.evolve.target_score = 0.5;
    let store = new_store(&config);
    let agent = build_agent(
        config,
        &WorkerRegistry::with_builtins(),
        Arc::clone(&store),
        ShutdownToken::new(),
    );

    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::TargetReached);
    assert_eq!(outcome.iterations_completed, 2);
    assert_close(outcome.best.unwrap().score, 0.6);
}

#[tokio::test]
async fn test_resume_continues_from_checkpoint() {
    let temp = TempDir::new().unwrap();
    let config = incrementing_config(&temp, 2);
    let store = new_store(&config);
    let agent = build_agent(
        config.clone(),
        &WorkerRegistry::with_builtins(),
        Arc::clone(&store),
        ShutdownToken::new(),
    );
    let first = agent.run().await.unwrap();
    let checkpoint = first.last_checkpoint.unwrap();

    let restored = Arc::new(
        SolutionStore::restore(&config.database, agent.checkpoint_dir())
            .await
            .unwrap(),
    );
    assert_eq!(restored.len(), 2);

    let mut config = config;
    config.evolve.max_iterations = 4;
    let resumed = build_agent(
        config,
        &WorkerRegistry::with_builtins(),
        Arc::clone(&restored),
        ShutdownToken::new(),
    );
    let second = resumed.run().await.unwrap();
    assert_eq!(second.iterations_completed, 2);
    assert_ne!(second.last_checkpoint.unwrap(), checkpoint);

    let solutions = restored.get_solutions(&pes_database::SolutionFilter::all());
    let iterations: Vec<usize> = solutions.iter().map(|s| s.iteration).collect();
    assert_eq!(iterations, vec![0, 1, 2, 3]);
    assert_close(solutions[3].score, 1.2);
    assert_eq!(solutions[2].parent_id, Some(solutions[1].id));
}

#[tokio::test]
async fn test_failed_iteration_reuses_parent_and_island() {
    let temp = TempDir::new().unwrap();
    let mut config = incrementing_config(&temp, 2);
    config.database.num_islands = 2;
    config.evolve.planner_name = "flaky".into();
    let store = new_store(&config);
    let registry = registry_with_flaky(|_, context| context.current_iteration == 0);
    let agent = build_agent(config, &registry, Arc::clone(&store), ShutdownToken::new());

    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::MaxIterations);
    assert_eq!(outcome.iterations_completed, 1);

    let solutions = store.get_solutions(&pes_database::SolutionFilter::all());
    assert_eq!(solutions.len(), 1);
    // iteration 1 would rotate to island 1, the retried parent keeps island 0
    assert_eq!(solutions[0].iteration, 1);
    assert_eq!(solutions[0].island_id, 0);
    assert_eq!(solutions[0].parent_id, None);

    let activity = std::fs::read_to_string(temp.path().join("out").join(ACTIVITY_FILE)).unwrap();
    assert!(activity.contains("Iteration 0 abandoned"));
    assert!(activity.contains("model unavailable"));
}

#[tokio::test]
async fn test_worker_retry_within_iteration() {
    let temp = TempDir::new().unwrap();
    let mut config = incrementing_config(&temp, 2);
    config.evolve.planner_name = "flaky".into();
    config.evolve.worker_retries = 1;
    let store = new_store(&config);
    // every first attempt fails
    let registry = registry_with_flaky(|call, _| call % 2 == 0);
    let agent = build_agent(config, &registry, Arc::clone(&store), ShutdownToken::new());

    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome.iterations_completed, 2);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_repeated_failures_trip_breaker() {
    let temp = TempDir::new().unwrap();
    let mut config = incrementing_config(&temp, 50);
    config.evolve.planner_name = "flaky".into();
    config.evolve.max_consecutive_failures = 3;
    let store = new_store(&config);
    let registry = registry_with_flaky(|_, _| true);
    let agent = build_agent(config, &registry, Arc::clone(&store), ShutdownToken::new());

    let outcome = agent.run().await.unwrap();
    match &outcome.stop_reason {
        StopReason::Fatal(message) => {
            assert!(message.contains("3 consecutive iterations failed"), "{}", message);
            assert!(message.contains("model unavailable"));
        }
        other => panic!("expected a fatal stop, got {:?}", other),
    }
    assert!(!outcome.is_success());
    assert!(outcome.best.is_none());
    assert!(store.is_empty());
}

/// Wait for the evaluator script to publish its pid
async fn read_pid(path: &Path) -> Pid {
    for _ in 0..200 {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(pid) = raw.trim().parse::<i32>() {
                return Pid::from_raw(pid);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("evaluator never wrote {:?}", path);
}

#[tokio::test]
async fn test_shutdown_during_execution_persists_nothing() {
    let temp = TempDir::new().unwrap();
    let pid_file = temp.path().join("evaluator.pid");
    let mut config = incrementing_config(&temp, 5);
    config.evaluator.evaluate_code = Some(format!(
        "echo $$ > '{}'; exec sleep 30",
        pid_file.display()
    ));
    config.evaluator.timeout_secs = 60;
    let store = new_store(&config);
    let shutdown = ShutdownToken::new();
    let agent = build_agent(
        config,
        &WorkerRegistry::with_builtins(),
        Arc::clone(&store),
        shutdown.clone(),
    );

    let signal = tokio::spawn({
        let pid_file = pid_file.clone();
        async move {
            let pid = read_pid(&pid_file).await;
            shutdown.cancel();
            pid
        }
    });

    let outcome = tokio::time::timeout(Duration::from_secs(20), agent.run())
        .await
        .expect("run did not unwind after shutdown")
        .unwrap();
    let pid = signal.await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Interrupted);
    assert_eq!(outcome.iterations_completed, 0);
    assert!(outcome.best.is_none());
    assert!(store.is_empty());
    assert_eq!(kill(pid, None), Err(Errno::ESRCH), "evaluator {} survived", pid);
}
