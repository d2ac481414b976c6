//! PES agent: drives the state machine against real workers and the store
//!
//! The agent owns no policy of its own. It feeds events into
//! [`transition`] and performs the returned actions: sampling parents,
//! running phase workers, persisting solutions, checkpointing and
//! interrupting the evaluator on shutdown.

use pes_core::{
    fail_open::fail_open_with_retries, workspace::read_json, Assessment, Context,
    EvaluationResult, IterationWorkspace, Message, ParentInfo, PesConfig, PesError, Phase,
    PhaseOutput, Result, ShutdownToken, Solution, SolutionDraft, SolutionId,
};
use pes_database::SolutionStore;
use pes_evaluator::Evaluator;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::activity::ActivityLog;
use crate::breaker::{BreakerState, FailureBreaker};
use crate::state_machine::{transition, Action, Event, State, StopPolicy, StopReason};
use crate::worker::PhaseWorkers;

/// Island leaders listed in every iteration's context
const BEST_IN_CONTEXT: usize = 3;

/// Attempts for a periodic or final checkpoint
const CHECKPOINT_ATTEMPTS: usize = 3;

/// How a run ended
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Best solution in the store, `None` if nothing was ever persisted
    pub best: Option<Solution>,
    pub stop_reason: StopReason,
    /// Solutions persisted by this run
    pub iterations_completed: usize,
    pub last_checkpoint: Option<PathBuf>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.stop_reason, StopReason::Fatal(_))
    }
}

/// Island leader as shown to workers
#[derive(Serialize)]
struct Leader {
    id: SolutionId,
    score: f64,
    iteration: usize,
}

/// In-memory state of the iteration in progress
struct IterationRun {
    context: Context,
    parent: ParentInfo,
    /// Accumulated phase outputs, handed to each following phase
    output: PhaseOutput,
    span: Span,
}

/// Bookkeeping carried between transitions
#[derive(Default)]
struct Cycle {
    current: Option<IterationRun>,
    last_parent: Option<ParentInfo>,
    begin_error: Option<PesError>,
    completed: usize,
    last_checkpoint: Option<PathBuf>,
}

pub struct PesAgent {
    config: PesConfig,
    store: Arc<SolutionStore>,
    evaluator: Arc<dyn Evaluator>,
    workers: PhaseWorkers,
    shutdown: ShutdownToken,
    breaker: FailureBreaker,
    activity: ActivityLog,
    policy: StopPolicy,
    checkpoint_dir: PathBuf,
    trace_id: String,
}

impl PesAgent {
    pub fn new(
        config: PesConfig,
        store: Arc<SolutionStore>,
        evaluator: Arc<dyn Evaluator>,
        workers: PhaseWorkers,
        shutdown: ShutdownToken,
    ) -> Self {
        let policy = StopPolicy {
            max_iterations: config.evolve.max_iterations,
            target_score: config.evolve.target_score,
            checkpoint_interval: config.evolve.checkpoint_interval,
            migration_interval: config.database.migration_interval,
        };
        Self {
            breaker: FailureBreaker::new(config.evolve.max_consecutive_failures),
            activity: ActivityLog::new(&config.evolve.output_path),
            checkpoint_dir: config.evolve.output_path.join("checkpoints"),
            trace_id: uuid::Uuid::new_v4().to_string(),
            config,
            store,
            evaluator,
            workers,
            shutdown,
            policy,
        }
    }

    /// Write checkpoints somewhere other than `<output_path>/checkpoints`
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn store(&self) -> &Arc<SolutionStore> {
        &self.store
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Directory name under `output_path` holding this run's iterations
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Run until a stop condition, a fatal error or a shutdown request
    ///
    /// Only setup problems are returned as `Err`. Fatal errors during the
    /// run end it with [`StopReason::Fatal`] after a final checkpoint.
    pub async fn run(&self) -> Result<RunOutcome> {
        let evolve = &self.config.evolve;
        tokio::fs::create_dir_all(&evolve.output_path).await?;

        let first_iteration = self.store.last_iteration().map_or(0, |last| last + 1);
        info!(
            "Starting PES run {} at iteration {} ({} islands, {} solutions loaded)",
            self.trace_id,
            first_iteration,
            self.store.num_islands(),
            self.store.len()
        );
        self.activity
            .log_run_start(&evolve.task, first_iteration, evolve.max_iterations)
            .await;

        let mut cycle = Cycle::default();
        let mut state = State::Idle;
        let mut event = Event::Start { first_iteration };
        loop {
            debug!("{:?} on {:?}", state, event);
            let (next, actions) = transition(state, event, &self.policy);
            state = next;
            for action in actions {
                self.apply(action, &mut cycle).await;
            }
            if let State::Terminated { reason } = &state {
                return Ok(self.finish(reason.clone(), cycle).await);
            }
            event = self.step(&state, &mut cycle).await;
        }
    }

    /// Do the work of `state` and report what happened
    async fn step(&self, state: &State, cycle: &mut Cycle) -> Event {
        if self.shutdown.is_cancelled() {
            return Event::ShutdownRequested;
        }
        if let Some(error) = cycle.begin_error.take() {
            return self.failure(error);
        }
        let Some(run) = cycle.current.as_mut() else {
            return Event::IterationFailed {
                message: format!("No iteration in progress in state {:?}", state),
                fatal: true,
            };
        };
        let span = run.span.clone();

        match state {
            State::Persisting { .. } => match self.persist(run).instrument(span).await {
                Ok(solution) => {
                    self.breaker.record_success();
                    cycle.completed += 1;
                    cycle.current = None;
                    Event::Persisted {
                        score: solution.score,
                        total_iterations: self.store.total_iterations(),
                    }
                }
                Err(e) => self.failure(e),
            },
            _ => {
                let Some(phase) = state.phase() else {
                    return Event::IterationFailed {
                        message: format!("No work defined for state {:?}", state),
                        fatal: true,
                    };
                };
                match self.run_phase(phase, run).instrument(span).await {
                    Ok(()) => Event::PhaseComplete { phase },
                    Err(PesError::Interrupted) => Event::ShutdownRequested,
                    Err(e) => self.failure(e),
                }
            }
        }
    }

    async fn apply(&self, action: Action, cycle: &mut Cycle) {
        match action {
            Action::BeginIteration {
                iteration,
                reuse_parent,
            } => {
                let reuse = if reuse_parent {
                    cycle.last_parent.clone()
                } else {
                    None
                };
                cycle.current = None;
                match self.begin_iteration(iteration, reuse).await {
                    Ok(run) => {
                        cycle.last_parent = Some(run.parent.clone());
                        cycle.current = Some(run);
                    }
                    Err(e) => cycle.begin_error = Some(e),
                }
            }
            Action::Checkpoint => {
                let dir = fail_open_with_retries(
                    "store::checkpoint",
                    || self.store.checkpoint(&self.checkpoint_dir),
                    CHECKPOINT_ATTEMPTS,
                )
                .await;
                if let Some(dir) = dir {
                    info!("Checkpoint written to {:?}", dir);
                    cycle.last_checkpoint = Some(dir);
                }
            }
            Action::Migrate => match self.store.migrate() {
                Ok(copied) => info!("Migrated {} solution(s) between islands", copied),
                Err(e) => warn!("Island migration failed: {}", e),
            },
            Action::InterruptEvaluator => self.evaluator.interrupt().await,
            Action::LogActivity { message } => {
                info!("{}", message);
                self.activity.log_note(&message).await;
            }
        }
    }

    /// Pick the parent, build the context and lay out the workspace
    async fn begin_iteration(
        &self,
        iteration: usize,
        reuse: Option<ParentInfo>,
    ) -> Result<IterationRun> {
        let evolve = &self.config.evolve;
        let island_id = match &reuse {
            // A retried parent stays on its island
            Some(parent) => parent.island_id,
            None => iteration % self.store.num_islands(),
        };

        let leaders: Vec<Leader> = self
            .store
            .get_best_solutions(Some(island_id), BEST_IN_CONTEXT)
            .iter()
            .map(|s| Leader {
                id: s.id,
                score: s.score,
                iteration: s.iteration,
            })
            .collect();
        let mut context = Context::new(evolve.task.clone(), evolve.output_path.clone())
            .with_iteration(iteration)
            .with_island(island_id)
            .with_seed(evolve.initial_code.clone(), evolve.initial_score)
            .with_metadata("memory_status", serde_json::to_value(self.store.memory_status())?)
            .with_metadata("island_leaders", serde_json::to_value(&leaders)?);
        context.trace_id = self.trace_id.clone();

        let parent = match reuse {
            Some(parent) => parent,
            None => match self.store.sample_solution(island_id)? {
                Some(solution) => ParentInfo::from_solution(&solution),
                None => ParentInfo::seed(&context),
            },
        };

        let workspace = IterationWorkspace::for_context(&context);
        workspace.create().await?;
        let parent_info_file_path = workspace.write_parent_info(&parent).await?;

        let span = info_span!(
            "iteration",
            trace_id = %context.short_trace(),
            iteration,
            island = island_id
        );
        span.in_scope(|| match parent.solution_id {
            Some(id) => info!("Parent {} (score {:.4})", id, parent.score),
            None => info!("Parent is the seed solution (score {:.4})", parent.score),
        });

        Ok(IterationRun {
            context,
            parent,
            output: PhaseOutput {
                parent_info_file_path: Some(parent_info_file_path),
                ..Default::default()
            },
            span,
        })
    }

    /// Run one phase worker, retrying per `worker_retries`, racing shutdown
    async fn run_phase(&self, phase: Phase, run: &mut IterationRun) -> Result<()> {
        let worker = self.workers.get(phase);
        let attempts = 1 + self.config.evolve.worker_retries;

        for attempt in 1..=attempts {
            let message = Message::from_output(&run.output)?;
            debug!("Running {} worker '{}' (attempt {})", phase, worker.name(), attempt);
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(PesError::Interrupted),
                result = worker.run(&run.context, message) => result,
            };
            match result.and_then(|reply| reply.output()) {
                Ok(output) => {
                    run.output.merge(output);
                    return Ok(());
                }
                Err(e) if attempt < attempts && !e.is_fatal() => {
                    warn!("{} attempt {} failed, retrying: {}", phase, attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(PesError::worker(phase, "no attempts configured"))
    }

    /// Turn the iteration's files into a stored solution
    async fn persist(&self, run: &IterationRun) -> Result<Solution> {
        let workspace = IterationWorkspace::for_context(&run.context);
        let output = &run.output;

        let solution_path = output.best_solution_file_path.clone().ok_or_else(|| {
            PesError::worker(Phase::Executor, "executor reported no best_solution_file_path")
        })?;
        let evaluation_path = output
            .best_evaluation_file_path
            .clone()
            .unwrap_or_else(|| workspace.evaluation_path());
        let content = tokio::fs::read_to_string(&solution_path).await?;
        let evaluation: EvaluationResult = read_json(&evaluation_path).await?;
        let plan = read_optional(output.best_plan_file_path.as_deref()).await?;
        let summary = read_optional(output.best_summary_file_path.as_deref()).await?;
        let assessment = Assessment::classify(run.parent.score, evaluation.score);

        let mut draft = SolutionDraft::new(run.context.trace_id.clone(), run.context.island_id)
            .with_parent(run.parent.solution_id)
            .with_iteration(run.context.current_iteration)
            .with_plan(plan)
            .with_content(content)
            .with_evaluation(evaluation)
            .with_summary(summary)
            .with_metadata("assessment", assessment.to_string())
            .with_metadata("workspace", workspace.root().to_string_lossy().into_owned());
        if let Some(tokens) = output.total_prompt_tokens {
            draft = draft.with_metadata("total_prompt_tokens", tokens);
        }
        if let Some(tokens) = output.total_completion_tokens {
            draft = draft.with_metadata("total_completion_tokens", tokens);
        }
        if let Some(duration) = output.duration_ms {
            draft = draft.with_metadata("duration_ms", duration);
        }

        let id = self.store.add_solution(draft)?;
        let solution = self.store.get_solution(id)?;
        info!(
            "Persisted solution {} with score {:.4} ({})",
            solution.id, solution.score, assessment
        );
        self.activity
            .log_persisted(&solution, Some(&assessment.to_string()))
            .await;
        Ok(solution)
    }

    /// Classify an abandoned iteration, escalating through the breaker
    fn failure(&self, error: PesError) -> Event {
        let tripped = self.breaker.record_failure() == BreakerState::Tripped;
        let fatal = error.is_fatal() || tripped;
        let message = if tripped && !error.is_fatal() {
            format!(
                "{} consecutive iterations failed, last error: {}",
                self.breaker.consecutive_failures(),
                error
            )
        } else {
            error.to_string()
        };
        if fatal {
            error!("{}", message);
        } else {
            warn!("Iteration abandoned: {}", message);
        }
        Event::IterationFailed { message, fatal }
    }

    async fn finish(&self, reason: StopReason, cycle: Cycle) -> RunOutcome {
        let best = self.store.best_solution();
        match &best {
            Some(solution) => info!(
                "Run finished ({}): best solution {} scored {:.4}",
                reason, solution.id, solution.score
            ),
            None => info!("Run finished ({}): no solution persisted", reason),
        }
        self.activity
            .log_run_complete(cycle.completed, &reason, best.as_ref())
            .await;
        RunOutcome {
            best,
            stop_reason: reason,
            iterations_completed: cycle.completed,
            last_checkpoint: cycle.last_checkpoint,
        }
    }
}

async fn read_optional(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => Ok(String::new()),
    }
}
