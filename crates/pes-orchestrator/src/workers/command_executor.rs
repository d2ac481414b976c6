//! `command_executor`: produces and scores the iteration's candidate
//!
//! For up to `max_rounds` rounds a generator command writes a candidate to
//! `$PES_SOLUTION_PATH`; each candidate goes through the evaluator and the
//! best round becomes `best_solution.*` plus `best_evaluation.json`.
//! Without a generator the parent solution is re-evaluated unchanged.

use async_trait::async_trait;
use pes_core::{
    workspace::{read_json, write_json},
    Context, EvaluationResult, EvaluationStatus, IterationWorkspace, Message, ParentInfo,
    PesError, Phase, PhaseOutput, Result,
};
use pes_evaluator::{Candidate, Evaluator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::command::{base_env, parse_section, run_command, CommandSpec};
use super::write_meta;
use crate::worker::{Worker, WorkerDeps};

pub const NAME: &str = "command_executor";

fn default_max_rounds() -> usize {
    1
}

/// `[workers.command_executor]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(flatten)]
    pub generator: CommandSpec,

    /// Generate-and-evaluate rounds per iteration
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Overrides `evaluator.timeout_secs`
    #[serde(default)]
    pub eval_timeout_secs: Option<u64>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            generator: CommandSpec::default(),
            max_rounds: default_max_rounds(),
            eval_timeout_secs: None,
        }
    }
}

pub struct CommandExecutor {
    settings: ExecutorSettings,
    evaluator: Arc<dyn Evaluator>,
    eval_timeout: Duration,
    solution_file_name: String,
}

/// Outcome of one generate-and-evaluate round
struct Round {
    index: usize,
    candidate: PathBuf,
    evaluation: EvaluationResult,
}

impl CommandExecutor {
    pub fn from_deps(deps: WorkerDeps) -> Result<Self> {
        let settings: ExecutorSettings = parse_section(Phase::Executor, NAME, &deps.config)?;
        if settings.max_rounds == 0 {
            return Err(PesError::Config(format!(
                "[workers.{}] max_rounds must be at least 1",
                NAME
            )));
        }
        let eval_timeout = settings
            .eval_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| deps.evaluator_config.timeout());
        Ok(Self {
            settings,
            evaluator: deps.evaluator,
            eval_timeout,
            solution_file_name: deps.evaluator_config.solution_file_name,
        })
    }

    /// Produce the candidate file of one round
    async fn generate(
        &self,
        context: &Context,
        message: &Message,
        workspace: &IterationWorkspace,
        env: &[(String, String)],
        parent_solution: &Path,
        candidate: &Path,
    ) -> Result<()> {
        if !self.settings.generator.is_configured() {
            tokio::fs::copy(parent_solution, candidate).await?;
            return Ok(());
        }

        let output = run_command(
            Phase::Executor,
            &self.settings.generator,
            &workspace.phase_dir(Phase::Executor),
            env,
            context,
            message,
        )
        .await?;

        if !candidate.exists() {
            if output.stdout.trim().is_empty() {
                return Err(PesError::worker(
                    Phase::Executor,
                    "generator wrote no candidate and printed nothing",
                ));
            }
            tokio::fs::write(candidate, &output.stdout).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for CommandExecutor {
    fn phase(&self) -> Phase {
        Phase::Executor
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, context: &Context, message: Message) -> Result<Message> {
        let started = Instant::now();
        let workspace = IterationWorkspace::for_context(context);
        let incoming = message.output()?;
        let executor_dir = workspace.phase_dir(Phase::Executor);
        tokio::fs::create_dir_all(&executor_dir).await?;

        let parent_path = incoming
            .parent_info_file_path
            .clone()
            .unwrap_or_else(|| workspace.parent_info_path());
        let parent: ParentInfo = read_json(&parent_path).await?;
        let parent_solution = executor_dir.join(format!("parent_{}", self.solution_file_name));
        tokio::fs::write(&parent_solution, &parent.solution).await?;
        let plan_path = incoming
            .best_plan_file_path
            .clone()
            .unwrap_or_else(|| workspace.plan_path());

        let mut best: Option<Round> = None;
        let mut last_error: Option<PesError> = None;
        let mut framework_errors = 0;
        let mut previous_evaluation: Option<PathBuf> = None;

        for index in 0..self.settings.max_rounds {
            let round_dir = executor_dir.join(format!("round-{}", index));
            tokio::fs::create_dir_all(&round_dir).await?;
            let candidate = round_dir.join(&self.solution_file_name);
            // Left over when the phase is retried
            if candidate.exists() {
                tokio::fs::remove_file(&candidate).await?;
            }

            let mut env = base_env(context, &workspace);
            env.extend([
                ("PES_ROUND".into(), index.to_string()),
                ("PES_SOLUTION_PATH".into(), path_str(&candidate)),
                ("PES_PLAN_PATH".into(), path_str(&plan_path)),
                ("PES_PARENT_INFO_PATH".into(), path_str(&parent_path)),
                ("PES_PARENT_SOLUTION_PATH".into(), path_str(&parent_solution)),
            ]);
            if let Some(previous) = &previous_evaluation {
                env.push(("PES_PREVIOUS_EVALUATION_PATH".into(), path_str(previous)));
            }

            match self
                .generate(context, &message, &workspace, &env, &parent_solution, &candidate)
                .await
            {
                Ok(()) => {}
                Err(e @ PesError::Worker { .. }) => {
                    warn!("Round {} produced no candidate: {}", index, e);
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let label = format!("iter{}-round{}", context.current_iteration, index);
            let evaluation = self
                .evaluator
                .evaluate(
                    &Candidate::from_path(&candidate).with_label(label),
                    self.eval_timeout,
                )
                .await;
            let evaluation_path = round_dir.join("evaluation.json");
            write_json(&evaluation_path, &evaluation).await?;
            previous_evaluation = Some(evaluation_path);

            info!(
                "Round {}: {:?} score={:.4}",
                index, evaluation.status, evaluation.score
            );
            if evaluation.status == EvaluationStatus::FrameworkError {
                framework_errors += 1;
                last_error = Some(PesError::Framework(evaluation.summary.clone()));
                continue;
            }
            let improves = best
                .as_ref()
                .map_or(true, |b| evaluation.score > b.evaluation.score);
            if improves {
                best = Some(Round {
                    index,
                    candidate,
                    evaluation,
                });
            }
        }

        let Some(best) = best else {
            return Err(match last_error {
                Some(PesError::Framework(detail)) if framework_errors > 0 => {
                    PesError::Framework(detail)
                }
                Some(e) => e,
                None => PesError::worker(Phase::Executor, "no round produced a candidate"),
            });
        };

        let solution_path = workspace.solution_path(&self.solution_file_name);
        tokio::fs::copy(&best.candidate, &solution_path).await?;
        let evaluation_path = workspace.evaluation_path();
        write_json(&evaluation_path, &best.evaluation).await?;
        info!(
            "Best candidate from round {} scored {:.4}",
            best.index, best.evaluation.score
        );

        let result = PhaseOutput {
            best_solution_file_path: Some(solution_path),
            best_evaluation_file_path: Some(evaluation_path),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            ..Default::default()
        };
        write_meta(&workspace, Phase::Executor, NAME, &result).await;
        Message::from_output(&result)
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
