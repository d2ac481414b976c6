//! `command_planner`: writes `best_plan.md` for the iteration
//!
//! With a `command` configured, the command writes the plan to
//! `$PES_PLAN_PATH` (its stdout is the fallback). Without one, a plan is
//! derived from the parent info and the island's standing.

use async_trait::async_trait;
use pes_core::{
    workspace::read_json, Context, IterationWorkspace, Message, ParentInfo, PesError, Phase,
    PhaseOutput, Result,
};
use std::fmt::Write as _;
use std::time::Instant;
use tracing::info;

use super::command::{base_env, parse_section, run_command, CommandSpec};
use super::write_meta;
use crate::worker::{Worker, WorkerDeps};

pub const NAME: &str = "command_planner";

pub struct CommandPlanner {
    spec: CommandSpec,
}

impl CommandPlanner {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn from_deps(deps: WorkerDeps) -> Result<Self> {
        Ok(Self::new(parse_section(Phase::Planner, NAME, &deps.config)?))
    }
}

/// Plan used when no planning command is configured
fn default_plan(context: &Context, parent: &ParentInfo) -> String {
    let mut plan = String::new();
    let _ = writeln!(plan, "# Plan for iteration {}\n", context.current_iteration);
    let _ = writeln!(plan, "## Task\n\n{}\n", context.task.trim());
    let _ = writeln!(plan, "## Parent\n");
    match parent.solution_id {
        Some(id) => {
            let _ = writeln!(
                plan,
                "Solution {} on island {} scored {:.4}.",
                id, parent.island_id, parent.score
            );
        }
        None => {
            let _ = writeln!(plan, "Seed solution (score {:.4}).", parent.score);
        }
    }
    if let Some(evaluation) = &parent.evaluation {
        if !evaluation.summary.is_empty() {
            let _ = writeln!(plan, "\nLast evaluation: {}", evaluation.summary.trim());
        }
    }
    if let Some(status) = context.metadata.get("memory_status") {
        let _ = writeln!(plan, "\n## Population\n\n```json\n{}\n```", status);
    }
    let _ = writeln!(
        plan,
        "\n## Next step\n\nModify the parent solution to raise its score without breaking what already works."
    );
    plan
}

#[async_trait]
impl Worker for CommandPlanner {
    fn phase(&self) -> Phase {
        Phase::Planner
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, context: &Context, message: Message) -> Result<Message> {
        let started = Instant::now();
        let workspace = IterationWorkspace::for_context(context);
        let incoming = message.output()?;
        let parent_path = incoming
            .parent_info_file_path
            .unwrap_or_else(|| workspace.parent_info_path());
        let parent: ParentInfo = read_json(&parent_path).await?;
        let plan_path = workspace.plan_path();

        if self.spec.is_configured() {
            let mut env = base_env(context, &workspace);
            env.push((
                "PES_PARENT_INFO_PATH".into(),
                parent_path.to_string_lossy().into_owned(),
            ));
            env.push((
                "PES_PLAN_PATH".into(),
                plan_path.to_string_lossy().into_owned(),
            ));
            let output = run_command(
                Phase::Planner,
                &self.spec,
                &workspace.phase_dir(Phase::Planner),
                &env,
                context,
                &message,
            )
            .await?;

            if !plan_path.exists() {
                if output.stdout.trim().is_empty() {
                    return Err(PesError::worker(
                        Phase::Planner,
                        "planning command wrote no plan and printed nothing",
                    ));
                }
                tokio::fs::write(&plan_path, &output.stdout).await?;
            }
        } else {
            tokio::fs::write(&plan_path, default_plan(context, &parent)).await?;
        }

        let result = PhaseOutput {
            best_plan_file_path: Some(plan_path),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            ..Default::default()
        };
        write_meta(&workspace, Phase::Planner, NAME, &result).await;
        info!("Plan ready for iteration {}", context.current_iteration);
        Message::from_output(&result)
    }
}
