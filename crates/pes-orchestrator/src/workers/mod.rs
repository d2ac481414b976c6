//! Builtin phase workers
//!
//! Each delegates the creative part of its phase to an external command and
//! keeps the file protocol of the iteration workspace.

mod command;
pub mod command_executor;
pub mod command_planner;
pub mod score_summarizer;

pub use command::{CommandOutput, CommandSpec};
pub use command_executor::{CommandExecutor, ExecutorSettings};
pub use command_planner::CommandPlanner;
pub use score_summarizer::ScoreSummarizer;

use chrono::{DateTime, Utc};
use pes_core::{fail_open::fail_open, workspace::write_json, IterationWorkspace, Phase, PhaseOutput};
use serde::Serialize;
use std::sync::Arc;

use crate::worker::{Worker, WorkerRegistry};

#[derive(Serialize)]
struct PhaseMeta<'a> {
    worker: &'a str,
    phase: Phase,
    output: &'a PhaseOutput,
    finished_at: DateTime<Utc>,
}

/// Record the phase's output in `meta.json`; failures are only logged
pub(crate) async fn write_meta(
    workspace: &IterationWorkspace,
    phase: Phase,
    worker: &str,
    output: &PhaseOutput,
) {
    let meta = PhaseMeta {
        worker,
        phase,
        output,
        finished_at: Utc::now(),
    };
    let path = workspace.meta_path(phase);
    fail_open("worker::meta", || write_json(&path, &meta)).await;
}

pub fn register_builtins(registry: &mut WorkerRegistry) {
    registry
        .register(Phase::Planner, command_planner::NAME, |deps| {
            Ok(Arc::new(CommandPlanner::from_deps(deps)?) as Arc<dyn Worker>)
        })
        .register(Phase::Executor, command_executor::NAME, |deps| {
            Ok(Arc::new(CommandExecutor::from_deps(deps)?) as Arc<dyn Worker>)
        })
        .register(Phase::Summarizer, score_summarizer::NAME, |deps| {
            Ok(Arc::new(ScoreSummarizer::from_deps(deps)?) as Arc<dyn Worker>)
        });
}
