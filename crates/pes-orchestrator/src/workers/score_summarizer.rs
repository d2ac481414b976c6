//! `score_summarizer`: classifies the child against its parent
//!
//! The assessment is purely score based. An optional command may append
//! free-form notes; it receives `PES_ASSESSMENT` and writes to stdout.

use async_trait::async_trait;
use pes_core::{
    workspace::read_json, Assessment, Context, EvaluationResult, IterationWorkspace, Message,
    ParentInfo, Phase, PhaseOutput, Result,
};
use std::fmt::Write as _;
use std::time::Instant;
use tracing::info;

use super::command::{base_env, parse_section, run_command, CommandSpec};
use super::write_meta;
use crate::worker::{Worker, WorkerDeps};

pub const NAME: &str = "score_summarizer";

pub struct ScoreSummarizer {
    spec: CommandSpec,
}

impl ScoreSummarizer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn from_deps(deps: WorkerDeps) -> Result<Self> {
        Ok(Self::new(parse_section(Phase::Summarizer, NAME, &deps.config)?))
    }
}

fn render_summary(
    assessment: Assessment,
    parent: &ParentInfo,
    evaluation: &EvaluationResult,
    notes: Option<&str>,
) -> String {
    let mut summary = String::new();
    let _ = writeln!(summary, "# Assessment: {}\n", assessment);
    let parent_label = match parent.solution_id {
        Some(id) => format!("solution {}", id),
        None => "seed".to_string(),
    };
    let _ = writeln!(
        summary,
        "- Parent ({}): {:.4}",
        parent_label, parent.score
    );
    let _ = writeln!(
        summary,
        "- Child: {:.4} ({:?})",
        evaluation.score, evaluation.status
    );
    let _ = writeln!(
        summary,
        "- Delta: {:+.4}",
        evaluation.score - parent.score
    );
    if !evaluation.summary.trim().is_empty() {
        let _ = writeln!(summary, "\n## Evaluation\n\n{}", evaluation.summary.trim());
    }
    if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
        let _ = writeln!(summary, "\n## Notes\n\n{}", notes);
    }
    summary
}

#[async_trait]
impl Worker for ScoreSummarizer {
    fn phase(&self) -> Phase {
        Phase::Summarizer
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
        let evaluation_path = incoming
            .best_evaluation_file_path
            .unwrap_or_else(|| workspace.evaluation_path());
        let parent: ParentInfo = read_json(&parent_path).await?;
        let evaluation: EvaluationResult = read_json(&evaluation_path).await?;
        let assessment = Assessment::classify(parent.score, evaluation.score);

        let summary_path = workspace.summary_path();
        tokio::fs::create_dir_all(workspace.phase_dir(Phase::Summarizer)).await?;

        let notes = if self.spec.is_configured() {
            let mut env = base_env(context, &workspace);
            env.extend([
                ("PES_ASSESSMENT".into(), assessment.to_string()),
                (
                    "PES_SUMMARY_PATH".into(),
                    summary_path.to_string_lossy().into_owned(),
                ),
                (
                    "PES_EVALUATION_PATH".into(),
                    evaluation_path.to_string_lossy().into_owned(),
                ),
            ]);
            let output = run_command(
                Phase::Summarizer,
                &self.spec,
                &workspace.phase_dir(Phase::Summarizer),
                &env,
                context,
                &message,
            )
            .await?;
            Some(output.stdout)
        } else {
            None
        };

        tokio::fs::write(
            &summary_path,
            render_summary(assessment, &parent, &evaluation, notes.as_deref()),
        )
        .await?;
        info!(
            "{}: {:.4} -> {:.4}",
            assessment, parent.score, evaluation.score
        );

        let result = PhaseOutput {
            best_summary_file_path: Some(summary_path),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            ..Default::default()
        };
        write_meta(&workspace, Phase::Summarizer, NAME, &result).await;
        Message::from_output(&result)
    }
}
