//! Human-readable run log at `<output_path>/activity.md`
//!
//! Every write is fail-open: a broken activity log never stops evolution.

use chrono::Utc;
use pes_core::{fail_open::fail_open, Result, Solution};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::state_machine::StopReason;

pub const ACTIVITY_FILE: &str = "activity.md";

/// Maximum characters of a note kept in the log
const NOTE_PREVIEW_CHARS: usize = 500;

pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(output_path: &Path) -> Self {
        Self {
            path: output_path.join(ACTIVITY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header of a run; appends so resumed runs keep their history
    pub async fn log_run_start(&self, task: &str, first_iteration: usize, max_iterations: usize) {
        let limit = if max_iterations == 0 {
            "unlimited".to_string()
        } else {
            max_iterations.to_string()
        };
        let content = format!(
            "# PES Activity Log\n\n## Task: {}\n**Started**: {}\n**First Iteration**: {}\n**Max Iterations**: {}\n\n---\n\n",
            task.lines().next().unwrap_or(task),
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            first_iteration,
            limit
        );
        fail_open("activity::run_start", || self.append(content)).await;
    }

    pub async fn log_persisted(&self, solution: &Solution, assessment: Option<&str>) {
        let mut content = format!(
            "### Iteration {} (island {})\n**Solution**: {} | **Score**: {:.4}",
            solution.iteration, solution.island_id, solution.id, solution.score
        );
        if let Some(parent) = solution.parent_id {
            content.push_str(&format!(" | **Parent**: {}", parent));
        }
        if let Some(assessment) = assessment {
            content.push_str(&format!(" | **Assessment**: {}", assessment));
        }
        content.push_str("\n\n");
        fail_open("activity::persisted", || self.append(content)).await;
    }

    /// One timestamped line; long messages are cut
    pub async fn log_note(&self, message: &str) {
        let mut preview: String = message.chars().take(NOTE_PREVIEW_CHARS).collect();
        if message.chars().count() > NOTE_PREVIEW_CHARS {
            preview.push_str("...");
        }
        let content = format!(
            "- {} {}\n\n",
            Utc::now().format("%H:%M:%S"),
            preview.replace('\n', "\n  ")
        );
        fail_open("activity::note", || self.append(content)).await;
    }

    pub async fn log_run_complete(
        &self,
        iterations_completed: usize,
        stop_reason: &StopReason,
        best: Option<&Solution>,
    ) {
        let best_line = match best {
            Some(solution) => format!(
                "{} (score {:.4}, island {})",
                solution.id, solution.score, solution.island_id
            ),
            None => "none".to_string(),
        };
        let content = format!(
            "## Run Summary\n\n**Completed**: {}\n**Iterations Persisted**: {}\n**Stop Reason**: {}\n**Best Solution**: {}\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            iterations_completed,
            stop_reason,
            best_line
        );
        fail_open("activity::run_complete", || self.append(content)).await;
    }

    async fn append(&self, content: String) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pes_core::{SolutionDraft, SolutionId};
    use tempfile::TempDir;

    fn solution(score: f64) -> Solution {
        SolutionDraft::new("trace", 1)
            .with_parent(Some(SolutionId(3)))
            .with_iteration(4)
            .with_content("x")
            .with_score(score)
            .into_solution(SolutionId(7), Utc::now())
    }

    #[tokio::test]
    async fn test_run_log_sections() {
        let temp = TempDir::new().unwrap();
        let log = ActivityLog::new(temp.path());

        log.log_run_start("Pack circles\nmore detail", 0, 0).await;
        log.log_persisted(&solution(0.42), Some("IMPROVEMENT")).await;
        log.log_note("Iteration 5 abandoned: executor worker failed: boom")
            .await;
        log.log_run_complete(1, &StopReason::Interrupted, Some(&solution(0.42)))
            .await;

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("## Task: Pack circles\n"));
        assert!(content.contains("**Max Iterations**: unlimited"));
        assert!(content.contains("**Solution**: 7 | **Score**: 0.4200 | **Parent**: 3"));
        assert!(content.contains("**Assessment**: IMPROVEMENT"));
        assert!(content.contains("Iteration 5 abandoned: executor worker failed: boom"));
        assert!(content.contains("**Stop Reason**: interrupted"));
    }

    #[tokio::test]
    async fn test_long_notes_are_truncated() {
        let temp = TempDir::new().unwrap();
        let log = ActivityLog::new(temp.path());
        log.log_note(&"e".repeat(2000)).await;

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("..."));
        assert!(!content.contains(&"e".repeat(600)));
    }

    #[tokio::test]
    async fn test_unwritable_log_is_ignored() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        // parent is a regular file, every write fails
        let log = ActivityLog::new(&blocker);
        log.log_note("still running").await;
        assert!(!log.path().exists());
    }
}
