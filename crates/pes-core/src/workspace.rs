//! On-disk workspace of one iteration
//!
//! Layout: `<base_path>/<trace_id>/<iteration>/{planner,executor,summary,evaluator}`.
//! The directories outlive the in-memory [`Context`] and are kept for audit.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::{Context, ParentInfo, Phase, Result};

pub const PARENT_INFO_FILE: &str = "parent_info.json";
pub const BEST_PLAN_FILE: &str = "best_plan.md";
pub const BEST_SOLUTION_STEM: &str = "best_solution";
pub const BEST_EVALUATION_FILE: &str = "best_evaluation.json";
pub const BEST_SUMMARY_FILE: &str = "best_summary.md";
pub const META_FILE: &str = "meta.json";

/// Paths of one iteration's workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationWorkspace {
    root: PathBuf,
}

impl IterationWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_context(context: &Context) -> Self {
        Self::new(
            context
                .base_path
                .join(&context.trace_id)
                .join(context.current_iteration.to_string()),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn phase_dir(&self, phase: Phase) -> PathBuf {
        self.root.join(phase.dir_name())
    }

    pub fn evaluator_dir(&self) -> PathBuf {
        self.root.join("evaluator")
    }

    pub fn parent_info_path(&self) -> PathBuf {
        self.phase_dir(Phase::Planner).join(PARENT_INFO_FILE)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.phase_dir(Phase::Planner).join(BEST_PLAN_FILE)
    }

    /// Best solution file, keeping the extension of the evaluated file name
    pub fn solution_path(&self, solution_file_name: &str) -> PathBuf {
        let file_name = match Path::new(solution_file_name).extension() {
            Some(ext) => format!("{}.{}", BEST_SOLUTION_STEM, ext.to_string_lossy()),
            None => BEST_SOLUTION_STEM.to_string(),
        };
        self.phase_dir(Phase::Executor).join(file_name)
    }

    pub fn evaluation_path(&self) -> PathBuf {
        self.phase_dir(Phase::Executor).join(BEST_EVALUATION_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.phase_dir(Phase::Summarizer).join(BEST_SUMMARY_FILE)
    }

    pub fn meta_path(&self, phase: Phase) -> PathBuf {
        self.phase_dir(phase).join(META_FILE)
    }

    /// Create every phase directory
    pub async fn create(&self) -> Result<()> {
        for phase in Phase::ALL {
            fs::create_dir_all(self.phase_dir(phase)).await?;
        }
        fs::create_dir_all(self.evaluator_dir()).await?;
        debug!("Created iteration workspace at {:?}", self.root);
        Ok(())
    }

    pub async fn write_parent_info(&self, parent: &ParentInfo) -> Result<PathBuf> {
        let path = self.parent_info_path();
        write_json(&path, parent).await?;
        Ok(path)
    }

    pub async fn read_parent_info(&self) -> Result<ParentInfo> {
        read_json(&self.parent_info_path()).await
    }
}

/// Write pretty JSON, creating parent directories
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).await?;
    Ok(())
}

pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}
