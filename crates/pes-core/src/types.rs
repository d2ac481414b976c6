//! Core type definitions for PES evolution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Score difference below which a child is considered equal to its parent
pub const STALE_EPSILON: f64 = 1e-9;

/// Identifier assigned by the Solution Store, strictly increasing
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SolutionId(pub u64);

impl SolutionId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SolutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SolutionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| format!("Invalid solution id: {}", s))
    }
}

/// The three PES phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planner,
    Executor,
    Summarizer,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Planner, Phase::Executor, Phase::Summarizer];

    /// Directory name used inside an iteration workspace
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Summarizer => "summary",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planner => write!(f, "planner"),
            Self::Executor => write!(f, "executor"),
            Self::Summarizer => write!(f, "summarizer"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planner" | "plan" => Ok(Self::Planner),
            "executor" | "execute" => Ok(Self::Executor),
            "summarizer" | "summary" => Ok(Self::Summarizer),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Outcome class of one evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    #[default]
    Success,
    /// The evaluation code finished but its payload was malformed
    ValidationFailed,
    /// The evaluation code crashed, exited non-zero, timed out or was interrupted
    ExecutionFailed,
    /// The evaluation harness itself failed
    FrameworkError,
}

impl std::fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::ExecutionFailed => write!(f, "execution_failed"),
            Self::FrameworkError => write!(f, "framework_error"),
        }
    }
}

/// Result of scoring one candidate. Produced once, never modified.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub score: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub status: EvaluationStatus,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Value>,
}

impl EvaluationResult {
    pub fn success(score: f64, summary: impl Into<String>) -> Self {
        Self {
            score,
            summary: summary.into(),
            status: EvaluationStatus::Success,
            metrics: BTreeMap::new(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn execution_failed(summary: impl Into<String>) -> Self {
        Self::failed(EvaluationStatus::ExecutionFailed, summary)
    }

    pub fn validation_failed(summary: impl Into<String>) -> Self {
        Self::failed(EvaluationStatus::ValidationFailed, summary)
    }

    pub fn framework_error(summary: impl Into<String>) -> Self {
        Self::failed(EvaluationStatus::FrameworkError, summary)
    }

    fn failed(status: EvaluationStatus, summary: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            summary: summary.into(),
            status,
            metrics: BTreeMap::new(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.artifacts.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == EvaluationStatus::Success
    }
}

/// A persisted candidate solution
///
/// Owned by the Solution Store; everything handed out is a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub id: SolutionId,
    pub parent_id: Option<SolutionId>,
    pub island_id: usize,
    /// Iteration that produced this solution
    pub iteration: usize,
    /// Trace of the iteration (links the solution to its task run)
    pub trace_id: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub evaluation: EvaluationResult,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// A solution that has not been assigned an id yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionDraft {
    pub parent_id: Option<SolutionId>,
    pub island_id: usize,
    pub iteration: usize,
    pub trace_id: String,
    pub plan: String,
    pub content: String,
    pub score: f64,
    pub evaluation: EvaluationResult,
    pub summary: String,
    pub metadata: BTreeMap<String, Value>,
}

impl SolutionDraft {
    pub fn new(trace_id: impl Into<String>, island_id: usize) -> Self {
        Self {
            parent_id: None,
            island_id,
            iteration: 0,
            trace_id: trace_id.into(),
            plan: String::new(),
            content: String::new(),
            score: 0.0,
            evaluation: EvaluationResult::default(),
            summary: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: Option<SolutionId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = plan.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the evaluation; the solution score follows the evaluation score
    pub fn with_evaluation(mut self, evaluation: EvaluationResult) -> Self {
        self.score = evaluation.score;
        self.evaluation = evaluation;
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Materialize with a store-assigned id and timestamp
    pub fn into_solution(self, id: SolutionId, created_at: DateTime<Utc>) -> Solution {
        Solution {
            id,
            parent_id: self.parent_id,
            island_id: self.island_id,
            iteration: self.iteration,
            trace_id: self.trace_id,
            plan: self.plan,
            content: self.content,
            score: self.score,
            evaluation: self.evaluation,
            summary: self.summary,
            metadata: self.metadata,
            created_at,
        }
    }
}

/// Lineage classification produced by the summary phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Assessment {
    Improvement,
    Regression,
    Stale,
}

impl Assessment {
    /// Compare a child score against its parent score
    pub fn classify(parent_score: f64, child_score: f64) -> Self {
        let delta = child_score - parent_score;
        if delta.abs() <= STALE_EPSILON {
            Self::Stale
        } else if delta > 0.0 {
            Self::Improvement
        } else {
            Self::Regression
        }
    }
}

impl std::fmt::Display for Assessment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Improvement => write!(f, "IMPROVEMENT"),
            Self::Regression => write!(f, "REGRESSION"),
            Self::Stale => write!(f, "STALE"),
        }
    }
}

impl std::str::FromStr for Assessment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IMPROVEMENT" => Ok(Self::Improvement),
            "REGRESSION" => Ok(Self::Regression),
            "STALE" => Ok(Self::Stale),
            _ => Err(format!("Invalid assessment: {}", s)),
        }
    }
}

/// Per-iteration execution context shared by the three workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub trace_id: String,
    pub task: String,
    pub current_iteration: usize,
    pub island_id: usize,
    /// Seed solution, used only when the island is empty
    pub init_solution: String,
    pub init_score: f64,
    pub base_path: PathBuf,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Context {
    pub fn new(task: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            current_iteration: 0,
            island_id: 0,
            init_solution: String::new(),
            init_score: 0.0,
            base_path: base_path.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.current_iteration = iteration;
        self
    }

    pub fn with_island(mut self, island_id: usize) -> Self {
        self.island_id = island_id;
        self
    }

    pub fn with_seed(mut self, solution: impl Into<String>, score: f64) -> Self {
        self.init_solution = solution.into();
        self.init_score = score;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Short trace prefix for log lines
    pub fn short_trace(&self) -> &str {
        &self.trace_id[..self.trace_id.len().min(8)]
    }
}

/// Parent handed to the planner, either a stored solution or the task seed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentInfo {
    pub solution_id: Option<SolutionId>,
    pub island_id: usize,
    pub solution: String,
    pub plan: String,
    pub score: f64,
    pub evaluation: Option<EvaluationResult>,
    pub summary: String,
}

impl ParentInfo {
    pub fn from_solution(solution: &Solution) -> Self {
        Self {
            solution_id: Some(solution.id),
            island_id: solution.island_id,
            solution: solution.content.clone(),
            plan: solution.plan.clone(),
            score: solution.score,
            evaluation: Some(solution.evaluation.clone()),
            summary: solution.summary.clone(),
        }
    }

    /// Seed parent for an empty island
    pub fn seed(context: &Context) -> Self {
        Self {
            solution_id: None,
            island_id: context.island_id,
            solution: context.init_solution.clone(),
            plan: String::new(),
            score: context.init_score,
            evaluation: None,
            summary: "This is the initial solution, it has no parents. Start evolution from here."
                .to_string(),
        }
    }
}
