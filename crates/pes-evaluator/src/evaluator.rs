use async_trait::async_trait;
use pes_core::EvaluationResult;
use std::path::PathBuf;
use std::time::Duration;

/// Where the candidate's code comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    Inline(String),
    File(PathBuf),
}

/// A solution produced by the execute phase, pending scoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source: CandidateSource,
    /// Appears in log lines and in the evaluation directory name
    pub label: String,
}

impl Candidate {
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            source: CandidateSource::Inline(content.into()),
            label: "candidate".to_string(),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: CandidateSource::File(path.into()),
            label: "candidate".to_string(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Scores candidates
///
/// Implementations never fail the call: crashes, timeouts and harness bugs
/// are reported through [`EvaluationResult::status`].
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, candidate: &Candidate, timeout: Duration) -> EvaluationResult;

    /// Terminate every in-flight evaluation and wait until each child is reaped
    ///
    /// Safe to call with nothing running.
    async fn interrupt(&self);
}
