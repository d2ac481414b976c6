//! # pes-evaluator
//!
//! Scores candidate solutions by running untrusted evaluation code in a
//! child process.
//!
//! The child gets its own process group. On timeout, interrupt or shutdown
//! the group receives SIGTERM, then SIGKILL once the grace period expires,
//! and the child is always reaped. Evaluation never returns an error: every
//! failure is folded into the returned [`EvaluationResult`] status.
//!
//! [`EvaluationResult`]: pes_core::EvaluationResult

mod evaluator;
mod payload;
mod sandbox;

pub use evaluator::{Candidate, CandidateSource, Evaluator};
pub use payload::parse_evaluation;
pub use sandbox::SandboxEvaluator;
