//! Pure state machine for the PES iteration cycle
//!
//! No async, no I/O: `transition(state, event, policy)` returns the next state
//! and the side effects the agent must perform. Invalid transitions end in
//! `Terminated { Fatal }` and never panic.
//!
//! ```text
//! Idle -> Planning -> Executing -> Summarizing -> Persisting -> Planning ...
//!   any non-terminal state -> Terminated
//! ```

use pes_core::Phase;
use serde::{Deserialize, Serialize};

/// Why a run stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// A persisted solution reached the target score
    TargetReached,
    /// The iteration budget is used up
    MaxIterations,
    /// External shutdown request
    Interrupted,
    /// Unrecoverable error, e.g. configuration or repeated failures
    Fatal(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TargetReached => write!(f, "target score reached"),
            Self::MaxIterations => write!(f, "max iterations reached"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Fatal(error) => write!(f, "fatal error: {}", error),
        }
    }
}

/// Loop state; every active state carries its iteration number
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Idle,
    Planning { iteration: usize },
    Executing { iteration: usize },
    Summarizing { iteration: usize },
    Persisting { iteration: usize },
    Terminated { reason: StopReason },
}

impl State {
    pub fn iteration(&self) -> Option<usize> {
        match self {
            Self::Planning { iteration }
            | Self::Executing { iteration }
            | Self::Summarizing { iteration }
            | Self::Persisting { iteration } => Some(*iteration),
            Self::Idle | Self::Terminated { .. } => None,
        }
    }

    /// Phase worker that runs in this state, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Planning { .. } => Some(Phase::Planner),
            Self::Executing { .. } => Some(Phase::Executor),
            Self::Summarizing { .. } => Some(Phase::Summarizer),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

/// Events fed back by the agent
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Begin the run at `first_iteration` (non-zero after a restore)
    Start { first_iteration: usize },
    /// The worker of the current phase returned
    PhaseComplete { phase: Phase },
    /// The iteration's solution was appended to the store
    Persisted { score: f64, total_iterations: usize },
    /// The iteration was abandoned
    IterationFailed { message: String, fatal: bool },
    /// External interrupt or terminate signal
    ShutdownRequested,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Sample (or keep) the parent and lay out the iteration workspace
    BeginIteration { iteration: usize, reuse_parent: bool },
    /// Snapshot the store
    Checkpoint,
    /// Copy island elites to their neighbours
    Migrate,
    /// Terminate in-flight sandboxed evaluations
    InterruptEvaluator,
    LogActivity { message: String },
}

/// Static run limits, read once from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StopPolicy {
    /// 0 means unlimited
    pub max_iterations: usize,
    pub target_score: f64,
    /// Persisted iterations between checkpoints; 0 keeps only the final one
    pub checkpoint_interval: usize,
    /// Persisted iterations between migrations; 0 disables migration
    pub migration_interval: usize,
}

impl StopPolicy {
    /// No iteration numbered `iteration` may start
    pub fn exhausted(&self, iteration: usize) -> bool {
        self.max_iterations > 0 && iteration >= self.max_iterations
    }

    fn due(interval: usize, count: usize) -> bool {
        interval > 0 && count > 0 && count % interval == 0
    }
}

fn terminate(reason: StopReason, mut actions: Vec<Action>) -> (State, Vec<Action>) {
    actions.push(Action::LogActivity {
        message: format!("Run terminated: {}", reason),
    });
    actions.push(Action::Checkpoint);
    (State::Terminated { reason }, actions)
}

fn begin(iteration: usize, reuse_parent: bool, mut actions: Vec<Action>) -> (State, Vec<Action>) {
    actions.push(Action::BeginIteration {
        iteration,
        reuse_parent,
    });
    (State::Planning { iteration }, actions)
}

/// Pure state transition function
///
/// Stop conditions are evaluated once per finished iteration; only
/// `ShutdownRequested` ends an iteration early.
pub fn transition(state: State, event: Event, policy: &StopPolicy) -> (State, Vec<Action>) {
    match (state, event) {
        (State::Idle, Event::Start { first_iteration }) => {
            if policy.exhausted(first_iteration) {
                terminate(StopReason::MaxIterations, vec![])
            } else {
                begin(
                    first_iteration,
                    false,
                    vec![Action::LogActivity {
                        message: format!("Starting evolution at iteration {}", first_iteration),
                    }],
                )
            }
        }

        (State::Planning { iteration }, Event::PhaseComplete { phase: Phase::Planner }) => {
            (State::Executing { iteration }, vec![])
        }
        (State::Executing { iteration }, Event::PhaseComplete { phase: Phase::Executor }) => {
            (State::Summarizing { iteration }, vec![])
        }
        (State::Summarizing { iteration }, Event::PhaseComplete { phase: Phase::Summarizer }) => {
            (State::Persisting { iteration }, vec![])
        }

        (
            State::Persisting { iteration },
            Event::Persisted {
                score,
                total_iterations,
            },
        ) => {
            let mut actions = vec![Action::LogActivity {
                message: format!("Iteration {} persisted with score {:.4}", iteration, score),
            }];
            if StopPolicy::due(policy.migration_interval, total_iterations) {
                actions.push(Action::Migrate);
            }

            if score >= policy.target_score {
                terminate(StopReason::TargetReached, actions)
            } else if policy.exhausted(iteration + 1) {
                terminate(StopReason::MaxIterations, actions)
            } else {
                if StopPolicy::due(policy.checkpoint_interval, total_iterations) {
                    actions.push(Action::Checkpoint);
                }
                begin(iteration + 1, false, actions)
            }
        }

        (
            State::Planning { iteration }
            | State::Executing { iteration }
            | State::Summarizing { iteration }
            | State::Persisting { iteration },
            Event::IterationFailed { message, fatal },
        ) => {
            let actions = vec![Action::LogActivity {
                message: format!("Iteration {} abandoned: {}", iteration, message),
            }];
            if fatal {
                terminate(StopReason::Fatal(message), actions)
            } else if policy.exhausted(iteration + 1) {
                terminate(StopReason::MaxIterations, actions)
            } else {
                begin(iteration + 1, true, actions)
            }
        }

        (
            State::Idle
            | State::Planning { .. }
            | State::Executing { .. }
            | State::Summarizing { .. }
            | State::Persisting { .. },
            Event::ShutdownRequested,
        ) => terminate(StopReason::Interrupted, vec![Action::InterruptEvaluator]),

        (State::Terminated { reason }, event) => (
            State::Terminated {
                reason: StopReason::Fatal(format!(
                    "Invalid transition from Terminated ({}) on event: {:?}",
                    reason, event
                )),
            },
            vec![],
        ),

        (state, event) => (
            State::Terminated {
                reason: StopReason::Fatal(format!(
                    "Invalid state transition: {:?} cannot handle event {:?}",
                    state, event
                )),
            },
            vec![],
        ),
    }
}
