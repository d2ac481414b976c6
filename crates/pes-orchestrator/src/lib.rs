//! # pes-orchestrator
//!
//! The Plan → Execute → Summary evolution loop.
//!
//! This crate provides:
//! - A pure state machine for the iteration cycle
//! - The phase `Worker` trait and a name-keyed registry
//! - Builtin command-driven workers
//! - `PesAgent`, which runs the cycle against the solution store and evaluator

mod activity;
mod agent;
mod breaker;
mod state_machine;
mod worker;
pub mod workers;

pub use activity::{ActivityLog, ACTIVITY_FILE};
pub use agent::{PesAgent, RunOutcome};
pub use breaker::{BreakerState, FailureBreaker};
pub use state_machine::{transition, Action, Event, State, StopPolicy, StopReason};
pub use worker::{PhaseWorkers, Worker, WorkerDeps, WorkerFactory, WorkerRegistry};
