//! # pes-database
//!
//! Population database for PES evolution.
//!
//! This crate provides:
//! - An append-only solution store partitioned into islands
//! - Parent sampling with a fixed exploit/explore policy
//! - Lineage reads for analysis tooling
//! - Checkpoint and restore of the full population
//! - Optional migration of island elites to the neighbouring island

mod checkpoint;
mod query;
mod sampler;
mod store;

pub use checkpoint::{
    checkpoint_dir_name, resolve_checkpoint_dir, CheckpointMetadata, CHECKPOINT_PREFIX,
};
pub use query::{IslandStatus, MemoryStatus, SolutionFilter};
pub use sampler::IslandSampler;
pub use store::SolutionStore;
