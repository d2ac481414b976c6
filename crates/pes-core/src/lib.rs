//! # pes-core
//!
//! Core types for the PES (Plan → Execute → Summary) evolutionary search engine.
//!
//! ## Core Paradigm
//!
//! - Every completed iteration produces exactly one Solution
//! - Solutions live on islands; islands never share members
//! - Workers exchange file paths and usage counters, not large content
//! - Shutdown is an explicit token, never a global flag

pub mod config;
mod error;
pub mod fail_open;
mod message;
mod shutdown;
mod types;
pub mod workspace;

pub use config::{
    DatabaseConfig, EvaluatorConfig, EvolveConfig, LoggerConfig, PesConfig,
};
pub use error::{PesError, Result};
pub use message::{Message, MimeType, PhaseOutput};
pub use shutdown::ShutdownToken;
pub use types::*;
pub use workspace::IterationWorkspace;
