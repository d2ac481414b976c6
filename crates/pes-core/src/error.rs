//! Unified error types for the PES engine

use thiserror::Error;

use crate::types::{Phase, SolutionId};

/// Unified error type for all PES operations
#[derive(Error, Debug)]
pub enum PesError {
    // Store errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Solution not found: {0}")]
    SolutionNotFound(SolutionId),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No {phase} worker registered under '{name}'")]
    WorkerNotFound { phase: Phase, name: String },

    // Worker errors
    #[error("{phase} worker failed: {message}")]
    Worker { phase: Phase, message: String },

    // Evaluation errors
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Framework error: {0}")]
    Framework(String),

    #[error("Interrupted by shutdown request")]
    Interrupted,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl PesError {
    /// Build a worker failure for the given phase
    pub fn worker(phase: Phase, message: impl Into<String>) -> Self {
        Self::Worker {
            phase,
            message: message.into(),
        }
    }

    /// Fatal errors terminate the run instead of abandoning one iteration
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::WorkerNotFound { .. })
    }
}

/// Result type alias using PesError
pub type Result<T> = std::result::Result<T, PesError>;
