//! Configuration management for PES runs
//!
//! This module provides the run configuration: evolution limits, island
//! database policy, sandboxed evaluator settings, logging, and free-form
//! per-worker sections. Policy values are read once at startup and stay fixed
//! for the whole run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{PesError, Result};

/// Complete run configuration
///
/// Loaded from a TOML file; every section falls back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PesConfig {
    #[serde(default)]
    pub evolve: EvolveConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    #[serde(default)]
    pub logger: LoggerConfig,

    /// Worker sections keyed by registered worker name
    #[serde(default)]
    pub workers: BTreeMap<String, toml::Value>,
}

/// Evolution loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolveConfig {
    /// Task description handed to every worker
    #[serde(default)]
    pub task: String,

    /// Base directory for iteration workspaces and checkpoints
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,

    /// Maximum iterations before stopping (0 = unlimited)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Stop as soon as a persisted solution reaches this score
    #[serde(default = "default_target_score")]
    pub target_score: f64,

    #[serde(default = "default_planner_name")]
    pub planner_name: String,

    #[serde(default = "default_executor_name")]
    pub executor_name: String,

    #[serde(default = "default_summary_name")]
    pub summary_name: String,

    /// Seed solution used while an island is empty
    #[serde(default)]
    pub initial_code: String,

    #[serde(default)]
    pub initial_score: f64,

    /// Extra attempts for a failed phase within the same iteration (0 or 1)
    #[serde(default)]
    pub worker_retries: usize,

    /// Consecutive abandoned iterations before the run is terminated
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Iterations between checkpoints (0 = only the final checkpoint)
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

/// Island database policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_num_islands")]
    pub num_islands: usize,

    /// Probability of returning the island best instead of a random member
    #[serde(default = "default_exploit_ratio")]
    pub exploit_ratio: f64,

    /// RNG seed for reproducible sampling
    #[serde(default)]
    pub seed: Option<u64>,

    /// Persisted iterations between migrations (0 = disabled)
    #[serde(default)]
    pub migration_interval: usize,

    /// Fraction of an island's population copied to its neighbour
    #[serde(default = "default_migration_rate")]
    pub migration_rate: f64,
}

/// Sandboxed evaluator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Interpreter used to run the evaluation code
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before the script path
    #[serde(default)]
    pub args: Vec<String>,

    /// Inline evaluation code
    #[serde(default)]
    pub evaluate_code: Option<String>,

    /// Evaluation code file, used when `evaluate_code` is absent
    #[serde(default)]
    pub evaluate_file: Option<PathBuf>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Wait between the terminate and the kill signal
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Directory for per-evaluation scratch directories
    #[serde(default = "default_evaluation_path")]
    pub workspace_path: PathBuf,

    #[serde(default = "default_script_file_name")]
    pub script_file_name: String,

    #[serde(default = "default_solution_file_name")]
    pub solution_file_name: String,

    /// Cap on captured stdout/stderr per evaluation
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Extra environment for the child process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value providers
fn default_output_path() -> PathBuf {
    PathBuf::from("./output")
}

fn default_max_iterations() -> usize {
    1000
}

fn default_target_score() -> f64 {
    1.0
}

fn default_planner_name() -> String {
    "command_planner".to_string()
}

fn default_executor_name() -> String {
    "command_executor".to_string()
}

fn default_summary_name() -> String {
    "score_summarizer".to_string()
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_checkpoint_interval() -> usize {
    5
}

fn default_num_islands() -> usize {
    3
}

fn default_exploit_ratio() -> f64 {
    0.7
}

fn default_migration_rate() -> f64 {
    0.1
}

fn default_program() -> String {
    "python3".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_evaluation_path() -> PathBuf {
    PathBuf::from("./output/evaluations")
}

fn default_script_file_name() -> String {
    "evaluator.py".to_string()
}

fn default_solution_file_name() -> String {
    "solution.py".to_string()
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PesConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PesError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PesError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Serialize to TOML, e.g. to write a starter file
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PesError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject configurations the run cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.evolve.task.trim().is_empty() {
            return Err(PesError::Config("evolve.task must not be empty".into()));
        }
        if self.evolve.worker_retries > 1 {
            return Err(PesError::Config(format!(
                "evolve.worker_retries must be 0 or 1, got {}",
                self.evolve.worker_retries
            )));
        }
        if !self.evolve.target_score.is_finite() {
            return Err(PesError::Config("evolve.target_score must be finite".into()));
        }
        if self.database.num_islands == 0 {
            return Err(PesError::Config("database.num_islands must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.database.exploit_ratio) {
            return Err(PesError::Config(format!(
                "database.exploit_ratio must be within [0, 1], got {}",
                self.database.exploit_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.database.migration_rate) {
            return Err(PesError::Config(format!(
                "database.migration_rate must be within [0, 1], got {}",
                self.database.migration_rate
            )));
        }
        if self.evaluator.timeout_secs == 0 {
            return Err(PesError::Config("evaluator.timeout_secs must be positive".into()));
        }
        if self.evaluator.evaluate_code.is_none() && self.evaluator.evaluate_file.is_none() {
            return Err(PesError::Config(
                "evaluator needs either evaluate_code or evaluate_file".into(),
            ));
        }
        Ok(())
    }

    /// Worker section as JSON, `Null` when the worker has no section
    pub fn worker_config(&self, name: &str) -> Result<serde_json::Value> {
        match self.workers.get(name) {
            Some(value) => Ok(serde_json::to_value(value)?),
            None => Ok(serde_json::Value::Null),
        }
    }
}

impl EvaluatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Resolve the evaluation code, inline code first
    pub fn evaluate_source(&self) -> Result<String> {
        if let Some(code) = &self.evaluate_code {
            return Ok(code.clone());
        }
        match &self.evaluate_file {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                PesError::Config(format!("Failed to read evaluate_file {:?}: {}", path, e))
            }),
            None => Err(PesError::Config(
                "evaluator needs either evaluate_code or evaluate_file".into(),
            )),
        }
    }
}

impl Default for EvolveConfig {
    fn default() -> Self {
        Self {
            task: String::new(),
            output_path: default_output_path(),
            max_iterations: default_max_iterations(),
            target_score: default_target_score(),
            planner_name: default_planner_name(),
            executor_name: default_executor_name(),
            summary_name: default_summary_name(),
            initial_code: String::new(),
            initial_score: 0.0,
            worker_retries: 0,
            max_consecutive_failures: default_max_consecutive_failures(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            num_islands: default_num_islands(),
            exploit_ratio: default_exploit_ratio(),
            seed: None,
            migration_interval: 0,
            migration_rate: default_migration_rate(),
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            evaluate_code: None,
            evaluate_file: None,
            timeout_secs: default_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
            workspace_path: default_evaluation_path(),
            script_file_name: default_script_file_name(),
            solution_file_name: default_solution_file_name(),
            max_output_bytes: default_max_output_bytes(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
