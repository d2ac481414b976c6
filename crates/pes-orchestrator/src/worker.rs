//! Phase worker trait and the name-keyed registry
//!
//! A worker implements one phase. Workers are looked up by `(phase, name)`
//! in a table built at startup, so swapping an implementation is a
//! configuration change only.

use async_trait::async_trait;
use pes_core::{Context, EvaluatorConfig, Message, PesConfig, PesError, Phase, Result};
use pes_database::SolutionStore;
use pes_evaluator::Evaluator;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One phase of the PES cycle
///
/// The returned message carries output file paths and usage counters
/// (see [`pes_core::PhaseOutput`]); the loop never looks at anything else.
#[async_trait]
pub trait Worker: Send + Sync {
    fn phase(&self) -> Phase;

    fn name(&self) -> &str;

    async fn run(&self, context: &Context, message: Message) -> Result<Message>;
}

/// Everything a worker factory may need
#[derive(Clone)]
pub struct WorkerDeps {
    /// The worker's `[workers.<name>]` section, `Null` when absent
    pub config: serde_json::Value,
    pub store: Arc<SolutionStore>,
    pub evaluator: Arc<dyn Evaluator>,
    pub evaluator_config: EvaluatorConfig,
}

pub type WorkerFactory = Arc<dyn Fn(WorkerDeps) -> Result<Arc<dyn Worker>> + Send + Sync>;

/// Lookup table from `(phase, name)` to worker constructors
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    factories: BTreeMap<(Phase, String), WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the command and score workers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::workers::register_builtins(&mut registry);
        registry
    }

    /// Register a factory; a later registration under the same name wins
    pub fn register<F>(&mut self, phase: Phase, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(WorkerDeps) -> Result<Arc<dyn Worker>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registered {} worker '{}'", phase, name);
        self.factories.insert((phase, name), Arc::new(factory));
        self
    }

    pub fn contains(&self, phase: Phase, name: &str) -> bool {
        self.factories.contains_key(&(phase, name.to_string()))
    }

    /// Registered names for `phase`, sorted
    pub fn names(&self, phase: Phase) -> Vec<&str> {
        self.factories
            .keys()
            .filter(|(p, _)| *p == phase)
            .map(|(_, name)| name.as_str())
            .collect()
    }

    pub fn build(&self, phase: Phase, name: &str, deps: WorkerDeps) -> Result<Arc<dyn Worker>> {
        let factory = self
            .factories
            .get(&(phase, name.to_string()))
            .ok_or_else(|| PesError::WorkerNotFound {
                phase,
                name: name.to_string(),
            })?;
        factory(deps)
    }
}

/// The three workers selected for a run
#[derive(Clone)]
pub struct PhaseWorkers {
    pub planner: Arc<dyn Worker>,
    pub executor: Arc<dyn Worker>,
    pub summarizer: Arc<dyn Worker>,
}

impl PhaseWorkers {
    /// Build the workers named in `[evolve]`, each with its own config section
    pub fn from_config(
        registry: &WorkerRegistry,
        config: &PesConfig,
        store: Arc<SolutionStore>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self> {
        let build = |phase: Phase, name: &str| {
            let deps = WorkerDeps {
                config: config.worker_config(name)?,
                store: Arc::clone(&store),
                evaluator: Arc::clone(&evaluator),
                evaluator_config: config.evaluator.clone(),
            };
            registry.build(phase, name, deps)
        };
        Ok(Self {
            planner: build(Phase::Planner, &config.evolve.planner_name)?,
            executor: build(Phase::Executor, &config.evolve.executor_name)?,
            summarizer: build(Phase::Summarizer, &config.evolve.summary_name)?,
        })
    }

    pub fn get(&self, phase: Phase) -> &Arc<dyn Worker> {
        match phase {
            Phase::Planner => &self.planner,
            Phase::Executor => &self.executor,
            Phase::Summarizer => &self.summarizer,
        }
    }
}
