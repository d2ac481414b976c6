//! Read-side types: query filters and aggregate status

use pes_core::{Solution, SolutionId};
use serde::{Deserialize, Serialize};

/// Filter for [`crate::SolutionStore::get_solutions`]
///
/// All set fields must match. Results keep insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolutionFilter {
    pub island_id: Option<usize>,
    pub ids: Option<Vec<SolutionId>>,
    pub min_score: Option<f64>,
    pub iteration: Option<usize>,
    pub limit: Option<usize>,
}

impl SolutionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn island(island_id: usize) -> Self {
        Self {
            island_id: Some(island_id),
            ..Default::default()
        }
    }

    pub fn ids(ids: impl IntoIterator<Item = SolutionId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, solution: &Solution) -> bool {
        if let Some(island) = self.island_id {
            if solution.island_id != island {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&solution.id) {
                return false;
            }
        }
        if let Some(min) = self.min_score {
            if solution.score < min {
                return false;
            }
        }
        if let Some(iteration) = self.iteration {
            if solution.iteration != iteration {
                return false;
            }
        }
        true
    }
}

/// Per-island counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandStatus {
    pub island_id: usize,
    pub population: usize,
    pub best_score: Option<f64>,
    pub best_solution_id: Option<SolutionId>,
}

/// Aggregate counters consumed by planners for situational awareness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub total_solutions: usize,
    /// Iterations that persisted a solution (migrated copies excluded)
    pub total_iterations: usize,
    pub last_iteration: Option<usize>,
    pub best_score: Option<f64>,
    pub best_solution_id: Option<SolutionId>,
    pub islands: Vec<IslandStatus>,
}

impl MemoryStatus {
    pub fn island(&self, island_id: usize) -> Option<&IslandStatus> {
        self.islands.iter().find(|i| i.island_id == island_id)
    }

    /// One-line summary for log output
    pub fn summary_line(&self) -> String {
        let islands: Vec<String> = self
            .islands
            .iter()
            .map(|i| match i.best_score {
                Some(score) => format!("#{}={}@{:.4}", i.island_id, i.population, score),
                None => format!("#{}=empty", i.island_id),
            })
            .collect();
        format!(
            "{} solutions over {} iterations, best {}, islands [{}]",
            self.total_solutions,
            self.total_iterations,
            self.best_score
                .map(|s| format!("{:.4}", s))
                .unwrap_or_else(|| "n/a".to_string()),
            islands.join(" ")
        )
    }
}
