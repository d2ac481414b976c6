//! Append-only solution store partitioned into islands
//!
//! All writes go through one `RwLock` write guard, so id assignment,
//! migration and the snapshot taken by `checkpoint` never interleave.

use chrono::Utc;
use pes_core::{DatabaseConfig, PesError, Result, Solution, SolutionDraft, SolutionId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::checkpoint::{
    checkpoint_dir_name, read_checkpoint, resolve_checkpoint_dir, write_checkpoint,
    CheckpointMetadata, FORMAT_VERSION,
};
use crate::query::{IslandStatus, MemoryStatus, SolutionFilter};
use crate::sampler::IslandSampler;

/// Metadata key set on solutions copied by [`SolutionStore::migrate`]
pub const MIGRATED_FROM_KEY: &str = "migrated_from";

#[derive(Debug, Default)]
struct StoreState {
    /// Insertion order, which is also id order
    solutions: Vec<Solution>,
    index: HashMap<SolutionId, usize>,
    islands: Vec<Vec<usize>>,
    children: HashMap<SolutionId, Vec<SolutionId>>,
    next_id: SolutionId,
    total_iterations: usize,
    last_iteration: Option<usize>,
}

impl StoreState {
    fn with_islands(num_islands: usize) -> Self {
        Self {
            islands: vec![Vec::new(); num_islands],
            ..Default::default()
        }
    }

    fn push(&mut self, solution: Solution, counts_as_iteration: bool) {
        let position = self.solutions.len();
        if counts_as_iteration {
            self.total_iterations += 1;
            self.last_iteration = Some(
                self.last_iteration
                    .map_or(solution.iteration, |last| last.max(solution.iteration)),
            );
        }
        if let Some(parent) = solution.parent_id {
            self.children.entry(parent).or_default().push(solution.id);
        }
        self.next_id = self.next_id.max(solution.id.next());
        self.index.insert(solution.id, position);
        self.islands[solution.island_id].push(position);
        self.solutions.push(solution);
    }

    fn get(&self, id: SolutionId) -> Option<&Solution> {
        self.index.get(&id).map(|&pos| &self.solutions[pos])
    }

    fn island_members(&self, island_id: usize) -> Vec<&Solution> {
        self.islands
            .get(island_id)
            .map(|positions| positions.iter().map(|&p| &self.solutions[p]).collect())
            .unwrap_or_default()
    }

    /// Score descending, then creation order
    fn ranked<'a>(&'a self, members: impl Iterator<Item = &'a Solution>) -> Vec<&'a Solution> {
        let mut ranked: Vec<&Solution> = members.collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
    }

    fn best(&self) -> Option<&Solution> {
        self.ranked(self.solutions.iter()).into_iter().next()
    }

    fn build_solution(&self, draft: SolutionDraft) -> Solution {
        let now = Utc::now();
        let created_at = match self.solutions.last() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        };
        draft.into_solution(self.next_id, created_at)
    }
}

/// Population database shared by all iterations of a run
pub struct SolutionStore {
    num_islands: usize,
    migration_rate: f64,
    sampler: IslandSampler,
    state: RwLock<StoreState>,
}

impl SolutionStore {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        if config.num_islands == 0 {
            return Err(PesError::Config(
                "database.num_islands must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&config.migration_rate) {
            return Err(PesError::Config(format!(
                "database.migration_rate must be within [0, 1], got {}",
                config.migration_rate
            )));
        }
        Ok(Self {
            num_islands: config.num_islands,
            migration_rate: config.migration_rate,
            sampler: IslandSampler::new(config.exploit_ratio, config.seed)?,
            state: RwLock::new(StoreState::with_islands(config.num_islands)),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn num_islands(&self) -> usize {
        self.num_islands
    }

    pub fn len(&self) -> usize {
        self.read().solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_iterations(&self) -> usize {
        self.read().total_iterations
    }

    pub fn last_iteration(&self) -> Option<usize> {
        self.read().last_iteration
    }

    /// Append a solution and assign its id
    pub fn add_solution(&self, draft: SolutionDraft) -> Result<SolutionId> {
        let mut state = self.write();
        self.validate_draft(&state, &draft)?;

        let solution = state.build_solution(draft);
        let id = solution.id;
        debug!(
            "Stored solution {} on island {} (score {:.4}, parent {:?})",
            id, solution.island_id, solution.score, solution.parent_id
        );
        state.push(solution, true);
        Ok(id)
    }

    fn validate_draft(&self, state: &StoreState, draft: &SolutionDraft) -> Result<()> {
        if draft.trace_id.trim().is_empty() {
            return Err(PesError::Validation(
                "solution is missing its trace_id".into(),
            ));
        }
        if draft.island_id >= self.num_islands {
            return Err(PesError::Validation(format!(
                "island_id {} is out of range (num_islands = {})",
                draft.island_id, self.num_islands
            )));
        }
        if !draft.score.is_finite() {
            return Err(PesError::Validation(format!(
                "score must be finite, got {}",
                draft.score
            )));
        }
        if let Some(parent) = draft.parent_id {
            if state.get(parent).is_none() {
                return Err(PesError::Validation(format!(
                    "parent solution {} does not exist",
                    parent
                )));
            }
        }
        Ok(())
    }

    pub fn get_solution(&self, id: SolutionId) -> Result<Solution> {
        self.read()
            .get(id)
            .cloned()
            .ok_or(PesError::SolutionNotFound(id))
    }

    /// Solutions matching `filter`, in insertion order
    pub fn get_solutions(&self, filter: &SolutionFilter) -> Vec<Solution> {
        let state = self.read();
        let matching = state.solutions.iter().filter(|s| filter.matches(s)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Top `k` by score; ties go to the earlier solution
    ///
    /// `None` ranks across every island.
    pub fn get_best_solutions(&self, island_id: Option<usize>, k: usize) -> Vec<Solution> {
        let state = self.read();
        let ranked = match island_id {
            Some(island) => state.ranked(state.island_members(island).into_iter()),
            None => state.ranked(state.solutions.iter()),
        };
        ranked.into_iter().take(k).cloned().collect()
    }

    pub fn best_solution(&self) -> Option<Solution> {
        self.read().best().cloned()
    }

    /// Ancestors of `id`, nearest first
    pub fn get_parents_by_child_id(&self, id: SolutionId) -> Result<Vec<Solution>> {
        let state = self.read();
        let mut current = state.get(id).ok_or(PesError::SolutionNotFound(id))?;
        let mut ancestors = Vec::new();
        while let Some(parent_id) = current.parent_id {
            match state.get(parent_id) {
                Some(parent) => {
                    ancestors.push(parent.clone());
                    current = parent;
                }
                None => break,
            }
        }
        Ok(ancestors)
    }

    /// Direct children of `id`, in creation order
    pub fn get_children_by_parent_id(&self, id: SolutionId) -> Result<Vec<Solution>> {
        let state = self.read();
        if state.get(id).is_none() {
            return Err(PesError::SolutionNotFound(id));
        }
        Ok(state
            .children
            .get(&id)
            .map(|ids| ids.iter().filter_map(|c| state.get(*c)).cloned().collect())
            .unwrap_or_default())
    }

    pub fn memory_status(&self) -> MemoryStatus {
        let state = self.read();
        let islands = (0..self.num_islands)
            .map(|island_id| {
                let members = state.island_members(island_id);
                let best = state.ranked(members.iter().copied()).into_iter().next();
                IslandStatus {
                    island_id,
                    population: members.len(),
                    best_score: best.map(|s| s.score),
                    best_solution_id: best.map(|s| s.id),
                }
            })
            .collect();
        let best = state.best();

        MemoryStatus {
            total_solutions: state.solutions.len(),
            total_iterations: state.total_iterations,
            last_iteration: state.last_iteration,
            best_score: best.map(|s| s.score),
            best_solution_id: best.map(|s| s.id),
            islands,
        }
    }

    /// Pick a parent for the next iteration on `island_id`
    ///
    /// `Ok(None)` means the island is empty and the caller seeds from the task.
    pub fn sample_solution(&self, island_id: usize) -> Result<Option<Solution>> {
        if island_id >= self.num_islands {
            return Err(PesError::Validation(format!(
                "island_id {} is out of range (num_islands = {})",
                island_id, self.num_islands
            )));
        }
        let state = self.read();
        let members = state.island_members(island_id);
        Ok(self.sampler.select(&members).cloned())
    }

    /// Copy each island's elites into the next island
    ///
    /// Copies are new solutions whose parent is the original. An elite that
    /// already has a copy on the destination island is skipped. Returns the
    /// number of copies made.
    pub fn migrate(&self) -> Result<usize> {
        if self.num_islands < 2 || self.migration_rate <= 0.0 {
            return Ok(0);
        }
        let mut state = self.write();

        let mut plan: Vec<(usize, SolutionId)> = Vec::new();
        for island in 0..self.num_islands {
            let members = state.island_members(island);
            let count = (self.migration_rate * members.len() as f64).ceil() as usize;
            if count == 0 {
                continue;
            }
            let destination = (island + 1) % self.num_islands;
            for elite in state.ranked(members.into_iter()).into_iter().take(count) {
                let already_copied = state.island_members(destination).iter().any(|s| {
                    s.metadata
                        .get(MIGRATED_FROM_KEY)
                        .and_then(|v| v.as_u64())
                        == Some(elite.id.0)
                });
                if !already_copied {
                    plan.push((destination, elite.id));
                }
            }
        }

        let mut copied = 0;
        for (destination, source_id) in plan {
            let Some(source) = state.get(source_id).cloned() else {
                continue;
            };
            let mut draft = SolutionDraft::new(source.trace_id.clone(), destination)
                .with_parent(Some(source.id))
                .with_iteration(source.iteration)
                .with_plan(source.plan.clone())
                .with_content(source.content.clone())
                .with_evaluation(source.evaluation.clone())
                .with_summary(source.summary.clone());
            draft.score = source.score;
            draft.metadata = source.metadata.clone();
            draft
                .metadata
                .insert(MIGRATED_FROM_KEY.to_string(), source.id.0.into());

            let solution = state.build_solution(draft);
            state.push(solution, false);
            copied += 1;
        }

        if copied > 0 {
            info!("Migrated {} elite solution(s) between islands", copied);
        }
        Ok(copied)
    }

    fn metadata(&self, state: &StoreState) -> CheckpointMetadata {
        let best = state.best();
        CheckpointMetadata {
            version: FORMAT_VERSION,
            num_islands: self.num_islands,
            next_id: state.next_id,
            total_iterations: state.total_iterations,
            last_iteration: state.last_iteration,
            solution_count: state.solutions.len(),
            best_solution_id: best.map(|s| s.id),
            best_score: best.map(|s| s.score),
            saved_at: Utc::now(),
            solutions_sha256: String::new(),
        }
    }

    /// Snapshot the whole population under `dir`
    ///
    /// Returns the `checkpoint-iter-<n>` directory that was written, where `n`
    /// is the last persisted iteration (0 for an empty store).
    pub async fn checkpoint(&self, dir: &Path) -> Result<PathBuf> {
        let (metadata, solutions) = {
            let state = self.read();
            (self.metadata(&state), state.solutions.clone())
        };
        let target = dir.join(checkpoint_dir_name(metadata.last_iteration.unwrap_or(0)));
        write_checkpoint(&target, &metadata, &solutions).await?;
        info!(
            "Checkpoint saved to {:?} ({} solutions)",
            target, metadata.solution_count
        );
        Ok(target)
    }

    /// Rebuild a store from a checkpoint directory (or a parent of several)
    ///
    /// Island count comes from the checkpoint; sampling policy comes from `config`.
    pub async fn restore(config: &DatabaseConfig, path: &Path) -> Result<Self> {
        let dir = resolve_checkpoint_dir(path)?;
        let (metadata, solutions) = read_checkpoint(&dir).await?;

        if metadata.num_islands != config.num_islands {
            warn!(
                "Checkpoint has {} islands but config asks for {}; keeping the checkpoint layout",
                metadata.num_islands, config.num_islands
            );
        }
        let effective = DatabaseConfig {
            num_islands: metadata.num_islands,
            ..config.clone()
        };
        let store = Self::new(&effective)?;
        {
            let mut state = store.write();
            for solution in solutions {
                state.push(solution, false);
            }
            state.next_id = state.next_id.max(metadata.next_id);
            state.total_iterations = metadata.total_iterations;
            state.last_iteration = metadata.last_iteration;
        }

        info!(
            "Restored {} solutions from {:?} (next id {})",
            metadata.solution_count,
            dir,
            store.read().next_id
        );
        Ok(store)
    }
}

impl std::fmt::Debug for SolutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolutionStore")
            .field("num_islands", &self.num_islands)
            .field("solutions", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(num_islands: usize) -> DatabaseConfig {
        DatabaseConfig {
            num_islands,
            exploit_ratio: 1.0,
            seed: Some(3),
            migration_interval: 0,
            migration_rate: 0.5,
        }
    }

    fn draft(island: usize, score: f64) -> SolutionDraft {
        SolutionDraft::new("trace-a", island).with_score(score)
    }

    #[test]
    fn test_ids_are_sequential() {
        let store = SolutionStore::new(&config(2)).unwrap();
        let a = store.add_solution(draft(0, 0.1)).unwrap();
        let b = store.add_solution(draft(1, 0.2)).unwrap();
        assert_eq!(a, SolutionId(0));
        assert_eq!(b, SolutionId(1));
        assert_eq!(store.len(), 2);
        assert_eq!(store.total_iterations(), 2);
    }

    #[test]
    fn test_validation_rejects_bad_drafts() {
        let store = SolutionStore::new(&config(2)).unwrap();

        let missing_trace = SolutionDraft::new("", 0);
        assert!(matches!(
            store.add_solution(missing_trace),
            Err(PesError::Validation(_))
        ));
        assert!(matches!(
            store.add_solution(draft(2, 0.0)),
            Err(PesError::Validation(_))
        ));
        assert!(matches!(
            store.add_solution(draft(0, f64::NAN)),
            Err(PesError::Validation(_))
        ));
        assert!(matches!(
            store.add_solution(draft(0, 0.0).with_parent(Some(SolutionId(9)))),
            Err(PesError::Validation(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_created_at_is_monotonic() {
        let store = SolutionStore::new(&config(1)).unwrap();
        for _ in 0..20 {
            store.add_solution(draft(0, 0.0)).unwrap();
        }
        let all = store.get_solutions(&SolutionFilter::all());
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_get_solutions_respects_limit_and_order() {
        let store = SolutionStore::new(&config(2)).unwrap();
        for i in 0..6 {
            store.add_solution(draft(i % 2, i as f64)).unwrap();
        }
        let island_one = store.get_solutions(&SolutionFilter::island(1).with_limit(2));
        let ids: Vec<u64> = island_one.iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_sample_out_of_range_island() {
        let store = SolutionStore::new(&config(2)).unwrap();
        assert!(store.sample_solution(5).is_err());
        assert!(store.sample_solution(1).unwrap().is_none());
    }

    #[test]
    fn test_migration_copies_elites_once() {
        let store = SolutionStore::new(&config(2)).unwrap();
        store.add_solution(draft(0, 0.9)).unwrap();
        store.add_solution(draft(0, 0.1)).unwrap();

        // ceil(0.5 * 2) = 1 elite from island 0; island 1 is empty
        assert_eq!(store.migrate().unwrap(), 1);
        let island_one = store.get_solutions(&SolutionFilter::island(1));
        assert_eq!(island_one.len(), 1);
        let copy = &island_one[0];
        assert_eq!(copy.parent_id, Some(SolutionId(0)));
        assert_eq!(copy.score, 0.9);
        assert_eq!(copy.metadata[MIGRATED_FROM_KEY], serde_json::json!(0));

        // the copy migrates back to island 0, the original does not repeat
        assert_eq!(store.migrate().unwrap(), 1);
        assert_eq!(store.migrate().unwrap(), 0);
        assert_eq!(store.total_iterations(), 2);
    }

    #[test]
    fn test_single_island_never_migrates() {
        let store = SolutionStore::new(&config(1)).unwrap();
        store.add_solution(draft(0, 0.5)).unwrap();
        assert_eq!(store.migrate().unwrap(), 0);
    }
}
