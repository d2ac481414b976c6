//! Integration tests for the solution store
//!
//! Covers:
//! - Checkpoint and restore of a multi-island population
//! - Lineage traversal in both directions
//! - Top-k ordering with tie-breaks
//! - The exploit/explore sampling distribution

use pes_core::{DatabaseConfig, EvaluationResult, PesError, SolutionDraft, SolutionId};
use pes_database::{resolve_checkpoint_dir, SolutionFilter, SolutionStore};
use std::collections::HashMap;
use tempfile::TempDir;

/// Helper to build a store with a deterministic sampler
fn create_store(num_islands: usize, exploit_ratio: f64) -> SolutionStore {
    let config = DatabaseConfig {
        num_islands,
        exploit_ratio,
        seed: Some(42),
        migration_interval: 0,
        migration_rate: 0.1,
    };
    SolutionStore::new(&config).expect("Failed to create store")
}

/// Helper to build a draft the way the orchestrator's persist step does
fn iteration_draft(
    iteration: usize,
    island: usize,
    parent: Option<SolutionId>,
    score: f64,
) -> SolutionDraft {
    SolutionDraft::new("trace-it", island)
        .with_parent(parent)
        .with_iteration(iteration)
        .with_plan(format!("plan {}", iteration))
        .with_content(format!("x = {}", iteration))
        .with_evaluation(EvaluationResult::success(score, "ok"))
        .with_summary("IMPROVEMENT")
}

#[tokio::test]
async fn test_checkpoint_restore_roundtrip() {
    let store = create_store(3, 0.5);
    let mut parent = None;
    for iteration in 0..7 {
        let id = store
            .add_solution(iteration_draft(
                iteration,
                iteration % 3,
                parent,
                iteration as f64 / 10.0,
            ))
            .expect("Failed to add solution");
        parent = Some(id);
    }
    let before = store.memory_status();

    let temp = TempDir::new().unwrap();
    let written = store
        .checkpoint(temp.path())
        .await
        .expect("Failed to write checkpoint");
    assert!(written.ends_with("checkpoint-iter-6"));

    // restore from the parent directory resolves the same checkpoint
    let restored = SolutionStore::restore(&DatabaseConfig::default(), temp.path())
        .await
        .expect("Failed to restore");
    assert_eq!(restored.memory_status(), before);
    assert_eq!(restored.num_islands(), 3);
    assert_eq!(
        restored.get_solutions(&SolutionFilter::all()),
        store.get_solutions(&SolutionFilter::all())
    );

    // id sequencing resumes past the restored ids
    let next = restored
        .add_solution(iteration_draft(7, 1, Some(SolutionId(6)), 0.9))
        .unwrap();
    assert_eq!(next, SolutionId(7));
    assert_eq!(restored.last_iteration(), Some(7));
}

#[tokio::test]
async fn test_restore_prefers_latest_checkpoint() {
    let store = create_store(1, 1.0);
    let temp = TempDir::new().unwrap();

    store.add_solution(iteration_draft(0, 0, None, 0.1)).unwrap();
    store.checkpoint(temp.path()).await.unwrap();
    store
        .add_solution(iteration_draft(1, 0, Some(SolutionId(0)), 0.2))
        .unwrap();
    store.checkpoint(temp.path()).await.unwrap();

    let latest = resolve_checkpoint_dir(temp.path()).unwrap();
    assert!(latest.ends_with("checkpoint-iter-1"));

    let restored = SolutionStore::restore(&DatabaseConfig::default(), temp.path())
        .await
        .unwrap();
    assert_eq!(restored.len(), 2);
}

#[tokio::test]
async fn test_restore_rejects_corrupt_checkpoint() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("checkpoint-iter-0");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("solutions.json"), "not json").unwrap();
    std::fs::write(dir.join("metadata.json"), "{}").unwrap();

    let err = SolutionStore::restore(&DatabaseConfig::default(), &dir)
        .await
        .unwrap_err();
    assert!(matches!(err, PesError::Checkpoint(_)));
}

#[test]
fn test_lineage_traversal() {
    let store = create_store(1, 1.0);
    let root = store.add_solution(iteration_draft(0, 0, None, 0.1)).unwrap();
    let a = store.add_solution(iteration_draft(1, 0, Some(root), 0.2)).unwrap();
    let b = store.add_solution(iteration_draft(2, 0, Some(root), 0.3)).unwrap();
    let c = store.add_solution(iteration_draft(3, 0, Some(a), 0.4)).unwrap();

    let ancestors: Vec<SolutionId> = store
        .get_parents_by_child_id(c)
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ancestors, vec![a, root]);

    let children: Vec<SolutionId> = store
        .get_children_by_parent_id(root)
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(children, vec![a, b]);

    assert!(store.get_parents_by_child_id(root).unwrap().is_empty());
    assert!(store.get_children_by_parent_id(c).unwrap().is_empty());
    assert!(matches!(
        store.get_children_by_parent_id(SolutionId(99)),
        Err(PesError::SolutionNotFound(_))
    ));
}

#[test]
fn test_best_solutions_break_ties_by_creation_order() {
    let store = create_store(2, 1.0);
    let scores = [0.5, 0.9, 0.5, 0.9, 0.1];
    for (i, score) in scores.iter().enumerate() {
        store.add_solution(iteration_draft(i, 0, None, *score)).unwrap();
    }
    store.add_solution(iteration_draft(5, 1, None, 1.0)).unwrap();

    let top: Vec<u64> = store
        .get_best_solutions(Some(0), 4)
        .iter()
        .map(|s| s.id.0)
        .collect();
    assert_eq!(top, vec![1, 3, 0, 2]);

    let global = store.get_best_solutions(None, 2);
    assert_eq!(global[0].id, SolutionId(5));
    assert_eq!(store.best_solution().unwrap().id, SolutionId(5));

    let status = store.memory_status();
    assert_eq!(status.island(0).unwrap().population, 5);
    assert_eq!(status.island(0).unwrap().best_solution_id, Some(SolutionId(1)));
    assert_eq!(status.island(1).unwrap().best_score, Some(1.0));
}

#[test]
fn test_sampling_distribution_matches_exploit_ratio() {
    let store = create_store(1, 0.7);
    let members = 50;
    for i in 0..members {
        let score = if i == 17 { 1.0 } else { 0.01 * i as f64 / members as f64 };
        store.add_solution(iteration_draft(i, 0, None, score)).unwrap();
    }

    let draws = 10_000;
    let mut counts: HashMap<SolutionId, usize> = HashMap::new();
    for _ in 0..draws {
        let parent = store.sample_solution(0).unwrap().unwrap();
        *counts.entry(parent.id).or_default() += 1;
    }

    // exploit picks the best, explore picks it 1/50 of the remaining time
    let expected = 0.7 + 0.3 / members as f64;
    let observed = counts[&SolutionId(17)] as f64 / draws as f64;
    assert!(
        (observed - expected).abs() < 0.03,
        "best sampled {:.3}, expected {:.3}",
        observed,
        expected
    );
    assert!(counts.len() > members / 2, "explore should spread over the island");
}

#[test]
fn test_concurrent_adds_get_unique_ids() {
    let store = std::sync::Arc::new(create_store(4, 0.5));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        store
                            .add_solution(iteration_draft(t * 25 + i, t % 4, None, 0.0))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<SolutionId> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 200);
    assert_eq!(ids.last(), Some(&SolutionId(199)));
}
