//! Checkpoint files
//!
//! Layout: `<dir>/checkpoint-iter-<n>/{solutions.json,metadata.json}`.
//! A checkpoint is staged in a hidden sibling directory and renamed into place,
//! so a reader never observes a half-written snapshot. An existing checkpoint
//! of the same iteration is moved aside to `<name>.previous` first and only
//! deleted once its replacement is in place; restore falls back to it.

use chrono::{DateTime, Utc};
use pes_core::{PesError, Result, Solution, SolutionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use std::ffi::OsString;
use tracing::{debug, warn};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-iter-";
pub(crate) const SOLUTIONS_FILE: &str = "solutions.json";
pub(crate) const METADATA_FILE: &str = "metadata.json";
pub(crate) const FORMAT_VERSION: u32 = 1;
const PREVIOUS_SUFFIX: &str = ".previous";

/// Summary written next to the solutions of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: u32,
    pub num_islands: usize,
    pub next_id: SolutionId,
    pub total_iterations: usize,
    pub last_iteration: Option<usize>,
    pub solution_count: usize,
    pub best_solution_id: Option<SolutionId>,
    pub best_score: Option<f64>,
    pub saved_at: DateTime<Utc>,
    /// Hex SHA-256 of `solutions.json`; empty skips the check
    #[serde(default)]
    pub solutions_sha256: String,
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn checkpoint_dir_name(iteration: usize) -> String {
    format!("{}{}", CHECKPOINT_PREFIX, iteration)
}

fn checkpoint_iteration(path: &Path) -> Option<usize> {
    let rest = path.file_name()?.to_str()?.strip_prefix(CHECKPOINT_PREFIX)?;
    rest.strip_suffix(PREVIOUS_SUFFIX).unwrap_or(rest).parse().ok()
}

fn is_previous(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.ends_with(PREVIOUS_SUFFIX))
}

fn previous_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(PREVIOUS_SUFFIX);
    PathBuf::from(name)
}

/// Accept a checkpoint directory or a directory holding `checkpoint-iter-*` children
///
/// With several children the highest iteration wins. A `.previous` copy is
/// used only when the checkpoint it was replaced by never landed.
pub fn resolve_checkpoint_dir(path: &Path) -> Result<PathBuf> {
    if path.join(SOLUTIONS_FILE).is_file() {
        return Ok(path.to_path_buf());
    }
    let previous = previous_path(path);
    if previous.join(SOLUTIONS_FILE).is_file() {
        warn!("Checkpoint {:?} is missing, using {:?}", path, previous);
        return Ok(previous);
    }
    let entries = std::fs::read_dir(path).map_err(|e| {
        PesError::Checkpoint(format!("Cannot read checkpoint path {:?}: {}", path, e))
    })?;

    // Ranked by iteration, then live over `.previous`
    let mut latest: Option<((usize, bool), PathBuf)> = None;
    for entry in entries.flatten() {
        let candidate = entry.path();
        if !candidate.join(SOLUTIONS_FILE).is_file() {
            continue;
        }
        if let Some(iteration) = checkpoint_iteration(&candidate) {
            let rank = (iteration, !is_previous(&candidate));
            if latest.as_ref().map_or(true, |(best, _)| rank > *best) {
                latest = Some((rank, candidate));
            }
        }
    }

    latest.map(|(_, dir)| dir).ok_or_else(|| {
        PesError::Checkpoint(format!("No checkpoint found under {:?}", path))
    })
}

/// Stage both files in a temp directory and rename it to `target`
pub(crate) async fn write_checkpoint(
    target: &Path,
    metadata: &CheckpointMetadata,
    solutions: &[Solution],
) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| PesError::Checkpoint(format!("Invalid checkpoint path {:?}", target)))?;
    fs::create_dir_all(parent).await?;

    let staging = parent.join(format!(".staging-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&staging).await?;

    let result = async {
        let solutions_raw = serde_json::to_vec_pretty(solutions)?;
        let metadata = CheckpointMetadata {
            solutions_sha256: digest(&solutions_raw),
            ..metadata.clone()
        };
        fs::write(staging.join(SOLUTIONS_FILE), &solutions_raw).await?;
        fs::write(
            staging.join(METADATA_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )
        .await?;
        replace_dir(&staging, target).await?;
        Ok::<_, PesError>(())
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_dir_all(&staging).await;
    }
    result?;
    debug!("Wrote checkpoint {:?} ({} solutions)", target, solutions.len());
    Ok(())
}

/// Move `target` aside, rename `staging` into its place, then drop the old copy
async fn replace_dir(staging: &Path, target: &Path) -> Result<()> {
    let previous = previous_path(target);
    let replacing = fs::metadata(target).await.is_ok();
    if replacing {
        if fs::metadata(&previous).await.is_ok() {
            fs::remove_dir_all(&previous).await?;
        }
        fs::rename(target, &previous).await?;
    }

    if let Err(e) = fs::rename(staging, target).await {
        if replacing {
            let _ = fs::rename(&previous, target).await;
        }
        return Err(e.into());
    }

    if fs::metadata(&previous).await.is_ok() {
        if let Err(e) = fs::remove_dir_all(&previous).await {
            warn!("Could not remove replaced checkpoint {:?}: {}", previous, e);
        }
    }
    Ok(())
}

pub(crate) async fn read_checkpoint(dir: &Path) -> Result<(CheckpointMetadata, Vec<Solution>)> {
    let solutions_raw = fs::read(dir.join(SOLUTIONS_FILE)).await.map_err(|e| {
        PesError::Checkpoint(format!("Cannot read {:?}: {}", dir.join(SOLUTIONS_FILE), e))
    })?;
    let metadata_raw = fs::read(dir.join(METADATA_FILE)).await.map_err(|e| {
        PesError::Checkpoint(format!("Cannot read {:?}: {}", dir.join(METADATA_FILE), e))
    })?;

    let metadata: CheckpointMetadata = serde_json::from_slice(&metadata_raw)
        .map_err(|e| PesError::Checkpoint(format!("Corrupt {}: {}", METADATA_FILE, e)))?;
    if !metadata.solutions_sha256.is_empty() && metadata.solutions_sha256 != digest(&solutions_raw)
    {
        return Err(PesError::Checkpoint(format!(
            "{} does not match its recorded checksum",
            SOLUTIONS_FILE
        )));
    }
    let solutions: Vec<Solution> = serde_json::from_slice(&solutions_raw)
        .map_err(|e| PesError::Checkpoint(format!("Corrupt {}: {}", SOLUTIONS_FILE, e)))?;

    if metadata.version != FORMAT_VERSION {
        return Err(PesError::Checkpoint(format!(
            "Unsupported checkpoint version {} (expected {})",
            metadata.version, FORMAT_VERSION
        )));
    }
    validate_snapshot(&metadata, &solutions)?;
    Ok((metadata, solutions))
}

/// Structural checks a restored population must pass
fn validate_snapshot(metadata: &CheckpointMetadata, solutions: &[Solution]) -> Result<()> {
    if metadata.num_islands == 0 {
        return Err(PesError::Checkpoint("num_islands is 0".to_string()));
    }
    if metadata.solution_count != solutions.len() {
        return Err(PesError::Checkpoint(format!(
            "metadata lists {} solutions, file holds {}",
            metadata.solution_count,
            solutions.len()
        )));
    }

    let mut seen: HashSet<SolutionId> = HashSet::with_capacity(solutions.len());
    let mut previous: Option<SolutionId> = None;
    for solution in solutions {
        if previous.map_or(false, |p| solution.id <= p) {
            return Err(PesError::Checkpoint(format!(
                "solution {} is out of id order",
                solution.id
            )));
        }
        if solution.island_id >= metadata.num_islands {
            return Err(PesError::Checkpoint(format!(
                "solution {} references island {} of {}",
                solution.id, solution.island_id, metadata.num_islands
            )));
        }
        if let Some(parent) = solution.parent_id {
            if !seen.contains(&parent) {
                return Err(PesError::Checkpoint(format!(
                    "solution {} references unknown or later parent {}",
                    solution.id, parent
                )));
            }
        }
        seen.insert(solution.id);
        previous = Some(solution.id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pes_core::SolutionDraft;
    use tempfile::TempDir;

    fn metadata(count: usize) -> CheckpointMetadata {
        CheckpointMetadata {
            version: FORMAT_VERSION,
            num_islands: 2,
            next_id: SolutionId(count as u64),
            total_iterations: count,
            last_iteration: count.checked_sub(1),
            solution_count: count,
            best_solution_id: None,
            best_score: None,
            saved_at: Utc::now(),
            solutions_sha256: String::new(),
        }
    }

    fn solution(id: u64, parent: Option<u64>, island: usize) -> Solution {
        SolutionDraft::new("trace", island)
            .with_parent(parent.map(SolutionId))
            .into_solution(SolutionId(id), Utc::now())
    }

    #[test]
    fn test_dir_name_roundtrip() {
        let name = checkpoint_dir_name(12);
        assert_eq!(name, "checkpoint-iter-12");
        assert_eq!(checkpoint_iteration(Path::new(&name)), Some(12));
        assert_eq!(checkpoint_iteration(Path::new(".staging-x")), None);
        assert_eq!(
            checkpoint_iteration(Path::new("checkpoint-iter-12.previous")),
            Some(12)
        );
    }

    #[test]
    fn test_snapshot_rejects_forward_parent() {
        let solutions = vec![solution(0, Some(1), 0), solution(1, None, 0)];
        let err = validate_snapshot(&metadata(2), &solutions).unwrap_err();
        assert!(matches!(err, PesError::Checkpoint(_)));
    }

    #[test]
    fn test_snapshot_rejects_unknown_island() {
        let solutions = vec![solution(0, None, 5)];
        assert!(validate_snapshot(&metadata(1), &solutions).is_err());
    }

    #[test]
    fn test_snapshot_rejects_duplicate_ids() {
        let solutions = vec![solution(3, None, 0), solution(3, None, 1)];
        assert!(validate_snapshot(&metadata(2), &solutions).is_err());
    }

    #[tokio::test]
    async fn test_resolve_picks_latest_child() {
        let temp = TempDir::new().unwrap();
        for iteration in [2, 10, 4] {
            let dir = temp.path().join(checkpoint_dir_name(iteration));
            write_checkpoint(&dir, &metadata(0), &[]).await.unwrap();
        }
        std::fs::create_dir_all(temp.path().join("checkpoint-iter-99")).unwrap();

        let resolved = resolve_checkpoint_dir(temp.path()).unwrap();
        assert_eq!(resolved, temp.path().join("checkpoint-iter-10"));
        assert_eq!(resolve_checkpoint_dir(&resolved).unwrap(), resolved);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_existing_checkpoint() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(checkpoint_dir_name(1));
        write_checkpoint(&dir, &metadata(0), &[]).await.unwrap();
        write_checkpoint(&dir, &metadata(1), &[solution(0, None, 1)])
            .await
            .unwrap();

        let (meta, solutions) = read_checkpoint(&dir).await.unwrap();
        assert_eq!(meta.solution_count, 1);
        assert_eq!(solutions.len(), 1);
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path() != dir)
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn test_interrupted_rewrite_keeps_previous_checkpoint() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(checkpoint_dir_name(3));
        write_checkpoint(&dir, &metadata(1), &[solution(0, None, 0)])
            .await
            .unwrap();
        // State after the old copy was moved aside but before the new one landed
        std::fs::rename(&dir, previous_path(&dir)).unwrap();

        assert_eq!(resolve_checkpoint_dir(temp.path()).unwrap(), previous_path(&dir));
        let resolved = resolve_checkpoint_dir(&dir).unwrap();
        let (meta, solutions) = read_checkpoint(&resolved).await.unwrap();
        assert_eq!(meta.solution_count, 1);
        assert_eq!(solutions.len(), 1);

        // The next write of that iteration replaces it and cleans up
        write_checkpoint(&dir, &metadata(0), &[]).await.unwrap();
        assert_eq!(resolve_checkpoint_dir(temp.path()).unwrap(), dir);
        assert!(!previous_path(&dir).exists());
    }

    #[tokio::test]
    async fn test_live_checkpoint_beats_previous_copy() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(checkpoint_dir_name(5));
        write_checkpoint(&dir, &metadata(0), &[]).await.unwrap();
        write_checkpoint(&previous_path(&dir), &metadata(0), &[])
            .await
            .unwrap();

        assert_eq!(resolve_checkpoint_dir(temp.path()).unwrap(), dir);
    }

    #[tokio::test]
    async fn test_tampered_solutions_fail_checksum() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(checkpoint_dir_name(0));
        write_checkpoint(&dir, &metadata(1), &[solution(0, None, 0)])
            .await
            .unwrap();
        let raw = std::fs::read_to_string(dir.join(SOLUTIONS_FILE)).unwrap();
        std::fs::write(dir.join(SOLUTIONS_FILE), raw.replace("\"island_id\": 0", "\"island_id\": 1"))
            .unwrap();

        let err = read_checkpoint(&dir).await.unwrap_err();
        assert!(err.to_string().contains("checksum"), "{}", err);
    }

    #[test]
    fn test_resolve_missing_path_is_checkpoint_error() {
        let err = resolve_checkpoint_dir(Path::new("/nonexistent/pes-ckpt")).unwrap_err();
        assert!(matches!(err, PesError::Checkpoint(_)));
    }
}
