//! Fail-open helpers for side effects that must not abort an iteration
//!
//! Appropriate for audit files (`meta.json`), periodic checkpoints and
//! activity notes. Never use these for the persist step or for phase workers:
//! their failures must reach the orchestrator.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Base delay between retries; attempt `n` waits `n * RETRY_BASE_DELAY`
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Run an operation whose failure is only worth a warning
///
/// # Usage
///
/// ```no_run
/// use pes_core::fail_open::fail_open;
/// use pes_core::Result;
///
/// async fn write_meta() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     // None if write_meta() failed
///     let written = fail_open("executor::meta", || write_meta()).await;
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like [`fail_open`] but retries with linear backoff
///
/// ```no_run
/// use pes_core::fail_open::fail_open_with_retries;
/// use pes_core::Result;
///
/// async fn write_checkpoint() -> Result<std::path::PathBuf> {
///     Ok("checkpoint-iter-5".into())
/// }
///
/// async fn example() {
///     // up to 3 attempts, sleeping 100ms then 200ms between them
///     let dir = fail_open_with_retries("checkpoint", || write_checkpoint(), 3).await;
/// }
/// ```
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_attempts: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=max_attempts {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) if attempt == max_attempts => {
                warn!(
                    "{} failed after {} attempts (fail-open): {}",
                    operation_name, max_attempts, e
                );
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_attempts, e
                );
                tokio::time::sleep(RETRY_BASE_DELAY * attempt as u32).await;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PesError;

    #[tokio::test]
    async fn test_fail_open_passes_value_through() {
        let result = fail_open("meta", || async { Ok::<_, PesError>("written") }).await;
        assert_eq!(result, Some("written"));
    }

    #[tokio::test]
    async fn test_fail_open_swallows_error() {
        let result = fail_open("meta", || async {
            Err::<(), _>(PesError::Checkpoint("disk full".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let mut attempts = 0;
        let result = fail_open_with_retries(
            "checkpoint",
            || {
                attempts += 1;
                let current = attempts;
                async move {
                    if current < 2 {
                        Err(PesError::Checkpoint("rename failed".to_string()))
                    } else {
                        Ok(current)
                    }
                }
            },
            3,
        )
        .await;
        assert_eq!(result, Some(2));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut attempts = 0;
        let result = fail_open_with_retries(
            "checkpoint",
            || {
                attempts += 1;
                async move { Err::<(), _>(PesError::Checkpoint("read-only".to_string())) }
            },
            2,
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(attempts, 2);
    }
}
