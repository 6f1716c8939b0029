//! The artifact fetch seam and its retry policy.
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::warn;

/// A failure to resolve an artifact reference
#[derive(Debug, Error, Clone)]
#[error("artifact {reference}: {message}")]
pub struct FetchError {
    /// The reference that failed
    pub reference: String,
    /// What went wrong
    pub message: String,
}

/// Resolves artifact references to local paths.
///
/// External collaborator: image/package distribution is out of scope, only
/// this interface is specified.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync + 'static {
    /// Fetch one artifact, returning where it landed locally
    async fn fetch(&self, reference: &str) -> Result<PathBuf, FetchError>;
}

/// Fetch with capped, jittered exponential backoff.
///
/// `attempts` bounds the retry-forever temptation explicitly: permanent
/// failure must surface as unit phase `Failed` with a reason rather than
/// an unbounded loop.
pub async fn fetch_with_retry(
    fetcher: &dyn ArtifactFetcher,
    reference: &str,
    attempts: u32,
    initial_delay: Duration,
) -> Result<PathBuf, FetchError> {
    let mut backoff = ExponentialBackoff {
        initial_interval: initial_delay,
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match fetcher.fetch(reference).await {
            Ok(path) => return Ok(path),
            Err(err) => {
                warn!(reference, attempt, error = %err, "artifact fetch failed");
                last_error = Some(err);
                if attempt < attempts {
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_error.expect("at least one attempt ran"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFetcher;

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let fetcher = FakeFetcher::default();
        fetcher.fail_times("registry/web:1", 2);
        let path = fetch_with_retry(&fetcher, "registry/web:1", 5, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(path.to_string_lossy().contains("registry"));
        assert_eq!(fetcher.calls("registry/web:1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_surfaces_after_the_cap() {
        let fetcher = FakeFetcher::default();
        fetcher.fail_times("registry/broken:1", u32::MAX);
        let err = fetch_with_retry(&fetcher, "registry/broken:1", 3, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.reference, "registry/broken:1");
        assert_eq!(fetcher.calls("registry/broken:1"), 3);
    }
}
