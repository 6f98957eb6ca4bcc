//! Bounded retries for optimistic-concurrency and sequence collisions.

use std::future::Future;
use std::time::Duration;

use errors::{NotebookError, StorageError};
use nb_core::StorageResult;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::debug;

/// Runs `action`, re-running it up to `retries` more times while it fails
/// with a contention error. `action` must re-read whatever it writes.
/// Contention left over after the last retry surfaces as
/// [`NotebookError::Conflict`]; other storage errors are returned as is.
pub async fn on_contention<T, F, Fut>(
    operation: &'static str,
    retries: usize,
    action: F,
) -> Result<T, NotebookError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(5)
        .max_delay(Duration::from_millis(250))
        .map(jitter)
        .take(retries);

    RetryIf::spawn(strategy, action, |e: &StorageError| {
        let retry = e.is_contention();
        if retry {
            debug!(operation, error = %e, "Retrying after contention");
            observability::metrics::record_contention_retry(operation);
        }
        retry
    })
    .await
    .map_err(NotebookError::from_contention)
}
