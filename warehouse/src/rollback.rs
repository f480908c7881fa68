//! Time-bounded transaction rollback.
//!
//! A rollback runs as its own tokio task raced against a timer. When the timer wins the task
//! is detached, not cancelled: it keeps running in the background and may still hold its
//! connection until the server answers or the connection is torn down by the pool.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{error, info};

use crate::metrics::{WH_PG_ROLLBACK_TIMEOUT_TOTAL, register_metrics};
use crate::tags::LoadTags;

/// Terminal state of a supervised rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The rollback finished successfully within the timeout.
    Completed,
    /// The rollback finished within the timeout with an error, or its task panicked.
    Failed,
    /// The timeout elapsed first and the rollback task was abandoned.
    TimedOut,
}

/// Runs `rollback` with an upper bound of `timeout`.
///
/// Rollback errors are logged and never returned, since callers are already handling the
/// failure that triggered the rollback. On timeout `wh_pg_rollback_timeout_total` is
/// incremented with `tags`.
pub async fn run_rollback_with_timeout<F, E>(
    rollback: F,
    timeout: Duration,
    tags: &LoadTags,
) -> RollbackOutcome
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    register_metrics();

    let handle = tokio::spawn(rollback);

    // Dropping the handle on timeout detaches the task.
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(()))) => {
            info!(table = %tags.table, "transaction rolled back");
            RollbackOutcome::Completed
        }
        Ok(Ok(Err(err))) => {
            error!(table = %tags.table, error = %err, "failed to roll back transaction");
            RollbackOutcome::Failed
        }
        Ok(Err(join_err)) => {
            error!(table = %tags.table, error = %join_err, "rollback task panicked");
            RollbackOutcome::Failed
        }
        Err(_) => {
            error!(
                table = %tags.table,
                stage = tags.stage.map(|stage| stage.as_str()),
                timeout_ms = timeout.as_millis() as u64,
                "timed out rolling back transaction"
            );
            metrics::counter!(WH_PG_ROLLBACK_TIMEOUT_TOTAL, tags.labels()).increment(1);
            RollbackOutcome::TimedOut
        }
    }
}
