//! Bounded retry of transient collaborator failures

use crate::db::DbResult;
use crate::error::{MigrationError, Phase};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `op` until it succeeds, fails fatally, or `ceiling` attempts fail
///
/// Every attempt runs with unchanged parameters. Transient failures sleep
/// `interval` before the next attempt; a non-transient failure is returned at
/// once as `MigrationError::Database`.
pub(crate) async fn retry_transient<T, F, Fut>(
    phase: Phase,
    ceiling: u32,
    interval: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, MigrationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(MigrationError::database(phase, e)),
            Err(e) if attempt >= ceiling => {
                return Err(MigrationError::RetriesExhausted {
                    phase,
                    attempts: attempt,
                    source: e,
                })
            }
            Err(e) => {
                tracing::warn!(%phase, attempt, error = %e, "transient failure, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(MigrationError::Cancelled { phase }),
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
}
