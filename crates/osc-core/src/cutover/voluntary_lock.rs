//! Advisory-lock cut-over
//!
//! A named advisory lock serializes cut-over attempts. In-flight queries on
//! the original table are killed, the table is write-locked, and once the
//! streamer has caught up to the lock both tables are swapped in a single
//! atomic rename. Blocked writers resume against the new table and never
//! see the name missing.

use super::CutOverEnv;
use crate::error::CutOverError;

/// Advisory lock, query kill, write lock, atomic swap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoluntaryLock;

impl VoluntaryLock {
    pub(crate) async fn attempt(&self, env: CutOverEnv<'_>) -> Result<(), CutOverError> {
        let database = env.database();
        let names = env.ctx.names();

        if !env
            .swapper
            .acquire_advisory_lock(&names.lock_name, env.timeout())
            .await?
        {
            return Err(CutOverError::LockNotAcquired {
                name: names.lock_name.clone(),
            });
        }

        let result = async {
            let killed = env
                .swapper
                .kill_table_queries(database, &names.original)
                .await?;
            tracing::debug!(killed, "killed queries on original table");

            env.swapper.lock_table_write(database, &names.original).await?;
            env.mark_locked();
            let swapped = async {
                env.wait_for_events_up_to_lock().await?;
                env.mark_renaming();
                env.swapper
                    .swap_tables(database, &names.original, &names.ghost, &names.old)
                    .await?;
                env.mark_renamed();
                Ok::<(), CutOverError>(())
            }
            .await;
            if let Err(e) = env.swapper.unlock_tables().await {
                tracing::warn!(error = %e, "unlock tables failed");
            }
            swapped
        }
        .await;

        if let Err(e) = env.swapper.release_advisory_lock(&names.lock_name).await {
            tracing::warn!(lock = %names.lock_name, error = %e, "advisory lock release failed");
        }
        result
    }
}
