//! Two sequential renames
//!
//! The original table is renamed away under a write lock, then the ghost is
//! renamed into its place. Between the two renames the original name does
//! not exist; writers see "table missing" for that instant. If the second
//! rename fails the original is renamed back.

use super::CutOverEnv;
use crate::error::CutOverError;

/// Rename original to old, then ghost to original
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwoStep;

impl TwoStep {
    pub(crate) async fn attempt(&self, env: CutOverEnv<'_>) -> Result<(), CutOverError> {
        let database = env.database();
        let names = env.ctx.names();

        env.swapper.lock_table_write(database, &names.original).await?;
        env.mark_locked();
        let locked = async {
            env.wait_for_events_up_to_lock().await?;
            env.mark_renaming();
            env.swapper
                .rename_table(database, &names.original, &names.old)
                .await?;
            Ok::<(), CutOverError>(())
        }
        .await;
        if let Err(e) = env.swapper.unlock_tables().await {
            tracing::warn!(error = %e, "unlock tables failed");
        }
        locked?;

        if let Err(e) = env
            .swapper
            .rename_table(database, &names.ghost, &names.original)
            .await
        {
            tracing::warn!(error = %e, "renaming ghost into place failed, restoring original");
            return match env
                .swapper
                .rename_table(database, &names.old, &names.original)
                .await
            {
                Ok(()) => Err(CutOverError::Database(e)),
                Err(rollback) => Err(CutOverError::RollbackFailed {
                    cause: Box::new(CutOverError::Database(e)),
                    rollback,
                }),
            };
        }
        env.mark_renamed();
        Ok(())
    }
}
