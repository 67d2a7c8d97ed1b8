//! Wait-session cut-over
//!
//! A helper session blocks new access to the original table for the
//! duration of the swap, so no connection needs killing. The atomic rename
//! runs once the streamer has applied everything written before the block.
//! A backend must refuse the swap if the wait session has already timed
//! out, since writers are no longer held back at that point.

use super::CutOverEnv;
use crate::error::CutOverError;

/// Blocking wait session, atomic swap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdfWait;

impl UdfWait {
    pub(crate) async fn attempt(&self, env: CutOverEnv<'_>) -> Result<(), CutOverError> {
        let database = env.database();
        let names = env.ctx.names();

        env.swapper
            .install_udf_wait(database, &names.original, env.timeout())
            .await?;
        env.mark_locked();
        let result = async {
            env.wait_for_events_up_to_lock().await?;
            env.mark_renaming();
            env.swapper
                .swap_tables(database, &names.original, &names.ghost, &names.old)
                .await?;
            env.mark_renamed();
            Ok::<(), CutOverError>(())
        }
        .await;
        if let Err(e) = env.swapper.release_udf_wait().await {
            tracing::warn!(error = %e, "releasing wait session failed");
        }
        result
    }
}
