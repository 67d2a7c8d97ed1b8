//! Changelog heartbeat writer
//!
//! Writes the current epoch milliseconds to the changelog table at a fixed
//! interval. The streamer reads those rows back off the change stream, so
//! the gap between now and the last heartbeat it saw is its lag.

use crate::context::{MigrationContext, HEARTBEAT_HINT};
use crate::db::Applier;
use chrono::Utc;
use std::sync::Arc;

/// Write one heartbeat row
pub async fn beat(ctx: &MigrationContext, applier: &dyn Applier) -> crate::db::DbResult<i64> {
    let now = Utc::now().timestamp_millis();
    applier
        .write_changelog(
            ctx.database(),
            &ctx.names().changelog,
            HEARTBEAT_HINT,
            &now.to_string(),
        )
        .await?;
    Ok(now)
}

/// Beat until shutdown; failures are logged and skipped
pub async fn run(ctx: Arc<MigrationContext>, applier: Arc<dyn Applier>) {
    let shutdown = ctx.shutdown().clone();
    let mut ticker = tokio::time::interval(ctx.settings().timing.heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = beat(&ctx, applier.as_ref()).await {
                    tracing::warn!(error = %e, "heartbeat write failed");
                }
            }
        }
    }
    tracing::debug!("heartbeat stopped");
}
