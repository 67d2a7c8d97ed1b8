//! Progress snapshots and the periodic status line

use crate::context::MigrationContext;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Point-in-time view of a run's progress
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    /// Estimated rows in the original table
    pub rows_estimate: u64,
    /// Rows copied so far
    pub rows_copied: u64,
    /// Change events applied so far
    pub dml_applied: u64,
    /// Chunks copied
    pub iteration: u64,
    /// Copy completion, 0 to 100
    pub percent: f64,
    /// Time since the copy started
    pub copy_elapsed: Duration,
    /// Remaining copy time extrapolated from the rate so far
    pub eta: Option<Duration>,
    /// Whether work is paused
    pub throttled: bool,
    /// Why work is paused
    pub throttle_reason: String,
    /// Streamer lag behind the heartbeat, once known
    pub applier_lag: Option<Duration>,
    /// Whether the copy has finished
    pub copy_complete: bool,
    /// Whether cut-over is postponed by flag file
    pub cut_over_postponed: bool,
}

/// Take a progress snapshot
#[must_use]
pub fn progress(ctx: &MigrationContext) -> Progress {
    let rows_estimate = ctx.rows_estimate();
    let rows_copied = ctx.total_rows_copied();
    let copy_complete = ctx.is_row_copy_complete();
    let timeline = ctx.timeline();
    let copy_elapsed = timeline
        .row_copy_started_at
        .map(|start| {
            let end = timeline.row_copy_ended_at.unwrap_or_else(Utc::now);
            (end - start).to_std().unwrap_or_default()
        })
        .unwrap_or_default();

    let percent = if copy_complete {
        100.0
    } else {
        copy_percent(rows_copied, rows_estimate)
    };
    let eta = if copy_complete {
        Some(Duration::ZERO)
    } else {
        estimate_remaining(rows_copied, rows_estimate, copy_elapsed)
    };

    let throttle = ctx.throttle_state();
    let lag = ctx.applier_lag();

    Progress {
        rows_estimate,
        rows_copied,
        dml_applied: ctx.total_dml_applied(),
        iteration: ctx.iteration(),
        percent,
        copy_elapsed,
        eta,
        throttled: throttle.throttled,
        throttle_reason: throttle.reason,
        applier_lag: (lag != Duration::MAX).then_some(lag),
        copy_complete,
        cut_over_postponed: ctx.is_cut_over_postponed(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn copy_percent(copied: u64, estimate: u64) -> f64 {
    if estimate == 0 {
        return 0.0;
    }
    (copied as f64 * 100.0 / estimate as f64).min(100.0)
}

#[allow(clippy::cast_precision_loss)]
fn estimate_remaining(copied: u64, estimate: u64, elapsed: Duration) -> Option<Duration> {
    if copied == 0 || estimate <= copied {
        return None;
    }
    let per_row = elapsed.as_secs_f64() / copied as f64;
    Some(Duration::from_secs_f64(per_row * (estimate - copied) as f64))
}

/// Render a one-line summary
#[must_use]
pub fn status_line(p: &Progress) -> String {
    let state = if p.throttled {
        format!("throttled, {}", p.throttle_reason)
    } else if p.copy_complete && p.cut_over_postponed {
        "postponing cut-over".to_string()
    } else {
        "migrating".to_string()
    };
    let eta = match p.eta {
        Some(d) if d.is_zero() => "due".to_string(),
        Some(d) => format!("{}s", d.as_secs()),
        None => "N/A".to_string(),
    };
    let lag = p
        .applier_lag
        .map_or_else(|| "N/A".to_string(), |l| format!("{:.2}s", l.as_secs_f64()));
    format!(
        "Copy: {}/{} {:.1}%; Applied: {}; Lag: {}; State: {}; ETA: {}",
        p.rows_copied, p.rows_estimate, p.percent, p.dml_applied, lag, state, eta
    )
}

/// Log the status line at the configured interval until shutdown
pub async fn run(ctx: Arc<MigrationContext>) {
    let shutdown = ctx.shutdown().clone();
    let mut ticker = tokio::time::interval(ctx.settings().timing.status_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let p = progress(&ctx);
                tracing::info!(
                    rows_copied = p.rows_copied,
                    dml_applied = p.dml_applied,
                    iteration = p.iteration,
                    "{}",
                    status_line(&p)
                );
            }
        }
    }
}
