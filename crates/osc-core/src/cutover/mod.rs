//! Cut-over coordination
//!
//! The coordinator waits until the copy is exhausted, the streamer has
//! converged and nothing postpones the swap, then runs the configured
//! strategy. Attempts are bounded; a failed attempt always leaves the
//! original table in place before the next one starts. Noop runs stop
//! after the readiness wait and a marker round trip.
//!
//! State machine:
//!
//! ```text
//! NotReady -> ReadyToCutOver -> CuttingOver -> Done
//!     ^            |                |
//!     +------------+----------------+-> Failed
//! ```

mod two_step;
mod udf_wait;
mod voluntary_lock;

pub use two_step::TwoStep;
pub use udf_wait::UdfWait;
pub use voluntary_lock::VoluntaryLock;

use crate::config::MAX_RETRIES;
use crate::context::{MigrationContext, EVENTS_UP_TO_LOCK_PREFIX, STATE_HINT};
use crate::db::{Applier, TableSwapper};
use crate::error::{CutOverError, MigrationError, Phase};
use crate::throttler::wait_while_throttled;
use crate::types::CutOverType;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cut-over progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CutOverState {
    /// Copy or stream not converged yet
    NotReady,
    /// All readiness conditions hold
    ReadyToCutOver,
    /// An attempt is running
    CuttingOver,
    /// Ghost table is live under the original name
    Done,
    /// Attempts exhausted; original table untouched
    Failed,
}

impl fmt::Display for CutOverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CutOverState::NotReady => "not-ready",
            CutOverState::ReadyToCutOver => "ready-to-cut-over",
            CutOverState::CuttingOver => "cutting-over",
            CutOverState::Done => "done",
            CutOverState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Check a state transition
///
/// # Errors
/// `MigrationError::IllegalTransition` if `to` is not reachable from `from`.
pub fn validate_transition(from: CutOverState, to: CutOverState) -> Result<(), MigrationError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(MigrationError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: CutOverState) -> Vec<CutOverState> {
    use CutOverState::{CuttingOver, Done, Failed, NotReady, ReadyToCutOver};
    match from {
        NotReady => vec![ReadyToCutOver],
        ReadyToCutOver => vec![CuttingOver, NotReady],
        CuttingOver => vec![Done, Failed, NotReady],
        Done | Failed => vec![],
    }
}

/// What a strategy gets to work with during one attempt
#[derive(Clone, Copy)]
pub struct CutOverEnv<'a> {
    /// Shared state
    pub ctx: &'a MigrationContext,
    /// Changelog writes
    pub applier: &'a dyn Applier,
    /// Locks and renames
    pub swapper: &'a dyn TableSwapper,
}

impl fmt::Debug for CutOverEnv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CutOverEnv")
            .field("table", &self.ctx.names().original)
            .finish_non_exhaustive()
    }
}

impl CutOverEnv<'_> {
    /// Schema name
    #[must_use]
    pub fn database(&self) -> &str {
        self.ctx.database()
    }

    /// Bound on the locked section
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.ctx.settings().swap_tables_timeout()
    }

    /// Record that writes to the original table are now blocked
    pub fn mark_locked(&self) {
        self.ctx.with_timeline(|t| t.lock_started_at = Some(Utc::now()));
    }

    /// Record the start of the rename
    pub fn mark_renaming(&self) {
        self.ctx.with_timeline(|t| t.rename_started_at = Some(Utc::now()));
    }

    /// Record that the ghost table is live
    pub fn mark_renamed(&self) {
        self.ctx.with_timeline(|t| t.rename_ended_at = Some(Utc::now()));
    }

    /// Write a fresh marker and wait until the streamer has applied it
    ///
    /// Must be called with writes to the original table blocked: once it
    /// returns, every write to the original table is in the ghost table and
    /// the streamer is parked.
    ///
    /// # Errors
    /// The changelog write fails, or the marker is not applied within the
    /// swap timeout.
    pub async fn wait_for_events_up_to_lock(&self) -> Result<u64, CutOverError> {
        let id = self.ctx.next_lock_marker_id();
        let mut seen = self.ctx.subscribe_lock_marker();
        let timeout = self.timeout();

        self.applier
            .write_changelog(
                self.database(),
                &self.ctx.names().changelog,
                STATE_HINT,
                &format!("{EVENTS_UP_TO_LOCK_PREFIX}{id}"),
            )
            .await?;

        let started = Instant::now();
        let reached = tokio::time::timeout(timeout, async {
            seen.wait_for(|marker| *marker >= id).await.is_ok()
        })
        .await;

        match reached {
            Ok(true) => {
                tracing::debug!(marker = id, waited = ?started.elapsed(), "events up to lock applied");
                Ok(id)
            }
            _ => Err(CutOverError::EventsUpToLockTimeout { timeout }),
        }
    }
}

/// Selected cut-over strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutOverStrategy {
    /// Two sequential renames with rollback
    TwoStep(TwoStep),
    /// Advisory lock, query kill, atomic swap
    VoluntaryLock(VoluntaryLock),
    /// Blocking wait session, atomic swap
    UdfWait(UdfWait),
}

impl CutOverStrategy {
    /// Strategy for a configured type
    #[must_use]
    pub fn for_type(kind: CutOverType) -> Self {
        match kind {
            CutOverType::TwoStep => Self::TwoStep(TwoStep),
            CutOverType::VoluntaryLock => Self::VoluntaryLock(VoluntaryLock),
            CutOverType::UdfWait => Self::UdfWait(UdfWait),
        }
    }

    /// Configured type this strategy implements
    #[must_use]
    pub fn kind(&self) -> CutOverType {
        match self {
            Self::TwoStep(_) => CutOverType::TwoStep,
            Self::VoluntaryLock(_) => CutOverType::VoluntaryLock,
            Self::UdfWait(_) => CutOverType::UdfWait,
        }
    }

    /// Run one attempt
    ///
    /// On error, every lock the attempt took has been released and the
    /// original table is back under its name.
    ///
    /// # Errors
    /// Whatever stopped the attempt; see `CutOverError::is_retryable`.
    pub async fn attempt_cut_over(&self, env: CutOverEnv<'_>) -> Result<(), CutOverError> {
        match self {
            Self::TwoStep(s) => s.attempt(env).await,
            Self::VoluntaryLock(s) => s.attempt(env).await,
            Self::UdfWait(s) => s.attempt(env).await,
        }
    }
}

/// Result of a completed cut-over
#[derive(Debug, Clone, Serialize)]
pub struct CutOverOutcome {
    /// Strategy used
    pub strategy: CutOverType,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Time from first attempt to success
    pub duration: Duration,
}

/// Drives readiness checks and bounded cut-over attempts
pub struct CutOverCoordinator {
    ctx: Arc<MigrationContext>,
    applier: Arc<dyn Applier>,
    swapper: Arc<dyn TableSwapper>,
    strategy: CutOverStrategy,
    state: CutOverState,
}

impl fmt::Debug for CutOverCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CutOverCoordinator")
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CutOverCoordinator {
    /// Coordinator using the strategy configured in `ctx`
    pub fn new(
        ctx: Arc<MigrationContext>,
        applier: Arc<dyn Applier>,
        swapper: Arc<dyn TableSwapper>,
    ) -> Self {
        let strategy = CutOverStrategy::for_type(ctx.settings().cut_over_type);
        Self {
            ctx,
            applier,
            swapper,
            strategy,
            state: CutOverState::NotReady,
        }
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> CutOverState {
        self.state
    }

    /// Strategy in use
    #[inline]
    #[must_use]
    pub fn strategy(&self) -> CutOverStrategy {
        self.strategy
    }

    fn transition(&mut self, to: CutOverState) -> Result<(), MigrationError> {
        validate_transition(self.state, to)?;
        tracing::debug!(from = %self.state, %to, "cut-over state");
        self.state = to;
        Ok(())
    }

    /// Whether every readiness condition holds right now
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let threshold = Duration::from_millis(self.ctx.settings().cut_over_lag_threshold_millis);
        self.ctx.is_row_copy_complete()
            && self.ctx.applier_lag() < threshold
            && !self.ctx.is_cut_over_postponed()
    }

    async fn wait_until_ready(&mut self) -> Result<(), MigrationError> {
        let shutdown = self.ctx.shutdown().clone();
        let poll = self.ctx.settings().timing.cut_over_poll_interval();
        let mut postponed_logged = false;
        loop {
            if !wait_while_throttled(&self.ctx, &shutdown).await {
                return Err(MigrationError::Cancelled {
                    phase: Phase::CutOver,
                });
            }
            if self.is_ready() {
                return self.transition(CutOverState::ReadyToCutOver);
            }
            if self.ctx.is_cut_over_postponed() && !postponed_logged {
                tracing::info!("cut-over postponed by flag file");
                postponed_logged = true;
            }
            tokio::select! {
                () = shutdown.cancelled() => {
                    return Err(MigrationError::Cancelled { phase: Phase::CutOver });
                }
                () = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Wait for readiness and swap, retrying failed attempts
    ///
    /// On success the streamer is told to stop.
    ///
    /// # Errors
    /// `MigrationError::CutOverFailed` after a non-retryable failure or the
    /// last allowed attempt; `Cancelled` on shutdown.
    pub async fn run(&mut self) -> Result<CutOverOutcome, MigrationError> {
        let kind = self.strategy.kind();
        let mut started: Option<Instant> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.wait_until_ready().await?;
            self.transition(CutOverState::CuttingOver)?;
            let first = *started.get_or_insert_with(Instant::now);
            self.ctx.with_timeline(|t| {
                t.cut_over_started_at.get_or_insert_with(Utc::now);
            });
            tracing::info!(strategy = %kind, attempt, "cutting over");

            let result = self.strategy.attempt_cut_over(self.env()).await;

            match result {
                Ok(()) => {
                    self.transition(CutOverState::Done)?;
                    self.ctx.streaming_stop().cancel();
                    let outcome = CutOverOutcome {
                        strategy: kind,
                        attempts: attempt,
                        duration: first.elapsed(),
                    };
                    tracing::info!(attempts = attempt, duration = ?outcome.duration, "cut-over complete");
                    return Ok(outcome);
                }
                Err(e) => {
                    self.ctx.resume_streaming_after(self.ctx.lock_markers_issued());
                    if !e.is_retryable() || attempt >= MAX_RETRIES {
                        self.transition(CutOverState::Failed)?;
                        tracing::error!(attempt, error = %e, "cut-over failed");
                        return Err(MigrationError::CutOverFailed {
                            strategy: kind,
                            attempts: attempt,
                            source: e,
                        });
                    }
                    tracing::warn!(attempt, error = %e, "cut-over attempt failed, retrying");
                    self.transition(CutOverState::NotReady)?;
                    self.pause_before_retry().await?;
                }
            }
        }
    }

    /// Wait for readiness and for the streamer to catch up, without swapping
    ///
    /// Used by noop runs. On success the ghost table holds every write to
    /// the original table up to the last marker and the streamer is parked
    /// behind it. Returns the marker id.
    ///
    /// # Errors
    /// `MigrationError::CutOverFailed` when the marker is never applied
    /// within the allowed attempts; `Cancelled` on shutdown.
    pub async fn converge(&mut self) -> Result<u64, MigrationError> {
        let kind = self.strategy.kind();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.wait_until_ready().await?;
            let reached = self.env().wait_for_events_up_to_lock().await;
            match reached {
                Ok(marker) => {
                    tracing::info!(marker, attempts = attempt, "converged, skipping cut-over");
                    return Ok(marker);
                }
                Err(e) => {
                    self.ctx.resume_streaming_after(self.ctx.lock_markers_issued());
                    if !e.is_retryable() || attempt >= MAX_RETRIES {
                        tracing::error!(attempt, error = %e, "streamer did not converge");
                        return Err(MigrationError::CutOverFailed {
                            strategy: kind,
                            attempts: attempt,
                            source: e,
                        });
                    }
                    tracing::warn!(attempt, error = %e, "marker not applied in time, retrying");
                    self.transition(CutOverState::NotReady)?;
                    self.pause_before_retry().await?;
                }
            }
        }
    }

    fn env(&self) -> CutOverEnv<'_> {
        CutOverEnv {
            ctx: &self.ctx,
            applier: self.applier.as_ref(),
            swapper: self.swapper.as_ref(),
        }
    }

    async fn pause_before_retry(&self) -> Result<(), MigrationError> {
        tokio::select! {
            () = self.ctx.shutdown().cancelled() => {
                Err(MigrationError::Cancelled { phase: Phase::CutOver })
            }
            () = tokio::time::sleep(self.ctx.settings().timing.retry_interval()) => Ok(()),
        }
    }
}
