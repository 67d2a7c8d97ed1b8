//! Throttle control loop
//!
//! Samples pause conditions in a fixed order (flag files, replica lag,
//! max-load) and publishes the first one that holds into the context's
//! throttle region. Copier and streamer only ever read that region.

use crate::context::{MigrationContext, ThrottleState};
use crate::db::LoadProbe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodic throttle evaluator
pub struct Throttler {
    ctx: Arc<MigrationContext>,
    probe: Arc<dyn LoadProbe>,
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler").finish_non_exhaustive()
    }
}

impl Throttler {
    /// Create a throttler for `ctx` sampling through `probe`
    pub fn new(ctx: Arc<MigrationContext>, probe: Arc<dyn LoadProbe>) -> Self {
        Self { ctx, probe }
    }

    /// Evaluate all conditions without publishing the result
    ///
    /// First match wins: flag files, then replica lag, then max-load in
    /// variable-name order.
    pub async fn evaluate(&self) -> ThrottleState {
        let settings = self.ctx.settings();
        for flag in [
            &settings.throttle_flag_file,
            &settings.throttle_additional_flag_file,
        ]
        .into_iter()
        .flatten()
        {
            if flag_exists(flag).await {
                return throttled(format!("flag-file {}", flag.display()));
            }
        }

        let tunables = self.ctx.tunables();
        if tunables.max_lag_millis > 0 {
            match self
                .probe
                .replication_lag(tunables.replication_lag_query.clone())
                .await
            {
                Ok(lag) if lag > Duration::from_millis(tunables.max_lag_millis) => {
                    return throttled(format!(
                        "lag={:.3}s > {}ms",
                        lag.as_secs_f64(),
                        tunables.max_lag_millis
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    if let Some(state) = self.probe_failed("replication lag", &e) {
                        return state;
                    }
                }
            }
        }

        for (variable, max) in tunables.max_load.conditions() {
            match self.probe.status_variable(variable.to_string()).await {
                Ok(value) if value > max => {
                    return throttled(format!("max-load {variable}={value} > {max}"));
                }
                Ok(_) => {}
                Err(e) => {
                    if let Some(state) = self.probe_failed(variable, &e) {
                        return state;
                    }
                }
            }
        }

        ThrottleState::default()
    }

    fn probe_failed(&self, what: &str, error: &crate::error::DbError) -> Option<ThrottleState> {
        tracing::warn!(condition = what, error = %error, "throttle probe failed");
        if self.ctx.settings().ignore_throttle_probe_errors {
            None
        } else {
            Some(throttled(format!("unable to determine {what}: {error}")))
        }
    }

    /// Evaluate, publish the decision and refresh the postponement flag
    pub async fn check(&self) -> ThrottleState {
        let state = self.evaluate().await;
        let previous = self.ctx.throttle_state();
        if previous.throttled != state.throttled {
            if state.throttled {
                tracing::info!(reason = %state.reason, "throttling");
            } else {
                tracing::info!("throttle released");
            }
        }
        self.ctx.set_throttle(state.throttled, state.reason.clone());

        if let Some(flag) = &self.ctx.settings().postpone_cut_over_flag_file {
            let postponed = flag_exists(flag).await;
            if postponed != self.ctx.is_cut_over_postponed() {
                tracing::info!(postponed, flag = %flag.display(), "cut-over postponement changed");
            }
            self.ctx.set_cut_over_postponed(postponed);
        }
        state
    }

    /// Re-check at the configured interval until shutdown
    pub async fn run(self) {
        let shutdown = self.ctx.shutdown().clone();
        let mut ticker = tokio::time::interval(self.ctx.settings().timing.throttle_check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
        tracing::debug!("throttler stopped");
    }
}

fn throttled(reason: String) -> ThrottleState {
    ThrottleState {
        throttled: true,
        reason,
    }
}

async fn flag_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Block while the context says throttled
///
/// Polls at the configured interval. Returns `false` if `cancel` fired,
/// `true` when work may proceed.
pub async fn wait_while_throttled(ctx: &MigrationContext, cancel: &CancellationToken) -> bool {
    let poll = ctx.settings().timing.throttle_poll_interval();
    let mut announced = false;
    while ctx.is_throttled() {
        if !announced {
            tracing::debug!(reason = %ctx.throttle_state().reason, "waiting on throttle");
            announced = true;
        }
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(poll) => {}
        }
    }
    !cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationSettings, Timing};
    use crate::db::MockLoadProbe;
    use crate::error::{DbError, DbErrorKind};

    fn settings() -> MigrationSettings {
        MigrationSettings::new("shop", "orders", "ADD COLUMN note").with_timing(Timing::fast())
    }

    fn throttler(settings: MigrationSettings, probe: MockLoadProbe) -> Throttler {
        Throttler::new(Arc::new(MigrationContext::new(settings)), Arc::new(probe))
    }

    fn calm_probe() -> MockLoadProbe {
        let mut probe = MockLoadProbe::new();
        probe
            .expect_replication_lag()
            .returning(|_| Ok(Duration::from_millis(10)));
        probe.expect_status_variable().returning(|_| Ok(1));
        probe
    }

    #[tokio::test]
    async fn calm_server_is_not_throttled() {
        let mut s = settings();
        s.max_load = "Threads_running=100".parse().unwrap();
        let t = throttler(s, calm_probe());

        let state = t.check().await;
        assert!(!state.throttled);
        assert!(!t.ctx.is_throttled());
    }

    #[tokio::test]
    async fn flag_file_wins_before_probes_run() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("throttle.flag");
        std::fs::write(&flag, b"").unwrap();

        let mut s = settings();
        s.throttle_additional_flag_file = Some(flag.clone());
        let mut probe = MockLoadProbe::new();
        probe.expect_replication_lag().times(0);
        probe.expect_status_variable().times(0);

        let t = throttler(s, probe);
        let state = t.check().await;
        assert!(state.throttled);
        assert!(state.reason.starts_with("flag-file"));
        assert!(state.reason.contains("throttle.flag"));
    }

    #[tokio::test]
    async fn replica_lag_over_threshold_throttles() {
        let mut probe = MockLoadProbe::new();
        probe
            .expect_replication_lag()
            .withf(|q| q.as_deref() == Some("SELECT lag FROM meta.heartbeat"))
            .returning(|_| Ok(Duration::from_millis(2500)));
        probe.expect_status_variable().times(0);

        let mut s = settings();
        s.replication_lag_query = Some("SELECT lag FROM meta.heartbeat".to_string());
        let state = throttler(s, probe).evaluate().await;
        assert!(state.throttled);
        assert!(state.reason.starts_with("lag="));
    }

    #[tokio::test]
    async fn max_load_over_threshold_throttles() {
        let mut probe = MockLoadProbe::new();
        probe
            .expect_replication_lag()
            .returning(|_| Ok(Duration::ZERO));
        probe
            .expect_status_variable()
            .withf(|name| name == "Threads_running")
            .returning(|_| Ok(150));

        let mut s = settings();
        s.max_load = "Threads_running=100".parse().unwrap();
        let state = throttler(s, probe).evaluate().await;
        assert!(state.throttled);
        assert_eq!(state.reason, "max-load Threads_running=150 > 100");
    }

    #[tokio::test]
    async fn probe_errors_throttle_unless_ignored() {
        let failing = || {
            let mut probe = MockLoadProbe::new();
            probe
                .expect_replication_lag()
                .returning(|_| Err(DbError::new(DbErrorKind::ConnectionLost, "replica gone")));
            probe
        };

        let state = throttler(settings(), failing()).evaluate().await;
        assert!(state.throttled);
        assert!(state.reason.starts_with("unable to determine replication lag"));

        let mut s = settings();
        s.ignore_throttle_probe_errors = true;
        let state = throttler(s, failing()).evaluate().await;
        assert!(!state.throttled);
    }

    #[tokio::test]
    async fn postpone_flag_tracks_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("postpone.flag");
        let mut s = settings();
        s.postpone_cut_over_flag_file = Some(flag.clone());
        let t = throttler(s, calm_probe());

        t.check().await;
        assert!(!t.ctx.is_cut_over_postponed());

        std::fs::write(&flag, b"").unwrap();
        t.check().await;
        assert!(t.ctx.is_cut_over_postponed());
        assert!(!t.ctx.is_throttled());
    }

    #[tokio::test]
    async fn waiting_ends_when_throttle_clears() {
        let ctx = Arc::new(MigrationContext::new(settings()));
        ctx.set_throttle(true, "test");
        let token = CancellationToken::new();

        let releaser = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                ctx.set_throttle(false, "");
            })
        };

        assert!(wait_while_throttled(&ctx, &token).await);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn waiting_stops_on_cancel() {
        let ctx = MigrationContext::new(settings());
        ctx.set_throttle(true, "test");
        let token = CancellationToken::new();
        token.cancel();
        assert!(!wait_while_throttled(&ctx, &token).await);
    }
}
