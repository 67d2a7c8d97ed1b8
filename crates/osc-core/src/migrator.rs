//! Migration orchestrator
//!
//! Runs one migration end to end:
//! 1. Validate settings and check prerequisites
//! 2. Create the changelog and ghost tables, alter the ghost
//! 3. Capture stream coordinates, read the key range
//! 4. Run copier and streamer concurrently under the throttler
//! 5. Cut over (or, in noop mode, converge and stop short of it)
//! 6. Clean up according to outcome and settings
//!
//! Whatever happens, the original table is either untouched or fully
//! replaced; workers are always stopped before cleanup touches any table.

use crate::config::MigrationSettings;
use crate::context::{MigrationContext, Timeline, STATE_HINT};
use crate::copier::{CopyStats, RowCopier};
use crate::cutover::{CutOverCoordinator, CutOverOutcome};
use crate::db::Backend;
use crate::error::{DbError, MigrationError, Phase};
use crate::inspect;
use crate::streamer::{ChangeStreamApplier, StreamStats};
use crate::throttler::Throttler;
use crate::types::{BinlogCoordinates, CutOverType};
use crate::{heartbeat, status};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};

/// Static description of what a run would do
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    /// Schema
    pub database: String,
    /// Table being migrated
    pub table: String,
    /// Ghost table
    pub ghost_table: String,
    /// Where the original goes
    pub old_table: String,
    /// Changelog table
    pub changelog_table: String,
    /// Advisory lock name
    pub lock_name: String,
    /// Alter clause
    pub alter: String,
    /// Cut-over strategy
    pub cut_over: CutOverType,
    /// Rows per chunk
    pub chunk_size: u64,
    /// Replica lag threshold
    pub max_lag_millis: u64,
    /// Max-load conditions
    pub max_load: String,
    /// Noop mode
    pub noop: bool,
}

impl MigrationPlan {
    /// Describe `settings` without touching any database
    ///
    /// # Errors
    /// Settings that fail validation.
    pub fn from_settings(settings: &MigrationSettings) -> Result<Self, MigrationError> {
        settings.validate()?;
        let names = crate::context::TableNames::derive(
            &settings.database_name,
            &settings.original_table_name,
        );
        Ok(Self {
            database: settings.database_name.clone(),
            table: names.original,
            ghost_table: names.ghost,
            old_table: names.old,
            changelog_table: names.changelog,
            lock_name: names.lock_name,
            alter: settings.alter_statement.clone(),
            cut_over: settings.cut_over_type,
            chunk_size: settings.chunk_size,
            max_lag_millis: settings.max_lag_millis,
            max_load: settings.max_load.to_string(),
            noop: settings.noop,
        })
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Run id
    pub migration_id: String,
    /// Schema
    pub database: String,
    /// Migrated table
    pub table: String,
    /// Ghost table name
    pub ghost_table: String,
    /// Old table name
    pub old_table: String,
    /// Alter clause
    pub alter: String,
    /// Key used to chunk the copy
    pub migration_key: Option<String>,
    /// Noop mode
    pub noop: bool,
    /// Whether the ghost table replaced the original
    pub swapped: bool,
    /// Whether the old table was dropped afterwards
    pub old_table_dropped: bool,
    /// Estimated rows at start
    pub rows_estimate: u64,
    /// Rows copied
    pub rows_copied: u64,
    /// Chunks copied
    pub chunks: u64,
    /// Change events applied
    pub dml_applied: u64,
    /// Cut-over details when one happened
    pub cut_over: Option<CutOverOutcome>,
    /// Last applied stream position
    pub last_position: Option<BinlogCoordinates>,
    /// Milestones
    pub timeline: Timeline,
}

struct Outcome {
    copy: CopyStats,
    stream: StreamStats,
    cut_over: Option<CutOverOutcome>,
}

#[derive(Default)]
struct Tasks {
    copier: Option<JoinHandle<Result<CopyStats, MigrationError>>>,
    streamer: Option<JoinHandle<Result<StreamStats, MigrationError>>>,
    background: Vec<JoinHandle<()>>,
}

impl Tasks {
    /// Stop and join everything still running
    async fn shutdown(&mut self, ctx: &MigrationContext) {
        ctx.streaming_stop().cancel();
        ctx.shutdown().cancel();
        if let Some(copier) = self.copier.take() {
            if let Err(e) = joined(Phase::Copy, copier.await) {
                tracing::debug!(error = %e, "copier stopped");
            }
        }
        if let Some(streamer) = self.streamer.take() {
            if let Err(e) = joined(Phase::Streaming, streamer.await) {
                tracing::debug!(error = %e, "streamer stopped");
            }
        }
        for task in self.background.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

fn joined<T>(
    phase: Phase,
    result: Result<Result<T, MigrationError>, JoinError>,
) -> Result<T, MigrationError> {
    result.map_err(|e| MigrationError::WorkerAborted {
        phase,
        reason: e.to_string(),
    })?
}

fn stream_ended_early(result: Result<Result<StreamStats, MigrationError>, JoinError>) -> MigrationError {
    match joined(Phase::Streaming, result) {
        Err(e) => e,
        Ok(_) => MigrationError::WorkerAborted {
            phase: Phase::Streaming,
            reason: "streamer stopped before cut-over".to_string(),
        },
    }
}

enum First<A, B> {
    Copy(A),
    Stream(B),
}

/// Runs one migration against a backend
pub struct Migrator {
    ctx: Arc<MigrationContext>,
    backend: Backend,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("migration_id", &self.ctx.migration_id())
            .field("table", &self.ctx.names().original)
            .finish_non_exhaustive()
    }
}

impl Migrator {
    /// Migrator for `settings`
    #[must_use]
    pub fn new(settings: MigrationSettings, backend: Backend) -> Self {
        Self {
            ctx: Arc::new(MigrationContext::new(settings)),
            backend,
        }
    }

    /// Shared state, for observers
    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<MigrationContext> {
        &self.ctx
    }

    /// Run the migration to completion
    ///
    /// # Errors
    /// The first fatal error, tagged with its phase. Tables are cleaned up
    /// per the on-failure settings before returning.
    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        self.ctx.settings().validate()?;
        self.ctx.with_timeline(|t| t.started_at = Some(Utc::now()));
        tracing::info!(
            migration_id = %self.ctx.migration_id(),
            database = %self.ctx.database(),
            table = %self.ctx.names().original,
            alter = %self.ctx.settings().alter_statement,
            cut_over = %self.ctx.settings().cut_over_type,
            "migration starting"
        );

        let mut tasks = Tasks::default();
        let mut touched = false;
        let result = self.migrate(&mut tasks, &mut touched).await;
        tasks.shutdown(&self.ctx).await;
        self.ctx.with_timeline(|t| t.ended_at = Some(Utc::now()));

        match result {
            Ok(outcome) => {
                let dropped_old = self.cleanup_success(outcome.cut_over.is_some()).await;
                let report = self.report(&outcome, dropped_old);
                tracing::info!(
                    swapped = report.swapped,
                    rows_copied = report.rows_copied,
                    dml_applied = report.dml_applied,
                    "migration complete"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(phase = %e.phase(), error = %e, "migration failed");
                if touched {
                    self.cleanup_failure().await;
                }
                Err(e)
            }
        }
    }

    async fn migrate(&self, tasks: &mut Tasks, touched: &mut bool) -> Result<Outcome, MigrationError> {
        let ctx = &self.ctx;
        let backend = &self.backend;
        let database = ctx.database();
        let names = ctx.names();

        // inspection
        let binlog = inspect::preflight(ctx, backend.inspector.as_ref()).await?;
        let requires_format_change = binlog.requires_format_change;
        ctx.set_binlog_state(binlog);
        let (original_columns, original_keys) =
            inspect::table_structure(backend.inspector.as_ref(), database, &names.original).await?;
        let estimate = backend
            .inspector
            .estimate_rows(database, &names.original, ctx.settings().rows_estimate_method)
            .await
            .map_err(|e| MigrationError::database(Phase::Inspection, e))?;
        ctx.set_rows_estimate(estimate);
        tracing::info!(rows = estimate, columns = %original_columns, "original table inspected");

        // setup
        let setup = |e: DbError| MigrationError::database(Phase::Setup, e);
        if requires_format_change {
            tracing::info!("switching binlog format to ROW");
            backend.applier.switch_binlog_format_to_row().await.map_err(setup)?;
        }
        if ctx.settings().initially_drop_old_table {
            backend.applier.drop_table(database, &names.old).await.map_err(setup)?;
        }
        if ctx.settings().initially_drop_ghost_table {
            backend.applier.drop_table(database, &names.ghost).await.map_err(setup)?;
        }
        for leftover in [&names.old, &names.ghost] {
            if backend
                .inspector
                .table_exists(database, leftover)
                .await
                .map_err(setup)?
            {
                return Err(MigrationError::Inspection(format!(
                    "table {database}.{leftover} already exists; drop it or ask for it to be dropped initially"
                )));
            }
        }

        *touched = true;
        backend
            .applier
            .drop_table(database, &names.changelog)
            .await
            .map_err(setup)?;
        backend
            .applier
            .create_changelog_table(database, &names.changelog)
            .await
            .map_err(setup)?;
        backend
            .applier
            .create_ghost_table(database, &names.original, &names.ghost)
            .await
            .map_err(setup)?;
        backend
            .applier
            .alter_ghost_table(database, &names.ghost, &ctx.settings().alter_statement)
            .await
            .map_err(setup)?;
        tracing::info!(ghost = %names.ghost, "ghost table created and altered");

        let (ghost_columns, ghost_keys) =
            inspect::table_structure(backend.inspector.as_ref(), database, &names.ghost).await?;
        let snapshot = inspect::build_snapshot(
            original_columns,
            original_keys,
            ghost_columns,
            ghost_keys,
            ctx.settings().nullable_unique_key_allowed,
        )?;
        tracing::info!(
            key = %snapshot.migration_key,
            shared = %snapshot.shared_columns,
            "migration key chosen"
        );
        ctx.set_schema(snapshot);

        let coordinates = backend
            .stream
            .current_coordinates()
            .await
            .map_err(|e| MigrationError::database(Phase::Streaming, e))?;
        tracing::info!(at = %coordinates, "stream coordinates captured");
        ctx.set_initial_coordinates(coordinates);
        backend
            .applier
            .write_changelog(database, &names.changelog, STATE_HINT, "GhostTableMigrated")
            .await
            .map_err(setup)?;

        let schema_key = ctx
            .schema()
            .map(|s| s.migration_key.clone())
            .ok_or_else(|| MigrationError::Inspection("schema not inspected".to_string()))?;
        let range = backend
            .inspector
            .migration_range(database, &names.original, &schema_key)
            .await
            .map_err(|e| MigrationError::database(Phase::Inspection, e))?;
        ctx.set_migration_range(range);

        // workers
        let throttler = Throttler::new(ctx.clone(), backend.probe.clone());
        throttler.check().await;
        tasks.background.push(tokio::spawn(throttler.run()));
        tasks
            .background
            .push(tokio::spawn(heartbeat::run(ctx.clone(), backend.applier.clone())));
        tasks.background.push(tokio::spawn(status::run(ctx.clone())));

        let streamer =
            ChangeStreamApplier::new(ctx.clone(), backend.stream.clone(), backend.applier.clone());
        tasks.streamer = Some(tokio::spawn(streamer.run()));
        let copier = RowCopier::new(ctx.clone(), backend.applier.clone());
        tasks.copier = Some(tokio::spawn(copier.run()));

        let copy = self.wait_for_copy(tasks).await?;

        let (cut_over, stream) = self.cut_over(tasks).await?;
        Ok(Outcome {
            copy,
            stream,
            cut_over,
        })
    }

    async fn wait_for_copy(&self, tasks: &mut Tasks) -> Result<CopyStats, MigrationError> {
        let (Some(mut copier), Some(mut streamer)) = (tasks.copier.take(), tasks.streamer.take())
        else {
            return Err(MigrationError::WorkerAborted {
                phase: Phase::Copy,
                reason: "workers not started".to_string(),
            });
        };

        let first = tokio::select! {
            copied = &mut copier => First::Copy(copied),
            streamed = &mut streamer => First::Stream(streamed),
        };

        match first {
            First::Copy(copied) => {
                tasks.streamer = Some(streamer);
                joined(Phase::Copy, copied)
            }
            First::Stream(streamed) => {
                tasks.copier = Some(copier);
                Err(stream_ended_early(streamed))
            }
        }
    }

    async fn cut_over(
        &self,
        tasks: &mut Tasks,
    ) -> Result<(Option<CutOverOutcome>, StreamStats), MigrationError> {
        let ctx = &self.ctx;
        let streamer = tasks.streamer.take().ok_or_else(|| MigrationError::WorkerAborted {
            phase: Phase::Streaming,
            reason: "streamer not running".to_string(),
        })?;

        let mut coordinator = CutOverCoordinator::new(
            ctx.clone(),
            self.backend.applier.clone(),
            self.backend.swapper.clone(),
        );

        let cut = async {
            let result = if ctx.settings().noop {
                coordinator.converge().await.map(|_| None)
            } else {
                coordinator.run().await.map(Some)
            };
            ctx.streaming_stop().cancel();
            result
        };
        let stream = async {
            let result = joined(Phase::Streaming, streamer.await);
            if result.is_err() {
                ctx.shutdown().cancel();
            }
            result
        };

        match tokio::join!(cut, stream) {
            (Ok(outcome), Ok(stats)) => Ok((outcome, stats)),
            (Ok(outcome), Err(e)) => {
                tracing::warn!(error = %e, "streamer failed after cut-over completed");
                Ok((outcome, StreamStats::default()))
            }
            (Err(_), Err(stream_error)) => Err(stream_error),
            (Err(cut_error), Ok(_)) => Err(cut_error),
        }
    }

    async fn drop_quietly(&self, table: &str) -> bool {
        match self.backend.applier.drop_table(self.ctx.database(), table).await {
            Ok(()) => {
                tracing::info!(table, "dropped");
                true
            }
            Err(e) => {
                tracing::warn!(table, error = %e, "drop failed");
                false
            }
        }
    }

    async fn cleanup_success(&self, swapped: bool) -> bool {
        let names = self.ctx.names();
        self.drop_quietly(&names.changelog).await;
        if !swapped {
            self.drop_quietly(&names.ghost).await;
            return false;
        }
        if self.ctx.settings().ok_to_drop_table {
            self.drop_quietly(&names.old).await
        } else {
            tracing::info!(table = %names.old, "old table kept");
            false
        }
    }

    async fn cleanup_failure(&self) {
        let names = self.ctx.names();
        let settings = self.ctx.settings();
        if settings.drop_ghost_table_on_failure {
            self.drop_quietly(&names.ghost).await;
        } else {
            tracing::info!(table = %names.ghost, "ghost table left in place");
        }
        if settings.drop_changelog_table_on_failure {
            self.drop_quietly(&names.changelog).await;
        }
    }

    fn report(&self, outcome: &Outcome, old_table_dropped: bool) -> MigrationReport {
        let ctx = &self.ctx;
        let names = ctx.names();
        MigrationReport {
            migration_id: ctx.migration_id().to_string(),
            database: ctx.database().to_string(),
            table: names.original.clone(),
            ghost_table: names.ghost.clone(),
            old_table: names.old.clone(),
            alter: ctx.settings().alter_statement.clone(),
            migration_key: ctx.schema().map(|s| s.migration_key.to_string()),
            noop: ctx.settings().noop,
            swapped: outcome.cut_over.is_some(),
            old_table_dropped,
            rows_estimate: ctx.rows_estimate(),
            rows_copied: outcome.copy.rows,
            chunks: outcome.copy.chunks,
            dml_applied: ctx.total_dml_applied(),
            cut_over: outcome.cut_over.clone(),
            last_position: outcome
                .stream
                .last_position
                .clone()
                .or_else(|| ctx.applied_coordinates()),
            timeline: ctx.timeline(),
        }
    }
}
