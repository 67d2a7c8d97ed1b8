//! Change-stream applier
//!
//! Tails the row-change log from the coordinates captured before the copy
//! started and replays every write on the original table against the ghost
//! table. Writes on the changelog table carry heartbeats and cut-over
//! markers and are interpreted instead of replayed.
//!
//! Events are applied strictly in log order. Pending ghost mutations are
//! always flushed before a changelog row is handled, so a marker is only
//! published once every earlier write has landed.

use crate::config::MAX_RETRIES;
use crate::context::{
    MigrationContext, SchemaSnapshot, EVENTS_UP_TO_LOCK_PREFIX, HEARTBEAT_HINT, STATE_HINT,
};
use crate::db::{Applier, EventStream};
use crate::error::{MigrationError, Phase};
use crate::retry::retry_transient;
use crate::throttler::wait_while_throttled;
use crate::types::{BinlogCoordinates, BinlogEntry, DmlKind, GhostMutation, RowEvent, Value};
use std::sync::Arc;

/// Translate one original-table event into ghost mutations
///
/// Inserts become a replace of the shared projection. Updates that change
/// the migration key first delete the old key. Deletes remove the key.
#[must_use]
pub fn mutations_for(event: &RowEvent, schema: &SchemaSnapshot) -> Vec<GhostMutation> {
    let project = |row: &crate::types::ColumnValues| row.project(&schema.shared_positions);
    let key_of = |row: &crate::types::ColumnValues| row.project(&schema.key_positions);

    match (event.kind, &event.before, &event.after) {
        (DmlKind::Insert, _, Some(after)) => vec![GhostMutation::Replace(project(after))],
        (DmlKind::Update, Some(before), Some(after)) => {
            let old_key = key_of(before);
            if old_key == key_of(after) {
                vec![GhostMutation::Replace(project(after))]
            } else {
                vec![
                    GhostMutation::Delete(old_key),
                    GhostMutation::Replace(project(after)),
                ]
            }
        }
        (DmlKind::Delete, Some(before), _) => vec![GhostMutation::Delete(key_of(before))],
        _ => {
            tracing::warn!(kind = ?event.kind, "row event without the image it needs, skipped");
            Vec::new()
        }
    }
}

/// Meaning of a changelog row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangelogSignal {
    /// Heartbeat written at this epoch-millisecond timestamp
    Heartbeat(i64),
    /// Cut-over marker with this id
    EventsUpToLock(u64),
    /// Any other state value
    State(String),
}

/// Decode a changelog row `(id, hint, value)`
#[must_use]
pub fn changelog_signal(event: &RowEvent) -> Option<ChangelogSignal> {
    let row = event.after.as_ref()?;
    let hint = row.values().get(1).and_then(Value::as_text)?;
    let value = row.values().get(2).and_then(Value::as_text)?;
    match hint {
        HEARTBEAT_HINT => value.parse().ok().map(ChangelogSignal::Heartbeat),
        STATE_HINT => match value.strip_prefix(EVENTS_UP_TO_LOCK_PREFIX) {
            Some(id) => id.parse().ok().map(ChangelogSignal::EventsUpToLock),
            None => Some(ChangelogSignal::State(value.to_string())),
        },
        _ => None,
    }
}

/// Outcome of a finished stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Original-table events applied
    pub events_applied: u64,
    /// Last fully applied position
    pub last_position: Option<BinlogCoordinates>,
}

/// Streaming worker
pub struct ChangeStreamApplier {
    ctx: Arc<MigrationContext>,
    stream: Arc<dyn EventStream>,
    applier: Arc<dyn Applier>,
}

impl std::fmt::Debug for ChangeStreamApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStreamApplier").finish_non_exhaustive()
    }
}

enum Flow {
    Continue,
    Stop,
}

impl ChangeStreamApplier {
    /// Create a streamer reading `stream` and writing through `applier`
    pub fn new(
        ctx: Arc<MigrationContext>,
        stream: Arc<dyn EventStream>,
        applier: Arc<dyn Applier>,
    ) -> Self {
        Self {
            ctx,
            stream,
            applier,
        }
    }

    /// Consume the stream until the streaming-stop token fires
    ///
    /// Stopping never interrupts a batch: the in-flight batch is finished
    /// and its position recorded first.
    ///
    /// # Errors
    /// Fatal collaborator errors or repeated read failures past the retry
    /// ceiling.
    pub async fn run(self) -> Result<StreamStats, MigrationError> {
        let ctx = self.ctx.as_ref();
        let schema = ctx
            .schema()
            .ok_or_else(|| MigrationError::Inspection("schema not inspected".to_string()))?;
        let mut position = ctx.initial_coordinates().cloned().ok_or_else(|| {
            MigrationError::Inspection("stream coordinates not captured".to_string())
        })?;
        let stop = ctx.streaming_stop().clone();
        let timing = &ctx.settings().timing;
        let mut stats = StreamStats::default();

        tracing::info!(from = %position, "streaming started");

        loop {
            if stop.is_cancelled() || !wait_while_throttled(ctx, &stop).await {
                break;
            }

            let stream = self.stream.as_ref();
            let from = &position;
            let read = tokio::select! {
                () = stop.cancelled() => break,
                read = retry_transient(Phase::Streaming, MAX_RETRIES, timing.retry_interval(), &stop, move || {
                    stream.read_events(from, timing.stream_batch_size, timing.stream_poll_wait())
                }) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(MigrationError::Cancelled { .. }) => break,
                Err(e) => return Err(e),
            };

            if entries.is_empty() {
                continue;
            }

            let flow = self.apply_batch(schema, &entries, &mut position, &mut stats).await?;
            ctx.set_applied_coordinates(position.clone());
            stats.last_position = Some(position.clone());
            if let Flow::Stop = flow {
                break;
            }
        }

        tracing::info!(
            applied = stats.events_applied,
            at = %position,
            "streaming stopped"
        );
        Ok(stats)
    }

    async fn apply_batch(
        &self,
        schema: &SchemaSnapshot,
        entries: &[BinlogEntry],
        position: &mut BinlogCoordinates,
        stats: &mut StreamStats,
    ) -> Result<Flow, MigrationError> {
        let ctx = self.ctx.as_ref();
        let names = ctx.names();
        let database = ctx.database();
        let mut pending = Vec::new();
        let mut pending_events = 0u64;

        for entry in entries {
            let event = &entry.event;
            if event.database != database {
                *position = entry.coordinates.clone();
                continue;
            }

            if event.table == names.original {
                pending.extend(mutations_for(event, schema));
                pending_events += 1;
            } else if event.table == names.changelog {
                self.flush(schema, &mut pending, &mut pending_events, stats).await?;
                *position = entry.coordinates.clone();
                if let Flow::Stop = self.on_changelog(event, position).await {
                    return Ok(Flow::Stop);
                }
                continue;
            }
            *position = entry.coordinates.clone();
        }

        self.flush(schema, &mut pending, &mut pending_events, stats).await?;
        Ok(Flow::Continue)
    }

    async fn flush(
        &self,
        schema: &SchemaSnapshot,
        pending: &mut Vec<GhostMutation>,
        pending_events: &mut u64,
        stats: &mut StreamStats,
    ) -> Result<(), MigrationError> {
        if *pending_events == 0 {
            return Ok(());
        }
        let ctx = self.ctx.as_ref();
        let applier = self.applier.as_ref();
        let names = ctx.names();
        let database = ctx.database();
        let mutations: &[GhostMutation] = pending;

        if !mutations.is_empty() {
            retry_transient(
                Phase::Streaming,
                MAX_RETRIES,
                ctx.settings().timing.retry_interval(),
                ctx.shutdown(),
                move || {
                    applier.apply_mutations(
                        database,
                        &names.ghost,
                        &schema.shared_columns,
                        &schema.migration_key,
                        mutations,
                    )
                },
            )
            .await?;
        }

        ctx.add_dml_applied(*pending_events);
        ctx.mark_point_of_interest();
        stats.events_applied += *pending_events;
        tracing::trace!(events = *pending_events, mutations = pending.len(), "applied batch");
        pending.clear();
        *pending_events = 0;
        Ok(())
    }

    async fn on_changelog(&self, event: &RowEvent, position: &BinlogCoordinates) -> Flow {
        let ctx = self.ctx.as_ref();
        match changelog_signal(event) {
            Some(ChangelogSignal::Heartbeat(millis)) => {
                ctx.set_last_heartbeat_millis(millis);
                Flow::Continue
            }
            Some(ChangelogSignal::EventsUpToLock(id)) => {
                ctx.set_applied_coordinates(position.clone());
                ctx.publish_lock_marker(id);
                tracing::debug!(marker = id, at = %position, "all events up to lock applied");
                if ctx.wait_for_stream_resume(id, ctx.streaming_stop()).await {
                    Flow::Continue
                } else {
                    Flow::Stop
                }
            }
            Some(ChangelogSignal::State(state)) => {
                tracing::debug!(%state, "changelog state");
                Flow::Continue
            }
            None => Flow::Continue,
        }
    }
}
