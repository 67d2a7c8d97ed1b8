//! Shared migration state
//!
//! One `MigrationContext` is built per run and handed to every worker behind
//! an `Arc`. It carries no logic of its own. State is split into regions
//! that are guarded independently so that frequent throttle reads never
//! contend with schema, range or tunable updates:
//!
//! | Region            | Guard          | Writer                     |
//! |-------------------|----------------|----------------------------|
//! | throttle          | `Mutex`        | throttler                  |
//! | point of interest | `Mutex`        | copier, streamer           |
//! | tunables          | `RwLock`       | operator                   |
//! | schema            | `OnceCell`     | inspection (once)          |
//! | range             | `RwLock`       | copier                     |
//! | counters          | atomics        | owning worker              |

use crate::config::{MaxLoad, MigrationSettings};
use crate::error::ConfigError;
use crate::types::{
    BinlogCoordinates, BinlogSettings, ColumnList, KeyRange, UniqueKey,
};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Changelog hint for heartbeat rows
pub const HEARTBEAT_HINT: &str = "heartbeat";
/// Changelog hint for state rows
pub const STATE_HINT: &str = "state";
/// Prefix of the state value that marks the start of a cut-over lock
pub const EVENTS_UP_TO_LOCK_PREFIX: &str = "AllEventsUpToLockProcessed:";

/// Ghost table name for `table`
#[must_use]
pub fn ghost_table_name(table: &str) -> String {
    format!("_{table}_gst")
}

/// Rename target of the original table during cut-over
#[must_use]
pub fn old_table_name(table: &str) -> String {
    format!("_{table}_old")
}

/// Changelog table name for `table`
#[must_use]
pub fn changelog_table_name(table: &str) -> String {
    format!("_{table}_osc")
}

/// Advisory lock name used by the voluntary-lock cut-over
#[must_use]
pub fn voluntary_lock_name(database: &str, table: &str) -> String {
    format!("{database}.{table}.lock")
}

/// Every table name a run touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableNames {
    /// Table being migrated
    pub original: String,
    /// Shadow table with the new schema
    pub ghost: String,
    /// Where the original goes on cut-over
    pub old: String,
    /// Heartbeat and marker table
    pub changelog: String,
    /// Advisory lock name
    pub lock_name: String,
}

impl TableNames {
    /// Derive all names from database and table
    #[must_use]
    pub fn derive(database: &str, table: &str) -> Self {
        Self {
            original: table.to_string(),
            ghost: ghost_table_name(table),
            old: old_table_name(table),
            changelog: changelog_table_name(table),
            lock_name: voluntary_lock_name(database, table),
        }
    }
}

/// Schema facts fixed after inspection
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    /// Original table columns, in table order
    pub original_columns: ColumnList,
    /// Ghost table columns, in table order
    pub ghost_columns: ColumnList,
    /// Columns present on both, in original order
    pub shared_columns: ColumnList,
    /// Unique keys of the original table
    pub original_unique_keys: Vec<UniqueKey>,
    /// Unique keys of the ghost table
    pub ghost_unique_keys: Vec<UniqueKey>,
    /// Key that orders and bounds the copy
    pub migration_key: UniqueKey,
    /// Positions of the shared columns within an original-table row
    pub shared_positions: Vec<usize>,
    /// Positions of the migration key columns within an original-table row
    pub key_positions: Vec<usize>,
}

/// Binlog prerequisites as observed, plus whether they must be changed
#[derive(Debug, Clone, Serialize)]
pub struct BinlogState {
    /// Observed settings
    pub settings: BinlogSettings,
    /// Format is not ROW and has to be switched
    pub requires_format_change: bool,
}

/// Throttle decision and the condition that produced it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleState {
    /// Whether work should pause
    pub throttled: bool,
    /// Which condition fired; empty when not throttled
    pub reason: String,
}

/// Operator-adjustable values read by the workers
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Rows per chunk
    pub chunk_size: u64,
    /// Replica lag threshold
    pub max_lag_millis: u64,
    /// Replica lag query
    pub replication_lag_query: Option<String>,
    /// Status-variable thresholds
    pub max_load: MaxLoad,
}

/// Global and per-iteration key ranges
#[derive(Debug, Clone, Default)]
pub struct RangeState {
    /// Min and max key over the whole table; `None` for an empty table
    pub global: Option<KeyRange>,
    /// Range of the last copied chunk
    pub iteration: Option<KeyRange>,
    /// Completed chunks
    pub iteration_count: u64,
}

/// Wall-clock milestones of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeline {
    /// Run start
    pub started_at: Option<DateTime<Utc>>,
    /// First chunk copy
    pub row_copy_started_at: Option<DateTime<Utc>>,
    /// Last chunk copied
    pub row_copy_ended_at: Option<DateTime<Utc>>,
    /// First cut-over attempt
    pub cut_over_started_at: Option<DateTime<Utc>>,
    /// Writes to the original table blocked, latest attempt
    pub lock_started_at: Option<DateTime<Utc>>,
    /// Rename issued, latest attempt
    pub rename_started_at: Option<DateTime<Utc>>,
    /// Ghost table live under the original name
    pub rename_ended_at: Option<DateTime<Utc>>,
    /// Run end
    pub ended_at: Option<DateTime<Utc>>,
}

/// State shared by every worker of one migration
#[derive(Debug)]
pub struct MigrationContext {
    migration_id: Ulid,
    settings: MigrationSettings,
    names: TableNames,

    throttle: Mutex<ThrottleState>,
    point_of_interest: Mutex<DateTime<Utc>>,
    tunables: RwLock<Tunables>,
    schema: OnceCell<SchemaSnapshot>,
    binlog: OnceCell<BinlogState>,
    range: RwLock<RangeState>,
    timeline: Mutex<Timeline>,
    initial_coordinates: OnceCell<BinlogCoordinates>,
    applied_coordinates: Mutex<Option<BinlogCoordinates>>,

    rows_estimate: AtomicU64,
    total_rows_copied: AtomicU64,
    total_dml_applied: AtomicU64,
    last_heartbeat_millis: AtomicI64,
    lock_marker_seq: AtomicU64,
    row_copy_complete: AtomicBool,
    cut_over_postponed: AtomicBool,

    lock_marker: watch::Sender<u64>,
    stream_resume: watch::Sender<u64>,
    streaming_stop: CancellationToken,
    shutdown: CancellationToken,
}

impl MigrationContext {
    /// Build the context for a run
    #[must_use]
    pub fn new(settings: MigrationSettings) -> Self {
        let names = TableNames::derive(&settings.database_name, &settings.original_table_name);
        let tunables = Tunables {
            chunk_size: settings.chunk_size,
            max_lag_millis: settings.max_lag_millis,
            replication_lag_query: settings.replication_lag_query.clone(),
            max_load: settings.max_load.clone(),
        };
        let (lock_marker, _) = watch::channel(0);
        let (stream_resume, _) = watch::channel(0);
        Self {
            migration_id: Ulid::new(),
            settings,
            names,
            throttle: Mutex::new(ThrottleState::default()),
            point_of_interest: Mutex::new(Utc::now()),
            tunables: RwLock::new(tunables),
            schema: OnceCell::new(),
            binlog: OnceCell::new(),
            range: RwLock::new(RangeState::default()),
            timeline: Mutex::new(Timeline::default()),
            initial_coordinates: OnceCell::new(),
            applied_coordinates: Mutex::new(None),
            rows_estimate: AtomicU64::new(0),
            total_rows_copied: AtomicU64::new(0),
            total_dml_applied: AtomicU64::new(0),
            last_heartbeat_millis: AtomicI64::new(0),
            lock_marker_seq: AtomicU64::new(0),
            row_copy_complete: AtomicBool::new(false),
            cut_over_postponed: AtomicBool::new(false),
            lock_marker,
            stream_resume,
            streaming_stop: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Unique id of this run
    #[inline]
    #[must_use]
    pub fn migration_id(&self) -> Ulid {
        self.migration_id
    }

    /// Static settings
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    /// Derived table names
    #[inline]
    #[must_use]
    pub fn names(&self) -> &TableNames {
        &self.names
    }

    /// Schema name
    #[inline]
    #[must_use]
    pub fn database(&self) -> &str {
        &self.settings.database_name
    }

    /// Inspector and applier point at the same instance
    #[must_use]
    pub fn inspector_is_also_applier(&self) -> bool {
        self.settings.inspector.equals(&self.settings.applier)
    }

    // --- throttle region ---

    /// Record a throttle decision
    pub fn set_throttle(&self, throttled: bool, reason: impl Into<String>) {
        let mut state = self.throttle.lock();
        state.throttled = throttled;
        state.reason = reason.into();
    }

    /// Current throttle decision and reason, read together
    #[must_use]
    pub fn throttle_state(&self) -> ThrottleState {
        self.throttle.lock().clone()
    }

    /// Whether work should pause right now
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.throttle.lock().throttled
    }

    // --- point of interest ---

    /// Note that progress just happened
    pub fn mark_point_of_interest(&self) {
        *self.point_of_interest.lock() = Utc::now();
    }

    /// Time since progress was last noted
    #[must_use]
    pub fn time_since_point_of_interest(&self) -> Duration {
        let then = *self.point_of_interest.lock();
        (Utc::now() - then).to_std().unwrap_or_default()
    }

    // --- tunables ---

    /// Snapshot of the tunables
    #[must_use]
    pub fn tunables(&self) -> Tunables {
        self.tunables.read().clone()
    }

    /// Current chunk size
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.tunables.read().chunk_size
    }

    /// Change the chunk size for subsequent chunks
    ///
    /// # Errors
    /// Rejects zero.
    pub fn set_chunk_size(&self, chunk_size: u64) -> Result<(), ConfigError> {
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chunk-size",
                reason: "must be positive".to_string(),
            });
        }
        self.tunables.write().chunk_size = chunk_size;
        Ok(())
    }

    /// Change the replica lag threshold
    pub fn set_max_lag_millis(&self, max_lag_millis: u64) {
        self.tunables.write().max_lag_millis = max_lag_millis;
    }

    /// Replace the max-load conditions from a string
    ///
    /// # Errors
    /// On a malformed string; the current conditions stay in place.
    pub fn read_max_load(&self, list: &str) -> Result<(), ConfigError> {
        let parsed = MaxLoad::parse(list)?;
        self.tunables.write().max_load = parsed;
        Ok(())
    }

    // --- schema ---

    /// Install the schema snapshot; only the first call wins
    pub fn set_schema(&self, snapshot: SchemaSnapshot) -> bool {
        self.schema.set(snapshot).is_ok()
    }

    /// Schema snapshot, once inspection has run
    #[must_use]
    pub fn schema(&self) -> Option<&SchemaSnapshot> {
        self.schema.get()
    }

    /// Install the binlog prerequisites; only the first call wins
    pub fn set_binlog_state(&self, state: BinlogState) -> bool {
        self.binlog.set(state).is_ok()
    }

    /// Binlog prerequisites, once inspection has run
    #[must_use]
    pub fn binlog_state(&self) -> Option<&BinlogState> {
        self.binlog.get()
    }

    // --- range ---

    /// Record the global key range (`None` for an empty table)
    pub fn set_migration_range(&self, range: Option<KeyRange>) {
        let mut state = self.range.write();
        state.global = range;
        state.iteration = None;
        state.iteration_count = 0;
    }

    /// Global key range
    #[must_use]
    pub fn migration_range(&self) -> Option<KeyRange> {
        self.range.read().global.clone()
    }

    /// Range of the last copied chunk
    #[must_use]
    pub fn iteration_range(&self) -> Option<KeyRange> {
        self.range.read().iteration.clone()
    }

    /// Completed chunk count
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.range.read().iteration_count
    }

    /// Record a completed chunk and return the new iteration count
    pub fn complete_iteration(&self, chunk: KeyRange) -> u64 {
        let mut state = self.range.write();
        debug_assert!(state
            .global
            .as_ref()
            .is_some_and(|global| global.encloses(&chunk)));
        state.iteration = Some(chunk);
        state.iteration_count += 1;
        state.iteration_count
    }

    // --- counters ---

    /// Record the row estimate
    pub fn set_rows_estimate(&self, rows: u64) {
        self.rows_estimate.store(rows, Ordering::Relaxed);
    }

    /// Estimated rows in the original table
    #[must_use]
    pub fn rows_estimate(&self) -> u64 {
        self.rows_estimate.load(Ordering::Relaxed)
    }

    /// Add copied rows
    pub fn add_rows_copied(&self, rows: u64) {
        self.total_rows_copied.fetch_add(rows, Ordering::Relaxed);
    }

    /// Rows copied so far
    #[must_use]
    pub fn total_rows_copied(&self) -> u64 {
        self.total_rows_copied.load(Ordering::Relaxed)
    }

    /// Add applied change events
    pub fn add_dml_applied(&self, events: u64) {
        self.total_dml_applied.fetch_add(events, Ordering::Relaxed);
    }

    /// Change events applied so far
    #[must_use]
    pub fn total_dml_applied(&self) -> u64 {
        self.total_dml_applied.load(Ordering::Relaxed)
    }

    /// Note a heartbeat seen on the change stream
    pub fn set_last_heartbeat_millis(&self, millis: i64) {
        self.last_heartbeat_millis.fetch_max(millis, Ordering::AcqRel);
    }

    /// How far the applier trails the heartbeat writer
    ///
    /// Before the first heartbeat arrives the lag is unbounded.
    #[must_use]
    pub fn applier_lag(&self) -> Duration {
        let seen = self.last_heartbeat_millis.load(Ordering::Acquire);
        if seen == 0 {
            return Duration::MAX;
        }
        let lag = Utc::now().timestamp_millis().saturating_sub(seen).max(0);
        Duration::from_millis(u64::try_from(lag).unwrap_or_default())
    }

    // --- flags ---

    /// Mark the copy as finished
    pub fn set_row_copy_complete(&self) {
        self.row_copy_complete.store(true, Ordering::Release);
    }

    /// Whether the copy is finished
    #[must_use]
    pub fn is_row_copy_complete(&self) -> bool {
        self.row_copy_complete.load(Ordering::Acquire)
    }

    /// Set or clear the cut-over postponement
    pub fn set_cut_over_postponed(&self, postponed: bool) {
        self.cut_over_postponed.store(postponed, Ordering::Release);
    }

    /// Whether cut-over is postponed
    #[must_use]
    pub fn is_cut_over_postponed(&self) -> bool {
        self.cut_over_postponed.load(Ordering::Acquire)
    }

    // --- stream positions ---

    /// Record where streaming starts; only the first call wins
    pub fn set_initial_coordinates(&self, coordinates: BinlogCoordinates) -> bool {
        self.initial_coordinates.set(coordinates).is_ok()
    }

    /// Where streaming started
    #[must_use]
    pub fn initial_coordinates(&self) -> Option<&BinlogCoordinates> {
        self.initial_coordinates.get()
    }

    /// Record the last fully applied position
    pub fn set_applied_coordinates(&self, coordinates: BinlogCoordinates) {
        *self.applied_coordinates.lock() = Some(coordinates);
    }

    /// Last fully applied position
    #[must_use]
    pub fn applied_coordinates(&self) -> Option<BinlogCoordinates> {
        self.applied_coordinates.lock().clone()
    }

    // --- lock marker ---

    /// Allocate the id for the next events-up-to-lock marker
    pub fn next_lock_marker_id(&self) -> u64 {
        self.lock_marker_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Highest marker id handed out so far
    #[must_use]
    pub fn lock_markers_issued(&self) -> u64 {
        self.lock_marker_seq.load(Ordering::Acquire)
    }

    /// Announce that the streamer has applied everything up to marker `id`
    pub fn publish_lock_marker(&self, id: u64) {
        self.lock_marker.send_if_modified(|current| {
            if id > *current {
                *current = id;
                true
            } else {
                false
            }
        });
    }

    /// Watch the highest marker id the streamer has reached
    #[must_use]
    pub fn subscribe_lock_marker(&self) -> watch::Receiver<u64> {
        self.lock_marker.subscribe()
    }

    /// Let a streamer parked at marker `id` (or earlier) continue
    pub fn resume_streaming_after(&self, id: u64) {
        self.stream_resume.send_if_modified(|current| {
            if id > *current {
                *current = id;
                true
            } else {
                false
            }
        });
    }

    /// Park until the cut-over releases marker `id`
    ///
    /// Returns `false` if `stop` fired first.
    pub async fn wait_for_stream_resume(&self, id: u64, stop: &CancellationToken) -> bool {
        let mut rx = self.stream_resume.subscribe();
        tokio::select! {
            () = stop.cancelled() => false,
            released = async { rx.wait_for(|current| *current >= id).await.is_ok() } => released,
        }
    }

    // --- cancellation ---

    /// Token the streamer stops on
    #[must_use]
    pub fn streaming_stop(&self) -> &CancellationToken {
        &self.streaming_stop
    }

    /// Token every background loop stops on
    #[must_use]
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    // --- timeline ---

    /// Read the timeline
    #[must_use]
    pub fn timeline(&self) -> Timeline {
        self.timeline.lock().clone()
    }

    /// Update the timeline
    pub fn with_timeline(&self, f: impl FnOnce(&mut Timeline)) {
        f(&mut self.timeline.lock());
    }
}
