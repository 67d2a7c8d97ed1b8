//! Database capabilities consumed by the engine
//!
//! The engine never speaks a wire protocol or builds SQL. Everything it needs
//! from a server is expressed here as a narrow async capability:
//! - `Inspector` reads schema and server prerequisites
//! - `Applier` writes to the ghost and changelog tables
//! - `TableSwapper` performs the locking and renaming of a cut-over
//! - `EventStream` reads the ordered row-change log
//! - `LoadProbe` samples replica lag and status variables
//!
//! `Backend` bundles one implementation of each for the migrator.

use crate::error::DbError;
use crate::types::{
    BinlogCoordinates, BinlogEntry, BinlogSettings, ColumnList, ColumnValues, GhostMutation,
    KeyRange, RowsEstimateMethod, UniqueKey,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Result alias for collaborator calls
pub type DbResult<T> = Result<T, DbError>;

/// Schema and prerequisite reads
#[async_trait]
pub trait Inspector: Send + Sync {
    /// Whether `table` exists in `database`
    async fn table_exists(&self, database: &str, table: &str) -> DbResult<bool>;

    /// Column names in table order
    async fn table_columns(&self, database: &str, table: &str) -> DbResult<ColumnList>;

    /// Unique keys of the table, PRIMARY first when present
    async fn unique_keys(&self, database: &str, table: &str) -> DbResult<Vec<UniqueKey>>;

    /// Storage engine name
    async fn table_engine(&self, database: &str, table: &str) -> DbResult<String>;

    /// Approximate row count
    async fn estimate_rows(
        &self,
        database: &str,
        table: &str,
        method: RowsEstimateMethod,
    ) -> DbResult<u64>;

    /// Binlog format and row image of the applier's server
    async fn binlog_settings(&self) -> DbResult<BinlogSettings>;

    /// Min and max of `key` over the table; `None` when the table is empty
    async fn migration_range(
        &self,
        database: &str,
        table: &str,
        key: &UniqueKey,
    ) -> DbResult<Option<KeyRange>>;
}

/// Writes against ghost and changelog tables
#[async_trait]
pub trait Applier: Send + Sync {
    /// Drop `table` if it exists
    async fn drop_table(&self, database: &str, table: &str) -> DbResult<()>;

    /// Create `ghost` with the same structure as `original`
    async fn create_ghost_table(&self, database: &str, original: &str, ghost: &str)
        -> DbResult<()>;

    /// Apply the alter clause to the ghost table
    async fn alter_ghost_table(&self, database: &str, ghost: &str, alter: &str) -> DbResult<()>;

    /// Create the changelog table (id, hint, value)
    async fn create_changelog_table(&self, database: &str, changelog: &str) -> DbResult<()>;

    /// Upsert the changelog row for `hint`
    async fn write_changelog(
        &self,
        database: &str,
        changelog: &str,
        hint: &str,
        value: &str,
    ) -> DbResult<()>;

    /// Switch the server to ROW binlog format
    async fn switch_binlog_format_to_row(&self) -> DbResult<()>;

    /// First and last of the next `chunk_size` keys in `(after, upper]`
    ///
    /// `after == None` starts at the beginning of the table. Returns `None`
    /// when no keys remain.
    async fn next_chunk_bounds(
        &self,
        database: &str,
        table: &str,
        key: &UniqueKey,
        after: Option<&ColumnValues>,
        upper: &ColumnValues,
        chunk_size: u64,
    ) -> DbResult<Option<KeyRange>>;

    /// Insert-or-ignore the rows of `range` into the ghost table
    ///
    /// Only `columns` are copied. Returns the number of rows inserted.
    async fn copy_chunk(
        &self,
        database: &str,
        original: &str,
        ghost: &str,
        columns: &ColumnList,
        key: &UniqueKey,
        range: &KeyRange,
    ) -> DbResult<u64>;

    /// Apply mutations to the ghost table in order
    async fn apply_mutations(
        &self,
        database: &str,
        ghost: &str,
        columns: &ColumnList,
        key: &UniqueKey,
        mutations: &[GhostMutation],
    ) -> DbResult<()>;
}

/// Locking and renaming used by the cut-over strategies
#[async_trait]
pub trait TableSwapper: Send + Sync {
    /// Take a write lock on `table`; writers block until `unlock_tables`
    async fn lock_table_write(&self, database: &str, table: &str) -> DbResult<()>;

    /// Release every table lock held by this session
    async fn unlock_tables(&self) -> DbResult<()>;

    /// Rename `from` to `to`
    async fn rename_table(&self, database: &str, from: &str, to: &str) -> DbResult<()>;

    /// Atomically rename `original` to `old` and `ghost` to `original`
    async fn swap_tables(&self, database: &str, original: &str, ghost: &str, old: &str)
        -> DbResult<()>;

    /// Try to take a named advisory lock; `false` if someone else holds it
    async fn acquire_advisory_lock(&self, name: &str, timeout: Duration) -> DbResult<bool>;

    /// Release a named advisory lock
    async fn release_advisory_lock(&self, name: &str) -> DbResult<()>;

    /// Kill in-flight queries against `table` from other sessions
    async fn kill_table_queries(&self, database: &str, table: &str) -> DbResult<u64>;

    /// Start a wait session that blocks new access to `table`
    async fn install_udf_wait(&self, database: &str, table: &str, timeout: Duration)
        -> DbResult<()>;

    /// End the wait session
    async fn release_udf_wait(&self) -> DbResult<()>;
}

/// Ordered row-change log
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Coordinates of the end of the log right now
    async fn current_coordinates(&self) -> DbResult<BinlogCoordinates>;

    /// Up to `max` entries strictly after `after`
    ///
    /// Waits up to `wait` for at least one entry; an empty vector means the
    /// wait elapsed.
    async fn read_events(
        &self,
        after: &BinlogCoordinates,
        max: usize,
        wait: Duration,
    ) -> DbResult<Vec<BinlogEntry>>;
}

/// Load sampling used by the throttler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoadProbe: Send + Sync {
    /// Replica lag; runs `query` when given, else the default lag check
    async fn replication_lag(&self, query: Option<String>) -> DbResult<Duration>;

    /// Current value of a global status variable
    async fn status_variable(&self, name: String) -> DbResult<i64>;
}

/// One implementation of every capability
#[derive(Clone)]
pub struct Backend {
    /// Schema reads
    pub inspector: Arc<dyn Inspector>,
    /// Ghost and changelog writes
    pub applier: Arc<dyn Applier>,
    /// Cut-over locking and renames
    pub swapper: Arc<dyn TableSwapper>,
    /// Row-change log
    pub stream: Arc<dyn EventStream>,
    /// Throttle sampling
    pub probe: Arc<dyn LoadProbe>,
}

impl Backend {
    /// Bundle a single object that implements every capability
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: Inspector + Applier + TableSwapper + EventStream + LoadProbe + 'static,
    {
        Self {
            inspector: backend.clone(),
            applier: backend.clone(),
            swapper: backend.clone(),
            stream: backend.clone(),
            probe: backend,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
