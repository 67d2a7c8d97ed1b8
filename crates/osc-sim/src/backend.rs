//! Capability implementations over a [`SimDatabase`]
//!
//! One `SimBackend` is one client session: table locks, wait sessions and
//! advisory locks it takes belong to it and are released by it.

use crate::database::SimDatabase;
use crate::fault::{FaultOp, FaultPlan};
use async_trait::async_trait;
use osc_core::{
    Applier, Backend, BinlogCoordinates, BinlogEntry, BinlogSettings, ColumnList, ColumnValues,
    DbError, DbErrorKind, DbResult, EventStream, GhostMutation, Inspector, KeyRange, LoadProbe,
    RowsEstimateMethod, TableSwapper, UniqueKey,
};
use std::sync::Arc;
use std::time::Duration;

/// A session on the simulated server
#[derive(Debug)]
pub struct SimBackend {
    db: Arc<SimDatabase>,
    faults: Arc<FaultPlan>,
    session: u64,
}

impl SimBackend {
    /// Open a session on `db`
    #[must_use]
    pub fn new(db: Arc<SimDatabase>) -> Self {
        let session = db.open_session();
        Self {
            db,
            faults: Arc::new(FaultPlan::new()),
            session,
        }
    }

    /// Share a fault plan with this session
    #[must_use]
    pub fn with_faults(mut self, faults: Arc<FaultPlan>) -> Self {
        self.faults = faults;
        self
    }

    /// The server behind this session
    #[must_use]
    pub fn database(&self) -> &Arc<SimDatabase> {
        &self.db
    }

    /// Scripted failures
    #[must_use]
    pub fn faults(&self) -> &Arc<FaultPlan> {
        &self.faults
    }

    /// Wrap into an engine [`Backend`]
    #[must_use]
    pub fn into_backend(self) -> Backend {
        Backend::from_shared(Arc::new(self))
    }
}

#[async_trait]
impl Inspector for SimBackend {
    async fn table_exists(&self, database: &str, table: &str) -> DbResult<bool> {
        Ok(self.db.table_exists(database, table))
    }

    async fn table_columns(&self, database: &str, table: &str) -> DbResult<ColumnList> {
        self.db.with_table(database, table, |t| t.columns().clone())
    }

    async fn unique_keys(&self, database: &str, table: &str) -> DbResult<Vec<UniqueKey>> {
        self.db.with_table(database, table, |t| t.unique_keys().to_vec())
    }

    async fn table_engine(&self, database: &str, table: &str) -> DbResult<String> {
        self.db.with_table(database, table, |t| t.engine().to_string())
    }

    async fn estimate_rows(
        &self,
        database: &str,
        table: &str,
        method: RowsEstimateMethod,
    ) -> DbResult<u64> {
        let rows = self.db.with_table(database, table, |t| t.len() as u64)?;
        tracing::trace!(?method, rows, "row estimate");
        Ok(rows)
    }

    async fn binlog_settings(&self) -> DbResult<BinlogSettings> {
        Ok(self.db.binlog_settings())
    }

    async fn migration_range(
        &self,
        database: &str,
        table: &str,
        key: &UniqueKey,
    ) -> DbResult<Option<KeyRange>> {
        self.db.with_table(database, table, |t| t.key_range(key))
    }
}

#[async_trait]
impl Applier for SimBackend {
    async fn drop_table(&self, database: &str, table: &str) -> DbResult<()> {
        self.db.drop_table(database, table);
        Ok(())
    }

    async fn create_ghost_table(&self, database: &str, original: &str, ghost: &str) -> DbResult<()> {
        self.faults.check(FaultOp::CreateGhost, ghost)?;
        self.db.create_like(database, original, ghost)
    }

    async fn alter_ghost_table(&self, database: &str, ghost: &str, alter: &str) -> DbResult<()> {
        self.faults.check(FaultOp::AlterGhost, ghost)?;
        self.db.alter(database, ghost, alter)
    }

    async fn create_changelog_table(&self, database: &str, changelog: &str) -> DbResult<()> {
        self.db.create_table(database, changelog, crate::fixtures::changelog_table())
    }

    async fn write_changelog(
        &self,
        database: &str,
        changelog: &str,
        hint: &str,
        value: &str,
    ) -> DbResult<()> {
        self.faults.check(FaultOp::WriteChangelog, hint)?;
        self.db.write_changelog(database, changelog, hint, value)
    }

    async fn switch_binlog_format_to_row(&self) -> DbResult<()> {
        self.db.switch_binlog_format_to_row();
        Ok(())
    }

    async fn next_chunk_bounds(
        &self,
        database: &str,
        table: &str,
        key: &UniqueKey,
        after: Option<&ColumnValues>,
        upper: &ColumnValues,
        chunk_size: u64,
    ) -> DbResult<Option<KeyRange>> {
        self.faults.check(FaultOp::ChunkBounds, table)?;
        self.db
            .next_chunk_bounds(database, table, key, after, upper, chunk_size)
    }

    async fn copy_chunk(
        &self,
        database: &str,
        original: &str,
        ghost: &str,
        columns: &ColumnList,
        key: &UniqueKey,
        range: &KeyRange,
    ) -> DbResult<u64> {
        self.faults.check(FaultOp::CopyChunk, original)?;
        self.db
            .copy_chunk(database, original, ghost, columns, key, range)
    }

    async fn apply_mutations(
        &self,
        database: &str,
        ghost: &str,
        columns: &ColumnList,
        key: &UniqueKey,
        mutations: &[GhostMutation],
    ) -> DbResult<()> {
        self.faults.check(FaultOp::ApplyMutations, ghost)?;
        self.db
            .apply_mutations(database, ghost, columns, key, mutations)
    }
}

#[async_trait]
impl TableSwapper for SimBackend {
    async fn lock_table_write(&self, database: &str, table: &str) -> DbResult<()> {
        self.faults.check(FaultOp::LockTable, table)?;
        self.db.lock_table_write(self.session, database, table)
    }

    async fn unlock_tables(&self) -> DbResult<()> {
        self.db.unlock_tables(self.session);
        Ok(())
    }

    async fn rename_table(&self, database: &str, from: &str, to: &str) -> DbResult<()> {
        self.faults.check(FaultOp::RenameTable, from)?;
        self.db.rename(database, from, to)
    }

    async fn swap_tables(&self, database: &str, original: &str, ghost: &str, old: &str) -> DbResult<()> {
        self.faults.check(FaultOp::SwapTables, original)?;
        self.db.swap(self.session, database, original, ghost, old)
    }

    async fn acquire_advisory_lock(&self, name: &str, timeout: Duration) -> DbResult<bool> {
        self.faults.check(FaultOp::AdvisoryLock, name)?;
        Ok(self.db.acquire_advisory_lock(self.session, name, timeout).await)
    }

    async fn release_advisory_lock(&self, name: &str) -> DbResult<()> {
        self.db.release_advisory_lock(self.session, name);
        Ok(())
    }

    async fn kill_table_queries(&self, database: &str, table: &str) -> DbResult<u64> {
        // statements run atomically here, so nothing is ever in flight
        if !self.db.table_exists(database, table) {
            return Err(DbError::table_missing(table));
        }
        Ok(0)
    }

    async fn install_udf_wait(&self, database: &str, table: &str, timeout: Duration) -> DbResult<()> {
        self.faults.check(FaultOp::UdfWait, table)?;
        self.db.install_wait(self.session, database, table, timeout)
    }

    async fn release_udf_wait(&self) -> DbResult<()> {
        self.db.release_wait(self.session);
        Ok(())
    }
}

#[async_trait]
impl EventStream for SimBackend {
    async fn current_coordinates(&self) -> DbResult<BinlogCoordinates> {
        Ok(self.db.current_coordinates())
    }

    async fn read_events(
        &self,
        after: &BinlogCoordinates,
        max: usize,
        wait: Duration,
    ) -> DbResult<Vec<BinlogEntry>> {
        self.faults.check(FaultOp::ReadEvents, &after.log_file)?;
        Ok(self.db.read_events(after, max, wait).await)
    }
}

#[async_trait]
impl LoadProbe for SimBackend {
    async fn replication_lag(&self, query: Option<String>) -> DbResult<Duration> {
        self.faults
            .check(FaultOp::ReplicationLag, query.as_deref().unwrap_or("default"))?;
        Ok(self.db.replication_lag())
    }

    async fn status_variable(&self, name: String) -> DbResult<i64> {
        self.faults.check(FaultOp::StatusVariable, &name)?;
        self.db.status_variable(&name).ok_or_else(|| {
            DbError::new(
                DbErrorKind::InvalidRequest,
                format!("unknown status variable {name}"),
            )
        })
    }
}
