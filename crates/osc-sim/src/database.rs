//! Simulated database server
//!
//! Holds every table in memory and records each row change in a single
//! ordered binlog. Client writes honour table write locks and wait
//! sessions: a blocked writer waits until the block is lifted and then
//! resolves the table name again, so a writer queued behind a swap lands in
//! whichever table carries the name afterwards.
//!
//! Table operations that a real server would run as one statement happen
//! under one mutex, which keeps binlog order identical to apply order.

use crate::alter::apply_alter;
use crate::table::Table;
use dashmap::DashMap;
use osc_core::{
    BinlogCoordinates, BinlogEntry, BinlogSettings, ColumnList, ColumnValues, DbError, DbErrorKind,
    DbResult, GhostMutation, KeyRange, RowEvent, UniqueKey, Value,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Name of the single simulated binlog file
pub const BINLOG_FILE: &str = "sim-bin.000001";

const BLOCKED_POLL: Duration = Duration::from_millis(1);

/// A client write, addressed by column name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowWrite {
    /// Insert a row; columns not named get their default
    Insert(Vec<(String, Value)>),
    /// Update rows where `key.0 == key.1`
    Update {
        /// Column and value selecting the row
        key: (String, Value),
        /// New column values
        set: Vec<(String, Value)>,
    },
    /// Delete rows where `key.0 == key.1`
    Delete {
        /// Column and value selecting the row
        key: (String, Value),
    },
}

/// A swapper operation, with the binlog position at which it took effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Human-readable operation
    pub operation: String,
    /// Binlog length when it ran
    pub position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    WriteLock,
    Wait,
}

#[derive(Debug, Clone)]
struct Block {
    session: u64,
    kind: BlockKind,
    expires: Option<Instant>,
}

impl Block {
    fn active(&self) -> bool {
        self.expires.map_or(true, |at| Instant::now() < at)
    }
}

type TableId = (String, String);

fn id(database: &str, table: &str) -> TableId {
    (database.to_string(), table.to_string())
}

#[derive(Debug)]
struct State {
    tables: BTreeMap<TableId, Table>,
    dropped: BTreeMap<TableId, Table>,
    binlog: Vec<BinlogEntry>,
    blocks: BTreeMap<TableId, Block>,
    binlog_settings: BinlogSettings,
}

impl State {
    fn table(&self, database: &str, table: &str) -> DbResult<&Table> {
        self.tables
            .get(&id(database, table))
            .ok_or_else(|| DbError::table_missing(table))
    }

    fn table_mut(&mut self, database: &str, table: &str) -> DbResult<&mut Table> {
        self.tables
            .get_mut(&id(database, table))
            .ok_or_else(|| DbError::table_missing(table))
    }

    fn log(&mut self, event: RowEvent) {
        let position = self.binlog.len() as u64 + 1;
        self.binlog.push(BinlogEntry {
            coordinates: BinlogCoordinates::new(BINLOG_FILE, position),
            event,
        });
    }

    fn position(&self) -> u64 {
        self.binlog.len() as u64
    }

    fn blocked(&self, database: &str, table: &str) -> bool {
        self.blocks
            .get(&id(database, table))
            .is_some_and(Block::active)
    }
}

/// In-memory server shared by backends and workloads
#[derive(Debug)]
pub struct SimDatabase {
    state: Mutex<State>,
    appended: Notify,
    advisory_locks: DashMap<String, u64>,
    status_variables: DashMap<String, i64>,
    replication_lag: Mutex<Duration>,
    journal: Mutex<Vec<JournalEntry>>,
    next_session: AtomicU64,
}

impl Default for SimDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDatabase {
    /// Empty server with ROW/FULL binlog settings
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tables: BTreeMap::new(),
                dropped: BTreeMap::new(),
                binlog: Vec::new(),
                blocks: BTreeMap::new(),
                binlog_settings: BinlogSettings {
                    format: "ROW".to_string(),
                    row_image: "FULL".to_string(),
                },
            }),
            appended: Notify::new(),
            advisory_locks: DashMap::new(),
            status_variables: DashMap::new(),
            replication_lag: Mutex::new(Duration::ZERO),
            journal: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// A fresh session id for locks
    pub fn open_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    // ----- fixtures and observation -----

    /// Create `table`
    ///
    /// # Errors
    /// `TableExists` if the name is taken.
    pub fn create_table(&self, database: &str, name: &str, table: Table) -> DbResult<()> {
        let mut state = self.state.lock();
        let key = id(database, name);
        if state.tables.contains_key(&key) {
            return Err(DbError::new(
                DbErrorKind::TableExists,
                format!("table '{name}' already exists"),
            ));
        }
        state.tables.insert(key, table);
        Ok(())
    }

    /// Snapshot of `table`
    #[must_use]
    pub fn table(&self, database: &str, name: &str) -> Option<Table> {
        self.state.lock().tables.get(&id(database, name)).cloned()
    }

    /// Table names in `database`
    #[must_use]
    pub fn table_names(&self, database: &str) -> Vec<String> {
        self.state
            .lock()
            .tables
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Override binlog settings
    pub fn set_binlog_settings(&self, format: &str, row_image: &str) {
        self.state.lock().binlog_settings = BinlogSettings {
            format: format.to_string(),
            row_image: row_image.to_string(),
        };
    }

    /// Current binlog settings
    #[must_use]
    pub fn binlog_settings(&self) -> BinlogSettings {
        self.state.lock().binlog_settings.clone()
    }

    /// Binlog entries after `position`
    #[must_use]
    pub fn binlog_since(&self, position: u64) -> Vec<BinlogEntry> {
        let state = self.state.lock();
        let start = usize::try_from(position).unwrap_or(usize::MAX);
        state.binlog.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Last table dropped under this name, as it stood when dropped
    #[must_use]
    pub fn dropped_table(&self, database: &str, table: &str) -> Option<Table> {
        self.state.lock().dropped.get(&id(database, table)).cloned()
    }

    /// Set a global status variable
    pub fn set_status_variable(&self, name: &str, value: i64) {
        self.status_variables.insert(name.to_string(), value);
    }

    /// Read a global status variable
    #[must_use]
    pub fn status_variable(&self, name: &str) -> Option<i64> {
        self.status_variables.get(name).map(|v| *v)
    }

    /// Set the reported replica lag
    pub fn set_replication_lag(&self, lag: Duration) {
        *self.replication_lag.lock() = lag;
    }

    /// Reported replica lag
    #[must_use]
    pub fn replication_lag(&self) -> Duration {
        *self.replication_lag.lock()
    }

    /// Swapper operations so far
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    fn record(&self, state: &State, operation: String) {
        tracing::debug!(%operation, "sim");
        self.journal.lock().push(JournalEntry {
            operation,
            position: state.position(),
        });
    }

    // ----- client writes -----

    /// Run a client write, waiting while the table is locked
    ///
    /// Returns the number of rows changed.
    ///
    /// # Errors
    /// `TableMissing` if no table has the name once unblocked.
    pub async fn write(&self, database: &str, table: &str, write: &RowWrite) -> DbResult<u64> {
        loop {
            if let Some(result) = self.try_write(database, table, write) {
                return result;
            }
            tokio::time::sleep(BLOCKED_POLL).await;
        }
    }

    fn try_write(&self, database: &str, name: &str, write: &RowWrite) -> Option<DbResult<u64>> {
        let mut state = self.state.lock();
        if state.blocked(database, name) {
            return None;
        }
        let result = Self::write_locked(&mut state, database, name, write);
        drop(state);
        if matches!(result, Ok(n) if n > 0) {
            self.appended.notify_waiters();
        }
        Some(result)
    }

    fn write_locked(state: &mut State, database: &str, name: &str, write: &RowWrite) -> DbResult<u64> {
        let table = state.table_mut(database, name)?;
        let mut events = Vec::new();
        match write {
            RowWrite::Insert(values) => {
                let row = table.row_from_named(values);
                if table.insert(row.clone()) {
                    events.push(RowEvent::insert(database, name, row));
                }
            }
            RowWrite::Update { key, set } => {
                let position = key_position(table, &key.0)?;
                let selector = ColumnValues::new(vec![key.1.clone()]);
                for before in table.remove_matching(&[position], &selector) {
                    let mut after = before.clone();
                    for (column, value) in set {
                        if let Some(i) = table.columns().position(column) {
                            after.0[i] = value.clone();
                        }
                    }
                    if !table.insert(after.clone()) {
                        // duplicate key: leave the row as it was
                        table.insert(before);
                        continue;
                    }
                    events.push(RowEvent::update(database, name, before, after));
                }
            }
            RowWrite::Delete { key } => {
                let position = key_position(table, &key.0)?;
                let selector = ColumnValues::new(vec![key.1.clone()]);
                for before in table.remove_matching(&[position], &selector) {
                    events.push(RowEvent::delete(database, name, before));
                }
            }
        }
        let changed = events.len() as u64;
        for event in events {
            state.log(event);
        }
        Ok(changed)
    }

    // ----- schema reads -----

    pub(crate) fn table_exists(&self, database: &str, table: &str) -> bool {
        self.state.lock().tables.contains_key(&id(database, table))
    }

    pub(crate) fn with_table<T>(
        &self,
        database: &str,
        table: &str,
        f: impl FnOnce(&Table) -> T,
    ) -> DbResult<T> {
        let state = self.state.lock();
        state.table(database, table).map(f)
    }

    // ----- applier -----

    pub(crate) fn drop_table(&self, database: &str, table: &str) {
        let mut state = self.state.lock();
        if let Some(removed) = state.tables.remove(&id(database, table)) {
            state.dropped.insert(id(database, table), removed);
            self.record(&state, format!("drop {table}"));
        }
    }

    pub(crate) fn create_like(&self, database: &str, original: &str, ghost: &str) -> DbResult<()> {
        let copy = self.with_table(database, original, Table::empty_copy)?;
        self.create_table(database, ghost, copy)
    }

    pub(crate) fn alter(&self, database: &str, table: &str, alter: &str) -> DbResult<()> {
        let mut state = self.state.lock();
        let current = state.table_mut(database, table)?;
        let altered = apply_alter(current, alter)
            .map_err(|e| DbError::new(DbErrorKind::InvalidRequest, e.to_string()))?;
        *current = altered;
        Ok(())
    }

    pub(crate) fn switch_binlog_format_to_row(&self) {
        self.state.lock().binlog_settings.format = "ROW".to_string();
    }

    pub(crate) fn write_changelog(
        &self,
        database: &str,
        changelog: &str,
        hint: &str,
        value: &str,
    ) -> DbResult<()> {
        let row_id = match hint {
            "heartbeat" => 1,
            "state" => 2,
            _ => 3,
        };
        let row = ColumnValues::new(vec![
            Value::Int(row_id),
            Value::Text(hint.to_string()),
            Value::Text(value.to_string()),
        ]);
        let mut state = self.state.lock();
        let table = state.table_mut(database, changelog)?;
        let event = match table.replace(row.clone()) {
            Some(before) => RowEvent::update(database, changelog, before, row),
            None => RowEvent::insert(database, changelog, row),
        };
        state.log(event);
        drop(state);
        self.appended.notify_waiters();
        Ok(())
    }

    pub(crate) fn next_chunk_bounds(
        &self,
        database: &str,
        table: &str,
        key: &UniqueKey,
        after: Option<&ColumnValues>,
        upper: &ColumnValues,
        chunk_size: u64,
    ) -> DbResult<Option<KeyRange>> {
        let keys = self
            .with_table(database, table, |t| t.key_values(key))?
            .ok_or_else(|| DbError::new(DbErrorKind::InvalidRequest, format!("unknown key {key}")))?;
        let take = usize::try_from(chunk_size).unwrap_or(usize::MAX);
        let chunk: Vec<&ColumnValues> = keys
            .iter()
            .filter(|k| after.map_or(true, |a| *k > a) && *k <= upper)
            .take(take)
            .collect();
        Ok(match (chunk.first(), chunk.last()) {
            (Some(min), Some(max)) => Some(KeyRange::new((*min).clone(), (*max).clone())),
            _ => None,
        })
    }

    pub(crate) fn copy_chunk(
        &self,
        database: &str,
        original: &str,
        ghost: &str,
        columns: &ColumnList,
        key: &UniqueKey,
        range: &KeyRange,
    ) -> DbResult<u64> {
        let mut state = self.state.lock();
        let source = state.table(database, original)?;
        let key_positions = key
            .columns
            .positions_in(source.columns())
            .ok_or_else(|| DbError::new(DbErrorKind::InvalidRequest, format!("unknown key {key}")))?;
        let shared = columns.positions_in(source.columns()).ok_or_else(|| {
            DbError::new(DbErrorKind::InvalidRequest, format!("unknown columns {columns}"))
        })?;
        let selected: Vec<ColumnValues> = source
            .rows()
            .filter(|row| range.contains(&row.project(&key_positions)))
            .map(|row| row.project(&shared))
            .collect();

        let target = state.table_mut(database, ghost)?;
        let mut inserted = Vec::new();
        for values in selected {
            let row = target.row_from_list(columns, &values);
            if target.insert(row.clone()) {
                inserted.push(row);
            }
        }
        let count = inserted.len() as u64;
        for row in inserted {
            state.log(RowEvent::insert(database, ghost, row));
        }
        Ok(count)
    }

    pub(crate) fn apply_mutations(
        &self,
        database: &str,
        ghost: &str,
        columns: &ColumnList,
        key: &UniqueKey,
        mutations: &[GhostMutation],
    ) -> DbResult<()> {
        let mut state = self.state.lock();
        let target = state.table_mut(database, ghost)?;
        let key_positions = key
            .columns
            .positions_in(target.columns())
            .ok_or_else(|| DbError::new(DbErrorKind::InvalidRequest, format!("unknown key {key}")))?;
        let mut events = Vec::new();
        for mutation in mutations {
            match mutation {
                GhostMutation::Replace(values) => {
                    let row = target.row_from_list(columns, values);
                    let selector = row.project(&key_positions);
                    let removed = target.remove_matching(&key_positions, &selector);
                    target.insert(row.clone());
                    events.push(match removed.into_iter().next() {
                        Some(before) => RowEvent::update(database, ghost, before, row),
                        None => RowEvent::insert(database, ghost, row),
                    });
                }
                GhostMutation::Delete(k) => {
                    for before in target.remove_matching(&key_positions, k) {
                        events.push(RowEvent::delete(database, ghost, before));
                    }
                }
            }
        }
        for event in events {
            state.log(event);
        }
        Ok(())
    }

    // ----- swapper -----

    pub(crate) fn lock_table_write(&self, session: u64, database: &str, table: &str) -> DbResult<()> {
        let mut state = self.state.lock();
        state.table(database, table)?;
        let key = id(database, table);
        if let Some(block) = state.blocks.get(&key) {
            if block.active() && block.session != session {
                return Err(DbError::new(
                    DbErrorKind::LockWaitTimeout,
                    format!("table '{table}' is locked by another session"),
                ));
            }
        }
        state.blocks.insert(
            key,
            Block {
                session,
                kind: BlockKind::WriteLock,
                expires: None,
            },
        );
        self.record(&state, format!("lock {table}"));
        Ok(())
    }

    fn release_blocks(&self, session: u64, kind: BlockKind) -> usize {
        let mut state = self.state.lock();
        let before = state.blocks.len();
        state
            .blocks
            .retain(|_, b| !(b.session == session && b.kind == kind));
        let released = before - state.blocks.len();
        let what = match kind {
            BlockKind::WriteLock => "unlock tables",
            BlockKind::Wait => "release wait",
        };
        self.record(&state, what.to_string());
        released
    }

    pub(crate) fn unlock_tables(&self, session: u64) {
        self.release_blocks(session, BlockKind::WriteLock);
    }

    pub(crate) fn release_wait(&self, session: u64) {
        self.release_blocks(session, BlockKind::Wait);
    }

    pub(crate) fn install_wait(
        &self,
        session: u64,
        database: &str,
        table: &str,
        timeout: Duration,
    ) -> DbResult<()> {
        let mut state = self.state.lock();
        state.table(database, table)?;
        state.blocks.insert(
            id(database, table),
            Block {
                session,
                kind: BlockKind::Wait,
                expires: Some(Instant::now() + timeout),
            },
        );
        self.record(&state, format!("wait {table}"));
        Ok(())
    }

    pub(crate) fn rename(&self, database: &str, from: &str, to: &str) -> DbResult<()> {
        let mut state = self.state.lock();
        if state.tables.contains_key(&id(database, to)) {
            return Err(DbError::new(
                DbErrorKind::TableExists,
                format!("table '{to}' already exists"),
            ));
        }
        let table = state
            .tables
            .remove(&id(database, from))
            .ok_or_else(|| DbError::table_missing(from))?;
        state.tables.insert(id(database, to), table);
        self.record(&state, format!("rename {from} -> {to}"));
        Ok(())
    }

    pub(crate) fn swap(
        &self,
        session: u64,
        database: &str,
        original: &str,
        ghost: &str,
        old: &str,
    ) -> DbResult<()> {
        let mut state = self.state.lock();
        // a wait session that has timed out no longer holds writers back
        let lapsed = state.blocks.get(&id(database, original)).is_some_and(|b| {
            b.session == session && b.kind == BlockKind::Wait && !b.active()
        });
        if lapsed {
            return Err(DbError::new(
                DbErrorKind::LockWaitTimeout,
                format!("wait session on '{original}' expired before the swap"),
            ));
        }
        state.table(database, original)?;
        state.table(database, ghost)?;
        if state.tables.contains_key(&id(database, old)) {
            return Err(DbError::new(
                DbErrorKind::TableExists,
                format!("table '{old}' already exists"),
            ));
        }
        let previous = state
            .tables
            .remove(&id(database, original))
            .ok_or_else(|| DbError::table_missing(original))?;
        let replacement = state
            .tables
            .remove(&id(database, ghost))
            .ok_or_else(|| DbError::table_missing(ghost))?;
        state.tables.insert(id(database, old), previous);
        state.tables.insert(id(database, original), replacement);
        self.record(&state, format!("swap {original} -> {old}, {ghost} -> {original}"));
        Ok(())
    }

    pub(crate) async fn acquire_advisory_lock(
        &self,
        session: u64,
        name: &str,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let acquired = match self.advisory_locks.entry(name.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(held) => *held.get() == session,
                dashmap::mapref::entry::Entry::Vacant(free) => {
                    free.insert(session);
                    true
                }
            };
            if acquired {
                let state = self.state.lock();
                self.record(&state, format!("get lock {name}"));
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(BLOCKED_POLL).await;
        }
    }

    pub(crate) fn release_advisory_lock(&self, session: u64, name: &str) {
        let released = self
            .advisory_locks
            .remove_if(name, |_, holder| *holder == session)
            .is_some();
        if released {
            let state = self.state.lock();
            self.record(&state, format!("release lock {name}"));
        }
    }

    /// Hold an advisory lock from an outside session, as a competing tool would
    pub fn hold_advisory_lock(&self, name: &str) -> u64 {
        let session = self.open_session();
        self.advisory_locks.insert(name.to_string(), session);
        session
    }

    /// Release a lock taken with [`hold_advisory_lock`](Self::hold_advisory_lock)
    pub fn release_held_lock(&self, name: &str, session: u64) {
        self.advisory_locks
            .remove_if(name, |_, holder| *holder == session);
    }

    // ----- binlog -----

    pub(crate) fn current_coordinates(&self) -> BinlogCoordinates {
        BinlogCoordinates::new(BINLOG_FILE, self.state.lock().position())
    }

    pub(crate) async fn read_events(
        &self,
        after: &BinlogCoordinates,
        max: usize,
        wait: Duration,
    ) -> Vec<BinlogEntry> {
        let notified = self.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let read = |db: &Self| {
            let state = db.state.lock();
            let start = usize::try_from(after.log_pos).unwrap_or(usize::MAX);
            state
                .binlog
                .get(start..)
                .map(|rest| rest.iter().take(max).cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };

        let entries = read(self);
        if !entries.is_empty() {
            return entries;
        }
        if tokio::time::timeout(wait, notified).await.is_err() {
            return Vec::new();
        }
        read(self)
    }
}

fn key_position(table: &Table, column: &str) -> DbResult<usize> {
    table
        .columns()
        .position(column)
        .ok_or_else(|| DbError::new(DbErrorKind::InvalidRequest, format!("unknown column {column}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn orders() -> Table {
        Table::new(
            ColumnList::new(["id", "qty"]),
            vec![UniqueKey::primary(ColumnList::new(["id"]))],
        )
    }

    fn insert(id: i64, qty: i64) -> RowWrite {
        RowWrite::Insert(vec![
            ("id".to_string(), Value::Int(id)),
            ("qty".to_string(), Value::Int(qty)),
        ])
    }

    #[tokio::test]
    async fn writes_are_logged_in_order() {
        let db = SimDatabase::new();
        db.create_table("shop", "orders", orders()).unwrap();
        db.write("shop", "orders", &insert(1, 5)).await.unwrap();
        db.write(
            "shop",
            "orders",
            &RowWrite::Update {
                key: ("id".to_string(), Value::Int(1)),
                set: vec![("qty".to_string(), Value::Int(6))],
            },
        )
        .await
        .unwrap();
        db.write(
            "shop",
            "orders",
            &RowWrite::Delete {
                key: ("id".to_string(), Value::Int(1)),
            },
        )
        .await
        .unwrap();

        let log = db.binlog_since(0);
        let kinds: Vec<_> = log.iter().map(|e| e.event.kind).collect();
        assert_eq!(
            kinds,
            vec![osc_core::DmlKind::Insert, osc_core::DmlKind::Update, osc_core::DmlKind::Delete]
        );
        assert_eq!(log[2].coordinates, BinlogCoordinates::new(BINLOG_FILE, 3));
        assert!(db.table("shop", "orders").unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_to_missing_table_fails() {
        let db = SimDatabase::new();
        let err = db.write("shop", "nope", &insert(1, 1)).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::TableMissing);
    }

    #[tokio::test]
    async fn locked_writer_lands_in_swapped_table() {
        let db = std::sync::Arc::new(SimDatabase::new());
        db.create_table("shop", "orders", orders()).unwrap();
        db.create_table("shop", "_orders_gst", orders()).unwrap();
        let session = db.open_session();
        db.lock_table_write(session, "shop", "orders").unwrap();

        let writer = {
            let db = db.clone();
            tokio::spawn(async move { db.write("shop", "orders", &insert(9, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        db.swap(session, "shop", "orders", "_orders_gst", "_orders_old").unwrap();
        db.unlock_tables(session);
        assert_eq!(writer.await.unwrap().unwrap(), 1);

        assert!(db.table("shop", "_orders_old").unwrap().is_empty());
        assert_eq!(db.table("shop", "orders").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_events_waits_for_append() {
        let db = std::sync::Arc::new(SimDatabase::new());
        db.create_table("shop", "orders", orders()).unwrap();
        let start = db.current_coordinates();

        let reader = {
            let db = db.clone();
            let start = start.clone();
            tokio::spawn(async move { db.read_events(&start, 10, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        db.write("shop", "orders", &insert(1, 1)).await.unwrap();

        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(db.read_events(&start, 10, Duration::from_millis(1)).await.len() == 1);
    }

    #[tokio::test]
    async fn advisory_lock_is_exclusive() {
        let db = SimDatabase::new();
        let outsider = db.hold_advisory_lock("shop.orders.lock");
        let session = db.open_session();
        assert!(!db.acquire_advisory_lock(session, "shop.orders.lock", Duration::from_millis(5)).await);
        db.release_held_lock("shop.orders.lock", outsider);
        assert!(db.acquire_advisory_lock(session, "shop.orders.lock", Duration::from_millis(5)).await);
    }

    fn orders_row(id: i64, qty: i64) -> ColumnValues {
        ColumnValues::new(vec![Value::Int(id), Value::Int(qty)])
    }

    #[test]
    fn replayed_mutation_batches_leave_ghost_unchanged() {
        let db = SimDatabase::new();
        let ghost = orders().with_rows([orders_row(1, 5), orders_row(2, 6)]);
        db.create_table("shop", "_orders_gst", ghost).unwrap();
        let columns = ColumnList::new(["id", "qty"]);
        let key = UniqueKey::primary(ColumnList::new(["id"]));
        let first = [
            GhostMutation::Replace(orders_row(2, 7)),
            GhostMutation::Delete(ColumnValues::int(1)),
        ];
        let second = [GhostMutation::Replace(orders_row(3, 9))];

        db.apply_mutations("shop", "_orders_gst", &columns, &key, &first).unwrap();
        db.apply_mutations("shop", "_orders_gst", &columns, &key, &second).unwrap();
        let once = db.table("shop", "_orders_gst").unwrap();
        assert_eq!(once.len(), 2);

        // a reconnect delivers both batches again
        db.apply_mutations("shop", "_orders_gst", &columns, &key, &first).unwrap();
        db.apply_mutations("shop", "_orders_gst", &columns, &key, &first).unwrap();
        db.apply_mutations("shop", "_orders_gst", &columns, &key, &second).unwrap();
        assert_eq!(db.table("shop", "_orders_gst").unwrap(), once);
    }

    #[tokio::test]
    async fn expired_wait_session_refuses_swap() {
        let db = SimDatabase::new();
        db.create_table("shop", "orders", orders()).unwrap();
        db.create_table("shop", "_orders_gst", orders()).unwrap();
        let session = db.open_session();
        db.install_wait(session, "shop", "orders", Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // writes are no longer held back
        db.write("shop", "orders", &insert(4, 1)).await.unwrap();
        let err = db
            .swap(session, "shop", "orders", "_orders_gst", "_orders_old")
            .unwrap_err();
        assert_eq!(err.kind, DbErrorKind::LockWaitTimeout);
        assert!(err.is_transient());
        assert_eq!(db.table("shop", "orders").unwrap().len(), 1);
        assert!(db.table("shop", "_orders_old").is_none());

        db.release_wait(session);
        db.install_wait(session, "shop", "orders", Duration::from_secs(5)).unwrap();
        db.swap(session, "shop", "orders", "_orders_gst", "_orders_old").unwrap();
        assert_eq!(db.table("shop", "_orders_old").unwrap().len(), 1);
    }

    #[test]
    fn dropped_table_is_kept_for_inspection() {
        let db = SimDatabase::new();
        db.create_table("shop", "_orders_gst", orders().with_rows([orders_row(1, 1)]))
            .unwrap();
        db.drop_table("shop", "_orders_gst");
        assert!(db.table("shop", "_orders_gst").is_none());
        assert_eq!(db.dropped_table("shop", "_orders_gst").unwrap().len(), 1);
        assert!(db.dropped_table("shop", "orders").is_none());
    }

    #[test]
    fn rename_refuses_existing_target() {
        let db = SimDatabase::new();
        db.create_table("shop", "a", orders()).unwrap();
        db.create_table("shop", "b", orders()).unwrap();
        let err = db.rename("shop", "a", "b").unwrap_err();
        assert_eq!(err.kind, DbErrorKind::TableExists);
        assert_eq!(db.table_names("shop"), vec!["a".to_string(), "b".to_string()]);
    }
}
