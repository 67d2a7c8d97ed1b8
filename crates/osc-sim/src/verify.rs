//! Consistency checks against the binlog
//!
//! After a cut-over the old table holds the original rows as they stood at
//! the swap. Replaying every later write to the table name onto that
//! snapshot must give exactly the rows of the new table, compared on the
//! columns both tables share.
//!
//! A noop run never swaps, so the ghost table is checked instead: replaying
//! the original table's writes up to the last cut-over marker onto its
//! initial rows must give exactly the rows of the ghost table.

use crate::database::SimDatabase;
use crate::table::Table;
use osc_core::streamer::{changelog_signal, ChangelogSignal};
use osc_core::{BinlogEntry, ColumnList, ColumnValues, DmlKind, TableNames, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a check could not run
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// A table the check needs is gone
    #[error("table {0} not found")]
    MissingTable(String),

    /// The journal holds no swap of the ghost table
    #[error("no cut-over recorded for {0}")]
    NoSwap(String),

    /// The binlog holds no cut-over marker for the table
    #[error("no cut-over marker recorded for {0}")]
    NoMarker(String),

    /// The key column is absent or not an integer
    #[error("key column {0} is not an integer column of both tables")]
    BadKey(String),
}

/// Outcome of a consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Rows in the new table
    pub rows: usize,
    /// Writes replayed onto the snapshot
    pub replayed: usize,
    /// Keys expected but absent from the new table
    pub missing: Vec<i64>,
    /// Keys present in the new table but not expected
    pub unexpected: Vec<i64>,
    /// Keys whose shared columns differ
    pub different: Vec<i64>,
}

impl Verdict {
    /// No discrepancies
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.different.is_empty()
    }
}

/// Binlog position at which the ghost table took the original name
#[must_use]
pub fn swap_position(db: &SimDatabase, database: &str, table: &str) -> Option<u64> {
    let names = TableNames::derive(database, table);
    let two_step = format!("rename {} -> {}", names.ghost, names.original);
    let atomic = format!("swap {} -> {}, {} -> {}", names.original, names.old, names.ghost, names.original);
    db.journal()
        .into_iter()
        .rev()
        .find(|e| e.operation == two_step || e.operation == atomic)
        .map(|e| e.position)
}

/// Compare the new table against the old snapshot plus post-swap writes
///
/// # Errors
/// Tables missing, no swap recorded, or a key column that is not an
/// integer column of both tables.
pub fn verify_swap(
    db: &SimDatabase,
    database: &str,
    table: &str,
    key_column: &str,
) -> Result<Verdict, VerifyError> {
    let names = TableNames::derive(database, table);
    let old = db
        .table(database, &names.old)
        .ok_or_else(|| VerifyError::MissingTable(names.old.clone()))?;
    let new = db
        .table(database, table)
        .ok_or_else(|| VerifyError::MissingTable(table.to_string()))?;
    let position =
        swap_position(db, database, table).ok_or_else(|| VerifyError::NoSwap(table.to_string()))?;

    let shared = old.columns().shared_with(new.columns());
    let key = Projection::new(key_column, &shared)?;

    let mut expected = key.table(&old)?;
    let events = db.binlog_since(position);
    let replayed = key.replay(&mut expected, new.columns(), database, table, &events)?;

    Ok(compare(&expected, &key.table(&new)?, replayed))
}

/// Binlog index of the last cut-over marker written for `table`
#[must_use]
pub fn marker_position(db: &SimDatabase, database: &str, table: &str) -> Option<u64> {
    let names = TableNames::derive(database, table);
    let log = db.binlog_since(0);
    log.iter()
        .rposition(|entry| {
            entry.event.database == database
                && entry.event.table == names.changelog
                && matches!(changelog_signal(&entry.event), Some(ChangelogSignal::EventsUpToLock(_)))
        })
        .and_then(|index| u64::try_from(index).ok())
}

/// Compare the ghost table against `initial` plus every write to the
/// original table before the last marker
///
/// `initial` is the original table before any write the binlog holds. The
/// ghost table is read from the live tables, or from the last drop of it.
///
/// # Errors
/// Ghost table never existed, no marker written, or a key column that is
/// not an integer column of both tables.
pub fn verify_convergence(
    db: &SimDatabase,
    database: &str,
    table: &str,
    initial: &Table,
    key_column: &str,
) -> Result<Verdict, VerifyError> {
    let names = TableNames::derive(database, table);
    let ghost = db
        .table(database, &names.ghost)
        .or_else(|| db.dropped_table(database, &names.ghost))
        .ok_or_else(|| VerifyError::MissingTable(names.ghost.clone()))?;
    let position =
        marker_position(db, database, table).ok_or_else(|| VerifyError::NoMarker(table.to_string()))?;

    let shared = initial.columns().shared_with(ghost.columns());
    let key = Projection::new(key_column, &shared)?;

    let mut expected = key.table(initial)?;
    let mut events = db.binlog_since(0);
    events.truncate(usize::try_from(position).unwrap_or(usize::MAX));
    let replayed = key.replay(&mut expected, initial.columns(), database, table, &events)?;

    Ok(compare(&expected, &key.table(&ghost)?, replayed))
}

fn compare(expected: &BTreeMap<i64, Vec<Value>>, actual: &BTreeMap<i64, Vec<Value>>, replayed: usize) -> Verdict {
    let mut verdict = Verdict {
        rows: actual.len(),
        replayed,
        ..Verdict::default()
    };
    for (id, values) in expected {
        match actual.get(id) {
            None => verdict.missing.push(*id),
            Some(found) if found != values => verdict.different.push(*id),
            Some(_) => {}
        }
    }
    verdict.unexpected = actual
        .keys()
        .filter(|id| !expected.contains_key(id))
        .copied()
        .collect();
    verdict
}

struct Projection<'a> {
    key: &'a str,
    shared: &'a ColumnList,
}

impl<'a> Projection<'a> {
    fn new(key: &'a str, shared: &'a ColumnList) -> Result<Self, VerifyError> {
        if shared.position(key).is_none() {
            return Err(VerifyError::BadKey(key.to_string()));
        }
        Ok(Self { key, shared })
    }

    fn row(&self, columns: &ColumnList, row: &ColumnValues) -> Result<(i64, Vec<Value>), VerifyError> {
        let value = |name: &str| {
            columns
                .position(name)
                .and_then(|p| row.values().get(p))
                .cloned()
                .ok_or_else(|| VerifyError::BadKey(name.to_string()))
        };
        let id = value(self.key)?
            .as_int()
            .ok_or_else(|| VerifyError::BadKey(self.key.to_string()))?;
        let values = self
            .shared
            .names()
            .iter()
            .map(|name| value(name))
            .collect::<Result<_, _>>()?;
        Ok((id, values))
    }

    fn table(&self, table: &Table) -> Result<BTreeMap<i64, Vec<Value>>, VerifyError> {
        table.rows().map(|row| self.row(table.columns(), row)).collect()
    }

    /// Apply the writes to `table` among `events`, returning how many
    fn replay(
        &self,
        rows: &mut BTreeMap<i64, Vec<Value>>,
        columns: &ColumnList,
        database: &str,
        table: &str,
        events: &[BinlogEntry],
    ) -> Result<usize, VerifyError> {
        let mut replayed = 0;
        for entry in events {
            let event = &entry.event;
            if event.database != database || event.table != table {
                continue;
            }
            replayed += 1;
            if let Some(before) = &event.before {
                rows.remove(&self.row(columns, before)?.0);
            }
            if matches!(event.kind, DmlKind::Insert | DmlKind::Update) {
                if let Some(after) = &event.after {
                    let (id, values) = self.row(columns, after)?;
                    rows.insert(id, values);
                }
            }
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fixtures, SimBackend};
    use osc_core::{CutOverType, MigrationSettings, Migrator, Timing};

    #[test]
    fn nothing_to_check_before_a_swap() {
        let db = fixtures::seeded("shop", "orders", 3).unwrap();
        assert_eq!(
            verify_swap(&db, "shop", "orders", "id"),
            Err(VerifyError::MissingTable("_orders_old".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tampering_after_swap_is_reported() {
        let db = fixtures::seeded("shop", "orders", 20).unwrap();
        let mut settings = MigrationSettings::new("shop", "orders", "ADD COLUMN note TEXT")
            .with_cut_over(CutOverType::VoluntaryLock)
            .with_timing(Timing::fast());
        settings.allow_on_master = true;
        Migrator::new(settings, SimBackend::new(db.clone()).into_backend())
            .run()
            .await
            .unwrap();

        let verdict = verify_swap(&db, "shop", "orders", "id").unwrap();
        assert!(verdict.is_consistent());
        assert_eq!(verdict.rows, 20);
        assert_eq!(verdict.replayed, 0);

        // a row vanishing without a logged delete
        let mut tampered = db.table("shop", "orders").unwrap();
        tampered.remove_matching(&[0], &ColumnValues::new(vec![Value::Int(5)]));
        db.drop_table("shop", "orders");
        db.create_table("shop", "orders", tampered).unwrap();
        let verdict = verify_swap(&db, "shop", "orders", "id").unwrap();
        assert_eq!(verdict.missing, vec![5]);
        assert!(!verdict.is_consistent());
    }

    #[test]
    fn convergence_needs_a_ghost_and_a_marker() {
        let db = fixtures::seeded("shop", "orders", 3).unwrap();
        let initial = db.table("shop", "orders").unwrap();
        assert_eq!(
            verify_convergence(&db, "shop", "orders", &initial, "id"),
            Err(VerifyError::MissingTable("_orders_gst".to_string()))
        );
        db.create_table("shop", "_orders_gst", initial.clone()).unwrap();
        assert_eq!(
            verify_convergence(&db, "shop", "orders", &initial, "id"),
            Err(VerifyError::NoMarker("orders".to_string()))
        );
    }

    #[test]
    fn text_key_is_rejected() {
        let shared = ColumnList::new(["name"]);
        assert!(Projection::new("id", &shared).is_err());
    }
}
