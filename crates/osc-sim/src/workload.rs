//! Seeded concurrent writer
//!
//! Runs inserts, updates (some of which move the key) and deletes against a
//! table until stopped, the way application traffic would during a
//! migration. Every write that fails because the table name briefly did not
//! exist is counted; it is retried until it lands.

use crate::database::{RowWrite, SimDatabase};
use osc_core::{DbErrorKind, DbResult, Value};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Workload configuration
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Schema
    pub database: String,
    /// Table written to
    pub table: String,
    /// Integer key column
    pub key_column: String,
    /// Pause between writes
    pub pause: Duration,
    /// Stop after this many writes
    pub max_writes: Option<u64>,
    /// Share of updates that change the key, 0 to 1
    pub key_change_ratio: f64,
    /// This writer's slot among `writers`; it only touches keys in its slot
    pub writer: u64,
    /// Concurrent writers sharing the table
    pub writers: u64,
}

impl WorkloadConfig {
    /// Writer for `database.table` keyed by `id`
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            seed: 42,
            database: database.into(),
            table: table.into(),
            key_column: "id".to_string(),
            pause: Duration::from_micros(200),
            max_writes: None,
            key_change_ratio: 0.1,
            writer: 0,
            writers: 1,
        }
    }

    /// One of `writers` concurrent writers, owning keys congruent to `writer`
    #[must_use]
    pub fn with_partition(mut self, writer: u64, writers: u64) -> Self {
        self.writers = writers.max(1);
        self.writer = writer % self.writers;
        self
    }

    fn owns(&self, id: i64) -> bool {
        self.writers == 1 || i64::try_from(self.writer).is_ok_and(|w| id.rem_euclid(self.stride()) == w)
    }

    fn stride(&self) -> i64 {
        i64::try_from(self.writers).unwrap_or(i64::MAX)
    }

    /// Override the seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Stop after `writes` writes
    #[must_use]
    pub fn with_max_writes(mut self, writes: u64) -> Self {
        self.max_writes = Some(writes);
        self
    }
}

/// What a workload did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadStats {
    /// Rows inserted
    pub inserts: u64,
    /// Rows updated in place
    pub updates: u64,
    /// Updates that moved a row to a new key
    pub key_changes: u64,
    /// Rows deleted
    pub deletes: u64,
    /// Writes that found the table name missing
    pub missing_table: u64,
}

impl WorkloadStats {
    /// All successful writes
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.inserts + self.updates + self.key_changes + self.deletes
    }

    /// Add another writer's counts
    pub fn absorb(&mut self, other: &Self) {
        self.inserts += other.inserts;
        self.updates += other.updates;
        self.key_changes += other.key_changes;
        self.deletes += other.deletes;
        self.missing_table += other.missing_table;
    }
}

/// A running workload
#[derive(Debug)]
pub struct WorkloadHandle {
    stop: CancellationToken,
    task: JoinHandle<DbResult<WorkloadStats>>,
}

impl WorkloadHandle {
    /// Stop writing and collect stats
    ///
    /// # Errors
    /// A write failed with anything other than a missing table.
    pub async fn stop(self) -> DbResult<WorkloadStats> {
        self.stop.cancel();
        self.finish().await
    }

    /// Wait for a bounded workload to finish on its own
    ///
    /// # Errors
    /// A write failed with anything other than a missing table.
    pub async fn finish(self) -> DbResult<WorkloadStats> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(osc_core::DbError::new(DbErrorKind::Other, e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Int,
    Text,
}

/// Seeded writer against one table
#[derive(Debug)]
pub struct Workload {
    db: Arc<SimDatabase>,
    config: WorkloadConfig,
}

impl Workload {
    /// Workload against `db`
    #[must_use]
    pub fn new(db: Arc<SimDatabase>, config: WorkloadConfig) -> Self {
        Self { db, config }
    }

    /// Start writing on a background task
    #[must_use]
    pub fn spawn(self) -> WorkloadHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.run(stop.clone()));
        WorkloadHandle { stop, task }
    }

    async fn run(self, stop: CancellationToken) -> DbResult<WorkloadStats> {
        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut stats = WorkloadStats::default();

        let (columns, mut live) = self.snapshot()?;
        let mut next_id = self.first_new_id(&live);
        let stride = config.stride();

        while !stop.is_cancelled() && config.max_writes.map_or(true, |max| stats.writes() < max) {
            let roll: f64 = rng.gen();
            let write = if live.is_empty() || roll < 0.4 {
                let id = next_id;
                next_id += stride;
                live.push(id);
                stats.inserts += 1;
                RowWrite::Insert(self.row(&columns, id, &mut rng))
            } else if roll < 0.8 {
                let index = rng.gen_range(0..live.len());
                let id = live[index];
                if rng.gen_bool(config.key_change_ratio.clamp(0.0, 1.0)) {
                    let moved = next_id;
                    next_id += stride;
                    live[index] = moved;
                    stats.key_changes += 1;
                    RowWrite::Update {
                        key: (config.key_column.clone(), Value::Int(id)),
                        set: vec![(config.key_column.clone(), Value::Int(moved))],
                    }
                } else {
                    stats.updates += 1;
                    let mut set = self.row(&columns, id, &mut rng);
                    set.retain(|(name, _)| *name != config.key_column);
                    RowWrite::Update {
                        key: (config.key_column.clone(), Value::Int(id)),
                        set,
                    }
                }
            } else {
                let id = live.swap_remove(rng.gen_range(0..live.len()));
                stats.deletes += 1;
                RowWrite::Delete {
                    key: (config.key_column.clone(), Value::Int(id)),
                }
            };

            self.apply(&write, &mut stats).await?;
            tokio::time::sleep(config.pause).await;
        }

        tracing::debug!(?stats, "workload stopped");
        Ok(stats)
    }

    fn snapshot(&self) -> DbResult<(Vec<(String, Shape)>, Vec<i64>)> {
        let config = &self.config;
        let table = self
            .db
            .table(&config.database, &config.table)
            .ok_or_else(|| osc_core::DbError::table_missing(&config.table))?;
        let key = table.columns().position(&config.key_column).ok_or_else(|| {
            osc_core::DbError::new(
                DbErrorKind::InvalidRequest,
                format!("unknown column {}", config.key_column),
            )
        })?;
        let sample = table.rows().next();
        let columns = table
            .columns()
            .names()
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let shape = match sample.map(|r| &r.values()[i]) {
                    Some(Value::Text(_)) => Shape::Text,
                    _ => Shape::Int,
                };
                (name.clone(), shape)
            })
            .collect();
        let live = table
            .rows()
            .filter_map(|r| r.values()[key].as_int())
            .filter(|id| config.owns(*id))
            .collect();
        Ok((columns, live))
    }

    fn first_new_id(&self, live: &[i64]) -> i64 {
        let mut id = self
            .db
            .table(&self.config.database, &self.config.table)
            .and_then(|t| {
                let key = t.columns().position(&self.config.key_column)?;
                t.rows().filter_map(|r| r.values()[key].as_int()).max()
            })
            .or_else(|| live.iter().copied().max())
            .unwrap_or(0)
            + 1;
        while !self.config.owns(id) {
            id += 1;
        }
        id
    }

    fn row(&self, columns: &[(String, Shape)], id: i64, rng: &mut StdRng) -> Vec<(String, Value)> {
        columns
            .iter()
            .map(|(name, shape)| {
                let value = if *name == self.config.key_column {
                    Value::Int(id)
                } else {
                    match shape {
                        Shape::Int => Value::Int(rng.gen_range(0..1_000)),
                        Shape::Text => Value::Text(format!("w-{}", rng.gen::<u32>())),
                    }
                };
                (name.clone(), value)
            })
            .collect()
    }

    async fn apply(&self, write: &RowWrite, stats: &mut WorkloadStats) -> DbResult<()> {
        let config = &self.config;
        loop {
            match self.db.write(&config.database, &config.table, write).await {
                Ok(_) => return Ok(()),
                Err(e) if e.kind == DbErrorKind::TableMissing => {
                    stats.missing_table += 1;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn bounded_workload_is_deterministic() {
        let run = || async {
            let db = fixtures::seeded("shop", "orders", 20).unwrap();
            let config = WorkloadConfig::new("shop", "orders")
                .with_seed(7)
                .with_max_writes(100);
            let stats = Workload::new(db.clone(), config).spawn().finish().await.unwrap();
            (stats, db.table("shop", "orders").unwrap())
        };
        let (first_stats, first_table) = run().await;
        let (second_stats, second_table) = run().await;

        assert_eq!(first_stats.writes(), 100);
        assert_eq!(first_stats, second_stats);
        assert_eq!(first_table, second_table);
        assert_eq!(first_stats.missing_table, 0);
    }

    #[tokio::test]
    async fn partitioned_writers_never_collide() {
        let db = fixtures::seeded("shop", "orders", 30).unwrap();
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let config = WorkloadConfig::new("shop", "orders")
                    .with_seed(i)
                    .with_partition(i, 3)
                    .with_max_writes(60);
                Workload::new(db.clone(), config).spawn()
            })
            .collect();

        let mut total = WorkloadStats::default();
        for handle in handles {
            total.absorb(&handle.finish().await.unwrap());
        }
        assert_eq!(total.writes(), 180);

        let inserted = i64::try_from(total.inserts).unwrap();
        let deleted = i64::try_from(total.deletes).unwrap();
        let rows = i64::try_from(db.table("shop", "orders").unwrap().len()).unwrap();
        assert_eq!(rows, 30 + inserted - deleted);
    }
}
