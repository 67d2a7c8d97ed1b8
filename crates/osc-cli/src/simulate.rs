//! `osc simulate`: a full migration against the in-memory server

use anyhow::{Context, Result};
use osc_core::{MigrationReport, MigrationSettings, Migrator};
use osc_sim::{fixtures, verify_swap, SimBackend, Verdict, Workload, WorkloadConfig, WorkloadStats};
use serde::Serialize;

/// Simulation knobs beyond the migration settings
#[derive(Debug, Clone)]
pub(crate) struct Options {
    /// Rows seeded into the table
    pub(crate) rows: i64,
    /// Workload seed; writer `i` uses `seed + i`
    pub(crate) seed: u64,
    /// Concurrent writers during the migration
    pub(crate) writers: u64,
    /// Print the report as JSON
    pub(crate) json: bool,
}

#[derive(Debug, Serialize)]
struct Summary<'a> {
    report: &'a MigrationReport,
    workload: Option<WorkloadSummary>,
    verdict: Option<&'a Verdict>,
}

#[derive(Debug, Serialize)]
struct WorkloadSummary {
    writers: u64,
    writes: u64,
    inserts: u64,
    updates: u64,
    key_changes: u64,
    deletes: u64,
    missing_table: u64,
}

/// Run the migration; `Ok(false)` when it failed or left the table inconsistent
///
/// # Errors
/// The simulated server could not be seeded or a writer broke.
pub(crate) async fn run(mut settings: MigrationSettings, options: &Options) -> Result<bool> {
    // one simulated server plays both inspector and applier
    settings.allow_on_master = true;
    let database = settings.database_name.clone();
    let table = settings.original_table_name.clone();

    let db = fixtures::seeded(&database, &table, options.rows).context("seeding simulated table")?;
    tracing::info!(rows = options.rows, writers = options.writers, "simulated table seeded");

    let handles: Vec<_> = (0..options.writers)
        .map(|i| {
            let config = WorkloadConfig::new(database.clone(), table.clone())
                .with_seed(options.seed.wrapping_add(i))
                .with_partition(i, options.writers);
            Workload::new(db.clone(), config).spawn()
        })
        .collect();

    let migrator = Migrator::new(settings, SimBackend::new(db.clone()).into_backend());
    let result = migrator.run().await;

    let mut stats = WorkloadStats::default();
    for handle in handles {
        stats.absorb(&handle.stop().await.context("workload failed")?);
    }

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            eprintln!("migration failed in {} phase: {e}", e.phase());
            return Ok(false);
        }
    };

    let verdict = if report.swapped && !report.old_table_dropped {
        Some(verify_swap(&db, &database, &table, "id").context("verifying swapped table")?)
    } else {
        None
    };
    let consistent = verdict.as_ref().map_or(true, Verdict::is_consistent);
    if !consistent {
        tracing::error!(?verdict, "swapped table does not match the original");
    }

    let summary = Summary {
        report: &report,
        workload: (options.writers > 0).then(|| WorkloadSummary {
            writers: options.writers,
            writes: stats.writes(),
            inserts: stats.inserts,
            updates: stats.updates,
            key_changes: stats.key_changes,
            deletes: stats.deletes,
            missing_table: stats.missing_table,
        }),
        verdict: verdict.as_ref(),
    };
    print_summary(&summary, options.json)?;
    Ok(consistent)
}

fn print_summary(summary: &Summary<'_>, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    let report = summary.report;
    println!("Migration {} complete", report.migration_id);
    println!("  Table:        {}.{}", report.database, report.table);
    println!("  Alter:        {}", report.alter);
    println!(
        "  Key:          {}",
        report.migration_key.as_deref().unwrap_or("n/a")
    );
    println!("  Rows copied:  {} in {} chunks", report.rows_copied, report.chunks);
    println!("  DML applied:  {}", report.dml_applied);
    match &report.cut_over {
        Some(c) => println!(
            "  Cut-over:     {} after {} attempt(s), {:?}",
            c.strategy, c.attempts, c.duration
        ),
        None => println!("  Cut-over:     skipped (noop)"),
    }
    if let Some(w) = &summary.workload {
        println!(
            "  Workload:     {} writes from {} writer(s), table missing {} time(s)",
            w.writes, w.writers, w.missing_table
        );
    }
    if let Some(v) = summary.verdict {
        if v.is_consistent() {
            println!("  Consistency:  OK ({} rows, {} writes replayed)", v.rows, v.replayed);
        } else {
            println!(
                "  Consistency:  FAILED ({} missing, {} unexpected, {} different)",
                v.missing.len(),
                v.unexpected.len(),
                v.different.len()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use osc_core::{CutOverType, Timing};

    fn options(writers: u64) -> Options {
        Options {
            rows: 200,
            seed: 7,
            writers,
            json: true,
        }
    }

    fn fast_settings(alter: &str) -> MigrationSettings {
        let mut settings = MigrationSettings::new("shop", "orders", alter);
        settings.cut_over_type = CutOverType::VoluntaryLock;
        settings.timing = Timing::fast();
        settings
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simulated_migration_passes() {
        let passed = run(fast_settings("ADD COLUMN note TEXT"), &options(3))
            .await
            .unwrap();
        assert!(passed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_migration_reports_false() {
        let passed = run(fast_settings("DROP COLUMN id"), &options(0))
            .await
            .unwrap();
        assert!(!passed);
    }
}
