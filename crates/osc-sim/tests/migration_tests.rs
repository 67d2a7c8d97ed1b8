//! End-to-end migrations against the simulator under concurrent writes

mod common;

use common::{assert_swap_consistent, settings, CHANGELOG, DB, GHOST, OLD, TABLE};
use osc_core::{CutOverType, MigrationError, Migrator, Phase, Value};
use osc_sim::verify::swap_position;
use osc_sim::{fixtures, verify_convergence, SimBackend, Workload, WorkloadConfig};
use pretty_assertions::assert_eq;
use std::time::Duration;

async fn migrate_under_load(cut_over: CutOverType, seed: u64) -> (osc_sim::WorkloadStats, std::sync::Arc<osc_sim::SimDatabase>) {
    let db = fixtures::seeded(DB, TABLE, 600).unwrap();
    let workload = Workload::new(db.clone(), WorkloadConfig::new(DB, TABLE).with_seed(seed)).spawn();

    let migrator = Migrator::new(
        settings("ADD COLUMN note TEXT DEFAULT 'none'", cut_over),
        SimBackend::new(db.clone()).into_backend(),
    );
    let report = migrator.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = workload.stop().await.unwrap();

    assert!(report.swapped);
    assert_eq!(report.cut_over.as_ref().map(|c| c.strategy), Some(cut_over));
    assert_eq!(report.migration_key.as_deref(), Some("PRIMARY (id)"));
    assert!(report.rows_copied > 0);
    assert!(!report.old_table_dropped);
    assert!(stats.writes() > 0);
    let timeline = &report.timeline;
    assert!(timeline.rename_ended_at.is_some());
    assert!(timeline.lock_started_at <= timeline.rename_started_at);
    assert!(timeline.rename_started_at <= timeline.rename_ended_at);

    let names = db.table_names(DB);
    assert!(names.contains(&OLD.to_string()));
    assert!(!names.contains(&GHOST.to_string()));
    assert!(!names.contains(&CHANGELOG.to_string()));

    let new = db.table(DB, TABLE).unwrap();
    assert_eq!(new.columns().names(), &["id", "name", "qty", "note"]);
    assert_swap_consistent(&db);
    (stats, db)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_step_migration_under_writes() {
    migrate_under_load(CutOverType::TwoStep, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_voluntary_lock_migration_never_hides_table() {
    let (stats, db) = migrate_under_load(CutOverType::VoluntaryLock, 2).await;
    assert_eq!(stats.missing_table, 0);

    let ops: Vec<String> = db.journal().into_iter().map(|e| e.operation).collect();
    let lock = ops.iter().position(|o| o == "get lock shop.orders.lock").unwrap();
    let swap = ops.iter().position(|o| o.starts_with("swap ")).unwrap();
    let release = ops.iter().position(|o| o == "release lock shop.orders.lock").unwrap();
    assert!(lock < swap && swap < release);
    assert!(ops[lock..swap].contains(&format!("lock {TABLE}")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udf_wait_migration_never_hides_table() {
    let (stats, db) = migrate_under_load(CutOverType::UdfWait, 3).await;
    assert_eq!(stats.missing_table, 0);

    let ops: Vec<String> = db.journal().into_iter().map(|e| e.operation).collect();
    let wait = ops.iter().position(|o| *o == format!("wait {TABLE}")).unwrap();
    let swap = ops.iter().position(|o| o.starts_with("swap ")).unwrap();
    let release = ops.iter().rposition(|o| o == "release wait").unwrap();
    assert!(wait < swap && swap < release);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_table_migrates() {
    let db = fixtures::seeded(DB, TABLE, 0).unwrap();
    let migrator = Migrator::new(
        settings("DROP COLUMN qty", CutOverType::TwoStep),
        SimBackend::new(db.clone()).into_backend(),
    );
    let report = migrator.run().await.unwrap();

    assert!(report.swapped);
    assert_eq!(report.rows_copied, 0);
    assert_eq!(report.chunks, 0);
    let new = db.table(DB, TABLE).unwrap();
    assert!(new.is_empty());
    assert_eq!(new.columns().names(), &["id", "name"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_noop_leaves_original_in_place() {
    let db = fixtures::seeded(DB, TABLE, 120).unwrap();
    let initial = db.table(DB, TABLE).unwrap();
    let workload = Workload::new(db.clone(), WorkloadConfig::new(DB, TABLE).with_seed(7)).spawn();
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::VoluntaryLock);
    s.noop = true;

    let report = Migrator::new(s, SimBackend::new(db.clone()).into_backend())
        .run()
        .await
        .unwrap();
    let stats = workload.stop().await.unwrap();

    assert!(report.noop);
    assert!(!report.swapped);
    assert!(report.cut_over.is_none());
    assert!(report.rows_copied > 0);
    assert!(stats.writes() > 0);
    assert_eq!(db.table_names(DB), vec![TABLE.to_string()]);
    assert_eq!(db.table(DB, TABLE).unwrap().columns(), initial.columns());
    assert_eq!(swap_position(&db, DB, TABLE), None);

    // the dropped ghost held every write made before the last marker
    let verdict = verify_convergence(&db, DB, TABLE, &initial, "id").unwrap();
    assert!(verdict.is_consistent(), "ghost diverged: {verdict:?}");
    assert!(verdict.rows > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_noop_without_writes_keeps_rows() {
    let db = fixtures::seeded(DB, TABLE, 120).unwrap();
    let before = db.table(DB, TABLE).unwrap();
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::TwoStep);
    s.noop = true;

    let report = Migrator::new(s, SimBackend::new(db.clone()).into_backend())
        .run()
        .await
        .unwrap();

    assert_eq!(report.rows_copied, 120);
    assert_eq!(db.table(DB, TABLE).unwrap(), before);
    let verdict = verify_convergence(&db, DB, TABLE, &before, "id").unwrap();
    assert_eq!(verdict.rows, 120);
    assert_eq!(verdict.replayed, 0);
    assert!(verdict.is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ok_to_drop_table_removes_old() {
    let db = fixtures::seeded(DB, TABLE, 75).unwrap();
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::UdfWait);
    s.ok_to_drop_table = true;

    let report = Migrator::new(s, SimBackend::new(db.clone()).into_backend())
        .run()
        .await
        .unwrap();

    assert!(report.old_table_dropped);
    assert_eq!(db.table_names(DB), vec![TABLE.to_string()]);
    let rows: Vec<Value> = db
        .table(DB, TABLE)
        .unwrap()
        .rows()
        .map(|r| r.values()[3].clone())
        .collect();
    assert_eq!(rows.len(), 75);
    assert!(rows.iter().all(|v| *v == Value::Null));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leftover_old_table_is_refused() {
    let db = fixtures::seeded(DB, TABLE, 10).unwrap();
    db.create_table(DB, OLD, fixtures::orders_table(1)).unwrap();

    let err = Migrator::new(
        settings("ADD COLUMN note TEXT", CutOverType::TwoStep),
        SimBackend::new(db.clone()).into_backend(),
    )
    .run()
    .await
    .unwrap_err();

    assert!(err.is_preflight());
    assert!(err.to_string().contains(OLD));
    assert_eq!(db.table_names(DB), vec![OLD.to_string(), TABLE.to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initially_drop_old_table_clears_leftover() {
    let db = fixtures::seeded(DB, TABLE, 10).unwrap();
    db.create_table(DB, OLD, fixtures::orders_table(1)).unwrap();
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::TwoStep);
    s.initially_drop_old_table = true;

    let report = Migrator::new(s, SimBackend::new(db.clone()).into_backend())
        .run()
        .await
        .unwrap();

    assert!(report.swapped);
    assert_eq!(db.table(DB, OLD).unwrap().len(), 10);
}

#[tokio::test]
async fn test_myisam_table_is_refused() {
    let db = std::sync::Arc::new(osc_sim::SimDatabase::new());
    db.create_table(DB, TABLE, fixtures::orders_table(5).with_engine("MyISAM"))
        .unwrap();

    let err = Migrator::new(
        settings("ADD COLUMN note TEXT", CutOverType::TwoStep),
        SimBackend::new(db.clone()).into_backend(),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, MigrationError::Inspection(_)));
    assert_eq!(err.phase(), Phase::Inspection);
    assert_eq!(db.table_names(DB), vec![TABLE.to_string()]);
}

#[tokio::test]
async fn test_statement_binlog_needs_permission_to_switch() {
    let db = fixtures::seeded(DB, TABLE, 5).unwrap();
    db.set_binlog_settings("STATEMENT", "FULL");

    let err = Migrator::new(
        settings("ADD COLUMN note TEXT", CutOverType::TwoStep),
        SimBackend::new(db.clone()).into_backend(),
    )
    .run()
    .await
    .unwrap_err();
    assert!(err.to_string().contains("binlog_format"));

    let mut s = settings("ADD COLUMN note TEXT", CutOverType::TwoStep);
    s.switch_to_row_binlog_format = true;
    Migrator::new(s, SimBackend::new(db.clone()).into_backend())
        .run()
        .await
        .unwrap();
    assert_eq!(db.binlog_settings().format, "ROW");
}

#[tokio::test]
async fn test_same_host_needs_allow_on_master() {
    let db = fixtures::seeded(DB, TABLE, 5).unwrap();
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::TwoStep);
    s.allow_on_master = false;

    let err = Migrator::new(s, SimBackend::new(db).into_backend())
        .run()
        .await
        .unwrap_err();
    assert!(err.is_preflight());
}

#[tokio::test]
async fn test_dropping_every_key_column_fails_inspection() {
    let db = fixtures::seeded(DB, TABLE, 5).unwrap();
    let mut s = settings("DROP COLUMN id", CutOverType::TwoStep);
    s.drop_ghost_table_on_failure = true;
    s.drop_changelog_table_on_failure = true;

    let err = Migrator::new(s, SimBackend::new(db.clone()).into_backend())
        .run()
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no shared unique key"));
    assert_eq!(db.table_names(DB), vec![TABLE.to_string()]);
}
