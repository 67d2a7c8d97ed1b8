//! Cut-over retries, rollbacks and worker faults

mod common;

use common::{assert_swap_consistent, settings, DB, GHOST, OLD, TABLE};
use osc_core::{
    CutOverError, CutOverType, DbErrorKind, MigrationError, Migrator, Phase, MAX_RETRIES,
};
use osc_sim::{fixtures, Fault, FaultOp, FaultPlan, SimBackend, Workload, WorkloadConfig};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_step_restores_original_and_retries() {
    let db = fixtures::seeded(DB, TABLE, 300).unwrap();
    let backend = SimBackend::new(db.clone());
    backend
        .faults()
        .inject(Fault::new(FaultOp::RenameTable).on(GHOST));
    let workload = Workload::new(db.clone(), WorkloadConfig::new(DB, TABLE).with_seed(11)).spawn();

    let report = Migrator::new(
        settings("ADD COLUMN note TEXT", CutOverType::TwoStep),
        backend.into_backend(),
    )
    .run()
    .await
    .unwrap();
    workload.stop().await.unwrap();

    let cut_over = report.cut_over.unwrap();
    assert_eq!(cut_over.attempts, 2);
    let ops: Vec<String> = db.journal().into_iter().map(|e| e.operation).collect();
    assert!(ops.contains(&format!("rename {OLD} -> {TABLE}")));
    assert_swap_consistent(&db);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_rollback_is_fatal_and_keeps_data() {
    let db = fixtures::seeded(DB, TABLE, 100).unwrap();
    let backend = SimBackend::new(db.clone());
    backend
        .faults()
        .inject(Fault::new(FaultOp::RenameTable).on(GHOST));
    backend
        .faults()
        .inject(Fault::new(FaultOp::RenameTable).on(OLD).kind(DbErrorKind::Other));

    let err = Migrator::new(
        settings("ADD COLUMN note TEXT", CutOverType::TwoStep),
        backend.into_backend(),
    )
    .run()
    .await
    .unwrap_err();

    match err {
        MigrationError::CutOverFailed {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 1);
            assert!(matches!(source, CutOverError::RollbackFailed { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(db.table(DB, TABLE).is_none());
    assert_eq!(db.table(DB, OLD).unwrap().len(), 100);
    assert_eq!(db.table(DB, GHOST).unwrap().len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_swap_failure_leaves_original_untouched() {
    let db = fixtures::seeded(DB, TABLE, 40).unwrap();
    let original = db.table(DB, TABLE).unwrap();
    let backend = SimBackend::new(db.clone());
    backend.faults().inject(
        Fault::new(FaultOp::SwapTables)
            .on(TABLE)
            .kind(DbErrorKind::InvalidRequest),
    );
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::VoluntaryLock);
    s.drop_ghost_table_on_failure = true;
    s.drop_changelog_table_on_failure = true;

    let err = Migrator::new(s, backend.into_backend()).run().await.unwrap_err();

    assert_eq!(err.phase(), Phase::CutOver);
    assert_eq!(db.table(DB, TABLE).unwrap(), original);
    assert_eq!(db.table_names(DB), vec![TABLE.to_string()]);
    let ops: Vec<String> = db.journal().into_iter().map(|e| e.operation).collect();
    assert!(ops.contains(&"unlock tables".to_string()));
    assert!(ops.contains(&"release lock shop.orders.lock".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_contended_advisory_lock_is_retried() {
    let db = fixtures::seeded(DB, TABLE, 100).unwrap();
    let outsider = db.hold_advisory_lock("shop.orders.lock");
    let releaser = {
        let db = db.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            db.release_held_lock("shop.orders.lock", outsider);
        })
    };
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::VoluntaryLock);
    s.swap_tables_timeout_secs = 1;

    let report = Migrator::new(s, SimBackend::new(db.clone()).into_backend())
        .run()
        .await
        .unwrap();
    releaser.await.unwrap();

    assert!(report.cut_over.unwrap().attempts >= 2);
    assert_eq!(db.table(DB, TABLE).unwrap().columns().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_worker_faults_are_absorbed() {
    let db = fixtures::seeded(DB, TABLE, 200).unwrap();
    let faults = Arc::new(FaultPlan::new());
    faults.inject(Fault::new(FaultOp::CopyChunk).times(3));
    faults.inject(Fault::new(FaultOp::ReadEvents).times(3).kind(DbErrorKind::ConnectionLost));
    faults.inject(Fault::new(FaultOp::ApplyMutations).times(2).kind(DbErrorKind::Deadlock));
    let workload = Workload::new(db.clone(), WorkloadConfig::new(DB, TABLE).with_seed(5)).spawn();

    let report = Migrator::new(
        settings("ADD COLUMN note TEXT", CutOverType::UdfWait),
        SimBackend::new(db.clone()).with_faults(faults.clone()).into_backend(),
    )
    .run()
    .await
    .unwrap();
    workload.stop().await.unwrap();

    assert!(report.swapped);
    assert_eq!(faults.fired(FaultOp::CopyChunk), 3);
    assert_eq!(faults.fired(FaultOp::ReadEvents), 3);
    assert_swap_consistent(&db);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_copy_fault_cleans_up_per_settings() {
    let db = fixtures::seeded(DB, TABLE, 200).unwrap();
    let backend = SimBackend::new(db.clone());
    backend
        .faults()
        .inject(Fault::new(FaultOp::CopyChunk).kind(DbErrorKind::Other));
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::TwoStep);
    s.drop_ghost_table_on_failure = true;

    let err = Migrator::new(s, backend.into_backend()).run().await.unwrap_err();

    assert_eq!(err.phase(), Phase::Copy);
    assert!(matches!(err, MigrationError::Database { .. }));
    // changelog kept, ghost dropped
    assert_eq!(
        db.table_names(DB),
        vec!["_orders_osc".to_string(), TABLE.to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_copy_retries_report_attempts() {
    let db = fixtures::seeded(DB, TABLE, 50).unwrap();
    let backend = SimBackend::new(db.clone());
    backend
        .faults()
        .inject(Fault::new(FaultOp::CopyChunk).times(100));

    let err = Migrator::new(
        settings("ADD COLUMN note TEXT", CutOverType::TwoStep),
        backend.into_backend(),
    )
    .run()
    .await
    .unwrap_err();

    match err {
        MigrationError::RetriesExhausted { phase, attempts, .. } => {
            assert_eq!(phase, Phase::Copy);
            assert_eq!(attempts, osc_core::MAX_RETRIES);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_interrupts_pause_between_attempts() {
    let db = fixtures::seeded(DB, TABLE, 40).unwrap();
    let original = db.table(DB, TABLE).unwrap();
    let backend = SimBackend::new(db.clone());
    backend
        .faults()
        .inject(Fault::new(FaultOp::SwapTables).on(TABLE).times(MAX_RETRIES));
    let faults = backend.faults().clone();
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::VoluntaryLock);
    s.timing.retry_interval_ms = 60_000;
    let migrator = Migrator::new(s, backend.into_backend());
    let ctx = migrator.context().clone();

    let run = async {
        tokio::join!(migrator.run(), async {
            while faults.fired(FaultOp::SwapTables) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            ctx.shutdown().cancel();
        })
    };
    let (result, ()) = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("shutdown should end the pause");

    assert!(matches!(
        result.unwrap_err(),
        MigrationError::Cancelled {
            phase: Phase::CutOver
        }
    ));
    assert_eq!(faults.fired(FaultOp::SwapTables), 1);
    assert_eq!(db.table(DB, TABLE).unwrap(), original);
}
