//! Change-stream replay and read failures

mod common;

use async_trait::async_trait;
use common::{assert_swap_consistent, settings, DB, TABLE};
use osc_core::{
    BinlogCoordinates, BinlogEntry, CutOverType, DbErrorKind, DbResult, EventStream,
    MigrationError, Migrator, Phase, MAX_RETRIES,
};
use osc_sim::{fixtures, Fault, FaultOp, SimBackend, Workload, WorkloadConfig};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delivers the last non-empty batch a second time, once, the way a
/// reconnecting reader resumes from a position it already passed
struct ReplayOnce {
    inner: Arc<dyn EventStream>,
    last_batch_start: Mutex<Option<BinlogCoordinates>>,
    replayed: AtomicUsize,
}

impl ReplayOnce {
    fn new(inner: Arc<dyn EventStream>) -> Self {
        Self {
            inner,
            last_batch_start: Mutex::new(None),
            replayed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EventStream for ReplayOnce {
    async fn current_coordinates(&self) -> DbResult<BinlogCoordinates> {
        self.inner.current_coordinates().await
    }

    async fn read_events(
        &self,
        after: &BinlogCoordinates,
        max: usize,
        wait: Duration,
    ) -> DbResult<Vec<BinlogEntry>> {
        let rewind = match &*self.last_batch_start.lock() {
            Some(start) if self.replayed.load(Ordering::Acquire) == 0 && start < after => {
                Some(start.clone())
            }
            _ => None,
        };
        let from = rewind.clone().unwrap_or_else(|| after.clone());
        let entries = self.inner.read_events(&from, max, wait).await?;

        if rewind.is_some() {
            let again = entries.iter().filter(|e| e.coordinates <= *after).count();
            self.replayed.store(again, Ordering::Release);
        } else if !entries.is_empty() {
            *self.last_batch_start.lock() = Some(after.clone());
        }
        Ok(entries)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replayed_events_do_not_corrupt_ghost() {
    let db = fixtures::seeded(DB, TABLE, 300).unwrap();
    let workload = Workload::new(db.clone(), WorkloadConfig::new(DB, TABLE).with_seed(21)).spawn();
    let mut backend = SimBackend::new(db.clone()).into_backend();
    let stream = Arc::new(ReplayOnce::new(backend.stream.clone()));
    backend.stream = stream.clone();

    let report = Migrator::new(settings("ADD COLUMN note TEXT", CutOverType::VoluntaryLock), backend)
        .run()
        .await
        .unwrap();
    workload.stop().await.unwrap();

    assert!(report.swapped);
    assert!(stream.replayed.load(Ordering::Acquire) > 0);
    assert_swap_consistent(&db);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_stream_connection_exhausts_retries() {
    let db = fixtures::seeded(DB, TABLE, 200).unwrap();
    let original = db.table(DB, TABLE).unwrap();
    let backend = SimBackend::new(db.clone());
    backend.faults().inject(
        Fault::new(FaultOp::ReadEvents)
            .times(MAX_RETRIES)
            .kind(DbErrorKind::ConnectionLost),
    );
    let faults = backend.faults().clone();
    let mut s = settings("ADD COLUMN note TEXT", CutOverType::TwoStep);
    s.drop_ghost_table_on_failure = true;
    s.drop_changelog_table_on_failure = true;

    let err = Migrator::new(s, backend.into_backend()).run().await.unwrap_err();

    match err {
        MigrationError::RetriesExhausted {
            phase,
            attempts,
            source,
        } => {
            assert_eq!(phase, Phase::Streaming);
            assert_eq!(attempts, MAX_RETRIES);
            assert_eq!(source.kind, DbErrorKind::ConnectionLost);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(faults.fired(FaultOp::ReadEvents), MAX_RETRIES);
    assert_eq!(db.table(DB, TABLE).unwrap(), original);
    assert_eq!(db.table_names(DB), vec![TABLE.to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_stream_keeps_tables_by_default() {
    let db = fixtures::seeded(DB, TABLE, 50).unwrap();
    let backend = SimBackend::new(db.clone());
    backend
        .faults()
        .inject(Fault::new(FaultOp::ReadEvents).kind(DbErrorKind::Other));

    let err = Migrator::new(
        settings("ADD COLUMN note TEXT", CutOverType::UdfWait),
        backend.into_backend(),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(err.phase(), Phase::Streaming);
    assert!(matches!(err, MigrationError::Database { .. }));
    assert_eq!(
        db.table_names(DB),
        vec![
            "_orders_gst".to_string(),
            "_orders_osc".to_string(),
            TABLE.to_string()
        ]
    );
}
