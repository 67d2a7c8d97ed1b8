//! Fault injection for backend calls

use osc_core::{DbError, DbErrorKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;

/// Backend operations a fault can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FaultOp {
    /// `Applier::copy_chunk`
    CopyChunk,
    /// `Applier::next_chunk_bounds`
    ChunkBounds,
    /// `Applier::apply_mutations`
    ApplyMutations,
    /// `Applier::write_changelog`
    WriteChangelog,
    /// `Applier::create_ghost_table`
    CreateGhost,
    /// `Applier::alter_ghost_table`
    AlterGhost,
    /// `TableSwapper::lock_table_write`
    LockTable,
    /// `TableSwapper::rename_table`
    RenameTable,
    /// `TableSwapper::swap_tables`
    SwapTables,
    /// `TableSwapper::acquire_advisory_lock`
    AdvisoryLock,
    /// `TableSwapper::install_udf_wait`
    UdfWait,
    /// `EventStream::read_events`
    ReadEvents,
    /// `LoadProbe::replication_lag`
    ReplicationLag,
    /// `LoadProbe::status_variable`
    StatusVariable,
}

impl fmt::Display for FaultOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One scripted failure
#[derive(Debug, Clone)]
pub struct Fault {
    op: FaultOp,
    subject: Option<String>,
    remaining: u32,
    kind: DbErrorKind,
}

impl Fault {
    /// Fail the next call of `op` once with a lock wait timeout
    #[must_use]
    pub fn new(op: FaultOp) -> Self {
        Self {
            op,
            subject: None,
            remaining: 1,
            kind: DbErrorKind::LockWaitTimeout,
        }
    }

    /// Only fail calls whose subject (table or lock name) is `subject`
    #[must_use]
    pub fn on(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Fail this many matching calls
    #[must_use]
    pub fn times(mut self, times: u32) -> Self {
        self.remaining = times;
        self
    }

    /// Fail with this error kind
    #[must_use]
    pub fn kind(mut self, kind: DbErrorKind) -> Self {
        self.kind = kind;
        self
    }

    fn matches(&self, op: FaultOp, subject: &str) -> bool {
        self.op == op
            && self.remaining > 0
            && self.subject.as_deref().map_or(true, |s| s == subject)
    }
}

/// Scripted failures shared by a backend
#[derive(Debug, Default)]
pub struct FaultPlan {
    faults: Mutex<Vec<Fault>>,
    fired: Mutex<BTreeMap<FaultOp, u32>>,
}

impl FaultPlan {
    /// No faults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fault
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    /// Disarm every remaining fault
    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// How many times `op` has been failed
    #[must_use]
    pub fn fired(&self, op: FaultOp) -> u32 {
        self.fired.lock().get(&op).copied().unwrap_or(0)
    }

    /// Fail the call if a matching fault is armed
    ///
    /// # Errors
    /// The scripted error.
    pub fn check(&self, op: FaultOp, subject: &str) -> Result<(), DbError> {
        let mut faults = self.faults.lock();
        let Some(fault) = faults.iter_mut().find(|f| f.matches(op, subject)) else {
            return Ok(());
        };
        fault.remaining -= 1;
        let kind = fault.kind;
        faults.retain(|f| f.remaining > 0);
        drop(faults);

        *self.fired.lock().entry(op).or_default() += 1;
        tracing::debug!(%op, subject, ?kind, "injected fault");
        Err(DbError::new(kind, format!("injected {op} fault on {subject}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_fires_requested_number_of_times() {
        let plan = FaultPlan::new();
        plan.inject(Fault::new(FaultOp::RenameTable).on("_t_gst").times(2));

        assert!(plan.check(FaultOp::RenameTable, "t").is_ok());
        assert!(plan.check(FaultOp::RenameTable, "_t_gst").is_err());
        assert!(plan.check(FaultOp::SwapTables, "_t_gst").is_ok());
        assert!(plan.check(FaultOp::RenameTable, "_t_gst").is_err());
        assert!(plan.check(FaultOp::RenameTable, "_t_gst").is_ok());
        assert_eq!(plan.fired(FaultOp::RenameTable), 2);
    }

    #[test]
    fn fault_kind_is_reported() {
        let plan = FaultPlan::new();
        plan.inject(Fault::new(FaultOp::CopyChunk).kind(DbErrorKind::Other));
        let err = plan.check(FaultOp::CopyChunk, "t").unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Other);
        assert!(!err.is_transient());
    }
}
