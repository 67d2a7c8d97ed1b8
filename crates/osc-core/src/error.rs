//! Error types for the migration engine
//!
//! Provides error handling for:
//! - Configuration failures (fail fast, never retried)
//! - Collaborator (database) failures, classified transient or fatal
//! - Cut-over attempt failures
//! - Fatal migration failures, always tagged with the failing phase

use crate::types::CutOverType;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Migration phase an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Settings validation
    Configuration,
    /// Reading schema and server prerequisites
    Inspection,
    /// Creating changelog and ghost tables
    Setup,
    /// Chunked row copy
    Copy,
    /// Change-stream replay
    Streaming,
    /// Table swap
    CutOver,
    /// Post-migration table cleanup
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Configuration => "configuration",
            Phase::Inspection => "inspection",
            Phase::Setup => "setup",
            Phase::Copy => "copy",
            Phase::Streaming => "streaming",
            Phase::CutOver => "cut-over",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Max-load pair lacks exactly one `=`
    #[error("Error parsing max-load condition: {0}")]
    MaxLoadCondition(String),

    /// Max-load pair has an empty variable name
    #[error("Error parsing status variable in max-load condition: {0}")]
    MaxLoadVariable(String),

    /// Max-load pair has a non-integer value
    #[error("Error parsing numeric value in max-load condition: {0}")]
    MaxLoadValue(String),

    /// Required setting is empty
    #[error("missing required setting: {0}")]
    MissingField(&'static str),

    /// Setting has an unusable value
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Setting name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// Unknown cut-over strategy name
    #[error("unknown cut-over type '{0}' (expected two-step, voluntary-lock or udf-wait)")]
    InvalidCutOverType(String),

    /// Config file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the expected layout
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },
}

/// Classification of a collaborator failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    /// Lock wait timed out
    LockWaitTimeout,
    /// Transaction chosen as deadlock victim
    Deadlock,
    /// Connection dropped or reset
    ConnectionLost,
    /// Table does not exist
    TableMissing,
    /// Table already exists
    TableExists,
    /// Request cannot be served (bad schema, unsupported operation)
    InvalidRequest,
    /// Anything else
    Other,
}

/// Error reported by a database collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct DbError {
    /// Classification
    pub kind: DbErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl DbError {
    /// Create an error
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Table-missing error for `table`
    pub fn table_missing(table: &str) -> Self {
        Self::new(DbErrorKind::TableMissing, format!("table '{table}' doesn't exist"))
    }

    /// Whether retrying the same operation may succeed
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DbErrorKind::LockWaitTimeout | DbErrorKind::Deadlock | DbErrorKind::ConnectionLost
        )
    }
}

/// Failure of a single cut-over attempt
#[derive(Debug, thiserror::Error)]
pub enum CutOverError {
    /// Collaborator failed
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// Advisory lock held by someone else
    #[error("could not acquire voluntary lock {name}")]
    LockNotAcquired {
        /// Lock name
        name: String,
    },

    /// Change-stream applier did not reach the lock marker in time
    #[error("timed out after {timeout:?} waiting for events up to lock to be applied")]
    EventsUpToLockTimeout {
        /// How long we waited
        timeout: Duration,
    },

    /// Undoing a half-done rename failed; tables need manual attention
    #[error("rollback failed after {cause}: {rollback}")]
    RollbackFailed {
        /// What made the attempt fail
        cause: Box<CutOverError>,
        /// Why the rollback failed
        rollback: DbError,
    },
}

impl CutOverError {
    /// Whether another attempt may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => e.is_transient(),
            Self::LockNotAcquired { .. } | Self::EventsUpToLockTimeout { .. } => true,
            Self::RollbackFailed { .. } => false,
        }
    }
}

/// Main migration error type
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Settings rejected before any worker started
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Schema or prerequisite check failed
    #[error("inspection failed: {0}")]
    Inspection(String),

    /// Collaborator failed with a non-retryable error
    #[error("{phase} failed: {source}")]
    Database {
        /// Failing phase
        phase: Phase,
        /// Underlying error
        #[source]
        source: DbError,
    },

    /// Transient failure repeated past the retry ceiling
    #[error("{phase} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Failing phase
        phase: Phase,
        /// Attempts made
        attempts: u32,
        /// Last error seen
        #[source]
        source: DbError,
    },

    /// Copier produced a chunk that would regress or skip the cursor
    #[error("copy failed: chunk boundary {found} does not advance past {cursor}")]
    ChunkRegression {
        /// Previous chunk's upper bound
        cursor: String,
        /// Offending lower bound
        found: String,
    },

    /// All cut-over attempts failed
    #[error("cut-over ({strategy}) failed after {attempts} attempts: {source}")]
    CutOverFailed {
        /// Strategy in use
        strategy: CutOverType,
        /// Attempts made
        attempts: u32,
        /// Last attempt's failure
        #[source]
        source: CutOverError,
    },

    /// Cut-over state machine refused a transition
    #[error("illegal cut-over transition {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: crate::cutover::CutOverState,
        /// Requested state
        to: crate::cutover::CutOverState,
    },

    /// Worker task panicked or was aborted
    #[error("{phase} worker terminated abnormally: {reason}")]
    WorkerAborted {
        /// Phase the worker served
        phase: Phase,
        /// Join error text
        reason: String,
    },

    /// Stopped by cancellation before finishing
    #[error("{phase} cancelled")]
    Cancelled {
        /// Phase that observed the cancellation
        phase: Phase,
    },
}

impl MigrationError {
    /// Phase the failure belongs to
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Config(_) => Phase::Configuration,
            Self::Inspection(_) => Phase::Inspection,
            Self::Database { phase, .. }
            | Self::RetriesExhausted { phase, .. }
            | Self::WorkerAborted { phase, .. }
            | Self::Cancelled { phase } => *phase,
            Self::ChunkRegression { .. } => Phase::Copy,
            Self::CutOverFailed { .. } | Self::IllegalTransition { .. } => Phase::CutOver,
        }
    }

    /// Wrap a collaborator error for `phase`
    #[inline]
    #[must_use]
    pub fn database(phase: Phase, source: DbError) -> Self {
        Self::Database { phase, source }
    }

    /// Whether the failure happened before any table was touched
    #[inline]
    #[must_use]
    pub fn is_preflight(&self) -> bool {
        matches!(self.phase(), Phase::Configuration | Phase::Inspection)
    }
}
