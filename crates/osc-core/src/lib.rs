//! OSC Core - online schema change engine
//!
//! Changes the schema of a live, actively written table without holding a
//! blocking lock for the duration:
//! - Builds a ghost table with the new schema
//! - Copies existing rows into it in bounded chunks
//! - Replays concurrent writes from the change stream onto it
//! - Throttles both data paths under replica lag or server load
//! - Swaps the ghost table into place with one of three cut-over strategies
//!
//! The engine talks to the database only through the capability traits in
//! [`db`]; see the `osc-sim` crate for an in-memory implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use osc_core::{Backend, MigrationSettings, Migrator};
//!
//! # async fn example(backend: Backend) -> Result<(), osc_core::MigrationError> {
//! let settings = MigrationSettings::new("shop", "orders", "ADD COLUMN note TEXT");
//! let report = Migrator::new(settings, backend).run().await?;
//!
//! println!("copied {} rows, applied {} events", report.rows_copied, report.dml_applied);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

// Core modules
pub mod config;
pub mod context;
pub mod copier;
pub mod cutover;
pub mod db;
pub mod error;
pub mod heartbeat;
pub mod inspect;
pub mod migrator;
mod retry;
pub mod status;
pub mod streamer;
pub mod throttler;
pub mod types;

// Re-exports for convenience
pub use config::{
    CliOverrides, FileConfig, MaxLoad, MigrationSettings, Timing, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_LAG_MILLIS, DEFAULT_SWAP_TABLES_TIMEOUT_SECS, MAX_RETRIES,
};
pub use context::{MigrationContext, SchemaSnapshot, TableNames, ThrottleState};
pub use copier::{ChunkIterator, ChunkRequest, CopyStats, RowCopier};
pub use cutover::{CutOverCoordinator, CutOverOutcome, CutOverState, CutOverStrategy};
pub use db::{Applier, Backend, DbResult, EventStream, Inspector, LoadProbe, TableSwapper};
pub use error::{ConfigError, CutOverError, DbError, DbErrorKind, MigrationError, Phase};
pub use migrator::{MigrationPlan, MigrationReport, Migrator};
pub use streamer::{ChangeStreamApplier, StreamStats};
pub use throttler::Throttler;
pub use types::{
    BinlogCoordinates, BinlogEntry, BinlogSettings, ColumnList, ColumnValues, ConnectionConfig,
    CutOverType, DmlKind, GhostMutation, InstanceKey, KeyRange, RowEvent, RowsEstimateMethod,
    UniqueKey, Value,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a migration
    pub use crate::{
        Backend, CutOverType, MigrationError, MigrationReport, MigrationSettings, Migrator,
        Timing,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
