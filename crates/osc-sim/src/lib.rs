//! OSC Sim - in-memory server for online schema change runs
//!
//! Provides everything needed to run a migration without a real database:
//! - `SimDatabase`: tables, a single ordered binlog, table locks, wait
//!   sessions, advisory locks, renames and swaps
//! - `SimBackend`: the engine's capability traits over one session
//! - `Workload`: a seeded concurrent writer
//! - `FaultPlan`: scripted failures for any backend call
//! - `verify_swap`: checks the swapped-in table against the old one
//! - `verify_convergence`: checks a noop run's ghost table at its last marker
//!
//! # Example
//!
//! ```rust,ignore
//! use osc_core::{MigrationSettings, Migrator, Timing};
//! use osc_sim::{fixtures, SimBackend};
//!
//! let db = fixtures::seeded("shop", "orders", 1_000)?;
//! let mut settings = MigrationSettings::new("shop", "orders", "ADD COLUMN note TEXT")
//!     .with_timing(Timing::fast());
//! settings.allow_on_master = true;
//!
//! let report = Migrator::new(settings, SimBackend::new(db).into_backend()).run().await?;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod alter;
pub mod backend;
pub mod database;
pub mod fault;
pub mod fixtures;
pub mod table;
pub mod verify;
pub mod workload;

pub use alter::{apply_alter, AlterError};
pub use backend::SimBackend;
pub use database::{JournalEntry, RowWrite, SimDatabase, BINLOG_FILE};
pub use fault::{Fault, FaultOp, FaultPlan};
pub use table::Table;
pub use verify::{verify_convergence, verify_swap, Verdict, VerifyError};
pub use workload::{Workload, WorkloadConfig, WorkloadHandle, WorkloadStats};
