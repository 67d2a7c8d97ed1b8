//! Shared helpers for simulated migration tests

#![allow(dead_code)]

use osc_core::{CutOverType, MigrationSettings, Timing};
use osc_sim::{verify_swap, SimDatabase};

pub const DB: &str = "shop";
pub const TABLE: &str = "orders";
pub const GHOST: &str = "_orders_gst";
pub const OLD: &str = "_orders_old";
pub const CHANGELOG: &str = "_orders_osc";

/// Settings for a fast run against the simulator
pub fn settings(alter: &str, cut_over: CutOverType) -> MigrationSettings {
    let mut settings = MigrationSettings::new(DB, TABLE, alter)
        .with_chunk_size(50)
        .with_cut_over(cut_over)
        .with_timing(Timing::fast());
    settings.allow_on_master = true;
    settings
}

/// Assert the new table equals the old table at swap time plus later writes
pub fn assert_swap_consistent(db: &SimDatabase) {
    let verdict = verify_swap(db, DB, TABLE, "id").expect("swap can be verified");
    assert!(verdict.is_consistent(), "inconsistent swap: {verdict:?}");
}
