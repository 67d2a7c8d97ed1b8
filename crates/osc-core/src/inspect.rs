//! Schema inspection and prerequisite checks
//!
//! Runs once before any worker starts. Everything here fails fast: a
//! refusal is always a `MigrationError` tagged with the inspection phase.

use crate::context::{BinlogState, MigrationContext, SchemaSnapshot};
use crate::db::Inspector;
use crate::error::{DbError, MigrationError, Phase};
use crate::types::{ColumnList, UniqueKey};

const TRANSACTIONAL_ENGINES: &[&str] = &["innodb", "tokudb"];

fn db(e: DbError) -> MigrationError {
    MigrationError::database(Phase::Inspection, e)
}

fn refuse(reason: impl Into<String>) -> MigrationError {
    MigrationError::Inspection(reason.into())
}

/// Check the server and the original table can be migrated
///
/// Verifies the inspector/applier roles, that the table exists on a
/// transactional engine, and that the binlog carries full row images.
///
/// # Errors
/// `MigrationError::Inspection` naming the failed prerequisite.
pub async fn preflight(
    ctx: &MigrationContext,
    inspector: &dyn Inspector,
) -> Result<BinlogState, MigrationError> {
    let settings = ctx.settings();
    let database = ctx.database();
    let table = &ctx.names().original;

    if ctx.inspector_is_also_applier() && !settings.allow_on_master {
        return Err(refuse(format!(
            "inspector and applier are both {}; pass allow-on-master to run against the primary",
            settings.inspector.key
        )));
    }

    if !inspector.table_exists(database, table).await.map_err(db)? {
        return Err(refuse(format!("table {database}.{table} not found")));
    }

    let engine = inspector.table_engine(database, table).await.map_err(db)?;
    if !TRANSACTIONAL_ENGINES.contains(&engine.to_ascii_lowercase().as_str()) {
        return Err(refuse(format!(
            "table {database}.{table} uses engine {engine}; a transactional engine is required"
        )));
    }

    let binlog = inspector.binlog_settings().await.map_err(db)?;
    let requires_format_change = !binlog.format.eq_ignore_ascii_case("ROW");
    if requires_format_change && !settings.switch_to_row_binlog_format {
        return Err(refuse(format!(
            "binlog_format is {}; ROW is required (or allow switching to ROW)",
            binlog.format
        )));
    }
    if !binlog.row_image.eq_ignore_ascii_case("FULL") {
        return Err(refuse(format!(
            "binlog_row_image is {}; FULL is required",
            binlog.row_image
        )));
    }

    Ok(BinlogState {
        settings: binlog,
        requires_format_change,
    })
}

/// Columns and unique keys of `table`
///
/// # Errors
/// Collaborator failures, or a table with no columns.
pub async fn table_structure(
    inspector: &dyn Inspector,
    database: &str,
    table: &str,
) -> Result<(ColumnList, Vec<UniqueKey>), MigrationError> {
    let columns = inspector.table_columns(database, table).await.map_err(db)?;
    if columns.is_empty() {
        return Err(refuse(format!("table {database}.{table} has no columns")));
    }
    let keys = inspector.unique_keys(database, table).await.map_err(db)?;
    Ok((columns, keys))
}

/// Pick the migration key
///
/// The first original unique key, PRIMARY preferred, whose exact column list
/// is also a unique key of the ghost table and entirely shared.
#[must_use]
pub fn choose_migration_key(
    original_keys: &[UniqueKey],
    ghost_keys: &[UniqueKey],
    shared: &ColumnList,
) -> Option<UniqueKey> {
    let primary_first = original_keys
        .iter()
        .filter(|k| k.is_primary())
        .chain(original_keys.iter().filter(|k| !k.is_primary()));

    primary_first
        .filter(|k| k.columns.names().iter().all(|c| shared.contains(c)))
        .find(|k| ghost_keys.iter().any(|g| g.columns == k.columns))
        .cloned()
}

/// Combine original and ghost structure into the schema snapshot
///
/// # Errors
/// No shared columns, no usable migration key, or a nullable key when
/// nullable keys are not allowed.
pub fn build_snapshot(
    original_columns: ColumnList,
    original_unique_keys: Vec<UniqueKey>,
    ghost_columns: ColumnList,
    ghost_unique_keys: Vec<UniqueKey>,
    nullable_unique_key_allowed: bool,
) -> Result<SchemaSnapshot, MigrationError> {
    let shared_columns = original_columns.shared_with(&ghost_columns);
    if shared_columns.is_empty() {
        return Err(refuse("original and ghost tables share no columns"));
    }

    let migration_key =
        choose_migration_key(&original_unique_keys, &ghost_unique_keys, &shared_columns)
            .ok_or_else(|| refuse("no shared unique key can be found after ALTER"))?;

    if migration_key.has_nullable && !nullable_unique_key_allowed {
        return Err(refuse(format!(
            "chosen key {migration_key} has nullable columns; allow nullable unique keys to proceed"
        )));
    }

    let shared_positions = shared_columns
        .positions_in(&original_columns)
        .ok_or_else(|| refuse("shared columns missing from original table"))?;
    let key_positions = migration_key
        .columns
        .positions_in(&original_columns)
        .ok_or_else(|| refuse("migration key columns missing from original table"))?;

    Ok(SchemaSnapshot {
        original_columns,
        ghost_columns,
        shared_columns,
        original_unique_keys,
        ghost_unique_keys,
        migration_key,
        shared_positions,
        key_positions,
    })
}
