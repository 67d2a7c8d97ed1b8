//! Ready-made tables and servers for tests and demos

use crate::database::SimDatabase;
use crate::table::Table;
use osc_core::{ColumnList, ColumnValues, DbResult, UniqueKey, Value};
use std::sync::Arc;

/// `orders (id PK, name, qty)` with ids `1..=rows`
#[must_use]
pub fn orders_table(rows: i64) -> Table {
    Table::new(
        ColumnList::new(["id", "name", "qty"]),
        vec![UniqueKey::primary(ColumnList::new(["id"]))],
    )
    .with_rows((1..=rows).map(|id| {
        ColumnValues::new(vec![
            Value::Int(id),
            Value::Text(format!("item-{id}")),
            Value::Int(id % 7),
        ])
    }))
}

/// Empty changelog table `(id PK, hint, value)`
#[must_use]
pub fn changelog_table() -> Table {
    Table::new(
        ColumnList::new(["id", "hint", "value"]),
        vec![UniqueKey::primary(ColumnList::new(["id"]))],
    )
}

/// A server holding `database.table` built by [`orders_table`]
///
/// # Errors
/// Never in practice; table creation on a fresh server cannot collide.
pub fn seeded(database: &str, table: &str, rows: i64) -> DbResult<Arc<SimDatabase>> {
    let db = Arc::new(SimDatabase::new());
    db.create_table(database, table, orders_table(rows))?;
    Ok(db)
}
