//! In-memory table storage

use osc_core::{ColumnList, ColumnValues, KeyRange, UniqueKey, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A table: structure plus rows stored by their primary (or first unique) key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    columns: ColumnList,
    unique_keys: Vec<UniqueKey>,
    engine: String,
    nullable: BTreeSet<String>,
    defaults: BTreeMap<String, Value>,
    rows: BTreeMap<ColumnValues, ColumnValues>,
}

impl Table {
    /// Empty InnoDB table
    #[must_use]
    pub fn new(columns: ColumnList, unique_keys: Vec<UniqueKey>) -> Self {
        Self {
            columns,
            unique_keys,
            engine: "InnoDB".to_string(),
            nullable: BTreeSet::new(),
            defaults: BTreeMap::new(),
            rows: BTreeMap::new(),
        }
    }

    /// Override the storage engine
    #[must_use]
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    /// Insert `rows`, ignoring duplicates
    #[must_use]
    pub fn with_rows(mut self, rows: impl IntoIterator<Item = ColumnValues>) -> Self {
        for row in rows {
            self.insert(row);
        }
        self
    }

    /// Column names in order
    #[must_use]
    pub fn columns(&self) -> &ColumnList {
        &self.columns
    }

    /// Unique keys, primary first
    #[must_use]
    pub fn unique_keys(&self) -> &[UniqueKey] {
        &self.unique_keys
    }

    /// Storage engine name
    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Row count
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table holds no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in storage-key order
    pub fn rows(&self) -> impl Iterator<Item = &ColumnValues> {
        self.rows.values()
    }

    /// Same structure, no rows
    #[must_use]
    pub fn empty_copy(&self) -> Self {
        Self {
            rows: BTreeMap::new(),
            ..self.clone()
        }
    }

    fn storage_positions(&self) -> Vec<usize> {
        self.unique_keys
            .first()
            .and_then(|k| k.columns.positions_in(&self.columns))
            .unwrap_or_else(|| (0..self.columns.len()).collect())
    }

    fn storage_key(&self, row: &ColumnValues) -> ColumnValues {
        row.project(&self.storage_positions())
    }

    /// Insert unless the key is taken; `true` if inserted
    pub fn insert(&mut self, row: ColumnValues) -> bool {
        let key = self.storage_key(&row);
        if self.rows.contains_key(&key) {
            return false;
        }
        self.rows.insert(key, row);
        true
    }

    /// Insert or overwrite; returns the overwritten row
    pub fn replace(&mut self, row: ColumnValues) -> Option<ColumnValues> {
        let key = self.storage_key(&row);
        self.rows.insert(key, row)
    }

    /// Remove every row whose `positions` equal `key`
    pub fn remove_matching(&mut self, positions: &[usize], key: &ColumnValues) -> Vec<ColumnValues> {
        let doomed: Vec<ColumnValues> = self
            .rows
            .iter()
            .filter(|(_, row)| row.project(positions) == *key)
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| self.rows.remove(&k))
            .collect()
    }

    /// First row whose `positions` equal `key`
    #[must_use]
    pub fn find(&self, positions: &[usize], key: &ColumnValues) -> Option<&ColumnValues> {
        self.rows.values().find(|row| row.project(positions) == *key)
    }

    /// Sorted projections of `key` over all rows; `None` if a column is missing
    #[must_use]
    pub fn key_values(&self, key: &UniqueKey) -> Option<Vec<ColumnValues>> {
        let positions = key.columns.positions_in(&self.columns)?;
        let mut keys: Vec<ColumnValues> = self.rows.values().map(|r| r.project(&positions)).collect();
        keys.sort();
        Some(keys)
    }

    /// Min and max of `key`; `None` for an empty table or unknown columns
    #[must_use]
    pub fn key_range(&self, key: &UniqueKey) -> Option<KeyRange> {
        let keys = self.key_values(key)?;
        Some(KeyRange::new(keys.first()?.clone(), keys.last()?.clone()))
    }

    /// Value for a column no source row provides
    #[must_use]
    pub fn default_for(&self, column: &str) -> Value {
        self.defaults.get(column).cloned().unwrap_or(Value::Null)
    }

    /// Build a full row from named values, defaulting the rest
    ///
    /// Names the table does not have are ignored.
    #[must_use]
    pub fn row_from_named(&self, values: &[(String, Value)]) -> ColumnValues {
        let row = self
            .columns
            .names()
            .iter()
            .map(|column| {
                values
                    .iter()
                    .find(|(name, _)| name == column)
                    .map_or_else(|| self.default_for(column), |(_, v)| v.clone())
            })
            .collect();
        ColumnValues::new(row)
    }

    /// Build a full row from `values` laid out as `columns`
    #[must_use]
    pub fn row_from_list(&self, columns: &ColumnList, values: &ColumnValues) -> ColumnValues {
        let named: Vec<(String, Value)> = columns
            .names()
            .iter()
            .cloned()
            .zip(values.values().iter().cloned())
            .collect();
        self.row_from_named(&named)
    }

    pub(crate) fn add_column(&mut self, name: &str, nullable: bool, default: Option<Value>) {
        let mut names = self.columns.names().to_vec();
        names.push(name.to_string());
        self.columns = ColumnList::new(names);
        if nullable {
            self.nullable.insert(name.to_string());
        }
        let fill = default.clone().unwrap_or(Value::Null);
        if let Some(value) = default {
            self.defaults.insert(name.to_string(), value);
        }
        self.rows = std::mem::take(&mut self.rows)
            .into_iter()
            .map(|(k, mut row)| {
                row.0.push(fill.clone());
                (k, row)
            })
            .collect();
    }

    pub(crate) fn drop_column(&mut self, position: usize) {
        let mut names = self.columns.names().to_vec();
        let name = names.remove(position);
        self.columns = ColumnList::new(names);
        self.nullable.remove(&name);
        self.defaults.remove(&name);
        self.unique_keys.retain(|k| !k.columns.contains(&name));
        self.rebuild(|mut row| {
            row.0.remove(position);
            row
        });
    }

    pub(crate) fn add_unique_key(&mut self, key: UniqueKey) {
        let has_nullable = !key.is_primary()
            && key.columns.names().iter().any(|c| self.nullable.contains(c));
        let key = key.with_nullable(has_nullable);
        if key.is_primary() {
            self.unique_keys.insert(0, key);
        } else {
            self.unique_keys.push(key);
        }
        self.rebuild(|row| row);
    }

    pub(crate) fn drop_unique_key(&mut self, name: &str) -> bool {
        let before = self.unique_keys.len();
        self.unique_keys.retain(|k| k.name != name);
        let removed = self.unique_keys.len() != before;
        if removed {
            self.rebuild(|row| row);
        }
        removed
    }

    pub(crate) fn set_engine(&mut self, engine: &str) {
        self.engine = engine.to_string();
    }

    fn rebuild(&mut self, f: impl Fn(ColumnValues) -> ColumnValues) {
        let rows = std::mem::take(&mut self.rows);
        for row in rows.into_values() {
            self.insert(f(row));
        }
    }
}
