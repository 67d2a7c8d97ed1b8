//! Core types for the migration engine
//!
//! Defines the value types every component exchanges:
//! - Row values and key tuples
//! - Column lists and unique keys
//! - Connection identities
//! - Change-stream coordinates, row events and ghost mutations
//! - Cut-over strategy selection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single column value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Integer value
    Int(i64),
    /// Text value
    Text(String),
}

impl Value {
    /// Borrow the text payload, if any
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload, if any
    #[inline]
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// Ordered tuple of values: a row image, or the values of a key's columns
///
/// Ordering is lexicographic, which matches index order for composite keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnValues(pub Vec<Value>);

impl ColumnValues {
    /// Create from values
    #[inline]
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Single-column integer tuple
    #[inline]
    #[must_use]
    pub fn int(value: i64) -> Self {
        Self(vec![Value::Int(value)])
    }

    /// Values in column order
    #[inline]
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of values
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the tuple is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Select the values at `positions`, in that order
    ///
    /// Positions outside the tuple yield `Value::Null`.
    #[must_use]
    pub fn project(&self, positions: &[usize]) -> ColumnValues {
        ColumnValues(
            positions
                .iter()
                .map(|&i| self.0.get(i).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

impl From<Vec<Value>> for ColumnValues {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl fmt::Display for ColumnValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Ordered list of column names
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnList {
    names: Vec<String>,
}

impl ColumnList {
    /// Create from names, preserving order
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Column names in order
    #[inline]
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of columns
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether there are no columns
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether the list contains `name`
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Ordinal of `name`
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Columns of `self` also present in `other`, in `self`'s order
    #[must_use]
    pub fn shared_with(&self, other: &ColumnList) -> ColumnList {
        ColumnList {
            names: self
                .names
                .iter()
                .filter(|n| other.contains(n))
                .cloned()
                .collect(),
        }
    }

    /// Ordinal in `other` of each of our columns; `None` if any is missing
    #[must_use]
    pub fn positions_in(&self, other: &ColumnList) -> Option<Vec<usize>> {
        self.names.iter().map(|n| other.position(n)).collect()
    }
}

impl fmt::Display for ColumnList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names.join(","))
    }
}

/// A unique key (primary or secondary unique index)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueKey {
    /// Index name; `PRIMARY` for the primary key
    pub name: String,
    /// Indexed columns, in index order
    pub columns: ColumnList,
    /// Whether any indexed column is nullable
    pub has_nullable: bool,
}

impl UniqueKey {
    /// Name the primary key carries
    pub const PRIMARY: &'static str = "PRIMARY";

    /// Create a non-nullable unique key
    pub fn new(name: impl Into<String>, columns: ColumnList) -> Self {
        Self {
            name: name.into(),
            columns,
            has_nullable: false,
        }
    }

    /// Primary key over `columns`
    #[must_use]
    pub fn primary(columns: ColumnList) -> Self {
        Self::new(Self::PRIMARY, columns)
    }

    /// Mark nullable
    #[inline]
    #[must_use]
    pub fn with_nullable(mut self, has_nullable: bool) -> Self {
        self.has_nullable = has_nullable;
        self
    }

    /// Whether this is the primary key
    #[inline]
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.name == Self::PRIMARY
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.columns)
    }
}

/// Inclusive range of migration-key values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Lowest key in range
    pub min: ColumnValues,
    /// Highest key in range
    pub max: ColumnValues,
}

impl KeyRange {
    /// Create a range
    #[inline]
    #[must_use]
    pub fn new(min: ColumnValues, max: ColumnValues) -> Self {
        Self { min, max }
    }

    /// Whether `key` lies within `[min, max]`
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &ColumnValues) -> bool {
        &self.min <= key && key <= &self.max
    }

    /// Whether `other` lies entirely within this range
    #[inline]
    #[must_use]
    pub fn encloses(&self, other: &KeyRange) -> bool {
        self.contains(&other.min) && self.contains(&other.max)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Host/port identity of a database instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Hostname
    pub hostname: String,
    /// Port
    pub port: u16,
}

impl Default for InstanceKey {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 3306,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Connection identity of a logical role (inspector or applier)
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Instance the role connects to
    pub key: InstanceKey,
    /// User name
    pub user: String,
    /// Password
    #[serde(skip_serializing)]
    pub password: String,
}

impl ConnectionConfig {
    /// Connection to `hostname:port` with empty credentials
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            key: InstanceKey {
                hostname: hostname.into(),
                port,
            },
            user: String::new(),
            password: String::new(),
        }
    }

    /// Two configs are equal when they point at the same instance
    #[inline]
    #[must_use]
    pub fn equals(&self, other: &ConnectionConfig) -> bool {
        self.key == other.key
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("key", &self.key)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Position in the change stream
///
/// Ordered by log file name, then position within the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    /// Log file name
    pub log_file: String,
    /// Byte offset (or sequence) within the file
    pub log_pos: u64,
}

impl BinlogCoordinates {
    /// Create coordinates
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
        }
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

/// Server binlog prerequisites as observed by the inspector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogSettings {
    /// `binlog_format` (ROW, STATEMENT, MIXED)
    pub format: String,
    /// `binlog_row_image` (FULL, MINIMAL, NOBLOB)
    pub row_image: String,
}

/// How the inspector estimates the original table's row count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowsEstimateMethod {
    /// Table status statistics
    #[default]
    TableStatus,
    /// Optimizer estimate of a full scan
    Explain,
    /// Exact `COUNT(*)`
    Count,
}

/// Kind of row mutation in the change stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DmlKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

/// A row-level change as recorded in the change stream
///
/// Row images are full rows in the table's column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowEvent {
    /// Schema the table belongs to
    pub database: String,
    /// Table name
    pub table: String,
    /// Mutation kind
    pub kind: DmlKind,
    /// Row image before the change (update, delete)
    pub before: Option<ColumnValues>,
    /// Row image after the change (insert, update)
    pub after: Option<ColumnValues>,
}

impl RowEvent {
    /// Insert event
    pub fn insert(database: impl Into<String>, table: impl Into<String>, row: ColumnValues) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            kind: DmlKind::Insert,
            before: None,
            after: Some(row),
        }
    }

    /// Update event
    pub fn update(
        database: impl Into<String>,
        table: impl Into<String>,
        before: ColumnValues,
        after: ColumnValues,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            kind: DmlKind::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    /// Delete event
    pub fn delete(database: impl Into<String>, table: impl Into<String>, row: ColumnValues) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            kind: DmlKind::Delete,
            before: Some(row),
            after: None,
        }
    }
}

/// A row event together with its stream position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogEntry {
    /// Where the event sits in the stream
    pub coordinates: BinlogCoordinates,
    /// The event
    pub event: RowEvent,
}

/// A write against the ghost table derived from a change-stream event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GhostMutation {
    /// Insert-or-replace a row; values are in shared-column order
    Replace(ColumnValues),
    /// Delete the row with this migration-key value
    Delete(ColumnValues),
}

/// Cut-over strategy, fixed for the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CutOverType {
    /// Rename original away, then rename ghost in
    #[default]
    TwoStep,
    /// Advisory lock + query kill + atomic rename
    VoluntaryLock,
    /// Blocking wait session + atomic rename
    UdfWait,
}

impl CutOverType {
    /// Canonical name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CutOverType::TwoStep => "two-step",
            CutOverType::VoluntaryLock => "voluntary-lock",
            CutOverType::UdfWait => "udf-wait",
        }
    }

    /// All strategies
    #[must_use]
    pub fn all() -> [CutOverType; 3] {
        [
            CutOverType::TwoStep,
            CutOverType::VoluntaryLock,
            CutOverType::UdfWait,
        ]
    }
}

impl fmt::Display for CutOverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CutOverType {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "two-step" => Ok(CutOverType::TwoStep),
            "voluntary-lock" => Ok(CutOverType::VoluntaryLock),
            "udf-wait" => Ok(CutOverType::UdfWait),
            other => Err(crate::error::ConfigError::InvalidCutOverType(
                other.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_columns_keep_original_order() {
        let original = ColumnList::new(["id", "name", "email", "legacy"]);
        let ghost = ColumnList::new(["email", "id", "name", "created_at"]);

        let shared = original.shared_with(&ghost);
        assert_eq!(shared.names(), &["id", "name", "email"]);
        assert_eq!(shared.positions_in(&original), Some(vec![0, 1, 2]));
        assert_eq!(shared.positions_in(&ghost), Some(vec![1, 2, 0]));
    }

    #[test]
    fn positions_in_reports_missing_column() {
        let a = ColumnList::new(["id", "gone"]);
        let b = ColumnList::new(["id"]);
        assert_eq!(a.positions_in(&b), None);
    }

    #[test]
    fn composite_keys_order_lexicographically() {
        let a = ColumnValues::new(vec![Value::Int(1), Value::Int(9)]);
        let b = ColumnValues::new(vec![Value::Int(2), Value::Int(0)]);
        assert!(a < b);

        let range = KeyRange::new(ColumnValues::int(1), ColumnValues::int(10));
        assert!(range.contains(&ColumnValues::int(10)));
        assert!(!range.contains(&ColumnValues::int(11)));
    }

    #[test]
    fn connection_equality_ignores_credentials() {
        let mut a = ConnectionConfig::new("db1", 3306);
        let b = ConnectionConfig::new("db1", 3306);
        a.user = "someone".to_string();
        a.password = "hunter2".to_string();
        assert!(a.equals(&b));
        assert!(!a.equals(&ConnectionConfig::new("db2", 3306)));
        assert!(!format!("{a:?}").contains("hunter2"));
    }

    #[test]
    fn cut_over_type_round_trips_names() {
        for t in CutOverType::all() {
            assert_eq!(t.as_str().parse::<CutOverType>().unwrap(), t);
        }
        assert!("atomic".parse::<CutOverType>().is_err());
    }

    #[test]
    fn coordinates_order_by_file_then_position() {
        let a = BinlogCoordinates::new("bin.000001", 900);
        let b = BinlogCoordinates::new("bin.000002", 4);
        assert!(a < b);
        assert_eq!(b.to_string(), "bin.000002:4");
    }
}
