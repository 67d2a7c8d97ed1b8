//! Migration settings and their layered sources
//!
//! Settings resolve in three layers: built-in defaults, an optional TOML
//! config file, then command-line-equivalent overrides. Credentials given on
//! the command line always win over the file.

use crate::error::ConfigError;
use crate::types::{ConnectionConfig, CutOverType, RowsEstimateMethod};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default rows per chunk
pub const DEFAULT_CHUNK_SIZE: u64 = 1000;
/// Default replica lag threshold
pub const DEFAULT_MAX_LAG_MILLIS: u64 = 1000;
/// Default timeout for the locked section of a cut-over
pub const DEFAULT_SWAP_TABLES_TIMEOUT_SECS: u64 = 3;
/// Retry ceiling shared by copy, stream reconnection and cut-over
pub const MAX_RETRIES: u32 = 10;

/// Parsed `--max-load` thresholds: status variable name to maximum value
///
/// Kept ordered so that throttle checks run in a deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MaxLoad(BTreeMap<String, i64>);

impl MaxLoad {
    /// Parse `Var=Int[,Var=Int...]`; the empty string means no conditions
    ///
    /// # Errors
    /// Returns the first malformed condition: missing or repeated `=`,
    /// empty variable name, or non-integer value.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut conditions = BTreeMap::new();
        if list.is_empty() {
            return Ok(Self(conditions));
        }
        for condition in list.split(',') {
            let tokens: Vec<&str> = condition.split('=').collect();
            if tokens.len() != 2 {
                return Err(ConfigError::MaxLoadCondition(condition.to_string()));
            }
            if tokens[0].is_empty() {
                return Err(ConfigError::MaxLoadVariable(condition.to_string()));
            }
            let value = tokens[1]
                .parse::<i64>()
                .map_err(|_| ConfigError::MaxLoadValue(condition.to_string()))?;
            conditions.insert(tokens[0].to_string(), value);
        }
        Ok(Self(conditions))
    }

    /// Conditions in variable-name order
    pub fn conditions(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Threshold for `variable`
    #[must_use]
    pub fn get(&self, variable: &str) -> Option<i64> {
        self.0.get(variable).copied()
    }

    /// Number of conditions
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no conditions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for MaxLoad {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MaxLoad {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MaxLoad> for String {
    fn from(value: MaxLoad) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MaxLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&joined.join(","))
    }
}

/// Loop intervals and batch sizes of the workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// How often the throttler re-evaluates its conditions
    pub throttle_check_interval_ms: u64,
    /// How often a throttled worker re-polls the decision
    pub throttle_poll_interval_ms: u64,
    /// How often a heartbeat is written to the changelog table
    pub heartbeat_interval_ms: u64,
    /// How often a status line is logged
    pub status_interval_ms: u64,
    /// Pause between retries of a transient failure
    pub retry_interval_ms: u64,
    /// How long one stream read waits for new events
    pub stream_poll_wait_ms: u64,
    /// Maximum events applied per batch
    pub stream_batch_size: usize,
    /// How often cut-over readiness is re-checked
    pub cut_over_poll_interval_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            throttle_check_interval_ms: 1000,
            throttle_poll_interval_ms: 250,
            heartbeat_interval_ms: 500,
            status_interval_ms: 30_000,
            retry_interval_ms: 1000,
            stream_poll_wait_ms: 500,
            stream_batch_size: 100,
            cut_over_poll_interval_ms: 500,
        }
    }
}

impl Timing {
    /// Fast intervals for simulations and tests
    #[must_use]
    pub fn fast() -> Self {
        Self {
            throttle_check_interval_ms: 10,
            throttle_poll_interval_ms: 5,
            heartbeat_interval_ms: 10,
            status_interval_ms: 1000,
            retry_interval_ms: 5,
            stream_poll_wait_ms: 10,
            stream_batch_size: 100,
            cut_over_poll_interval_ms: 10,
        }
    }

    #[inline]
    pub(crate) fn throttle_check_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_check_interval_ms)
    }

    #[inline]
    pub(crate) fn throttle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_poll_interval_ms)
    }

    #[inline]
    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[inline]
    pub(crate) fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    #[inline]
    pub(crate) fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    #[inline]
    pub(crate) fn stream_poll_wait(&self) -> Duration {
        Duration::from_millis(self.stream_poll_wait_ms)
    }

    #[inline]
    pub(crate) fn cut_over_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cut_over_poll_interval_ms)
    }
}

/// Everything a migration run is configured with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Schema holding the table
    pub database_name: String,
    /// Table being migrated
    pub original_table_name: String,
    /// Alter clause applied to the ghost table
    pub alter_statement: String,

    /// Where schema is read (may be a replica)
    pub inspector: ConnectionConfig,
    /// Where writes happen (must be the primary)
    pub applier: ConnectionConfig,

    /// Rows per copy chunk
    pub chunk_size: u64,
    /// Replica lag above which work is throttled
    pub max_lag_millis: u64,
    /// Query returning replica lag in seconds
    pub replication_lag_query: Option<String>,
    /// Status-variable thresholds
    pub max_load: MaxLoad,
    /// Pause while this file exists
    pub throttle_flag_file: Option<PathBuf>,
    /// Second pause file, usually shared between migrations
    pub throttle_additional_flag_file: Option<PathBuf>,
    /// Hold off the cut-over while this file exists
    pub postpone_cut_over_flag_file: Option<PathBuf>,
    /// Treat throttle probe failures as "not throttled"
    pub ignore_throttle_probe_errors: bool,

    /// Strategy used for the table swap
    pub cut_over_type: CutOverType,
    /// Bound on the locked section of a cut-over attempt
    pub swap_tables_timeout_secs: u64,
    /// Applier lag below which the streams count as converged
    pub cut_over_lag_threshold_millis: u64,

    /// How the original table's size is estimated
    pub rows_estimate_method: RowsEstimateMethod,
    /// Run everything but the swap, then drop the ghost
    pub noop: bool,
    /// Allow inspector and applier to be the same primary
    pub allow_on_master: bool,
    /// Switch a non-ROW binlog format instead of refusing
    pub switch_to_row_binlog_format: bool,
    /// Accept a unique key with nullable columns as migration key
    pub nullable_unique_key_allowed: bool,
    /// Drop the `_old` table after a successful swap
    pub ok_to_drop_table: bool,
    /// Drop a leftover `_old` table before starting
    pub initially_drop_old_table: bool,
    /// Drop a leftover ghost table before starting
    pub initially_drop_ghost_table: bool,
    /// Drop the ghost table when the migration fails
    pub drop_ghost_table_on_failure: bool,
    /// Drop the changelog table when the migration fails
    pub drop_changelog_table_on_failure: bool,

    /// Worker intervals
    pub timing: Timing,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            database_name: String::new(),
            original_table_name: String::new(),
            alter_statement: String::new(),
            inspector: ConnectionConfig::default(),
            applier: ConnectionConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_lag_millis: DEFAULT_MAX_LAG_MILLIS,
            replication_lag_query: None,
            max_load: MaxLoad::default(),
            throttle_flag_file: None,
            throttle_additional_flag_file: None,
            postpone_cut_over_flag_file: None,
            ignore_throttle_probe_errors: false,
            cut_over_type: CutOverType::default(),
            swap_tables_timeout_secs: DEFAULT_SWAP_TABLES_TIMEOUT_SECS,
            cut_over_lag_threshold_millis: 1000,
            rows_estimate_method: RowsEstimateMethod::default(),
            noop: false,
            allow_on_master: false,
            switch_to_row_binlog_format: false,
            nullable_unique_key_allowed: false,
            ok_to_drop_table: false,
            initially_drop_old_table: false,
            initially_drop_ghost_table: false,
            drop_ghost_table_on_failure: false,
            drop_changelog_table_on_failure: false,
            timing: Timing::default(),
        }
    }
}

impl MigrationSettings {
    /// Settings for migrating `database.table` with `alter`
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        alter: impl Into<String>,
    ) -> Self {
        Self {
            database_name: database.into(),
            original_table_name: table.into(),
            alter_statement: alter.into(),
            ..Self::default()
        }
    }

    /// With chunk size
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// With cut-over strategy
    #[must_use]
    pub fn with_cut_over(mut self, cut_over_type: CutOverType) -> Self {
        self.cut_over_type = cut_over_type;
        self
    }

    /// With worker timing
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Swap timeout as a duration
    #[must_use]
    pub fn swap_tables_timeout(&self) -> Duration {
        Duration::from_secs(self.swap_tables_timeout_secs)
    }

    /// Reject settings no worker could run with
    ///
    /// # Errors
    /// `ConfigError::MissingField` for empty identity fields,
    /// `ConfigError::InvalidValue` for zero sizes or timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_name.is_empty() {
            return Err(ConfigError::MissingField("database"));
        }
        if self.original_table_name.is_empty() {
            return Err(ConfigError::MissingField("table"));
        }
        if self.alter_statement.trim().is_empty() {
            return Err(ConfigError::MissingField("alter"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chunk-size",
                reason: "must be positive".to_string(),
            });
        }
        if self.swap_tables_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "swap-tables-timeout",
                reason: "must be positive".to_string(),
            });
        }
        if self.timing.stream_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stream-batch-size",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Layer a config file and command-line overrides over these settings
    ///
    /// Order: file values, then overrides. Credentials resolve
    /// file-then-CLI onto the inspector and are duplicated onto the applier.
    ///
    /// # Errors
    /// Fails on a malformed max-load string from either source; the
    /// settings are left untouched in that case.
    pub fn layered(
        &self,
        file: Option<&FileConfig>,
        overrides: &CliOverrides,
    ) -> Result<Self, ConfigError> {
        let mut next = self.clone();

        if let Some(file) = file {
            if let Some(n) = file.osc.chunk_size {
                next.chunk_size = n;
            }
            if let Some(n) = file.osc.max_lag_millis {
                next.max_lag_millis = n;
            }
            if let Some(q) = &file.osc.replication_lag_query {
                next.replication_lag_query = Some(q.clone());
            }
            if let Some(s) = &file.osc.max_load {
                next.max_load = MaxLoad::parse(s)?;
            }
        }

        if let Some(n) = overrides.chunk_size {
            next.chunk_size = n;
        }
        if let Some(n) = overrides.max_lag_millis {
            next.max_lag_millis = n;
        }
        if let Some(q) = &overrides.replication_lag_query {
            next.replication_lag_query = Some(q.clone());
        }
        if let Some(s) = &overrides.max_load {
            next.max_load = MaxLoad::parse(s)?;
        }

        next.apply_credentials(file, overrides);
        Ok(next)
    }

    fn apply_credentials(&mut self, file: Option<&FileConfig>, overrides: &CliOverrides) {
        if let Some(user) = file.and_then(|f| f.client.user.as_ref()) {
            if !user.is_empty() {
                self.inspector.user = user.clone();
            }
        }
        if let Some(user) = overrides.user.as_ref().filter(|u| !u.is_empty()) {
            self.inspector.user = user.clone();
        }
        if let Some(password) = file.and_then(|f| f.client.password.as_ref()) {
            if !password.is_empty() {
                self.inspector.password = password.clone();
            }
        }
        if let Some(password) = overrides.password.as_ref().filter(|p| !p.is_empty()) {
            self.inspector.password = password.clone();
        }
        self.applier.user = self.inspector.user.clone();
        self.applier.password = self.inspector.password.clone();
    }
}

/// `[client]` section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
}

/// `[osc]` section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OscSection {
    /// Rows per chunk
    pub chunk_size: Option<u64>,
    /// Replica lag threshold
    pub max_lag_millis: Option<u64>,
    /// Replica lag query
    pub replication_lag_query: Option<String>,
    /// Max-load string
    pub max_load: Option<String>,
}

/// Config file contents
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Credentials
    pub client: ClientSection,
    /// Migration tuning
    pub osc: OscSection,
}

impl FileConfig {
    /// Parse TOML text
    ///
    /// # Errors
    /// `ConfigError::Parse` with `path` for context.
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read and parse a config file
    ///
    /// # Errors
    /// `ConfigError::Io` if unreadable, `ConfigError::Parse` if malformed.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }
}

/// Command-line-equivalent values; `None` leaves the lower layer in place
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Rows per chunk
    pub chunk_size: Option<u64>,
    /// Replica lag threshold
    pub max_lag_millis: Option<u64>,
    /// Replica lag query
    pub replication_lag_query: Option<String>,
    /// Max-load string
    pub max_load: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn max_load_parses_pairs() {
        let ml = MaxLoad::parse("Threads_running=100,Threads_connected=500").unwrap();
        assert_eq!(ml.get("Threads_running"), Some(100));
        assert_eq!(ml.get("Threads_connected"), Some(500));
        assert_eq!(ml.len(), 2);
        assert_eq!(ml.to_string(), "Threads_connected=500,Threads_running=100");
    }

    #[test]
    fn max_load_empty_string_means_no_conditions() {
        assert!(MaxLoad::parse("").unwrap().is_empty());
    }

    #[test]
    fn max_load_rejects_malformed_conditions() {
        assert!(matches!(
            MaxLoad::parse("Threads_running"),
            Err(ConfigError::MaxLoadCondition(c)) if c == "Threads_running"
        ));
        assert!(matches!(
            MaxLoad::parse("a=1=2"),
            Err(ConfigError::MaxLoadCondition(_))
        ));
        assert!(matches!(
            MaxLoad::parse("=5"),
            Err(ConfigError::MaxLoadVariable(_))
        ));
        assert!(matches!(
            MaxLoad::parse("Threads_running=lots"),
            Err(ConfigError::MaxLoadValue(_))
        ));
        assert!(matches!(
            MaxLoad::parse("Threads_running=100,"),
            Err(ConfigError::MaxLoadCondition(_))
        ));
    }

    #[test]
    fn settings_defaults_match_documented_values() {
        let s = MigrationSettings::default();
        assert_eq!(s.chunk_size, 1000);
        assert_eq!(s.max_lag_millis, 1000);
        assert_eq!(s.swap_tables_timeout(), Duration::from_secs(3));
        assert!(s.max_load.is_empty());
    }

    #[test]
    fn validate_requires_identity() {
        assert!(matches!(
            MigrationSettings::default().validate(),
            Err(ConfigError::MissingField("database"))
        ));
        assert!(matches!(
            MigrationSettings::new("db", "t", "  ").validate(),
            Err(ConfigError::MissingField("alter"))
        ));
        assert!(MigrationSettings::new("db", "t", "ADD COLUMN c").validate().is_ok());
        assert!(MigrationSettings::new("db", "t", "ADD COLUMN c")
            .with_chunk_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let file = FileConfig::from_toml_str(
            r#"
            [client]
            user = "file-user"
            password = "file-pass"

            [osc]
            chunk_size = 500
            max_lag_millis = 1500
            max_load = "Threads_running=30"
            "#,
            Path::new("inline.toml"),
        )
        .unwrap();

        let overrides = CliOverrides {
            user: Some("cli-user".to_string()),
            chunk_size: Some(2000),
            ..CliOverrides::default()
        };

        let base = MigrationSettings::new("db", "t", "ADD COLUMN c INT");
        let s = base.layered(Some(&file), &overrides).unwrap();

        assert_eq!(s.chunk_size, 2000);
        assert_eq!(s.max_lag_millis, 1500);
        assert_eq!(s.max_load.get("Threads_running"), Some(30));
        assert_eq!(s.inspector.user, "cli-user");
        assert_eq!(s.inspector.password, "file-pass");
        assert_eq!(s.applier.user, "cli-user");
        assert_eq!(s.applier.password, "file-pass");
    }

    #[test]
    fn bad_max_load_leaves_settings_untouched() {
        let base = MigrationSettings::new("db", "t", "ADD COLUMN c INT");
        let overrides = CliOverrides {
            max_load: Some("Threads_running".to_string()),
            ..CliOverrides::default()
        };
        assert!(base.layered(None, &overrides).is_err());
        assert!(base.max_load.is_empty());
    }

    #[test]
    fn config_file_round_trip_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[osc]\nchunk_size = 250").unwrap();

        let cfg = FileConfig::from_path(file.path()).unwrap();
        assert_eq!(cfg.osc.chunk_size, Some(250));
        assert!(cfg.client.user.is_none());
    }

    #[test]
    fn config_file_errors_name_the_path() {
        let missing = Path::new("/definitely/not/here.toml");
        let err = FileConfig::from_path(missing).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));

        let err = FileConfig::from_toml_str("[osc\nchunk_size=", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
