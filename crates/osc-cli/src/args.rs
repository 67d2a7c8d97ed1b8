//! Command line definition and translation into migration settings

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use osc_core::{CliOverrides, CutOverType, FileConfig, MigrationSettings, RowsEstimateMethod};
use std::path::PathBuf;

fn migration_args() -> Vec<Arg> {
    vec![
        Arg::new("database")
            .long("database")
            .required(true)
            .help("Schema holding the table"),
        Arg::new("table")
            .long("table")
            .required(true)
            .help("Table to migrate"),
        Arg::new("alter")
            .long("alter")
            .required(true)
            .help("Alter clause, without ALTER TABLE"),
        Arg::new("config")
            .long("config")
            .value_parser(value_parser!(PathBuf))
            .help("TOML file with [client] and [osc] sections"),
        Arg::new("user").long("user").help("Database user"),
        Arg::new("password").long("password").help("Database password"),
        Arg::new("host")
            .long("host")
            .default_value("127.0.0.1")
            .help("Inspector host"),
        Arg::new("port")
            .long("port")
            .default_value("3306")
            .value_parser(value_parser!(u16))
            .help("Inspector port"),
        Arg::new("cut-over")
            .long("cut-over")
            .default_value("two-step")
            .help("Cut-over strategy: two-step, voluntary-lock or udf-wait"),
        Arg::new("chunk-size")
            .long("chunk-size")
            .value_parser(value_parser!(u64))
            .help("Rows per copy chunk"),
        Arg::new("max-lag-millis")
            .long("max-lag-millis")
            .value_parser(value_parser!(u64))
            .help("Throttle when replica lag exceeds this"),
        Arg::new("replication-lag-query")
            .long("replication-lag-query")
            .help("Custom query returning replica lag in seconds"),
        Arg::new("max-load")
            .long("max-load")
            .help("Throttle thresholds, e.g. Threads_running=25,Threads_connected=500"),
        Arg::new("throttle-flag-file")
            .long("throttle-flag-file")
            .value_parser(value_parser!(PathBuf))
            .help("Throttle while this file exists"),
        Arg::new("throttle-additional-flag-file")
            .long("throttle-additional-flag-file")
            .value_parser(value_parser!(PathBuf))
            .help("Throttle while this file exists"),
        Arg::new("postpone-cut-over-flag-file")
            .long("postpone-cut-over-flag-file")
            .value_parser(value_parser!(PathBuf))
            .help("Hold off cut-over while this file exists"),
        Arg::new("cut-over-lock-timeout-seconds")
            .long("cut-over-lock-timeout-seconds")
            .value_parser(value_parser!(u64))
            .help("Bound on the locked section of a cut-over"),
        Arg::new("exact-rowcount")
            .long("exact-rowcount")
            .action(ArgAction::SetTrue)
            .help("Estimate progress from COUNT(*) rather than table statistics"),
        Arg::new("ignore-throttle-probe-errors")
            .long("ignore-throttle-probe-errors")
            .action(ArgAction::SetTrue)
            .help("Do not throttle when a throttle probe fails"),
        Arg::new("allow-on-master")
            .long("allow-on-master")
            .action(ArgAction::SetTrue)
            .help("Allow inspecting the primary itself"),
        Arg::new("switch-to-rbr")
            .long("switch-to-rbr")
            .action(ArgAction::SetTrue)
            .help("Switch binlog_format to ROW when needed"),
        Arg::new("allow-nullable-unique-key")
            .long("allow-nullable-unique-key")
            .action(ArgAction::SetTrue)
            .help("Accept a migration key with nullable columns"),
        Arg::new("ok-to-drop-table")
            .long("ok-to-drop-table")
            .action(ArgAction::SetTrue)
            .help("Drop the old table after a successful cut-over"),
        Arg::new("initially-drop-old-table")
            .long("initially-drop-old-table")
            .action(ArgAction::SetTrue)
            .help("Drop a leftover old table before starting"),
        Arg::new("initially-drop-ghost-table")
            .long("initially-drop-ghost-table")
            .action(ArgAction::SetTrue)
            .help("Drop a leftover ghost table before starting"),
        Arg::new("drop-ghost-on-failure")
            .long("drop-ghost-on-failure")
            .action(ArgAction::SetTrue)
            .help("Drop the ghost table if the migration fails"),
        Arg::new("drop-changelog-on-failure")
            .long("drop-changelog-on-failure")
            .action(ArgAction::SetTrue)
            .help("Drop the changelog table if the migration fails"),
        Arg::new("noop")
            .long("noop")
            .action(ArgAction::SetTrue)
            .help("Copy and stream but stop before cut-over"),
        Arg::new("json")
            .long("json")
            .action(ArgAction::SetTrue)
            .help("Print output as JSON"),
    ]
}

/// The `osc` command
pub(crate) fn command() -> Command {
    Command::new("osc")
        .version(osc_core::VERSION)
        .about("Online schema change: migrate a live table without blocking writes")
        .subcommand_required(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("plan")
                .about("Validate settings and print what a migration would do")
                .args(migration_args()),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the migration against an in-memory server")
                .args(migration_args())
                .arg(
                    Arg::new("rows")
                        .long("rows")
                        .default_value("10000")
                        .value_parser(value_parser!(i64))
                        .help("Rows to seed the simulated table with"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for the concurrent workload"),
                )
                .arg(
                    Arg::new("writers")
                        .long("writers")
                        .default_value("2")
                        .value_parser(value_parser!(u64))
                        .help("Concurrent writers during the migration, 0 for none"),
                ),
        )
}

fn string(args: &ArgMatches, name: &str) -> Option<String> {
    args.get_one::<String>(name).cloned()
}

fn path(args: &ArgMatches, name: &str) -> Option<PathBuf> {
    args.get_one::<PathBuf>(name).cloned()
}

/// Build settings from a `plan` or `simulate` invocation
///
/// Defaults, then the config file, then command-line values.
///
/// # Errors
/// Unreadable config file, unknown cut-over type, malformed max-load, or
/// settings that fail validation.
pub(crate) fn settings(args: &ArgMatches) -> Result<MigrationSettings> {
    let mut settings = MigrationSettings::new(
        string(args, "database").unwrap_or_default(),
        string(args, "table").unwrap_or_default(),
        string(args, "alter").unwrap_or_default(),
    );

    let cut_over = string(args, "cut-over").unwrap_or_default();
    settings.cut_over_type = cut_over
        .parse::<CutOverType>()
        .with_context(|| format!("--cut-over {cut_over}"))?;

    let host = string(args, "host").unwrap_or_default();
    let port = args.get_one::<u16>("port").copied().unwrap_or(3306);
    settings.inspector = osc_core::ConnectionConfig::new(host.clone(), port);
    settings.applier = osc_core::ConnectionConfig::new(host, port);

    if let Some(secs) = args.get_one::<u64>("cut-over-lock-timeout-seconds") {
        settings.swap_tables_timeout_secs = *secs;
    }
    if args.get_flag("exact-rowcount") {
        settings.rows_estimate_method = RowsEstimateMethod::Count;
    }
    settings.throttle_flag_file = path(args, "throttle-flag-file");
    settings.throttle_additional_flag_file = path(args, "throttle-additional-flag-file");
    settings.postpone_cut_over_flag_file = path(args, "postpone-cut-over-flag-file");
    settings.ignore_throttle_probe_errors = args.get_flag("ignore-throttle-probe-errors");
    settings.allow_on_master = args.get_flag("allow-on-master");
    settings.switch_to_row_binlog_format = args.get_flag("switch-to-rbr");
    settings.nullable_unique_key_allowed = args.get_flag("allow-nullable-unique-key");
    settings.ok_to_drop_table = args.get_flag("ok-to-drop-table");
    settings.initially_drop_old_table = args.get_flag("initially-drop-old-table");
    settings.initially_drop_ghost_table = args.get_flag("initially-drop-ghost-table");
    settings.drop_ghost_table_on_failure = args.get_flag("drop-ghost-on-failure");
    settings.drop_changelog_table_on_failure = args.get_flag("drop-changelog-on-failure");
    settings.noop = args.get_flag("noop");

    let file = path(args, "config")
        .map(|p| FileConfig::from_path(&p))
        .transpose()?;
    let overrides = CliOverrides {
        user: string(args, "user"),
        password: string(args, "password"),
        chunk_size: args.get_one::<u64>("chunk-size").copied(),
        max_lag_millis: args.get_one::<u64>("max-lag-millis").copied(),
        replication_lag_query: string(args, "replication-lag-query"),
        max_load: string(args, "max-load"),
    };

    let settings = settings.layered(file.as_ref(), &overrides)?;
    settings.validate()?;
    Ok(settings)
}
