//! `osc` - online schema change command line

mod args;
mod simulate;

use anyhow::Result;
use osc_core::MigrationPlan;
use tracing_subscriber::EnvFilter;

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = args::command().get_matches();
    init_logging(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("plan", sub)) => {
            let settings = args::settings(sub)?;
            let plan = MigrationPlan::from_settings(&settings)?;
            if sub.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("Migration plan");
                println!("  Table:       {}.{}", plan.database, plan.table);
                println!("  Alter:       {}", plan.alter);
                println!("  Ghost table: {}", plan.ghost_table);
                println!("  Old table:   {}", plan.old_table);
                println!("  Changelog:   {}", plan.changelog_table);
                println!("  Cut-over:    {}", plan.cut_over);
                println!("  Chunk size:  {}", plan.chunk_size);
                println!("  Max lag:     {}ms", plan.max_lag_millis);
                if !plan.max_load.is_empty() {
                    println!("  Max load:    {}", plan.max_load);
                }
                if plan.noop {
                    println!("  Noop:        tables will not be swapped");
                }
            }
        }
        Some(("simulate", sub)) => {
            let settings = args::settings(sub)?;
            let options = simulate::Options {
                rows: sub.get_one::<i64>("rows").copied().unwrap_or(10_000),
                seed: sub.get_one::<u64>("seed").copied().unwrap_or(42),
                writers: sub.get_one::<u64>("writers").copied().unwrap_or(2),
                json: sub.get_flag("json"),
            };
            let passed = simulate::run(settings, &options).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        _ => {}
    }
    Ok(())
}
