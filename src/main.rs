use anyhow::{anyhow, Context};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use querylens::analysis::{analyze, AnalysisOptions};
use querylens::config::Config;
use querylens::constants::DEFAULT_ANALYZE_LIMIT;
use querylens::logging::{init_subscriber, LogFormat};
use querylens::store::LogStore;

/// Querylens - inspect and maintain stored query logs
#[derive(Parser, Debug)]
#[command(name = "querylens")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format: json or pretty
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze one day of query logs
    Analyze {
        /// Day to analyze (YYYY-MM-DD), today when omitted
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Show only slow queries
        #[arg(long)]
        slow: bool,

        /// Show only N+1 queries
        #[arg(long)]
        n_plus_one: bool,

        /// Limit number of queries considered
        #[arg(long, default_value_t = DEFAULT_ANALYZE_LIMIT)]
        limit: usize,
    },

    /// Delete query logs older than the retention period
    Clear {
        /// Retention in days, overriding the configuration
        #[arg(long)]
        days: Option<u32>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .map_err(|e| anyhow!(e))
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_subscriber(args.log_format)
        .map_err(|e| anyhow!("Failed to initialize logging subsystem: {}", e))?;

    let config = load_config(args.config.as_ref())?;
    let store = LogStore::new(&config.storage);

    tracing::debug!(
        store = %store.dir().display(),
        "Configuration loaded successfully"
    );

    match args.command {
        Command::Analyze {
            date,
            slow,
            n_plus_one,
            limit,
        } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            println!("Analyzing queries for {}...", date);

            let records = store.read(date, None);
            if records.is_empty() {
                println!("No queries found for {}", date);
                return Ok(());
            }

            let options = AnalysisOptions {
                slow_only: slow,
                n_plus_one_only: n_plus_one,
                limit,
                slow_threshold_ms: config.slow_query_threshold_ms,
            };
            let report = analyze(&records, &options);
            println!();
            print!("{}", report.render(&options));
        }
        Command::Clear { days } => {
            let days = days.unwrap_or_else(|| store.retention_days());
            println!("Clearing query logs older than {} days...", days);

            let deleted = store.cleanup(days);
            println!("Deleted {} log file(s)", deleted);
        }
    }

    Ok(())
}
