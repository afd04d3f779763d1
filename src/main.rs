mod config;
mod fetch;
mod models;
mod normalize;
mod pipeline;
mod quality;
mod reconcile;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;
use crate::models::DateRange;
use crate::pipeline::Pipeline;
use crate::storage::MasterStore;

#[derive(Parser)]
#[command(
    name = "energy-weather-etl",
    about = "Daily weather and electricity demand ETL for US cities",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory holding default.toml / local.toml
    #[arg(long, env = "ENERGY_ETL_CONFIG_DIR", default_value = "config", global = true)]
    config_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, clean and merge data for every configured city
    Run(RangeArgs),

    /// Show master table statistics
    Stats,

    /// List the configured cities
    Cities,
}

#[derive(Args, Debug, Default)]
struct RangeArgs {
    /// First day to fetch (YYYY-MM-DD)
    #[arg(long, requires = "end", conflicts_with_all = ["historical_days", "daily"])]
    start: Option<NaiveDate>,

    /// Last day to fetch (YYYY-MM-DD)
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,

    /// Fetch the last N days ending today
    #[arg(long, conflicts_with = "daily")]
    historical_days: Option<u32>,

    /// Fetch yesterday only
    #[arg(long)]
    daily: bool,
}

impl RangeArgs {
    fn resolve(&self, today: NaiveDate, default_days: u32) -> Result<DateRange> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => DateRange::new(start, end),
            _ if self.daily => Ok(DateRange::yesterday(today)),
            _ => DateRange::last_days(today, self.historical_days.unwrap_or(default_days)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "energy_weather_etl=info,warn",
        1 => "energy_weather_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load(&cli.config_dir)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config_dir))?;

    match cli.command {
        Command::Run(range_args) => {
            let today = Local::now().date_naive();
            let range = range_args.resolve(today, config.pipeline.default_history_days)?;
            let _t = utils::Timer::start(format!("Pipeline run {}", range));

            let stats = Pipeline::new(config)?.run(range).await?;
            if !stats.failed_cities.is_empty() {
                warn!("Cities that failed this run: {}", stats.failed_cities.join(", "));
            }
            info!(
                "Done: {} cities, {} rows, {} warnings",
                stats.cities_processed,
                utils::fmt_count(stats.rows_written),
                stats.warnings
            );
        }

        Command::Stats => {
            let store = MasterStore::open(config.master_path());
            let stats = store.stats()?;
            println!("─────────────────────────────────");
            println!("  Energy/Weather ETL — Master Stats");
            println!("─────────────────────────────────");
            println!("  File     : {}", store.path().display());
            println!("  Rows     : {}", utils::fmt_count(stats.rows));
            println!("  Cities   : {}", stats.per_city.len());
            println!("  From     : {}", utils::fmt_date(stats.first_date));
            println!("  To       : {}", utils::fmt_date(stats.last_date));
            println!("─────────────────────────────────");
            for (city, rows) in &stats.per_city {
                println!("  {:<20} {:>8}", city, utils::fmt_count(*rows));
            }
        }

        Command::Cities => {
            let cities = config.cities();
            if cities.is_empty() {
                println!("No cities configured — add [[cities]] to {:?}.", cli.config_dir.join("default.toml"));
            } else {
                println!("{} cities:", cities.len());
                for c in &cities {
                    println!(
                        "  {:<20} {:<20} {}",
                        c.name,
                        c.noaa_station_id,
                        c.eia_ba_code.as_deref().unwrap_or("—")
                    );
                }
            }
        }
    }

    Ok(())
}
