mod calendar;
mod config;
mod db;
mod fetcher;
mod parser;
mod pdf;
mod pipeline;
mod sink;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use tracing::{error, info};

use calendar::TradingCalendar;
use config::MarketConfig;
use db::SecurityRecord;
use fetcher::BulletinFetcher;
use parser::BulletinParser;
use pipeline::{Mode, Pipeline};
use sink::{Sink, SinkKind};

#[derive(Parser)]
#[command(name = "boc_parser", about = "BRVM daily bulletin (BOC) parser")]
struct Cli {
    /// TOML file overriding the built-in market configuration
    #[arg(long, global = true)]
    market: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, parse and store bulletins (default: last trading day)
    Run {
        /// Process a specific date (YYYY-MM-DD)
        #[arg(long, conflicts_with = "backfill")]
        date: Option<NaiveDate>,
        /// Backfill the last N trading days, oldest first
        #[arg(long, value_name = "N")]
        backfill: Option<usize>,
        /// Parse and print without writing anywhere
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_enum, default_value_t = SinkKind::Sqlite)]
        sink: SinkKind,
    },
    /// Parse local bulletin files
    Parse {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Bulletin date (default: taken from a boc_YYYYMMDD file name)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                // lopdf logs every text decode at info
                .unwrap_or_else(|_| "info,lopdf=warn".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let market = match &cli.market {
        Some(path) => MarketConfig::load(path)?,
        None => MarketConfig::default(),
    };

    let ok = match cli.command {
        Commands::Run {
            date,
            backfill,
            dry_run,
            sink,
        } => {
            let calendar = TradingCalendar::new(market.holidays.iter().copied());
            let today = chrono::Local::now().date_naive();
            let dates = match (date, backfill) {
                (Some(d), _) => vec![d],
                (None, Some(n)) => {
                    let mut days = calendar.trading_days_back(today, n);
                    if let (Some(newest), Some(oldest)) = (days.first(), days.last()) {
                        info!("Backfilling {} trading days: {} -> {}", days.len(), oldest, newest);
                    }
                    days.reverse();
                    days
                }
                (None, None) => vec![calendar.last_trading_day(today)],
            };

            let mode = if dry_run {
                Mode::DryRun
            } else {
                Mode::Persist(Sink::open(sink)?)
            };
            let pipeline = Pipeline::new(
                BulletinFetcher::from_config(&market)?,
                BulletinParser::from_config(&market)?,
                mode,
            );
            pipeline.run(&dates).await.all_succeeded()
        }
        Commands::Parse { files, date, json } => {
            let parser = BulletinParser::from_config(&market)?;
            let results: Vec<_> = files
                .par_iter()
                .map(|path| parse_file(&parser, path, date))
                .collect();

            let mut records = Vec::new();
            let mut failed = 0usize;
            for (path, result) in files.iter().zip(results) {
                match result {
                    Ok(r) => records.extend(r),
                    Err(e) => {
                        error!("{}: {:#}", path.display(), e);
                        failed += 1;
                    }
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                pipeline::print_records(&records);
            }
            info!("Done: {}/{} files parsed", files.len() - failed, files.len());
            failed == 0
        }
        Commands::Stats => {
            let path = std::env::var("BOC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(db::DEFAULT_DB_PATH));
            let conn = db::connect(&path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Rows:    {}", s.rows);
            println!("Dates:   {}", s.dates);
            println!("Tickers: {}", s.tickers);
            println!(
                "Range:   {} .. {}",
                s.first_date.as_deref().unwrap_or("-"),
                s.last_date.as_deref().unwrap_or("-")
            );
            true
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Parse one local file; an empty bulletin counts as a failure.
fn parse_file(
    parser: &BulletinParser,
    path: &Path,
    date: Option<NaiveDate>,
) -> anyhow::Result<Vec<SecurityRecord>> {
    let date = date
        .or_else(|| pipeline::date_from_file_name(path))
        .context("No --date given and none in the file name")?;
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let records = parser.parse(&bytes, date)?;
    anyhow::ensure!(!records.is_empty(), "parser returned 0 securities");
    Ok(records)
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
