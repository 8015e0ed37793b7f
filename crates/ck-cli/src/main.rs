//! `candlekeep`: backfill and incrementally update commodity candles.
//!
//! Without a mode flag the binary authenticates against SmartAPI, fetches
//! whatever part of the requested range is not yet stored and writes it to
//! the local DuckDB file.

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use ck_data::{
    validate_request, CandleStore, CommodityCatalog, CoverageTracker, DuckDbStore,
    FetchOrchestrator, IngestConfig, IngestRequest, SmartApiSource,
};
use ck_types::{CkResult, Granularity, TimeRange};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "candlekeep",
    about = "Incremental commodity candle ingestion into DuckDB"
)]
struct Cli {
    /// Commodity name or name prefix (e.g. GOLD). Defaults to every known contract.
    #[arg(long)]
    commodity: Option<String>,

    /// Exchange filter; MCX_FO, NCX_FO and NCDEX aliases are accepted.
    #[arg(long)]
    exchange: Option<String>,

    /// Candle interval: 1min, 5min, 15min, 30min, 1hour, 1day or the API names.
    #[arg(long, default_value = "1day")]
    interval: String,

    /// First date to fetch (YYYY-MM-DD). Defaults to `lookback_days` before the end date.
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Last date to fetch (YYYY-MM-DD). Defaults to the reference date.
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// Refetch the whole range even where data is already stored.
    #[arg(long, default_value_t = false)]
    force_fetch: bool,

    /// Print stored coverage for the selected contracts and exit.
    #[arg(long, default_value_t = false)]
    check_coverage: bool,

    /// Print the contract catalog and exit.
    #[arg(long, default_value_t = false)]
    list_commodities: bool,

    /// Create the database schema and exit.
    #[arg(long, default_value_t = false)]
    setup_db: bool,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file, overriding configuration and CANDLEKEEP_DB.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Number of contracts fetched concurrently.
    #[arg(long)]
    workers: Option<usize>,

    /// Reference date for planning (YYYY-MM-DD). Defaults to today in the exchange zone.
    #[arg(long)]
    as_of: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Silent if the file does not exist.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let tz = config.tz()?;

    let mut catalog = CommodityCatalog::builtin();
    let catalog_dir = config.catalog_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let loaded = catalog
        .load_contract_files(&catalog_dir)
        .with_context(|| format!("reading contract files in {}", catalog_dir.display()))?;
    if loaded > 0 {
        info!(contracts = loaded, dir = %catalog_dir.display(), "loaded contract files");
    }

    if cli.list_commodities {
        print_catalog(&catalog);
        return Ok(ExitCode::SUCCESS);
    }

    let db_path = config.database_path();
    let store = Arc::new(
        DuckDbStore::open(&db_path, tz)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );
    store.create_schema().await.context("creating schema")?;
    info!(path = %db_path.display(), "database ready");

    if cli.setup_db {
        return Ok(ExitCode::SUCCESS);
    }

    let granularity: Granularity = cli.interval.parse()?;
    let instruments = catalog.select(cli.exchange.as_deref(), cli.commodity.as_deref());
    if instruments.is_empty() {
        bail!(
            "no contract matches exchange {} and commodity {}",
            cli.exchange.as_deref().unwrap_or("*"),
            cli.commodity.as_deref().unwrap_or("*")
        );
    }

    if cli.check_coverage {
        let tracker = CoverageTracker::new(store.clone(), tz);
        for instrument in &instruments {
            let report = tracker.report(&instrument.series_key(granularity)).await?;
            println!("{:<24} {}", instrument.name, report.summary());
        }
        return Ok(ExitCode::SUCCESS);
    }

    if !config.api.is_complete() {
        bail!(
            "SmartAPI credentials incomplete: set SMARTAPI_KEY, SMARTAPI_CLIENT_CODE, \
             SMARTAPI_PASSWORD and SMARTAPI_TOTP"
        );
    }

    let as_of_date = cli.as_of.unwrap_or_else(|| today(&tz));
    let (range, as_of) =
        resolve_range(cli.start_date, cli.end_date, as_of_date, config.lookback_days)?;

    let source = Arc::new(SmartApiSource::new(config.api.clone())?);
    let orchestrator = FetchOrchestrator::new(source, store, &config)?;
    let request = IngestRequest {
        instruments,
        granularity,
        range,
        force: cli.force_fetch,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight writes");
            on_signal.cancel();
        }
    });

    info!(as_of = %as_of.format("%Y-%m-%d %H:%M"), "planning against reference time");
    let report = orchestrator.run(&request, &cancel).await?;
    report.log_summary();

    if report.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

/// File, then environment, then command line flags.
fn load_config(cli: &Cli) -> Result<IngestConfig> {
    let mut config = match &cli.config {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => IngestConfig::default(),
    };
    config.apply_process_env()?;
    if let Some(db) = &cli.db {
        config.database_path = Some(db.clone());
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn today(tz: &Tz) -> NaiveDate {
    Utc::now().with_timezone(tz).date_naive()
}

/// Requested range and the reference time it is checked against.
fn resolve_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    as_of: NaiveDate,
    lookback_days: u32,
) -> CkResult<(TimeRange, NaiveDateTime)> {
    let reference = TimeRange::from_dates(as_of, as_of)?.end;
    let end = end.unwrap_or(as_of);
    let start = start.unwrap_or_else(|| end - Duration::days(i64::from(lookback_days)));
    let range = TimeRange::from_dates(start, end)?;
    validate_request(&range, reference)?;
    Ok((range, reference))
}

fn print_catalog(catalog: &CommodityCatalog) {
    println!("{:<24} {:<8} {}", "NAME", "EXCHANGE", "TOKEN");
    for instrument in catalog.instruments() {
        println!(
            "{:<24} {:<8} {}",
            instrument.name, instrument.exchange, instrument.symbol_token
        );
    }
}
