//! # listing-geocoder
//!
//! Batch CLI around the incremental geocoding cache.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `import <csv>...` | Append listing batches to the `listings` table |
//! | `geocode` | Geocode uncached addresses from each source's latest batch |
//! | `compare` | Classify latest-batch listings as additions or existing |
//! | `markers --output <file>` | Export compared listings as GeoJSON points |
//! | `lookup <address>` | Show the cache entry for an address |
//! | `config` | Print the effective configuration (no secrets) |
//!
//! Configuration comes from the environment (see `AppConfig::from_env`).

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{info, warn};

use listing_geocoder::{
    bootstrap, build_markers, compare_batches, init_tracing, load_listings, normalize_address,
    persist_listings, read_listings_csv, AppConfig, AppError, CacheStore, GeocodingRunner,
    Listing, ListingStatus, RunJournal, RunSummary, SqliteCacheStore,
};

#[derive(Parser)]
#[command(
    name = "listing-geocoder",
    version,
    about = "Geocode new rental listing addresses into a durable cache"
)]
struct Cli {
    /// SQLite database holding listings and the location cache.
    /// Overrides `DATABASE_PATH`.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import listing CSV files (`source_name,address,batch_date`).
    Import {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Geocode addresses from the latest batch per source that are not cached yet.
    Geocode {
        /// Read listings from this CSV instead of the database.
        #[arg(long)]
        listings: Option<PathBuf>,

        /// Maximum number of addresses to geocode in this run.
        #[arg(long)]
        max_count: Option<usize>,

        /// Minimum delay between provider calls, in milliseconds.
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Compare each source's latest batch with the one before it.
    Compare {
        #[arg(long)]
        json: bool,
    },

    /// Write compared listings with cached coordinates as GeoJSON.
    Markers {
        #[arg(long)]
        output: PathBuf,

        /// Only export `addition` or `existing` rows.
        #[arg(long)]
        status: Option<String>,
    },

    /// Show the cached coordinates for an address.
    Lookup { address: String },

    /// Print the effective configuration.
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            match err.downcast_ref::<AppError>() {
                Some(AppError::RunAborted(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = AppConfig::from_env();
    if let Some(path) = cli.database {
        config.database_path = path;
    }

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.public_profile())?);
            Ok(())
        }
        Commands::Import { files } => import(&config, &files),
        Commands::Geocode {
            listings,
            max_count,
            delay_ms,
            json,
        } => {
            if let Some(delay_ms) = delay_ms {
                config.request_delay_ms = delay_ms;
            }
            let max_count = max_count.unwrap_or(config.max_count);
            geocode(&config, listings, max_count, json).await
        }
        Commands::Compare { json } => compare(&config, json),
        Commands::Markers { output, status } => markers(&config, output, status),
        Commands::Lookup { address } => lookup(&config, &address),
    }
}

fn open_store(config: &AppConfig) -> Result<SqliteCacheStore> {
    let ctx = bootstrap(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(SqliteCacheStore::new(Arc::new(Mutex::new(ctx.connection))))
}

fn stored_listings(store: &SqliteCacheStore) -> Result<Vec<Listing>> {
    let db = store.connection();
    let conn = db.lock();
    Ok(load_listings(&conn)?)
}

fn import(config: &AppConfig, files: &[PathBuf]) -> Result<()> {
    let store = open_store(config)?;
    let db = store.connection();
    for file in files {
        let listings = read_listings_csv(file).with_context(|| format!("reading {}", file.display()))?;
        let summary = persist_listings(&mut db.lock(), &listings)?;
        info!(
            file = %file.display(),
            read = summary.rows_read,
            inserted = summary.rows_inserted,
            skipped = summary.duplicates_skipped,
            "imported listings"
        );
        println!(
            "{}: {} rows read, {} inserted, {} duplicates skipped",
            file.display(),
            summary.rows_read,
            summary.rows_inserted,
            summary.duplicates_skipped
        );
    }
    Ok(())
}

async fn geocode(
    config: &AppConfig,
    listings_file: Option<PathBuf>,
    max_count: usize,
    json: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let listings = match listings_file {
        Some(path) => read_listings_csv(&path).with_context(|| format!("reading {}", path.display()))?,
        None => stored_listings(&store)?,
    };

    let mut runner = GeocodingRunner::from_config(config)?;
    if config.journal_enabled {
        match RunJournal::open(&config.journal_dir, config) {
            Ok(journal) => runner = runner.with_journal(journal),
            Err(err) => warn!(?err, "run journal unavailable; continuing without it"),
        }
    }

    let summary = runner.run(&listings, &store, max_count).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, store.count()?);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, cached_total: usize) {
    println!("{}", "=".repeat(60));
    println!("GEOCODING COMPLETE");
    println!("{}", "=".repeat(60));
    println!("Successfully geocoded and cached: {}", summary.succeeded);
    println!("Failed: {}", summary.failed);
    println!("Total processed: {}", summary.attempted);
    println!("Addresses in cache: {cached_total}");
    for failure in &summary.failures {
        println!("  x {} [{:?}] {}", failure.address_key, failure.kind, failure.reason);
    }
    println!("{}", "=".repeat(60));
}

fn compare(config: &AppConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let report = compare_batches(&stored_listings(&store)?);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (source, stats) in &report.sources {
        let latest = stats
            .latest_batch
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".into());
        let previous = stats
            .previous_batch
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{source}: latest {latest} vs {previous}: {} additions, {} existing",
            stats.additions, stats.existing
        );
    }
    println!(
        "total: {} additions, {} existing",
        report.total(ListingStatus::Addition),
        report.total(ListingStatus::Existing)
    );
    Ok(())
}

fn markers(config: &AppConfig, output: PathBuf, status: Option<String>) -> Result<()> {
    let status = match status {
        Some(value) => match ListingStatus::parse(&value) {
            Some(status) => Some(status),
            None => bail!("unknown status {value:?}; expected addition or existing"),
        },
        None => None,
    };

    let store = open_store(config)?;
    let report = compare_batches(&stored_listings(&store)?);
    let collection = build_markers(&report, &store, status)?;
    std::fs::write(&output, serde_json::to_vec_pretty(&collection)?)
        .with_context(|| format!("writing {}", output.display()))?;
    println!(
        "wrote {} markers to {} ({} listings not geocoded yet)",
        collection.features.len(),
        output.display(),
        collection.unplaced
    );
    Ok(())
}

fn lookup(config: &AppConfig, address: &str) -> Result<()> {
    let store = open_store(config)?;
    let key = normalize_address(address);
    let keys: BTreeSet<String> = [key.clone()].into_iter().collect();
    match store.fetch_entries(&keys)?.into_iter().next() {
        Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
        None => println!("{key}: not cached"),
    }
    Ok(())
}
