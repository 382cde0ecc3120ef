mod address;
mod cache;
mod candidates;
mod comparison;
mod config;
mod db;
mod errors;
mod geocoding;
mod ingestion;
mod journal;
mod markers;
mod runner;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use address::normalize_address;
pub use cache::{CacheEntry, CacheStore, SqliteCacheStore, UpsertOutcome};
pub use candidates::{latest_batch, select_candidates, GeocodeCandidate};
pub use comparison::{compare_batches, ComparedListing, ComparisonReport, ListingStatus, SourceStats};
pub use config::{AppConfig, PublicAppConfig, DEFAULT_GEOCODING_ENDPOINT, DEFAULT_REGION_SUFFIX};
pub use db::{bootstrap, DatabaseContext};
pub use errors::{AppError, AppResult, GeocodeError, PersistenceError};
pub use geocoding::{
    Coordinates, GeocodeProvider, GeocodingClient, HttpGeocoder, RateLimiter, RetryPolicy,
};
pub use ingestion::{
    load_listings, parse_batch_date, persist_listings, read_listings_csv, ImportSummary, Listing,
};
pub use journal::{JournalEvent, RunJournal};
pub use markers::{build_markers, MarkerCollection, MarkerFeature};
pub use runner::{FailureKind, GeocodingRunner, RunFailure, RunSummary};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,listing_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
