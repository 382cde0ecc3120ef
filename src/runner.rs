use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{CacheEntry, CacheStore, UpsertOutcome};
use crate::candidates::{select_candidates, GeocodeCandidate};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, GeocodeError};
use crate::geocoding::{GeocodingClient, RateLimiter};
use crate::ingestion::Listing;
use crate::journal::{JournalEvent, RunJournal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    RetriesExhausted,
    Persistence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub address_key: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<RunFailure>,
}

impl RunSummary {
    fn record_failure(&mut self, address_key: &str, kind: FailureKind, reason: String) {
        warn!(address_key, ?kind, %reason, "geocode candidate failed");
        self.failed += 1;
        self.failures.push(RunFailure {
            address_key: address_key.to_string(),
            kind,
            reason,
        });
    }
}

pub struct GeocodingRunner {
    client: GeocodingClient,
    limiter: RateLimiter,
    journal: Option<RunJournal>,
}

impl GeocodingRunner {
    pub fn new(client: GeocodingClient, limiter: RateLimiter) -> Self {
        Self {
            client,
            limiter,
            journal: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Ok(Self::new(
            GeocodingClient::from_config(config)?,
            RateLimiter::new(config.request_delay()),
        ))
    }

    pub fn with_journal(mut self, journal: RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// One pass: select uncached addresses, geocode them in key order and
    /// cache each success before moving on.
    ///
    /// Rejected credentials abort the pass with [`AppError::RunAborted`];
    /// every other per-address failure lands in the summary.
    pub async fn run(
        &self,
        listings: &[Listing],
        cache: &dyn CacheStore,
        max_count: usize,
    ) -> AppResult<RunSummary> {
        let candidates = select_candidates(listings, cache, max_count)?;
        info!(
            candidates = candidates.len(),
            max_count,
            delay_ms = self.limiter.min_interval().as_millis() as u64,
            "starting geocoding run"
        );
        self.journal(JournalEvent::RunStarted {
            candidates: candidates.len(),
            max_count,
        });

        let mut summary = RunSummary::default();
        for (index, candidate) in candidates.iter().enumerate() {
            summary.attempted += 1;
            if let Err(err) = self.process(candidate, cache, &mut summary).await {
                warn!(
                    %err,
                    processed = index + 1,
                    remaining = candidates.len() - index - 1,
                    succeeded = summary.succeeded,
                    "aborting geocoding run"
                );
                self.journal(JournalEvent::RunAborted {
                    address_key: candidate.address_key.clone(),
                    reason: err.to_string(),
                    succeeded: summary.succeeded,
                    failed: summary.failed,
                });
                self.flush_journal();
                return Err(AppError::RunAborted(err));
            }
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "geocoding run complete"
        );
        self.journal(JournalEvent::RunFinished {
            attempted: summary.attempted,
            succeeded: summary.succeeded,
            failed: summary.failed,
        });
        self.flush_journal();
        Ok(summary)
    }

    // Only a credential failure escapes; it stops the whole run.
    async fn process(
        &self,
        candidate: &GeocodeCandidate,
        cache: &dyn CacheStore,
        summary: &mut RunSummary,
    ) -> Result<(), GeocodeError> {
        let key = candidate.address_key.as_str();
        let coordinates = match self.client.geocode(&candidate.raw_address, &self.limiter).await {
            Ok(coordinates) => coordinates,
            Err(err @ GeocodeError::Auth(_)) => return Err(err),
            Err(err @ GeocodeError::NotFound(_)) => {
                summary.record_failure(key, FailureKind::NotFound, err.to_string());
                self.journal_failure(key, FailureKind::NotFound, &err.to_string());
                return Ok(());
            }
            Err(err @ GeocodeError::Transient(_)) => {
                summary.record_failure(key, FailureKind::RetriesExhausted, err.to_string());
                self.journal_failure(key, FailureKind::RetriesExhausted, &err.to_string());
                return Ok(());
            }
        };

        let entry = CacheEntry::new(key, coordinates.latitude, coordinates.longitude);
        match cache.upsert(&entry) {
            Ok(outcome) => {
                if outcome == UpsertOutcome::AlreadyPresent {
                    info!(address_key = key, "address cached concurrently; keeping existing entry");
                }
                summary.succeeded += 1;
            }
            Err(err) => {
                summary.record_failure(key, FailureKind::Persistence, err.to_string());
                self.journal_failure(key, FailureKind::Persistence, &err.to_string());
            }
        }
        Ok(())
    }

    fn journal_failure(&self, address_key: &str, kind: FailureKind, reason: &str) {
        self.journal(JournalEvent::Failure {
            address_key: address_key.to_string(),
            kind,
            reason: reason.to_string(),
        });
    }

    fn journal(&self, event: JournalEvent) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record(event) {
                warn!(?err, "failed to record journal event");
            }
        }
    }

    fn flush_journal(&self) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.flush() {
                warn!(?err, "failed to flush run journal");
            }
        }
    }
}
