use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("geocoding run aborted: {0}")]
    RunAborted(GeocodeError),
}

/// Failure of a single provider lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeocodeError {
    /// The provider answered but had no usable match for the query.
    #[error("no match for {0}")]
    NotFound(String),
    /// Network fault or provider-side error worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Credentials were rejected; every later call would fail the same way.
    #[error("provider rejected credentials: {0}")]
    Auth(String),
}

impl GeocodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GeocodeError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("cache store rejected operation: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("invalid cache entry: {0}")]
    InvalidEntry(String),
}
