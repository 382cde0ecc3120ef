use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::ffi;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Error as SqliteError};
use serde::Serialize;
use tracing::trace;

use crate::db;
use crate::errors::{AppResult, PersistenceError};

// SQLite's default bound-parameter ceiling is 999 on older builds.
const MAX_KEYS_PER_QUERY: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub address_key: String,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(address_key: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            address_key: address_key.into(),
            latitude,
            longitude,
            updated_at: Utc::now(),
        }
    }

    /// Rejects entries that would leave a half-usable row behind.
    pub fn validate(&self) -> Result<(), PersistenceError> {
        if self.address_key.is_empty() {
            return Err(PersistenceError::InvalidEntry("empty address key".into()));
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(PersistenceError::InvalidEntry(format!(
                "latitude {} out of range for {}",
                self.latitude, self.address_key
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(PersistenceError::InvalidEntry(format!(
                "longitude {} out of range for {}",
                self.longitude, self.address_key
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Durable address-key -> coordinate store.
pub trait CacheStore {
    /// Returns the subset of `keys` already cached, read from one snapshot.
    fn contains_keys(&self, keys: &BTreeSet<String>) -> Result<BTreeSet<String>, PersistenceError>;

    /// Insert-if-absent. An existing key, including one written concurrently
    /// by another process, is reported as `AlreadyPresent`.
    fn upsert(&self, entry: &CacheEntry) -> Result<UpsertOutcome, PersistenceError>;

    fn fetch_entries(&self, keys: &BTreeSet<String>) -> Result<Vec<CacheEntry>, PersistenceError>;

    fn count(&self) -> Result<usize, PersistenceError>;
}

#[derive(Clone)]
pub struct SqliteCacheStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let connection = db::open_in_memory()?;
        Ok(Self::new(Arc::new(Mutex::new(connection))))
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }
}

impl CacheStore for SqliteCacheStore {
    fn contains_keys(&self, keys: &BTreeSet<String>) -> Result<BTreeSet<String>, PersistenceError> {
        let mut present = BTreeSet::new();
        if keys.is_empty() {
            return Ok(present);
        }

        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for chunk in keys.chunks(MAX_KEYS_PER_QUERY) {
            let sql = format!(
                "SELECT address_key FROM locations_cache WHERE address_key IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
            for key in rows {
                present.insert(key?);
            }
        }
        tx.commit()?;
        Ok(present)
    }

    fn upsert(&self, entry: &CacheEntry) -> Result<UpsertOutcome, PersistenceError> {
        entry.validate()?;
        let conn = self.db.lock();
        let result = conn.execute(
            "INSERT INTO locations_cache (address_key, latitude, longitude, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(address_key) DO NOTHING",
            params![
                entry.address_key,
                entry.latitude,
                entry.longitude,
                entry.updated_at.to_rfc3339()
            ],
        );

        let outcome = match result {
            Ok(0) => UpsertOutcome::AlreadyPresent,
            Ok(_) => UpsertOutcome::Inserted,
            Err(err) if is_key_conflict(&err) => UpsertOutcome::AlreadyPresent,
            Err(err) => return Err(PersistenceError::from(err)),
        };
        trace!(address_key = %entry.address_key, ?outcome, "cache upsert");
        Ok(outcome)
    }

    fn fetch_entries(&self, keys: &BTreeSet<String>) -> Result<Vec<CacheEntry>, PersistenceError> {
        let mut entries = Vec::new();
        if keys.is_empty() {
            return Ok(entries);
        }

        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        let conn = self.db.lock();
        for chunk in keys.chunks(MAX_KEYS_PER_QUERY) {
            let sql = format!(
                "SELECT address_key, latitude, longitude, updated_at
                FROM locations_cache
                WHERE address_key IN ({})
                ORDER BY address_key ASC",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), parse_entry)?;
            for entry in rows {
                entries.push(entry?);
            }
        }
        entries.sort_by(|a, b| a.address_key.cmp(&b.address_key));
        Ok(entries)
    }

    fn count(&self) -> Result<usize, PersistenceError> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM locations_cache", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn placeholders(len: usize) -> String {
    vec!["?"; len].join(", ")
}

fn is_key_conflict(err: &SqliteError) -> bool {
    match err {
        SqliteError::SqliteFailure(code, _) => matches!(
            code.extended_code,
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
        ),
        _ => false,
    }
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let updated_at: String = row.get(3)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| SqliteError::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;
    Ok(CacheEntry {
        address_key: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        updated_at,
    })
}
