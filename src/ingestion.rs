use std::path::Path;

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

const BATCH_DATE_FORMAT: &str = "%Y-%m-%d";

/// One row of a rental-listing ingestion batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub source_name: String,
    pub address: String,
    pub batch_date: NaiveDate,
}

impl Listing {
    pub fn new(source_name: impl Into<String>, address: impl Into<String>, batch_date: NaiveDate) -> Self {
        Self {
            source_name: source_name.into(),
            address: address.into(),
            batch_date,
        }
    }

    pub fn has_address(&self) -> bool {
        !self.address.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub rows_read: usize,
    pub rows_inserted: usize,
    pub duplicates_skipped: usize,
}

#[derive(Debug, Deserialize)]
struct CsvListing {
    source_name: String,
    #[serde(default)]
    address: Option<String>,
    batch_date: String,
}

/// Reads `source_name,address,batch_date` rows; `batch_date` is `YYYY-MM-DD`.
pub fn read_listings_csv<P: AsRef<Path>>(path: P) -> AppResult<Vec<Listing>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(path)?;

    let mut listings = Vec::new();
    for (index, record) in reader.deserialize::<CsvListing>().enumerate() {
        let record = record?;
        let source_name = record.source_name.trim().to_string();
        if source_name.is_empty() {
            warn!(path = %path.display(), row = index + 1, "skipping listing without source name");
            continue;
        }
        let batch_date = parse_batch_date(&record.batch_date).map_err(|err| {
            AppError::Parse(format!("{} row {}: {err}", path.display(), index + 1))
        })?;
        listings.push(Listing {
            source_name,
            address: record.address.unwrap_or_default(),
            batch_date,
        });
    }
    debug!(path = %path.display(), rows = listings.len(), "read listings csv");
    Ok(listings)
}

pub fn parse_batch_date(value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), BATCH_DATE_FORMAT)
        .map_err(|err| AppError::Parse(format!("invalid batch date {value:?}: {err}")))
}

pub fn persist_listings(connection: &mut Connection, listings: &[Listing]) -> AppResult<ImportSummary> {
    let tx = connection.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO listings (source_name, address, batch_date)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(source_name, batch_date, address) DO NOTHING",
        )?;
        for listing in listings {
            inserted += stmt.execute(params![
                listing.source_name,
                listing.address,
                listing.batch_date.format(BATCH_DATE_FORMAT).to_string()
            ])?;
        }
    }
    tx.commit()?;

    Ok(ImportSummary {
        rows_read: listings.len(),
        rows_inserted: inserted,
        duplicates_skipped: listings.len() - inserted,
    })
}

pub fn load_listings(connection: &Connection) -> AppResult<Vec<Listing>> {
    let mut stmt = connection.prepare(
        "SELECT source_name, address, batch_date FROM listings ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(source_name, address, batch_date)| {
            Ok(Listing {
                source_name,
                address,
                batch_date: parse_batch_date(&batch_date)?,
            })
        })
        .collect()
}
