use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;

use crate::address::normalize_address;
use crate::candidates::ranked_batches;
use crate::ingestion::Listing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Addition,
    Existing,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Addition => "addition",
            ListingStatus::Existing => "existing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "addition" | "new" => Some(ListingStatus::Addition),
            "existing" => Some(ListingStatus::Existing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparedListing {
    pub source_name: String,
    pub address: String,
    pub address_key: String,
    pub batch_date: NaiveDate,
    pub previous_batch_date: Option<NaiveDate>,
    pub status: ListingStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub latest_batch: Option<NaiveDate>,
    pub previous_batch: Option<NaiveDate>,
    pub additions: usize,
    pub existing: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub sources: BTreeMap<String, SourceStats>,
    pub rows: Vec<ComparedListing>,
}

impl ComparisonReport {
    pub fn total(&self, status: ListingStatus) -> usize {
        self.rows.iter().filter(|row| row.status == status).count()
    }
}

/// Classifies each source's newest batch against the batch before it.
///
/// Batch dates are dense-ranked per source, newest first. A rank-1 address is
/// an `Addition` when the same source's rank-2 batch lacks its address key.
/// With a single batch on record every address counts as an addition.
pub fn compare_batches(listings: &[Listing]) -> ComparisonReport {
    let mut by_source: BTreeMap<&str, Vec<&Listing>> = BTreeMap::new();
    for listing in listings.iter().filter(|listing| listing.has_address()) {
        by_source
            .entry(listing.source_name.as_str())
            .or_default()
            .push(listing);
    }

    let ranked = ranked_batches(listings);
    let mut report = ComparisonReport::default();
    for (source, rows) in by_source {
        let Some(&latest) = ranked.get(source).and_then(|dates| dates.first()) else {
            continue;
        };
        let previous = ranked.get(source).and_then(|dates| dates.get(1)).copied();

        let previous_keys: BTreeSet<String> = rows
            .iter()
            .filter(|row| Some(row.batch_date) == previous)
            .map(|row| normalize_address(&row.address))
            .collect();

        let mut latest_rows: BTreeMap<String, &Listing> = BTreeMap::new();
        for row in rows.iter().filter(|row| row.batch_date == latest) {
            latest_rows
                .entry(normalize_address(&row.address))
                .or_insert(*row);
        }

        let mut stats = SourceStats {
            latest_batch: Some(latest),
            previous_batch: previous,
            ..SourceStats::default()
        };
        for (address_key, row) in latest_rows {
            let status = if previous_keys.contains(&address_key) {
                stats.existing += 1;
                ListingStatus::Existing
            } else {
                stats.additions += 1;
                ListingStatus::Addition
            };
            report.rows.push(ComparedListing {
                source_name: source.to_string(),
                address: row.address.trim().to_string(),
                address_key,
                batch_date: latest,
                previous_batch_date: previous,
                status,
            });
        }
        report.sources.insert(source.to_string(), stats);
    }
    report
}
