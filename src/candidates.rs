use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::address::normalize_address;
use crate::cache::CacheStore;
use crate::errors::PersistenceError;
use crate::ingestion::Listing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeocodeCandidate {
    pub raw_address: String,
    pub address_key: String,
}

/// Distinct batch dates per source, newest first. Rows with a blank address
/// do not count, so a batch made only of blanks never outranks a real one.
pub(crate) fn ranked_batches(listings: &[Listing]) -> HashMap<&str, Vec<NaiveDate>> {
    let mut dates: HashMap<&str, BTreeSet<NaiveDate>> = HashMap::new();
    for listing in listings.iter().filter(|listing| listing.has_address()) {
        dates
            .entry(listing.source_name.as_str())
            .or_default()
            .insert(listing.batch_date);
    }
    dates
        .into_iter()
        .map(|(source, dates)| (source, dates.into_iter().rev().collect()))
        .collect()
}

/// Addressed listings belonging to each source's most recent batch date.
pub fn latest_batch(listings: &[Listing]) -> Vec<&Listing> {
    let ranked = ranked_batches(listings);
    listings
        .iter()
        .filter(|listing| listing.has_address())
        .filter(|listing| {
            ranked
                .get(listing.source_name.as_str())
                .and_then(|dates| dates.first())
                == Some(&listing.batch_date)
        })
        .collect()
}

/// Addresses from the latest batch per source that are not cached yet,
/// ordered by address key and capped at `max_count`.
pub fn select_candidates(
    listings: &[Listing],
    cache: &dyn CacheStore,
    max_count: usize,
) -> Result<Vec<GeocodeCandidate>, PersistenceError> {
    if max_count == 0 || listings.is_empty() {
        return Ok(Vec::new());
    }

    let mut unique: BTreeMap<String, String> = BTreeMap::new();
    for listing in latest_batch(listings) {
        unique
            .entry(normalize_address(&listing.address))
            .or_insert_with(|| listing.address.trim().to_string());
    }
    if unique.is_empty() {
        return Ok(Vec::new());
    }

    let keys: BTreeSet<String> = unique.keys().cloned().collect();
    let cached = cache.contains_keys(&keys)?;
    let candidates: Vec<GeocodeCandidate> = unique
        .into_iter()
        .filter(|(key, _)| !cached.contains(key))
        .take(max_count)
        .map(|(address_key, raw_address)| GeocodeCandidate {
            raw_address,
            address_key,
        })
        .collect();

    debug!(
        distinct = keys.len(),
        cached = cached.len(),
        selected = candidates.len(),
        max_count,
        "selected geocode candidates"
    );
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::cache::{CacheEntry, SqliteCacheStore, UpsertOutcome};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    struct UntouchableStore {
        reads: Cell<usize>,
    }

    impl CacheStore for UntouchableStore {
        fn contains_keys(&self, _keys: &BTreeSet<String>) -> Result<BTreeSet<String>, PersistenceError> {
            self.reads.set(self.reads.get() + 1);
            Ok(BTreeSet::new())
        }

        fn upsert(&self, _entry: &CacheEntry) -> Result<UpsertOutcome, PersistenceError> {
            unreachable!("selection never writes")
        }

        fn fetch_entries(&self, _keys: &BTreeSet<String>) -> Result<Vec<CacheEntry>, PersistenceError> {
            Ok(Vec::new())
        }

        fn count(&self) -> Result<usize, PersistenceError> {
            Ok(0)
        }
    }

    #[test]
    fn considers_only_latest_batch_per_source() {
        let listings = vec![
            Listing::new("X", "1 Old Rd", date(1)),
            Listing::new("X", "2 New Rd", date(2)),
            Listing::new("Y", "3 Only Rd", date(1)),
            Listing::new("Y", "4 Only Rd", date(1)),
        ];
        let store = SqliteCacheStore::open_in_memory().unwrap();

        let keys: Vec<String> = select_candidates(&listings, &store, 10)
            .unwrap()
            .into_iter()
            .map(|c| c.address_key)
            .collect();
        assert_eq!(keys, vec!["2 NEW RD", "3 ONLY RD", "4 ONLY RD"]);
    }

    #[test]
    fn blank_only_batch_does_not_hide_older_batch() {
        let listings = vec![
            Listing::new("X", "1 Real St", date(1)),
            Listing::new("X", "   ", date(2)),
            Listing::new("X", "", date(2)),
        ];
        let store = SqliteCacheStore::open_in_memory().unwrap();

        let latest: Vec<&str> = latest_batch(&listings)
            .into_iter()
            .map(|listing| listing.address.as_str())
            .collect();
        assert_eq!(latest, vec!["1 Real St"]);

        let candidates = select_candidates(&listings, &store, 10).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address_key, "1 REAL ST");
    }

    #[test]
    fn excludes_cached_keys_and_collapses_duplicates() {
        let listings = vec![
            Listing::new("X", "123 Main St", date(2)),
            Listing::new("X", " 123 MAIN ST ", date(2)),
            Listing::new("Y", "123 main st", date(5)),
            Listing::new("Y", "77 Water St", date(5)),
            Listing::new("Y", "77 water st ", date(5)),
            Listing::new("Y", "   ", date(5)),
        ];
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.upsert(&CacheEntry::new("123 MAIN ST", 40.7, -73.9)).unwrap();

        let candidates = select_candidates(&listings, &store, 10).unwrap();
        assert_eq!(
            candidates,
            vec![GeocodeCandidate {
                raw_address: "77 Water St".into(),
                address_key: "77 WATER ST".into(),
            }]
        );
    }

    #[test]
    fn bounds_and_orders_candidates() {
        let listings: Vec<Listing> = (0..200)
            .rev()
            .map(|i| Listing::new("X", format!("{i:03} Elm St"), date(3)))
            .collect();
        let store = SqliteCacheStore::open_in_memory().unwrap();

        let first = select_candidates(&listings, &store, 50).unwrap();
        assert_eq!(first.len(), 50);
        assert_eq!(first[0].address_key, "000 ELM ST");
        assert_eq!(first[49].address_key, "049 ELM ST");
        assert_eq!(first, select_candidates(&listings, &store, 50).unwrap());
    }

    #[test]
    fn short_circuits_without_touching_store() {
        let store = UntouchableStore { reads: Cell::new(0) };
        let listings = vec![Listing::new("X", "1 A St", date(1))];

        assert!(select_candidates(&listings, &store, 0).unwrap().is_empty());
        assert!(select_candidates(&[], &store, 50).unwrap().is_empty());
        assert_eq!(store.reads.get(), 0);

        select_candidates(&listings, &store, 1).unwrap();
        assert_eq!(store.reads.get(), 1);
    }
}
