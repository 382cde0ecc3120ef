use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::address::normalize_address;
use crate::cache::CacheStore;
use crate::comparison::{ComparisonReport, ListingStatus};
use crate::errors::PersistenceError;

#[derive(Debug, Clone, Serialize)]
pub struct MarkerCollection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub features: Vec<MarkerFeature>,
    /// Rows left off the map because their address is not geocoded yet.
    #[serde(skip)]
    pub unplaced: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkerFeature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub geometry: MarkerGeometry,
    pub properties: MarkerProperties,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkerGeometry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// GeoJSON order: longitude, latitude.
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkerProperties {
    pub source_name: String,
    pub address: String,
    pub status: ListingStatus,
    pub batch_date: String,
}

/// Joins compared listings to cached coordinates as GeoJSON points,
/// optionally keeping only one status.
pub fn build_markers(
    report: &ComparisonReport,
    cache: &dyn CacheStore,
    status: Option<ListingStatus>,
) -> Result<MarkerCollection, PersistenceError> {
    let rows: Vec<_> = report
        .rows
        .iter()
        .filter(|row| status.map_or(true, |wanted| row.status == wanted))
        .collect();

    let keys: BTreeSet<String> = rows
        .iter()
        .map(|row| normalize_address(&row.address))
        .collect();
    let located: HashMap<String, [f64; 2]> = cache
        .fetch_entries(&keys)?
        .into_iter()
        .map(|entry| (entry.address_key, [entry.longitude, entry.latitude]))
        .collect();

    let mut features = Vec::with_capacity(rows.len());
    let mut unplaced = 0;
    for row in rows {
        let Some(coordinates) = located.get(&normalize_address(&row.address)) else {
            unplaced += 1;
            continue;
        };
        features.push(MarkerFeature {
            kind: "Feature",
            geometry: MarkerGeometry {
                kind: "Point",
                coordinates: *coordinates,
            },
            properties: MarkerProperties {
                source_name: row.source_name.clone(),
                address: row.address.clone(),
                status: row.status,
                batch_date: row.batch_date.to_string(),
            },
        });
    }
    debug!(placed = features.len(), unplaced, "built map markers");

    Ok(MarkerCollection {
        kind: "FeatureCollection",
        features,
        unplaced,
    })
}
