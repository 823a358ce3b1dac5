use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::config::PublicAppConfig;
use crate::errors::AppResult;
use crate::geo::{Bounds, Coordinate};
use crate::placement::{Marker, PlacementSink};
use crate::queue::{CoordinateRequest, QueueStats};
use crate::seed::{load_seed_rows, write_seed_file, SeedExport};
use crate::sites::{Dataset, DatasetCounts, FilteredStats, SiteFilter};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct FoundationHealth {
    pub db_path: String,
    pub db_bootstrap_recovered: bool,
    pub cache_key: String,
    pub cache_entries: usize,
    pub seeded_entries: usize,
    pub providers: Vec<String>,
    pub queue: QueueStats,
    pub journal_path: String,
    pub journal_buffered: usize,
    pub config: PublicAppConfig,
}

#[derive(Debug, Default, Serialize)]
pub struct RequestCounts {
    pub known: usize,
    pub cached: usize,
    pub queued: usize,
}

/// Dataset-wide facts the filter controls are built from.
#[derive(Debug, Serialize)]
pub struct DatasetOverview {
    pub generated_at: Option<String>,
    pub counts: DatasetCounts,
    pub regions: Vec<String>,
    pub verticals: Vec<String>,
    pub max_total_aps: u64,
}

impl From<&Dataset> for DatasetOverview {
    fn from(dataset: &Dataset) -> Self {
        Self {
            generated_at: dataset.generated_at.clone(),
            counts: dataset.counts.clone(),
            regions: dataset.regions(),
            verticals: dataset.verticals(),
            max_total_aps: dataset.max_total_aps(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResolveReport {
    pub dataset: DatasetOverview,
    pub stats: FilteredStats,
    pub requests: RequestCounts,
    pub markers: Vec<Marker>,
    pub bounds: Option<Bounds>,
    pub unresolved: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheLookup {
    pub address: String,
    pub coordinate: Option<Coordinate>,
}

pub fn foundation_health(state: &AppState) -> FoundationHealth {
    FoundationHealth {
        db_path: state.db_path().to_string_lossy().to_string(),
        db_bootstrap_recovered: state.db_bootstrap_recovered(),
        cache_key: state.cache().key().to_string(),
        cache_entries: state.cache().len(),
        seeded_entries: state.seeded_entries(),
        providers: state.provider_names(),
        queue: state.queue().stats(),
        journal_path: state.journal().path().to_string_lossy().to_string(),
        journal_buffered: state.journal().buffered(),
        config: state.config().public_profile(),
    }
}

/// Renders the filtered site list: markers for sites with known or cached
/// coordinates go down immediately, the rest wait for the queue to drain.
pub async fn resolve_sites(state: &AppState, filter: &SiteFilter) -> AppResult<ResolveReport> {
    let dataset = Dataset::load(&state.config().sites_file)?;
    let active = dataset.filter(filter);
    let layer = state.layer();
    layer.set_active(&active);

    let mut requests = RequestCounts::default();
    for site in &active {
        match state.queue().request_coordinate(site) {
            CoordinateRequest::Known(coordinate) => {
                requests.known += 1;
                layer.place_marker(site, coordinate);
            }
            CoordinateRequest::Cached(coordinate) => {
                requests.cached += 1;
                layer.place_marker(site, coordinate);
            }
            CoordinateRequest::Queued | CoordinateRequest::AlreadyQueued => requests.queued += 1,
        }
    }
    info!(
        sites = active.len(),
        known = requests.known,
        cached = requests.cached,
        queued = requests.queued,
        "filtered sites requested"
    );

    state.queue().wait_idle().await;

    let unresolved = active
        .iter()
        .filter(|site| site.coordinate().is_none())
        .map(|site| site.address.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Ok(ResolveReport {
        dataset: DatasetOverview::from(&dataset),
        stats: FilteredStats::from_sites(&active),
        requests,
        markers: layer.markers(),
        bounds: layer.fit_bounds(),
        unresolved,
    })
}

/// Geocodes every unique dataset address missing from the seed file and
/// rewrites it with the merged rows.
pub async fn export_seed(state: &AppState, output: &Path) -> AppResult<SeedExport> {
    let dataset = Dataset::load(&state.config().sites_file)?;
    let existing = load_seed_rows(output);
    let already_seeded: HashSet<&str> = existing.iter().map(|row| row.address.as_str()).collect();

    let sites = dataset.unique_addresses();
    let addresses: Vec<String> = sites.iter().map(|site| site.address.clone()).collect();
    for site in sites
        .iter()
        .filter(|site| !already_seeded.contains(site.address.as_str()))
    {
        state.queue().request_coordinate(site);
    }
    state.queue().wait_idle().await;

    let mut resolved = state.cache().snapshot();
    for site in &sites {
        if let Some(coordinate) = site.coordinate() {
            resolved.entry(site.address.clone()).or_insert(coordinate);
        }
    }

    let export = write_seed_file(output, &addresses, &existing, &resolved)?;
    info!(
        path = %output.display(),
        rows = export.rows,
        new_rows = export.new_rows,
        unresolved = export.unresolved.len(),
        "seed file written"
    );
    Ok(export)
}

pub fn cache_lookup(state: &AppState, address: &str) -> CacheLookup {
    CacheLookup {
        address: address.to_string(),
        coordinate: state.cache().get(address),
    }
}
