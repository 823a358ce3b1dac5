use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::geo::Coordinate;

pub type SiteId = usize;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetCounts {
    pub customers: u64,
    pub sites: u64,
    pub floors: u64,
    pub ap9176: u64,
    pub ap9178: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteTotals {
    pub floors: u64,
    #[serde(default)]
    pub aps: u64,
    pub ap9176: u64,
    pub ap9178: u64,
    #[serde(default)]
    pub area_sq_ft: f64,
    #[serde(default)]
    pub ap_density_avg: f64,
    #[serde(default)]
    pub wlc1715: u64,
    #[serde(default)]
    pub connector32: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloorRecord {
    pub name: String,
    pub aps: u64,
    pub ap9176: u64,
    pub ap9178: u64,
    #[serde(default)]
    pub area_sq_ft: f64,
    #[serde(default)]
    pub ap_density: f64,
    #[serde(default)]
    pub wlc1715: u64,
    #[serde(default)]
    pub connector32: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteRecord {
    customer: String,
    site: String,
    address: String,
    #[serde(default = "unknown")]
    region: String,
    #[serde(default = "unknown")]
    vertical: String,
    #[serde(default = "unknown")]
    dns_license_type: String,
    #[serde(default)]
    totals: SiteTotals,
    #[serde(default)]
    floors: Vec<FloorRecord>,
    lat: Option<f64>,
    lng: Option<f64>,
}

fn unknown() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SitesPayload {
    generated_at: Option<String>,
    #[serde(default)]
    counts: DatasetCounts,
    sites: Vec<SiteRecord>,
}

/// One site of the dataset; the handle the geocode queue works on.
#[derive(Debug)]
pub struct Site {
    pub id: SiteId,
    pub customer: String,
    pub site: String,
    pub address: String,
    pub region: String,
    pub vertical: String,
    pub dns_license_type: String,
    pub totals: SiteTotals,
    pub total_aps: u64,
    pub floors: Vec<FloorRecord>,
    coordinate: Mutex<Option<Coordinate>>,
    queued: AtomicBool,
}

impl Site {
    pub fn new(id: SiteId, customer: &str, site: &str, address: &str) -> Self {
        Self {
            id,
            customer: customer.to_string(),
            site: site.to_string(),
            address: address.to_string(),
            region: unknown(),
            vertical: unknown(),
            dns_license_type: unknown(),
            totals: SiteTotals::default(),
            total_aps: 0,
            floors: Vec::new(),
            coordinate: Mutex::new(None),
            queued: AtomicBool::new(false),
        }
    }

    fn from_record(id: SiteId, record: SiteRecord) -> Self {
        let coordinate = match (record.lat, record.lng) {
            (Some(lat), Some(lng)) => Coordinate::checked(lat, lng),
            _ => None,
        };
        Self {
            id,
            total_aps: record.totals.ap9176 + record.totals.ap9178,
            customer: record.customer,
            site: record.site,
            address: record.address,
            region: record.region,
            vertical: record.vertical,
            dns_license_type: record.dns_license_type,
            totals: record.totals,
            floors: record.floors,
            coordinate: Mutex::new(coordinate),
            queued: AtomicBool::new(false),
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        *self.coordinate.lock()
    }

    pub fn set_coordinate(&self, coordinate: Coordinate) {
        *self.coordinate.lock() = Some(coordinate);
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::SeqCst)
    }

    /// Sets the queued flag; returns `false` if it was already set.
    pub(crate) fn mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct Dataset {
    pub generated_at: Option<String>,
    pub counts: DatasetCounts,
    pub sites: Vec<Arc<Site>>,
}

impl Dataset {
    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AppError::Path(format!("unable to read {}: {err}", path.display()))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> AppResult<Self> {
        let payload: SitesPayload = serde_json::from_str(contents)?;
        let sites = payload
            .sites
            .into_iter()
            .enumerate()
            .map(|(idx, record)| Arc::new(Site::from_record(idx, record)))
            .collect();
        Ok(Self {
            generated_at: payload.generated_at,
            counts: payload.counts,
            sites,
        })
    }

    pub fn regions(&self) -> Vec<String> {
        distinct(self.sites.iter().map(|s| s.region.as_str()))
    }

    pub fn verticals(&self) -> Vec<String> {
        distinct(self.sites.iter().map(|s| s.vertical.as_str()))
    }

    pub fn max_total_aps(&self) -> u64 {
        self.sites.iter().map(|s| s.total_aps).max().unwrap_or(0)
    }

    /// First site for every distinct address, ordered by address.
    pub fn unique_addresses(&self) -> Vec<Arc<Site>> {
        let mut seen = HashSet::new();
        let mut unique: Vec<Arc<Site>> = self
            .sites
            .iter()
            .filter(|site| !site.address.trim().is_empty())
            .filter(|site| seen.insert(site.address.clone()))
            .cloned()
            .collect();
        unique.sort_by(|a, b| a.address.cmp(&b.address));
        unique
    }

    pub fn filter(&self, filter: &SiteFilter) -> Vec<Arc<Site>> {
        self.sites
            .iter()
            .filter(|site| filter.matches(site))
            .cloned()
            .collect()
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    values
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub const ALL: &str = "all";

#[derive(Debug, Clone)]
pub struct SiteFilter {
    pub search: String,
    pub region: String,
    pub vertical: String,
    pub wants_9176: bool,
    pub wants_9178: bool,
    pub min_aps: u64,
}

impl Default for SiteFilter {
    fn default() -> Self {
        Self {
            search: String::new(),
            region: ALL.to_string(),
            vertical: ALL.to_string(),
            wants_9176: true,
            wants_9178: true,
            min_aps: 0,
        }
    }
}

impl SiteFilter {
    pub fn matches(&self, site: &Site) -> bool {
        let has_9176 = site.totals.ap9176 > 0;
        let has_9178 = site.totals.ap9178 > 0;
        let matches_model = (self.wants_9176 && has_9176) || (self.wants_9178 && has_9178);
        if !matches_model {
            return false;
        }

        if self.region != ALL && site.region != self.region {
            return false;
        }
        if self.vertical != ALL && site.vertical != self.vertical {
            return false;
        }
        if site.total_aps < self.min_aps {
            return false;
        }

        let needle = self.search.trim().to_lowercase();
        if !needle.is_empty() {
            let haystack =
                format!("{} {} {}", site.customer, site.site, site.address).to_lowercase();
            if !haystack.contains(&needle) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilteredStats {
    pub sites: usize,
    pub customers: usize,
    pub aps: u64,
    pub ap9176: u64,
    pub ap9178: u64,
    pub floors: u64,
}

impl FilteredStats {
    pub fn from_sites(sites: &[Arc<Site>]) -> Self {
        let mut customers = HashSet::new();
        let mut stats = Self::default();
        for site in sites {
            stats.sites += 1;
            customers.insert(site.customer.as_str());
            stats.ap9176 += site.totals.ap9176;
            stats.ap9178 += site.totals.ap9178;
            stats.floors += site.totals.floors;
            stats.aps += site.total_aps;
        }
        stats.customers = customers.len();
        stats
    }
}
