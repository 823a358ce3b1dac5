use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::geo::{Bounds, Coordinate};
use crate::sites::{Site, SiteId};

const FIT_PADDING: f64 = 0.25;

/// Rendering side of the pipeline: answers whether a site is still part of
/// the filtered result set and draws markers for resolved sites.
pub trait PlacementSink: Send + Sync {
    fn is_active(&self, site: &Site) -> bool;
    fn place_marker(&self, site: &Site, coordinate: Coordinate);
}

#[derive(Debug, Clone, Serialize)]
pub struct Marker {
    pub site_id: SiteId,
    pub customer: String,
    pub site: String,
    pub address: String,
    pub total_aps: u64,
    pub ap9176: u64,
    pub ap9178: u64,
    pub coordinate: Coordinate,
}

impl Marker {
    fn for_site(site: &Site, coordinate: Coordinate) -> Self {
        Self {
            site_id: site.id,
            customer: site.customer.clone(),
            site: site.site.clone(),
            address: site.address.clone(),
            total_aps: site.total_aps,
            ap9176: site.totals.ap9176,
            ap9178: site.totals.ap9178,
            coordinate,
        }
    }
}

/// Headless marker layer: the active id set plus every placed marker.
#[derive(Default)]
pub struct MarkerLayer {
    active: RwLock<HashSet<SiteId>>,
    markers: Mutex<Vec<Marker>>,
}

impl MarkerLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the active set and clears markers, like a re-render after a
    /// filter change.
    pub fn set_active(&self, sites: &[Arc<Site>]) {
        *self.active.write() = sites.iter().map(|site| site.id).collect();
        self.markers.lock().clear();
    }

    pub fn markers(&self) -> Vec<Marker> {
        self.markers.lock().clone()
    }

    pub fn fit_bounds(&self) -> Option<Bounds> {
        let markers = self.markers.lock();
        Bounds::around(markers.iter().map(|marker| &marker.coordinate)).map(|b| b.pad(FIT_PADDING))
    }
}

impl PlacementSink for MarkerLayer {
    fn is_active(&self, site: &Site) -> bool {
        self.active.read().contains(&site.id)
    }

    fn place_marker(&self, site: &Site, coordinate: Coordinate) {
        let mut markers = self.markers.lock();
        markers.retain(|marker| marker.site_id != site.id);
        markers.push(Marker::for_site(site, coordinate));
    }
}
