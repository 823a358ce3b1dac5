use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::AppResult;
use crate::geo::Coordinate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedRow {
    pub address: String,
    pub lat: f64,
    pub lng: f64,
}

impl SeedRow {
    pub fn new(address: impl Into<String>, coordinate: Coordinate) -> Self {
        Self {
            address: address.into(),
            lat: coordinate.lat,
            lng: coordinate.lng,
        }
    }
}

/// Reads the optional seed file. Absence or a malformed file yields no rows.
pub fn load_seed_rows(path: &Path) -> Vec<SeedRow> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no geocode seed file present");
            return Vec::new();
        }
        Err(err) => {
            warn!(?err, path = %path.display(), "unable to read geocode seed file");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<SeedRow>>(&contents) {
        Ok(rows) => rows,
        Err(err) => {
            warn!(?err, path = %path.display(), "ignoring malformed geocode seed file");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedExport {
    pub rows: usize,
    pub new_rows: usize,
    pub unresolved: Vec<String>,
}

/// Rewrites the seed file with every address in `addresses` that has a
/// coordinate, either from the existing file or from `resolved`.
pub fn write_seed_file(
    path: &Path,
    addresses: &[String],
    existing: &[SeedRow],
    resolved: &BTreeMap<String, Coordinate>,
) -> AppResult<SeedExport> {
    let known: BTreeMap<&str, &SeedRow> = existing
        .iter()
        .map(|row| (row.address.as_str(), row))
        .collect();

    let mut rows = Vec::with_capacity(addresses.len());
    let mut new_rows = 0;
    let mut unresolved = Vec::new();
    for address in addresses {
        if let Some(row) = known.get(address.as_str()) {
            rows.push((*row).clone());
        } else if let Some(coordinate) = resolved.get(address) {
            rows.push(SeedRow::new(address.clone(), *coordinate));
            new_rows += 1;
        } else {
            unresolved.push(address.clone());
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&rows)?)?;

    Ok(SeedExport {
        rows: rows.len(),
        new_rows,
        unresolved,
    })
}
