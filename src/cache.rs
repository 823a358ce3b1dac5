use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db;
use crate::errors::AppResult;
use crate::geo::Coordinate;
use crate::seed::SeedRow;

/// Durable storage for the serialized cache, addressed by a versioned key.
pub trait CacheStore: Send + Sync {
    fn read(&self, key: &str) -> AppResult<Option<String>>;
    fn write(&self, key: &str, value: &str) -> AppResult<()>;
}

pub struct SqliteCacheStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

impl CacheStore for SqliteCacheStore {
    fn read(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.db.lock();
        db::kv_get(&conn, key)
    }

    fn write(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.db.lock();
        db::kv_put(&conn, key, value)
    }
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCacheStore {
    pub fn with_entry(key: impl Into<String>, value: impl Into<String>) -> Self {
        let store = Self::default();
        store.entries.lock().insert(key.into(), value.into());
        store
    }
}

impl CacheStore for MemoryCacheStore {
    fn read(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> AppResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

type CacheMap = BTreeMap<String, Coordinate>;

pub struct GeocodeCache {
    key: String,
    store: Arc<dyn CacheStore>,
    entries: Mutex<CacheMap>,
}

impl GeocodeCache {
    /// Loads the persisted mapping. Read or parse failures leave the cache
    /// empty; they are never returned to the caller.
    pub fn load(store: Arc<dyn CacheStore>, key: &str, legacy_keys: &[String]) -> Self {
        let entries = match read_mapping(store.as_ref(), key) {
            Some(map) => map,
            None => {
                let migrated = legacy_keys
                    .iter()
                    .filter(|legacy| legacy.as_str() != key)
                    .find_map(|legacy| {
                        read_mapping(store.as_ref(), legacy).map(|map| (legacy, map))
                    });
                match migrated {
                    Some((legacy, map)) => {
                        info!(
                            legacy_key = %legacy,
                            entries = map.len(),
                            "adopting legacy geocode cache"
                        );
                        map
                    }
                    None => CacheMap::new(),
                }
            }
        };

        let cache = Self {
            key: key.to_string(),
            store,
            entries: Mutex::new(entries),
        };
        if !cache.is_empty() {
            if let Err(err) = cache.persist() {
                warn!(?err, "failed to write geocode cache under current key");
            }
        }
        cache
    }

    pub fn get(&self, address: &str) -> Option<Coordinate> {
        self.entries.lock().get(address).copied()
    }

    /// Inserts and synchronously writes the whole mapping back.
    pub fn put(&self, address: &str, coordinate: Coordinate) -> AppResult<()> {
        self.entries.lock().insert(address.to_string(), coordinate);
        self.persist()
    }

    /// Merges seed rows in memory; seed values win over cached ones.
    pub fn merge_seed(&self, rows: &[SeedRow]) -> usize {
        let mut entries = self.entries.lock();
        let mut merged = 0;
        for row in rows {
            let Some(coordinate) = Coordinate::checked(row.lat, row.lng) else {
                debug!(address = %row.address, "skipping seed row with invalid coordinate");
                continue;
            };
            entries.insert(row.address.clone(), coordinate);
            merged += 1;
        }
        merged
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn snapshot(&self) -> BTreeMap<String, Coordinate> {
        self.entries.lock().clone()
    }

    fn persist(&self) -> AppResult<()> {
        let serialized = {
            let entries = self.entries.lock();
            serde_json::to_string(&*entries)?
        };
        self.store.write(&self.key, &serialized)
    }
}

fn read_mapping(store: &dyn CacheStore, key: &str) -> Option<CacheMap> {
    let raw = match store.read(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            warn!(?err, key, "failed to read persisted geocode cache");
            return None;
        }
    };
    match serde_json::from_str::<CacheMap>(&raw) {
        Ok(map) => Some(map),
        Err(err) => {
            warn!(?err, key, "discarding unreadable geocode cache");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;

    const KEY: &str = "wifi7_geocode_cache_v1";

    struct FailingStore;

    impl CacheStore for FailingStore {
        fn read(&self, _key: &str) -> AppResult<Option<String>> {
            Err(AppError::Config("store offline".into()))
        }

        fn write(&self, _key: &str, _value: &str) -> AppResult<()> {
            Err(AppError::Config("store offline".into()))
        }
    }

    #[test]
    fn loads_persisted_mapping() {
        let store = Arc::new(MemoryCacheStore::with_entry(
            KEY,
            r#"{"1 Infinite Loop":{"lat":37.33,"lng":-122.03}}"#,
        ));
        let cache = GeocodeCache::load(store, KEY, &[]);
        assert_eq!(
            cache.get("1 Infinite Loop"),
            Some(Coordinate {
                lat: 37.33,
                lng: -122.03
            })
        );
        assert_eq!(cache.get("1 infinite loop"), None);
    }

    #[test]
    fn corrupt_data_fails_open_to_empty() {
        let store = Arc::new(MemoryCacheStore::with_entry(KEY, "{not json"));
        let cache = GeocodeCache::load(store, KEY, &[]);
        assert!(cache.is_empty());
    }

    #[test]
    fn unreadable_store_fails_open_and_put_reports_error() {
        let cache = GeocodeCache::load(Arc::new(FailingStore), KEY, &[]);
        assert!(cache.is_empty());
        let coordinate = Coordinate { lat: 1.0, lng: 2.0 };
        assert!(cache.put("Somewhere", coordinate).is_err());
        assert_eq!(cache.get("Somewhere"), Some(coordinate));
    }

    #[test]
    fn put_persists_whole_mapping() {
        let store = Arc::new(MemoryCacheStore::default());
        let cache = GeocodeCache::load(store.clone(), KEY, &[]);
        cache.put("A", Coordinate { lat: 1.0, lng: 2.0 }).unwrap();
        cache.put("B", Coordinate { lat: 3.0, lng: 4.0 }).unwrap();

        let raw = store.read(KEY).unwrap().unwrap();
        let reloaded: CacheMap = serde_json::from_str(&raw).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded["B"], Coordinate { lat: 3.0, lng: 4.0 });
    }

    #[test]
    fn adopts_legacy_key_when_current_is_absent() {
        let store = Arc::new(MemoryCacheStore::with_entry(
            "wifi7_geocode_cache_v0",
            r#"{"Old St":{"lat":5.0,"lng":6.0}}"#,
        ));
        let legacy = vec!["missing".to_string(), "wifi7_geocode_cache_v0".to_string()];
        let cache = GeocodeCache::load(store.clone(), KEY, &legacy);
        assert_eq!(cache.get("Old St"), Some(Coordinate { lat: 5.0, lng: 6.0 }));
        assert!(store.read(KEY).unwrap().is_some());
    }

    #[test]
    fn seed_rows_overwrite_and_skip_invalid() {
        let store = Arc::new(MemoryCacheStore::with_entry(
            KEY,
            r#"{"Main St":{"lat":1.0,"lng":1.0}}"#,
        ));
        let cache = GeocodeCache::load(store, KEY, &[]);
        let merged = cache.merge_seed(&[
            SeedRow {
                address: "Main St".into(),
                lat: 2.0,
                lng: 3.0,
            },
            SeedRow {
                address: "Nowhere".into(),
                lat: 200.0,
                lng: 0.0,
            },
        ]);
        assert_eq!(merged, 1);
        assert_eq!(cache.get("Main St"), Some(Coordinate { lat: 2.0, lng: 3.0 }));
        assert_eq!(cache.get("Nowhere"), None);
    }
}
