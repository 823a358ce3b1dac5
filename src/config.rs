use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::providers::ProviderKind;

pub const DEFAULT_CACHE_KEY: &str = "wifi7_geocode_cache_v1";
const DEFAULT_GEOCODE_DELAY_MS: u64 = 900;
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const MAX_PROVIDER_RETRIES: u32 = 5;
/// Nominatim's usage policy asks for a reachable contact in every User-Agent.
const DEFAULT_CONTACT: &str = "dashboard@cisco.com";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub sites_file: PathBuf,
    pub seed_file: PathBuf,
    pub database_file_name: String,
    pub cache_key: String,
    pub legacy_cache_keys: Vec<String>,
    pub geocode_delay_ms: u64,
    pub provider_timeout_ms: u64,
    pub provider_retries: u32,
    pub providers: Vec<ProviderKind>,
    pub user_agent: String,
    pub accept_language: String,
    pub nominatim_endpoint: String,
    pub photon_endpoint: String,
    pub mapbox_endpoint: String,
    pub mapbox_token: Option<SecretString>,
    pub telemetry_enabled: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub sites_file: String,
    pub seed_file: String,
    pub database_file_name: String,
    pub cache_key: String,
    pub legacy_cache_keys: Vec<String>,
    pub geocode_delay_ms: u64,
    pub provider_timeout_ms: u64,
    pub provider_retries: u32,
    pub providers: Vec<&'static str>,
    pub user_agent: String,
    pub has_mapbox_token: bool,
    pub telemetry_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            sites_file: data_dir.join("sites.json"),
            seed_file: data_dir.join("geocoded_sites.json"),
            data_dir,
            database_file_name: "geocode-cache.db".to_string(),
            cache_key: DEFAULT_CACHE_KEY.to_string(),
            legacy_cache_keys: Vec::new(),
            geocode_delay_ms: DEFAULT_GEOCODE_DELAY_MS,
            provider_timeout_ms: DEFAULT_PROVIDER_TIMEOUT_MS,
            provider_retries: 0,
            providers: vec![ProviderKind::Nominatim, ProviderKind::Photon],
            user_agent: default_user_agent(None),
            accept_language: "en".to_string(),
            nominatim_endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            photon_endpoint: "https://photon.komoot.io/api/".to_string(),
            mapbox_endpoint: "https://api.mapbox.com/geocoding/v5/mapbox.places".to_string(),
            mapbox_token: None,
            telemetry_enabled: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        let data_dir = env::var("SITE_MAP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        Self {
            sites_file: env::var("SITES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("sites.json")),
            seed_file: env::var("GEOCODE_SEED_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("geocoded_sites.json")),
            data_dir,
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or(defaults.database_file_name),
            cache_key: non_empty("GEOCODE_CACHE_KEY").unwrap_or(defaults.cache_key),
            legacy_cache_keys: parse_list("GEOCODE_LEGACY_CACHE_KEYS"),
            geocode_delay_ms: parse_u64("GEOCODE_DELAY_MS", defaults.geocode_delay_ms),
            provider_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", defaults.provider_timeout_ms)
                .max(1),
            provider_retries: parse_u32("GEOCODER_PROVIDER_RETRIES", 0).min(MAX_PROVIDER_RETRIES),
            providers: parse_providers("GEOCODER_PROVIDERS").unwrap_or(defaults.providers),
            user_agent: non_empty("GEOCODER_USER_AGENT").unwrap_or_else(|| {
                let contact = non_empty("GEOCODER_CONTACT");
                if contact.is_none() {
                    warn!(
                        contact = DEFAULT_CONTACT,
                        "GEOCODER_CONTACT not set; geocoder User-Agent uses the default contact"
                    );
                }
                default_user_agent(contact.as_deref())
            }),
            accept_language: non_empty("GEOCODER_LANGUAGE").unwrap_or(defaults.accept_language),
            nominatim_endpoint: non_empty("NOMINATIM_ENDPOINT")
                .unwrap_or(defaults.nominatim_endpoint),
            photon_endpoint: non_empty("PHOTON_ENDPOINT").unwrap_or(defaults.photon_endpoint),
            mapbox_endpoint: non_empty("MAPBOX_ENDPOINT").unwrap_or(defaults.mapbox_endpoint),
            mapbox_token: non_empty("MAPBOX_TOKEN").map(SecretString::from),
            telemetry_enabled: parse_bool("TELEMETRY_ENABLED", defaults.telemetry_enabled),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", defaults.telemetry_batch_size)
                .max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                defaults.telemetry_buffer_max_bytes,
            ),
        }
    }

    pub fn geocode_delay(&self) -> Duration {
        Duration::from_millis(self.geocode_delay_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            sites_file: self.sites_file.to_string_lossy().to_string(),
            seed_file: self.seed_file.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            cache_key: self.cache_key.clone(),
            legacy_cache_keys: self.legacy_cache_keys.clone(),
            geocode_delay_ms: self.geocode_delay_ms,
            provider_timeout_ms: self.provider_timeout_ms,
            provider_retries: self.provider_retries,
            providers: self.providers.iter().map(ProviderKind::as_str).collect(),
            user_agent: self.user_agent.clone(),
            has_mapbox_token: self.mapbox_token.is_some(),
            telemetry_enabled: self.telemetry_enabled,
        }
    }
}

fn default_user_agent(contact: Option<&str>) -> String {
    let base = concat!("wifi7-site-map/", env!("CARGO_PKG_VERSION"));
    format!("{base} (contact: {})", contact.unwrap_or(DEFAULT_CONTACT))
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_list(key: &str) -> Vec<String> {
    non_empty(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_providers(key: &str) -> Option<Vec<ProviderKind>> {
    let names = parse_list(key);
    if names.is_empty() {
        return None;
    }
    let mut kinds = Vec::with_capacity(names.len());
    for name in names {
        match ProviderKind::parse(&name) {
            Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Ok(_) => {}
            Err(err) => warn!(%err, "ignoring unknown geocoding provider"),
        }
    }
    (!kinds.is_empty()).then_some(kinds)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
