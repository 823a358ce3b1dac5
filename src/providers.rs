use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Nominatim,
    Photon,
    Mapbox,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Nominatim => "nominatim",
            ProviderKind::Photon => "photon",
            ProviderKind::Mapbox => "mapbox",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nominatim" => Ok(ProviderKind::Nominatim),
            "photon" => Ok(ProviderKind::Photon),
            "mapbox" => Ok(ProviderKind::Mapbox),
            _ => Err(AppError::Config(format!("invalid geocoding provider: {value}"))),
        }
    }
}

/// Result of one request against one provider.
#[derive(Debug)]
pub enum ProviderOutcome {
    Found(Coordinate),
    NoMatch,
    Failed { retryable: bool, error: AppError },
}

impl ProviderOutcome {
    fn failed(retryable: bool, error: impl Into<AppError>) -> Self {
        ProviderOutcome::Failed {
            retryable,
            error: error.into(),
        }
    }
}

impl fmt::Display for ProviderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderOutcome::Found(c) => write!(f, "found {},{}", c.lat, c.lng),
            ProviderOutcome::NoMatch => f.write_str("no match"),
            ProviderOutcome::Failed { error, .. } => write!(f, "failed: {error}"),
        }
    }
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn geocode(&self, address: &str) -> ProviderOutcome;
}

/// Builds the configured providers in priority order. Mapbox is skipped
/// when no token is available.
pub fn providers_from_config(config: &AppConfig) -> AppResult<Vec<Arc<dyn GeocodeProvider>>> {
    let http = Client::builder().user_agent(config.user_agent.clone()).build()?;
    let timeout = config.provider_timeout();

    let mut providers: Vec<Arc<dyn GeocodeProvider>> = Vec::new();
    for kind in &config.providers {
        match kind {
            ProviderKind::Nominatim => providers.push(Arc::new(NominatimProvider::new(
                http.clone(),
                &config.nominatim_endpoint,
                &config.user_agent,
                &config.accept_language,
                timeout,
            )?)),
            ProviderKind::Photon => providers.push(Arc::new(PhotonProvider::new(
                http.clone(),
                &config.photon_endpoint,
                &config.user_agent,
                &config.accept_language,
                timeout,
            )?)),
            ProviderKind::Mapbox => match config.mapbox_token.clone() {
                Some(token) => providers.push(Arc::new(MapboxProvider::new(
                    http.clone(),
                    &config.mapbox_endpoint,
                    token,
                    &config.user_agent,
                    &config.accept_language,
                    timeout,
                )?)),
                None => warn!("mapbox provider configured without MAPBOX_TOKEN; skipping it"),
            },
        }
    }
    Ok(providers)
}

fn parse_endpoint(raw: &str) -> AppResult<Url> {
    Url::parse(raw).map_err(|err| AppError::Config(format!("invalid endpoint {raw}: {err}")))
}

async fn fetch_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ProviderOutcome> {
    let response = request
        .send()
        .await
        .map_err(|err| ProviderOutcome::failed(err.is_timeout() || err.is_connect(), err))?;

    let status = response.status();
    if !status.is_success() {
        let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
        return Err(ProviderOutcome::failed(retryable, AppError::Status(status)));
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| ProviderOutcome::failed(true, err))?;
    serde_json::from_slice(&body).map_err(|err| ProviderOutcome::failed(false, err))
}

fn parse_degrees(value: &str) -> Result<f64, ProviderOutcome> {
    value.trim().parse::<f64>().map_err(|err| {
        ProviderOutcome::failed(false, AppError::Parse(format!("invalid degrees {value:?}: {err}")))
    })
}

fn from_lon_lat(position: &[f64]) -> ProviderOutcome {
    match position {
        [lng, lat, ..] => match Coordinate::checked(*lat, *lng) {
            Some(coordinate) => ProviderOutcome::Found(coordinate),
            None => ProviderOutcome::failed(
                false,
                AppError::Parse(format!("coordinate out of range: {lat},{lng}")),
            ),
        },
        _ => ProviderOutcome::failed(false, AppError::Parse("position lacks lon/lat".into())),
    }
}

/// OpenStreetMap Nominatim search. Its usage policy requires an identifying
/// `User-Agent`.
pub struct NominatimProvider {
    http: Client,
    endpoint: Url,
    user_agent: String,
    language: String,
    timeout: Duration,
}

impl NominatimProvider {
    pub fn new(
        http: Client,
        endpoint: &str,
        user_agent: &str,
        language: &str,
        timeout: Duration,
    ) -> AppResult<Self> {
        Ok(Self {
            http,
            endpoint: parse_endpoint(endpoint)?,
            user_agent: user_agent.to_string(),
            language: language.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn name(&self) -> &str {
        ProviderKind::Nominatim.as_str()
    }

    async fn geocode(&self, address: &str) -> ProviderOutcome {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: String,
            lon: String,
        }

        let request = self
            .http
            .get(self.endpoint.clone())
            .timeout(self.timeout)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT_LANGUAGE, &self.language)
            .query(&[
                ("format", "json"),
                ("q", address),
                ("limit", "1"),
                ("addressdetails", "0"),
            ]);

        let hits: Vec<SearchHit> = match fetch_json(request).await {
            Ok(hits) => hits,
            Err(outcome) => return outcome,
        };
        let Some(hit) = hits.first() else {
            return ProviderOutcome::NoMatch;
        };
        let lat = match parse_degrees(&hit.lat) {
            Ok(lat) => lat,
            Err(outcome) => return outcome,
        };
        let lng = match parse_degrees(&hit.lon) {
            Ok(lng) => lng,
            Err(outcome) => return outcome,
        };
        from_lon_lat(&[lng, lat])
    }
}

#[derive(Deserialize)]
struct FeatureCollection<F> {
    #[serde(default = "Vec::new")]
    features: Vec<F>,
}

/// Komoot Photon, a GeoJSON feature API.
pub struct PhotonProvider {
    http: Client,
    endpoint: Url,
    user_agent: String,
    language: String,
    timeout: Duration,
}

impl PhotonProvider {
    pub fn new(
        http: Client,
        endpoint: &str,
        user_agent: &str,
        language: &str,
        timeout: Duration,
    ) -> AppResult<Self> {
        Ok(Self {
            http,
            endpoint: parse_endpoint(endpoint)?,
            user_agent: user_agent.to_string(),
            language: language.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl GeocodeProvider for PhotonProvider {
    fn name(&self) -> &str {
        ProviderKind::Photon.as_str()
    }

    async fn geocode(&self, address: &str) -> ProviderOutcome {
        #[derive(Deserialize)]
        struct Feature {
            geometry: Geometry,
        }

        #[derive(Deserialize)]
        struct Geometry {
            coordinates: Vec<f64>,
        }

        let request = self
            .http
            .get(self.endpoint.clone())
            .timeout(self.timeout)
            .header(USER_AGENT, &self.user_agent)
            .query(&[("q", address), ("limit", "1"), ("lang", self.language.as_str())]);

        match fetch_json::<FeatureCollection<Feature>>(request).await {
            Ok(collection) => match collection.features.first() {
                Some(feature) => from_lon_lat(&feature.geometry.coordinates),
                None => ProviderOutcome::NoMatch,
            },
            Err(outcome) => outcome,
        }
    }
}

/// Mapbox forward geocoding; the address is a path segment.
pub struct MapboxProvider {
    http: Client,
    endpoint: Url,
    token: SecretString,
    user_agent: String,
    language: String,
    timeout: Duration,
}

impl MapboxProvider {
    pub fn new(
        http: Client,
        endpoint: &str,
        token: SecretString,
        user_agent: &str,
        language: &str,
        timeout: Duration,
    ) -> AppResult<Self> {
        let endpoint = parse_endpoint(endpoint)?;
        if endpoint.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "mapbox endpoint cannot take a path: {endpoint}"
            )));
        }
        Ok(Self {
            http,
            endpoint,
            token,
            user_agent: user_agent.to_string(),
            language: language.to_string(),
            timeout,
        })
    }

    fn place_url(&self, address: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&format!("{address}.json"));
        }
        url
    }
}

#[async_trait]
impl GeocodeProvider for MapboxProvider {
    fn name(&self) -> &str {
        ProviderKind::Mapbox.as_str()
    }

    async fn geocode(&self, address: &str) -> ProviderOutcome {
        #[derive(Deserialize)]
        struct Feature {
            center: Vec<f64>,
        }

        let request = self
            .http
            .get(self.place_url(address))
            .timeout(self.timeout)
            .header(USER_AGENT, &self.user_agent)
            .query(&[
                ("access_token", self.token.expose_secret()),
                ("limit", "1"),
                ("language", self.language.as_str()),
            ]);

        match fetch_json::<FeatureCollection<Feature>>(request).await {
            Ok(collection) => match collection.features.first() {
                Some(feature) => from_lon_lat(&feature.center),
                None => ProviderOutcome::NoMatch,
            },
            Err(outcome) => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::request;
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn nominatim_at(server: &Server, path: &str) -> NominatimProvider {
        NominatimProvider::new(
            Client::new(),
            &server.url_str(path),
            "test-agent",
            "en",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn parses_provider_names() {
        assert_eq!(
            ProviderKind::parse(" Nominatim ").unwrap(),
            ProviderKind::Nominatim
        );
        assert_eq!(ProviderKind::parse("PHOTON").unwrap(), ProviderKind::Photon);
        assert!(ProviderKind::parse("google").is_err());
    }

    #[test]
    fn reads_positions_as_lon_lat() {
        match from_lon_lat(&[-89.6, 39.1]) {
            ProviderOutcome::Found(c) => assert_eq!(c, Coordinate { lat: 39.1, lng: -89.6 }),
            other => panic!("unexpected outcome: {other}"),
        }
        assert!(matches!(
            from_lon_lat(&[1.0]),
            ProviderOutcome::Failed {
                retryable: false,
                ..
            }
        ));
    }

    #[test]
    fn rejects_non_numeric_degrees() {
        assert!(parse_degrees("39.1").is_ok());
        assert!(parse_degrees("north").is_err());
    }

    #[test]
    fn mapbox_skipped_without_token() {
        let config = AppConfig {
            providers: vec![ProviderKind::Mapbox, ProviderKind::Photon],
            ..AppConfig::default()
        };
        let providers = providers_from_config(&config).unwrap();
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["photon"]);
    }

    #[test]
    fn mapbox_places_address_in_path() {
        let provider = MapboxProvider::new(
            Client::new(),
            "https://api.mapbox.com/geocoding/v5/mapbox.places",
            SecretString::from("token"),
            "test-agent",
            "en",
            Duration::from_secs(1),
        )
        .unwrap();
        let url = provider.place_url("10 Downing St, London");
        assert_eq!(
            url.as_str(),
            "https://api.mapbox.com/geocoding/v5/mapbox.places/10%20Downing%20St,%20London.json"
        );
    }

    #[tokio::test]
    async fn classifies_http_responses() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/busy")).respond_with(status_code(503)),
        );
        server.expect(
            Expectation::matching(request::path("/throttled")).respond_with(status_code(429)),
        );
        server.expect(
            Expectation::matching(request::path("/missing")).respond_with(status_code(404)),
        );
        server.expect(
            Expectation::matching(request::path("/garbled"))
                .respond_with(status_code(200).body("not json")),
        );
        server.expect(
            Expectation::matching(request::path("/empty")).respond_with(json_encoded(json!([]))),
        );

        for (path, expected) in [
            ("/busy", StatusCode::SERVICE_UNAVAILABLE),
            ("/throttled", StatusCode::TOO_MANY_REQUESTS),
        ] {
            match nominatim_at(&server, path).geocode("A St").await {
                ProviderOutcome::Failed {
                    retryable: true,
                    error: AppError::Status(status),
                } => assert_eq!(status, expected),
                other => panic!("{path}: unexpected outcome: {other}"),
            }
        }
        assert!(matches!(
            nominatim_at(&server, "/missing").geocode("A St").await,
            ProviderOutcome::Failed {
                retryable: false,
                error: AppError::Status(status),
            } if status == StatusCode::NOT_FOUND
        ));
        assert!(matches!(
            nominatim_at(&server, "/garbled").geocode("A St").await,
            ProviderOutcome::Failed {
                retryable: false,
                error: AppError::Json(_),
            }
        ));
        assert!(matches!(
            nominatim_at(&server, "/empty").geocode("A St").await,
            ProviderOutcome::NoMatch
        ));
    }
}
