use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cache::GeocodeCache;
use crate::clock::Clock;
use crate::geo::Coordinate;
use crate::placement::PlacementSink;
use crate::resolver::ProviderChain;
use crate::sites::Site;
use crate::telemetry::{EventJournal, GeocodeEvent};

/// Immediate answer to [`GeocodeQueue::request_coordinate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "coordinate", rename_all = "snake_case")]
pub enum CoordinateRequest {
    /// The site already carried a coordinate; the cache was not consulted.
    Known(Coordinate),
    /// Served from the cache without touching the queue.
    Cached(Coordinate),
    Queued,
    AlreadyQueued,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub draining: bool,
    pub resolved: u64,
    pub unresolved: u64,
    pub cache_hits: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<Site>>,
    draining: bool,
}

#[derive(Default)]
struct Counters {
    resolved: AtomicU64,
    unresolved: AtomicU64,
    cache_hits: AtomicU64,
}

struct Inner {
    cache: Arc<GeocodeCache>,
    chain: ProviderChain,
    sink: Arc<dyn PlacementSink>,
    clock: Arc<dyn Clock>,
    journal: Option<Arc<EventJournal>>,
    delay_ms: AtomicU64,
    state: Mutex<QueueState>,
    idle: Notify,
    counters: Counters,
}

/// FIFO geocoding queue drained by a single task under a minimum delay
/// between network resolutions.
///
/// Each site is queued at most once at a time. The delay is applied after
/// every network resolution, successful or not, so it bounds the gap
/// between one request completing and the next one starting.
#[derive(Clone)]
pub struct GeocodeQueue {
    inner: Arc<Inner>,
}

impl GeocodeQueue {
    pub fn new(
        cache: Arc<GeocodeCache>,
        chain: ProviderChain,
        sink: Arc<dyn PlacementSink>,
        clock: Arc<dyn Clock>,
        delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                chain,
                sink,
                clock,
                journal: None,
                delay_ms: AtomicU64::new(duration_ms(delay)),
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Attaches the event journal. Only effective before the queue is shared.
    pub fn with_journal(mut self, journal: Arc<EventJournal>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.journal = Some(journal);
        }
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        self.inner.delay_ms.store(duration_ms(delay), Ordering::SeqCst);
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.inner.delay_ms.load(Ordering::SeqCst))
    }

    pub fn cache(&self) -> &Arc<GeocodeCache> {
        &self.inner.cache
    }

    /// Entry point for the rendering layer. Safe to call repeatedly for the
    /// same site; must be called from within a Tokio runtime.
    pub fn request_coordinate(&self, site: &Arc<Site>) -> CoordinateRequest {
        if let Some(coordinate) = site.coordinate() {
            return CoordinateRequest::Known(coordinate);
        }
        if let Some(coordinate) = self.inner.cache.get(&site.address) {
            site.set_coordinate(coordinate);
            self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return CoordinateRequest::Cached(coordinate);
        }
        self.enqueue(site)
    }

    pub fn enqueue(&self, site: &Arc<Site>) -> CoordinateRequest {
        if !site.mark_queued() {
            return CoordinateRequest::AlreadyQueued;
        }

        let start_drain = {
            let mut state = self.inner.state.lock();
            state.pending.push_back(Arc::clone(site));
            !std::mem::replace(&mut state.draining, true)
        };
        debug!(site_id = site.id, address = %site.address, "queued site for geocoding");

        if start_drain {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.drain().await });
        }
        CoordinateRequest::Queued
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        !self.inner.state.lock().draining
    }

    pub fn stats(&self) -> QueueStats {
        let (pending, draining) = {
            let state = self.inner.state.lock();
            (state.pending.len(), state.draining)
        };
        let counters = &self.inner.counters;
        QueueStats {
            pending,
            draining,
            resolved: counters.resolved.load(Ordering::Relaxed),
            unresolved: counters.unresolved.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Resolves once the drain loop has emptied the queue and stopped.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    async fn drain(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(site) => site,
                    None => {
                        state.draining = false;
                        drop(state);
                        self.close_batch();
                        self.idle.notify_waiters();
                        return;
                    }
                }
            };
            next.clear_queued();

            if self.geocode_site(&next).await {
                let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
                self.clock.sleep(delay).await;
            }
        }
    }

    /// Returns whether a network resolution took place.
    async fn geocode_site(&self, site: &Site) -> bool {
        if site.coordinate().is_some() {
            debug!(site_id = site.id, "site gained coordinates while queued; skipping");
            return false;
        }
        if let Some(coordinate) = self.cache.get(&site.address) {
            debug!(site_id = site.id, "address resolved while queued; using cache");
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.attach(site, coordinate);
            return false;
        }

        let started = self.clock.now();
        let resolution = self.chain.resolve(&site.address).await;
        let elapsed_ms = self.clock.now().duration_since(started).as_millis() as u64;

        match resolution.coordinate {
            Some(coordinate) => {
                if let Err(err) = self.cache.put(&site.address, coordinate) {
                    warn!(?err, address = %site.address, "failed to persist geocode cache");
                }
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                info!(
                    site_id = site.id,
                    address = %site.address,
                    provider = resolution.resolved_by().unwrap_or_default(),
                    elapsed_ms,
                    "geocoded site"
                );
                self.record(GeocodeEvent::Resolved {
                    address: site.address.clone(),
                    provider: resolution.resolved_by().map(str::to_string),
                    coordinate,
                    elapsed_ms,
                });
                self.attach(site, coordinate);
            }
            None => {
                self.counters.unresolved.fetch_add(1, Ordering::Relaxed);
                warn!(
                    site_id = site.id,
                    address = %site.address,
                    attempts = %resolution.summary(),
                    "geocoding failed"
                );
                self.record(GeocodeEvent::Unresolved {
                    address: site.address.clone(),
                    attempts: resolution.attempts,
                });
            }
        }
        true
    }

    fn attach(&self, site: &Site, coordinate: Coordinate) {
        site.set_coordinate(coordinate);
        if self.sink.is_active(site) {
            self.sink.place_marker(site, coordinate);
        } else {
            debug!(site_id = site.id, "site left the active set; marker not placed");
        }
    }

    fn record(&self, event: GeocodeEvent) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record(event) {
                warn!(?err, "failed to record geocode event");
            }
        }
    }

    fn close_batch(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        self.record(GeocodeEvent::QueueDrained {
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            unresolved: self.counters.unresolved.load(Ordering::Relaxed),
            cache_entries: self.cache.len(),
        });
        if let Err(err) = journal.flush() {
            warn!(?err, "failed to flush geocode event journal");
        }
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use tokio::time::Instant;

    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore};
    use crate::clock::TokioClock;
    use crate::errors::AppError;
    use crate::placement::MarkerLayer;
    use crate::providers::{GeocodeProvider, ProviderOutcome};

    const DELAY: Duration = Duration::from_millis(900);
    const KEY: &str = "wifi7_geocode_cache_v1";

    /// Answers from a fixed table after a simulated network latency and
    /// records when each request started and finished.
    struct TableProvider {
        name: &'static str,
        answers: HashMap<String, Coordinate>,
        latency: Duration,
        log: Mutex<Vec<(String, Instant, Instant)>>,
        failures: Mutex<VecDeque<ProviderOutcome>>,
    }

    impl TableProvider {
        fn new(
            name: &'static str,
            answers: &[(&str, Coordinate)],
            latency: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                answers: answers
                    .iter()
                    .map(|(address, coordinate)| (address.to_string(), *coordinate))
                    .collect(),
                latency,
                log: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
            })
        }

        fn requested(&self) -> Vec<String> {
            self.log.lock().iter().map(|(a, _, _)| a.clone()).collect()
        }
    }

    #[async_trait]
    impl GeocodeProvider for TableProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn geocode(&self, address: &str) -> ProviderOutcome {
            let started = Instant::now();
            tokio::time::sleep(self.latency).await;
            self.log
                .lock()
                .push((address.to_string(), started, Instant::now()));
            if let Some(failure) = self.failures.lock().pop_front() {
                return failure;
            }
            match self.answers.get(address) {
                Some(coordinate) => ProviderOutcome::Found(*coordinate),
                None => ProviderOutcome::NoMatch,
            }
        }
    }

    struct RecordingClock {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Clock for RecordingClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
            tokio::time::sleep(duration).await;
        }
    }

    struct Harness {
        queue: GeocodeQueue,
        layer: Arc<MarkerLayer>,
        store: Arc<MemoryCacheStore>,
        clock: Arc<RecordingClock>,
    }

    fn harness(providers: Vec<Arc<dyn GeocodeProvider>>, store: MemoryCacheStore) -> Harness {
        let store = Arc::new(store);
        let cache = Arc::new(GeocodeCache::load(store.clone(), KEY, &[]));
        let clock = Arc::new(RecordingClock {
            sleeps: Mutex::new(Vec::new()),
        });
        let layer = Arc::new(MarkerLayer::new());
        let chain = ProviderChain::new(providers, Arc::new(TokioClock));
        let queue = GeocodeQueue::new(cache, chain, layer.clone(), clock.clone(), DELAY);
        Harness {
            queue,
            layer,
            store,
            clock,
        }
    }

    fn site(id: usize, address: &str) -> Arc<Site> {
        Arc::new(Site::new(id, "Acme", &format!("Site {id}"), address))
    }

    const SPRINGFIELD: Coordinate = Coordinate {
        lat: 39.1,
        lng: -89.6,
    };

    #[tokio::test(start_paused = true)]
    async fn resolves_and_persists_springfield() {
        let primary = TableProvider::new(
            "nominatim",
            &[("123 Main St, Springfield", SPRINGFIELD)],
            Duration::from_millis(50),
        );
        let h = harness(vec![primary.clone()], MemoryCacheStore::default());
        let hq = site(0, "123 Main St, Springfield");
        h.layer.set_active(&[hq.clone()]);

        assert_eq!(h.queue.request_coordinate(&hq), CoordinateRequest::Queued);
        h.queue.wait_idle().await;

        assert_eq!(hq.coordinate(), Some(SPRINGFIELD));
        assert_eq!(
            h.queue.cache().get("123 Main St, Springfield"),
            Some(SPRINGFIELD)
        );
        let raw = CacheStore::read(h.store.as_ref(), KEY).unwrap().unwrap();
        let persisted: HashMap<String, Coordinate> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted["123 Main St, Springfield"], SPRINGFIELD);
        assert_eq!(h.layer.markers().len(), 1);
        assert_eq!(h.queue.stats().resolved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_address_bypasses_queue_and_network() {
        let primary = TableProvider::new("nominatim", &[], Duration::from_millis(50));
        let h = harness(
            vec![primary.clone()],
            MemoryCacheStore::with_entry(
                KEY,
                r#"{"123 Main St, Springfield":{"lat":10.0,"lng":20.0}}"#,
            ),
        );
        let hq = site(0, "123 Main St, Springfield");

        let cached = Coordinate { lat: 10.0, lng: 20.0 };
        assert_eq!(
            h.queue.request_coordinate(&hq),
            CoordinateRequest::Cached(cached)
        );
        assert_eq!(hq.coordinate(), Some(cached));
        assert!(h.queue.is_idle());
        assert_eq!(h.queue.pending(), 0);
        assert!(primary.requested().is_empty());
        assert_eq!(h.queue.cache().get("123 Main St, Springfield"), Some(cached));
        assert_eq!(h.queue.stats().cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn site_with_coordinates_skips_cache() {
        let primary = TableProvider::new("nominatim", &[], Duration::ZERO);
        let h = harness(
            vec![primary],
            MemoryCacheStore::with_entry(KEY, r#"{"Dock Rd":{"lat":1.0,"lng":1.0}}"#),
        );
        let depot = site(1, "Dock Rd");
        depot.set_coordinate(Coordinate { lat: 51.5, lng: -0.1 });

        assert_eq!(
            h.queue.request_coordinate(&depot),
            CoordinateRequest::Known(Coordinate { lat: 51.5, lng: -0.1 })
        );
        assert_eq!(h.queue.stats().cache_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_requests_queue_once() {
        let primary = TableProvider::new(
            "nominatim",
            &[("123 Main St, Springfield", SPRINGFIELD)],
            Duration::from_millis(50),
        );
        let h = harness(vec![primary.clone()], MemoryCacheStore::default());
        let hq = site(0, "123 Main St, Springfield");
        let other = site(1, "Elsewhere");

        assert_eq!(h.queue.request_coordinate(&other), CoordinateRequest::Queued);
        assert_eq!(h.queue.request_coordinate(&hq), CoordinateRequest::Queued);
        assert_eq!(
            h.queue.request_coordinate(&hq),
            CoordinateRequest::AlreadyQueued
        );
        assert_eq!(h.queue.enqueue(&hq), CoordinateRequest::AlreadyQueued);
        assert_eq!(h.queue.pending(), 2);

        h.queue.wait_idle().await;
        let requested = primary.requested();
        assert_eq!(
            requested
                .iter()
                .filter(|a| a.as_str() == "123 Main St, Springfield")
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_in_enqueue_order_with_delay_floor() {
        let primary = TableProvider::new("nominatim", &[], Duration::from_millis(120));
        let h = harness(vec![primary.clone()], MemoryCacheStore::default());
        let sites: Vec<Arc<Site>> = (0..4).map(|i| site(i, &format!("{i} Queue St"))).collect();

        for s in &sites {
            assert_eq!(h.queue.request_coordinate(s), CoordinateRequest::Queued);
        }
        h.queue.wait_idle().await;

        let log = primary.log.lock().clone();
        let order: Vec<&str> = log.iter().map(|(a, _, _)| a.as_str()).collect();
        assert_eq!(order, vec!["0 Queue St", "1 Queue St", "2 Queue St", "3 Queue St"]);
        for pair in log.windows(2) {
            let previous_finished = pair[0].2;
            let next_started = pair[1].1;
            assert!(next_started.duration_since(previous_finished) >= DELAY);
        }
        // Failures still pay the delay.
        assert_eq!(h.clock.sleeps.lock().as_slice(), &[DELAY; 4]);
        assert_eq!(h.queue.stats().unresolved, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn total_failure_moves_on_to_next_site() {
        let primary = TableProvider::new("nominatim", &[], Duration::from_millis(10));
        primary.failures.lock().push_back(ProviderOutcome::Failed {
            retryable: true,
            error: AppError::Status(StatusCode::SERVICE_UNAVAILABLE),
        });
        let fallback = TableProvider::new(
            "photon",
            &[("Second St", Coordinate { lat: 1.0, lng: 2.0 })],
            Duration::from_millis(10),
        );
        let h = harness(
            vec![primary.clone(), fallback.clone()],
            MemoryCacheStore::default(),
        );
        let first = site(0, "First St");
        let second = site(1, "Second St");
        h.layer.set_active(&[first.clone(), second.clone()]);

        h.queue.request_coordinate(&first);
        h.queue.request_coordinate(&second);
        h.queue.wait_idle().await;

        assert_eq!(first.coordinate(), None);
        assert!(!first.is_queued());
        assert_eq!(second.coordinate(), Some(Coordinate { lat: 1.0, lng: 2.0 }));
        assert_eq!(fallback.requested(), vec!["First St", "Second St"]);
        assert_eq!(h.queue.cache().len(), 1);
        assert_eq!(h.layer.markers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_site_is_cached_without_marker() {
        let primary = TableProvider::new(
            "nominatim",
            &[("123 Main St, Springfield", SPRINGFIELD)],
            Duration::from_millis(50),
        );
        let h = harness(vec![primary], MemoryCacheStore::default());
        let hq = site(0, "123 Main St, Springfield");
        h.layer.set_active(&[hq.clone()]);

        h.queue.request_coordinate(&hq);
        // Filter changes before the request completes.
        h.layer.set_active(&[]);
        h.queue.wait_idle().await;

        assert_eq!(hq.coordinate(), Some(SPRINGFIELD));
        assert_eq!(h.queue.cache().get(&hq.address), Some(SPRINGFIELD));
        assert!(h.layer.markers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_address_reuses_first_resolution() {
        let primary = TableProvider::new(
            "nominatim",
            &[("123 Main St, Springfield", SPRINGFIELD)],
            Duration::from_millis(50),
        );
        let h = harness(vec![primary.clone()], MemoryCacheStore::default());
        let hq = site(0, "123 Main St, Springfield");
        let lab = site(2, "123 Main St, Springfield");

        h.queue.request_coordinate(&hq);
        h.queue.request_coordinate(&lab);
        h.queue.wait_idle().await;

        assert_eq!(lab.coordinate(), Some(SPRINGFIELD));
        assert_eq!(primary.requested().len(), 1);
        assert_eq!(h.clock.sleeps.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_site_given_coordinates_skips_lookup() {
        let primary = TableProvider::new(
            "nominatim",
            &[("A St", Coordinate { lat: 1.0, lng: 1.0 })],
            Duration::from_millis(50),
        );
        let h = harness(vec![primary.clone()], MemoryCacheStore::default());
        let a = site(0, "A St");
        let depot = site(1, "Dock Rd");
        h.layer.set_active(&[a.clone(), depot.clone()]);

        assert_eq!(h.queue.request_coordinate(&a), CoordinateRequest::Queued);
        assert_eq!(h.queue.request_coordinate(&depot), CoordinateRequest::Queued);
        let imported = Coordinate { lat: 51.5, lng: -0.1 };
        depot.set_coordinate(imported);
        h.queue.wait_idle().await;

        assert_eq!(primary.requested(), vec!["A St"]);
        assert_eq!(depot.coordinate(), Some(imported));
        assert!(!depot.is_queued());
        assert_eq!(h.queue.cache().get("Dock Rd"), None);
        assert_eq!(h.clock.sleeps.lock().as_slice(), &[DELAY]);
        assert_eq!(h.layer.markers().len(), 1);
        assert_eq!(h.queue.stats().cache_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_after_going_idle() {
        let primary = TableProvider::new(
            "nominatim",
            &[
                ("A St", Coordinate { lat: 1.0, lng: 1.0 }),
                ("B St", Coordinate { lat: 2.0, lng: 2.0 }),
            ],
            Duration::from_millis(5),
        );
        let h = harness(vec![primary.clone()], MemoryCacheStore::default());
        let a = site(0, "A St");
        let b = site(1, "B St");

        h.queue.request_coordinate(&a);
        h.queue.wait_idle().await;
        assert!(h.queue.is_idle());

        h.queue.set_delay(Duration::from_millis(100));
        assert_eq!(h.queue.delay(), Duration::from_millis(100));
        h.queue.request_coordinate(&b);
        h.queue.wait_idle().await;
        assert_eq!(b.coordinate(), Some(Coordinate { lat: 2.0, lng: 2.0 }));
        assert_eq!(
            h.clock.sleeps.lock().as_slice(),
            &[DELAY, Duration::from_millis(100)]
        );
    }
}
