use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::geo::Coordinate;
use crate::providers::{GeocodeProvider, ProviderOutcome};

const BASE_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptStatus {
    Found,
    NoMatch,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub tries: u32,
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub coordinate: Option<Coordinate>,
    pub attempts: Vec<ProviderAttempt>,
}

impl Resolution {
    /// Provider that produced the coordinate, if any.
    pub fn resolved_by(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find(|attempt| matches!(attempt.status, AttemptStatus::Found))
            .map(|attempt| attempt.provider.as_str())
    }

    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|attempt| match &attempt.status {
                AttemptStatus::Found => format!("{}: found", attempt.provider),
                AttemptStatus::NoMatch => format!("{}: no match", attempt.provider),
                AttemptStatus::Failed { error } => format!("{}: {error}", attempt.provider),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Tries providers in fixed priority order and stops at the first match.
///
/// Any failure of one provider (transport, status, or parse) moves on to
/// the next. With `max_retries` at zero every provider gets exactly one
/// request per call; otherwise only retryable failures are repeated.
pub struct ProviderChain {
    providers: Vec<Arc<dyn GeocodeProvider>>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    jitter_rng: Mutex<StdRng>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn GeocodeProvider>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers,
            clock,
            max_retries: 0,
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[cfg(test)]
    fn with_rng(mut self, rng: StdRng) -> Self {
        self.jitter_rng = Mutex::new(rng);
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub async fn resolve(&self, address: &str) -> Resolution {
        let mut attempts = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let (outcome, tries) = self.attempt(provider.as_ref(), address).await;
            trace!(provider = provider.name(), address, %outcome, "provider attempt finished");
            match outcome {
                ProviderOutcome::Found(coordinate) => {
                    attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        tries,
                        status: AttemptStatus::Found,
                    });
                    return Resolution {
                        coordinate: Some(coordinate),
                        attempts,
                    };
                }
                ProviderOutcome::NoMatch => attempts.push(ProviderAttempt {
                    provider: provider.name().to_string(),
                    tries,
                    status: AttemptStatus::NoMatch,
                }),
                ProviderOutcome::Failed { error, .. } => attempts.push(ProviderAttempt {
                    provider: provider.name().to_string(),
                    tries,
                    status: AttemptStatus::Failed {
                        error: error.to_string(),
                    },
                }),
            }
        }
        Resolution {
            coordinate: None,
            attempts,
        }
    }

    async fn attempt(
        &self,
        provider: &dyn GeocodeProvider,
        address: &str,
    ) -> (ProviderOutcome, u32) {
        let mut tries = 0;
        loop {
            tries += 1;
            match provider.geocode(address).await {
                ProviderOutcome::Failed {
                    retryable: true,
                    error,
                } if tries <= self.max_retries => {
                    let delay = self.backoff_delay(tries);
                    debug!(
                        ?error,
                        provider = provider.name(),
                        tries,
                        "geocode request failed; retrying after {:?}",
                        delay
                    );
                    self.clock.sleep(delay).await;
                }
                outcome => return (outcome, tries),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..BASE_BACKOFF_MS))
        };
        base + jitter
    }
}
