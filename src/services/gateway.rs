//! Ordered weather provider chain.
//!
//! Providers are tried in a fixed priority order (index 0 is the primary).
//! Each call runs under its own timeout; a failure or timeout moves on to
//! the next provider immediately, with no retry of the same one. A provider
//! that answers with gaps lets the chain continue so later providers can fill
//! them in. The gateway holds no shared mutable state, so concurrent calls
//! are independent.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ConditionError, ProviderError};
use crate::services::observation::{Coordinates, Observation, RawObservation};

/// A source of current/recent weather for a coordinate.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Short label used in logs and in the assessment's provider field.
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        coordinates: Coordinates,
        timeout: Duration,
    ) -> Result<RawObservation, ProviderError>;
}

/// Successful gateway fetch, with the per-provider failures that were
/// absorbed on the way.
#[derive(Debug, Clone)]
pub struct GatewayFetch {
    pub observation: Observation,
    pub failures: Vec<ConditionError>,
}

impl From<ProviderError> for ConditionError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout { .. } => ConditionError::ProviderTimeout(err.to_string()),
            other => ConditionError::ProviderUnavailable(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ProviderGateway {
    providers: Vec<Arc<dyn WeatherProvider>>,
}

impl ProviderGateway {
    pub fn new(providers: Vec<Arc<dyn WeatherProvider>>) -> Self {
        Self { providers }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Fetch one normalized observation for `coordinates`.
    ///
    /// Returns `ProviderUnavailable` only if no provider produced a usable
    /// reading.
    pub async fn fetch(
        &self,
        coordinates: Coordinates,
        timeout: Duration,
    ) -> Result<GatewayFetch, ConditionError> {
        let mut merged: Option<(RawObservation, bool)> = None;
        let mut failures: Vec<ConditionError> = Vec::new();

        for (index, provider) in self.providers.iter().enumerate() {
            let result = match tokio::time::timeout(timeout, provider.fetch(coordinates, timeout))
                .await
            {
                Ok(r) => r,
                Err(_) => Err(ProviderError::Timeout {
                    provider: provider.name().to_string(),
                    timeout_secs: timeout.as_secs_f64(),
                }),
            };

            match result {
                Ok(raw) => {
                    merged = Some(match merged {
                        None => (raw, index > 0),
                        Some((base, from_fallback)) => (base.merge(&raw), from_fallback),
                    });
                    if merged.as_ref().is_some_and(|(m, _)| m.is_complete()) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Gateway: provider {} failed for ({:.4}, {:.4}): {}",
                        provider.name(),
                        coordinates.latitude,
                        coordinates.longitude,
                        e
                    );
                    failures.push(e.into());
                }
            }
        }

        let Some((raw, from_fallback)) = merged else {
            return Err(ConditionError::ProviderUnavailable(summarize(&failures)));
        };

        match Observation::from_raw(raw, from_fallback) {
            Some(observation) => Ok(GatewayFetch {
                observation,
                failures,
            }),
            None => {
                failures.push(ConditionError::ProviderUnavailable(
                    "no provider reported a temperature".to_string(),
                ));
                Err(ConditionError::ProviderUnavailable(summarize(&failures)))
            }
        }
    }
}

fn summarize(failures: &[ConditionError]) -> String {
    if failures.is_empty() {
        return "no providers configured".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
