//! Tree-canopy coverage lookup.
//!
//! Canopy cover changes on a seasonal timescale, so readings are cached per
//! location for much longer than weather (`CANOPY_VALIDITY_HOURS`). The
//! external service is rate limited; the client spaces its requests and
//! honours `Retry-After` on HTTP 429. Without credentials the lookup is
//! disabled and every assessment uses neutral coverage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::CanopyError;
use crate::services::observation::Coordinates;
use crate::services::registry::Location;

/// Retry-After fallback when a 429 carries no usable header (seconds).
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// A canopy-cover reading for one location. `fraction` is always in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CanopyReading {
    pub location_id: Uuid,
    pub fraction: f64,
    pub fetched_at: DateTime<Utc>,
}

impl CanopyReading {
    pub fn new(location_id: Uuid, fraction: f64, fetched_at: DateTime<Utc>) -> Self {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            location_id,
            fraction,
            fetched_at,
        }
    }
}

/// Source of canopy coverage fractions.
#[async_trait]
pub trait CanopyLookup: Send + Sync {
    async fn get_coverage(
        &self,
        coordinates: Coordinates,
        timeout: Duration,
    ) -> Result<f64, CanopyError>;
}

#[derive(Debug, Deserialize)]
struct CanopyResponse {
    tree_canopy_cover_pct: Option<f64>,
}

#[derive(Debug, Default)]
struct RateGate {
    last_request: Option<Instant>,
    blocked_until: Option<Instant>,
}

/// HTTP client for the canopy coverage service.
pub struct CanopyClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    min_spacing: Duration,
    gate: Mutex<RateGate>,
}

impl CanopyClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        min_spacing: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            min_spacing,
            gate: Mutex::new(RateGate::default()),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Wait for our turn under the client-side spacing, or refuse while a
    /// server-imposed Retry-After window is open.
    async fn acquire_slot(&self) -> Result<(), CanopyError> {
        let mut gate = self.gate.lock().await;
        let now = Instant::now();
        if let Some(until) = gate.blocked_until {
            if now < until {
                return Err(CanopyError::RateLimited {
                    retry_after_secs: (until - now).as_secs().max(1),
                });
            }
            gate.blocked_until = None;
        }
        if let Some(last) = gate.last_request {
            let ready = last + self.min_spacing;
            if ready > now {
                tokio::time::sleep_until(ready).await;
            }
        }
        gate.last_request = Some(Instant::now());
        Ok(())
    }

    async fn block_for(&self, secs: u64) {
        let mut gate = self.gate.lock().await;
        gate.blocked_until = Some(Instant::now() + Duration::from_secs(secs));
    }
}

#[async_trait]
impl CanopyLookup for CanopyClient {
    async fn get_coverage(
        &self,
        coordinates: Coordinates,
        timeout: Duration,
    ) -> Result<f64, CanopyError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(CanopyError::Disabled);
        };

        // The spacing wait counts against the caller's bound.
        tokio::time::timeout(timeout, self.fetch_coverage(api_key, coordinates, timeout))
            .await
            .map_err(|_| CanopyError::Timeout)?
    }
}

impl CanopyClient {
    async fn fetch_coverage(
        &self,
        api_key: &str,
        coordinates: Coordinates,
        timeout: Duration,
    ) -> Result<f64, CanopyError> {
        self.acquire_slot().await?;

        let url = format!(
            "{}?lat={:.5}&lon={:.5}",
            self.base_url, coordinates.latitude, coordinates.longitude
        );
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", api_key))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CanopyError::Timeout
                } else {
                    CanopyError::Transport(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            self.block_for(retry_after_secs).await;
            return Err(CanopyError::RateLimited { retry_after_secs });
        }

        if !response.status().is_success() {
            return Err(CanopyError::Status(response.status().as_u16()));
        }

        let body: CanopyResponse = response
            .json()
            .await
            .map_err(|e| CanopyError::Malformed(e.to_string()))?;

        let pct = body
            .tree_canopy_cover_pct
            .filter(|p| p.is_finite())
            .ok_or_else(|| CanopyError::Malformed("missing tree_canopy_cover_pct".to_string()))?;

        Ok((pct / 100.0).clamp(0.0, 1.0))
    }
}

/// Per-location canopy readings in front of a `CanopyLookup`.
pub struct CanopyService {
    lookup: Arc<dyn CanopyLookup>,
    readings: RwLock<HashMap<Uuid, CanopyReading>>,
    validity: chrono::Duration,
    timeout: Duration,
}

impl CanopyService {
    pub fn new(
        lookup: Arc<dyn CanopyLookup>,
        validity: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            lookup,
            readings: RwLock::new(HashMap::new()),
            validity,
            timeout,
        }
    }

    /// Canopy reading for a location: cached if still valid, otherwise a
    /// fresh lookup. If the lookup fails, an expired reading is reused
    /// before giving up.
    pub async fn reading_for(&self, location: &Location) -> Result<CanopyReading, CanopyError> {
        let cached = self.readings.read().await.get(&location.id).copied();
        if let Some(reading) = cached {
            if Utc::now() - reading.fetched_at < self.validity {
                return Ok(reading);
            }
        }

        match self
            .lookup
            .get_coverage(location.coordinates, self.timeout)
            .await
        {
            Ok(fraction) => {
                let reading = CanopyReading::new(location.id, fraction, Utc::now());
                self.readings.write().await.insert(location.id, reading);
                Ok(reading)
            }
            Err(e) => match cached {
                Some(reading) => {
                    tracing::debug!(
                        "Canopy: lookup for {} failed ({}), reusing reading from {}",
                        location.id,
                        e,
                        reading.fetched_at
                    );
                    Ok(reading)
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// In-memory canopy lookup for tests across the crate.
    pub(crate) struct FakeCanopy {
        pub result: Result<f64, CanopyError>,
        /// Returned from the second call on, when set.
        pub later: Option<Result<f64, CanopyError>>,
        pub calls: AtomicUsize,
    }

    impl FakeCanopy {
        pub(crate) fn fixed(fraction: f64) -> Self {
            Self {
                result: Ok(fraction),
                later: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn rate_limited() -> Self {
            Self {
                result: Err(CanopyError::RateLimited {
                    retry_after_secs: 60,
                }),
                later: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn then(mut self, later: Result<f64, CanopyError>) -> Self {
            self.later = Some(later);
            self
        }

        pub(crate) fn disabled() -> Self {
            Self {
                result: Err(CanopyError::Disabled),
                later: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CanopyLookup for FakeCanopy {
        async fn get_coverage(
            &self,
            _coordinates: Coordinates,
            _timeout: Duration,
        ) -> Result<f64, CanopyError> {
            let previous = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.later {
                Some(later) if previous > 0 => later.clone(),
                _ => self.result.clone(),
            }
        }
    }

    fn location() -> Location {
        Location {
            id: Uuid::new_v4(),
            name: "Magic Wood".to_string(),
            coordinates: Coordinates::new(46.5416, 9.4383),
        }
    }

    #[test]
    fn test_reading_is_clamped() {
        let id = Uuid::new_v4();
        assert_eq!(CanopyReading::new(id, 1.7, Utc::now()).fraction, 1.0);
        assert_eq!(CanopyReading::new(id, -0.2, Utc::now()).fraction, 0.0);
        assert_eq!(CanopyReading::new(id, f64::NAN, Utc::now()).fraction, 0.0);
    }

    #[tokio::test]
    async fn test_service_caches_within_validity() {
        let fake = Arc::new(FakeCanopy::fixed(0.4));
        let service = CanopyService::new(
            fake.clone(),
            chrono::Duration::hours(720),
            Duration::from_secs(1),
        );
        let loc = location();

        let first = service.reading_for(&loc).await.unwrap();
        let second = service.reading_for(&loc).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fraction, 0.4);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_reuses_expired_reading_when_lookup_fails() {
        let fake = Arc::new(FakeCanopy::fixed(0.3).then(Err(CanopyError::Timeout)));
        let service = CanopyService::new(
            fake.clone(),
            chrono::Duration::zero(),
            Duration::from_secs(1),
        );
        let loc = location();

        let first = service.reading_for(&loc).await.unwrap();
        let second = service.reading_for(&loc).await.unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2, "expired reading triggers a lookup");
        assert_eq!(second, first);
        assert_eq!(second.fraction, 0.3);
    }

    #[tokio::test]
    async fn test_service_failure_without_reading_is_error() {
        let service = CanopyService::new(
            Arc::new(FakeCanopy::rate_limited()),
            chrono::Duration::hours(720),
            Duration::from_secs(1),
        );
        let result = service.reading_for(&location()).await;
        assert!(matches!(result, Err(CanopyError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_service_disabled_is_error() {
        let service = CanopyService::new(
            Arc::new(FakeCanopy::disabled()),
            chrono::Duration::hours(720),
            Duration::from_secs(1),
        );
        let result = service.reading_for(&location()).await;
        assert!(matches!(result, Err(CanopyError::Disabled)));
    }

    #[tokio::test]
    async fn test_client_without_key_is_disabled() {
        let client = CanopyClient::new("http://localhost:1", None, Duration::ZERO).unwrap();
        assert!(!client.is_enabled());
        let result = client
            .get_coverage(Coordinates::new(46.5, 9.4), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(CanopyError::Disabled)));
    }

    #[tokio::test]
    async fn test_client_converts_percent_to_fraction() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer secret"))
            .and(query_param("lat", "46.54160"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "tree_canopy_cover_pct": 62.5 })),
            )
            .mount(&server)
            .await;

        let client =
            CanopyClient::new(&server.uri(), Some("secret".to_string()), Duration::ZERO).unwrap();
        let fraction = client
            .get_coverage(Coordinates::new(46.5416, 9.4383), Duration::from_secs(5))
            .await
            .unwrap();
        assert!((fraction - 0.625).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_client_honours_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            CanopyClient::new(&server.uri(), Some("secret".to_string()), Duration::ZERO).unwrap();
        let coords = Coordinates::new(46.5, 9.4);

        let first = client.get_coverage(coords, Duration::from_secs(5)).await;
        assert!(matches!(
            first,
            Err(CanopyError::RateLimited {
                retry_after_secs: 120
            })
        ));

        // Second call is refused locally without reaching the server.
        let second = client.get_coverage(coords, Duration::from_secs(5)).await;
        assert!(matches!(second, Err(CanopyError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_client_spacing_wait_respects_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "tree_canopy_cover_pct": 10.0 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = CanopyClient::new(
            &server.uri(),
            Some("secret".to_string()),
            Duration::from_millis(1100),
        )
        .unwrap();
        let coords = Coordinates::new(46.5, 9.4);
        client
            .get_coverage(coords, Duration::from_secs(5))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let second = client.get_coverage(coords, Duration::from_millis(200)).await;
        assert!(matches!(second, Err(CanopyError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_client_missing_field_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client =
            CanopyClient::new(&server.uri(), Some("secret".to_string()), Duration::ZERO).unwrap();
        let result = client
            .get_coverage(Coordinates::new(46.5, 9.4), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(CanopyError::Malformed(_))));
    }
}
