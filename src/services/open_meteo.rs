//! Open-Meteo forecast API client (primary provider).
//!
//! One request returns the current conditions plus hourly history for the
//! lookback window (`past_days`), which is what the drying model needs.
//! See: https://open-meteo.com/en/docs

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::errors::ProviderError;
use crate::services::gateway::WeatherProvider;
use crate::services::observation::{Coordinates, RawObservation};

pub const OPEN_METEO_API_URL: &str = "https://api.open-meteo.com/v1/forecast";

const PROVIDER_NAME: &str = "open-meteo";

/// Hourly precipitation below this counts as dry (mm).
const WET_HOUR_MIN_MM: f64 = 0.1;

/// Freezing precipitation this recent is treated as ice on the rock.
const ICING_WINDOW_HOURS: f64 = 6.0;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
    lookback_hours: u32,
}

// --- Open-Meteo JSON response types ---

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    current: Option<OpenMeteoCurrent>,
    hourly: Option<OpenMeteoHourly>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoCurrent {
    time: String,
    temperature_2m: Option<f64>,
    relative_humidity_2m: Option<f64>,
    wind_speed_10m: Option<f64>,
    precipitation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    #[serde(default)]
    precipitation: Vec<Option<f64>>,
    #[serde(default)]
    snow_depth: Vec<Option<f64>>,
}

impl OpenMeteoClient {
    pub fn new(base_url: &str, lookback_hours: u32) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            lookback_hours,
        })
    }

    fn past_days(&self) -> u32 {
        self.lookback_hours.div_ceil(24).max(1)
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch(
        &self,
        coordinates: Coordinates,
        timeout: Duration,
    ) -> Result<RawObservation, ProviderError> {
        let url = format!(
            "{}?latitude={:.4}&longitude={:.4}\
             &current=temperature_2m,relative_humidity_2m,wind_speed_10m,precipitation\
             &hourly=precipitation,snow_depth\
             &past_days={}&forecast_days=1&wind_speed_unit=kmh&timezone=GMT",
            self.base_url,
            coordinates.latitude,
            coordinates.longitude,
            self.past_days()
        );

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER_NAME, timeout, e))?;

        if !response.status().is_success() {
            return Err(ProviderError::Status {
                provider: PROVIDER_NAME.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body: OpenMeteoResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER_NAME, timeout, e))?;

        normalize(&body, self.lookback_hours, Utc::now())
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

fn hours_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    ((later - earlier).num_seconds() as f64 / 3600.0).max(0.0)
}

/// Fold an Open-Meteo response into a raw observation.
///
/// Pure function: `now` is only used when the response lacks a current block.
fn normalize(
    body: &OpenMeteoResponse,
    lookback_hours: u32,
    now: DateTime<Utc>,
) -> Result<RawObservation, ProviderError> {
    let current = body.current.as_ref().ok_or_else(|| ProviderError::Malformed {
        provider: PROVIDER_NAME.to_string(),
        message: "missing current block".to_string(),
    })?;

    let observed_at = parse_time(&current.time).unwrap_or(now);
    let window_start = observed_at - ChronoDuration::hours(i64::from(lookback_hours));

    let mut obs = RawObservation::empty(PROVIDER_NAME, observed_at);
    obs.temperature_c = current.temperature_2m;
    obs.humidity_pct = current.relative_humidity_2m;
    obs.wind_speed_kmh = current.wind_speed_10m;

    let mut snow_depth_m: Option<f64> = None;
    if let Some(hourly) = &body.hourly {
        let mut total_mm = 0.0;
        let mut last_wet: Option<DateTime<Utc>> = None;

        for (i, time) in hourly.time.iter().enumerate() {
            let Some(t) = parse_time(time) else {
                continue;
            };
            if t <= window_start || t > observed_at {
                continue;
            }
            let mm = hourly.precipitation.get(i).copied().flatten().unwrap_or(0.0);
            total_mm += mm.max(0.0);
            if mm >= WET_HOUR_MIN_MM {
                last_wet = Some(t);
            }
            if let Some(depth) = hourly.snow_depth.get(i).copied().flatten() {
                snow_depth_m = Some(depth);
            }
        }

        obs.precipitation_mm = Some(total_mm);
        obs.hours_since_precipitation = last_wet.map(|t| hours_between(observed_at, t));
    }

    if current.precipitation.unwrap_or(0.0) >= WET_HOUR_MIN_MM {
        obs.hours_since_precipitation = Some(0.0);
        obs.precipitation_mm = Some(
            obs.precipitation_mm
                .unwrap_or(0.0)
                .max(current.precipitation.unwrap_or(0.0)),
        );
    }

    let icing = matches!(
        (obs.temperature_c, obs.hours_since_precipitation),
        (Some(t), Some(h)) if t <= 0.0 && h <= ICING_WINDOW_HOURS
    );
    obs.snow_ice = Some(snow_depth_m.is_some_and(|d| d > 0.0) || icing);

    Ok(obs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_json(current_precip: f64, temp: f64, snow_depth: f64) -> serde_json::Value {
        serde_json::json!({
            "latitude": 46.54,
            "longitude": 9.44,
            "current": {
                "time": "2026-05-01T12:00",
                "interval": 900,
                "temperature_2m": temp,
                "relative_humidity_2m": 64.0,
                "wind_speed_10m": 7.2,
                "precipitation": current_precip
            },
            "hourly": {
                "time": [
                    "2026-04-29T11:00",
                    "2026-04-30T08:00",
                    "2026-05-01T07:00",
                    "2026-05-01T08:00",
                    "2026-05-01T12:00",
                    "2026-05-01T15:00"
                ],
                "precipitation": [9.0, 2.5, 1.0, 0.05, 0.0, 4.0],
                "snow_depth": [0.0, 0.0, 0.0, 0.0, snow_depth, snow_depth]
            }
        })
    }

    fn parse(json: serde_json::Value) -> OpenMeteoResponse {
        serde_json::from_value(json).unwrap()
    }

    fn now() -> DateTime<Utc> {
        "2026-05-01T12:05:00Z".parse::<DateTime<Utc>>().unwrap()
    }

    #[test]
    fn test_normalize_sums_lookback_window() {
        let obs = normalize(&parse(sample_json(0.0, 14.0, 0.0)), 48, now()).unwrap();
        // 2026-04-29T11:00 is outside the 48h window, 15:00 is in the future.
        assert!((obs.precipitation_mm.unwrap() - 3.55).abs() < 1e-9);
        // Last hour with >= 0.1mm is 07:00, five hours before 12:00.
        assert_eq!(obs.hours_since_precipitation, Some(5.0));
        assert_eq!(obs.temperature_c, Some(14.0));
        assert_eq!(obs.wind_speed_kmh, Some(7.2));
        assert_eq!(obs.humidity_pct, Some(64.0));
        assert_eq!(obs.snow_ice, Some(false));
        assert_eq!(
            obs.observed_at,
            "2026-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_normalize_raining_now() {
        let obs = normalize(&parse(sample_json(0.8, 14.0, 0.0)), 48, now()).unwrap();
        assert_eq!(obs.hours_since_precipitation, Some(0.0));
    }

    #[test]
    fn test_normalize_snow_depth_sets_snow_ice() {
        let obs = normalize(&parse(sample_json(0.0, 4.0, 0.12)), 48, now()).unwrap();
        assert_eq!(obs.snow_ice, Some(true));
    }

    #[test]
    fn test_normalize_freezing_recent_precipitation_is_ice() {
        let obs = normalize(&parse(sample_json(0.0, -1.5, 0.0)), 48, now()).unwrap();
        assert_eq!(obs.snow_ice, Some(true));
    }

    #[test]
    fn test_normalize_without_current_is_malformed() {
        let body = parse(serde_json::json!({ "hourly": { "time": [] } }));
        assert!(matches!(
            normalize(&body, 48, now()),
            Err(ProviderError::Malformed { .. })
        ));
    }

    #[test]
    fn test_past_days_rounds_up() {
        assert_eq!(OpenMeteoClient::new(OPEN_METEO_API_URL, 48).unwrap().past_days(), 2);
        assert_eq!(OpenMeteoClient::new(OPEN_METEO_API_URL, 49).unwrap().past_days(), 3);
        assert_eq!(OpenMeteoClient::new(OPEN_METEO_API_URL, 0).unwrap().past_days(), 1);
    }

    #[tokio::test]
    async fn test_fetch_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("past_days", "2"))
            .and(query_param("wind_speed_unit", "kmh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_json(0.0, 18.0, 0.0)))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&format!("{}/v1/forecast", server.uri()), 48).unwrap();
        let obs = client
            .fetch(Coordinates::new(46.54, 9.44), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(obs.provider, "open-meteo");
        assert_eq!(obs.temperature_c, Some(18.0));
    }

    #[tokio::test]
    async fn test_fetch_maps_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), 48).unwrap();
        let err = client
            .fetch(Coordinates::new(46.54, 9.44), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(sample_json(0.0, 18.0, 0.0))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), 48).unwrap();
        let err = client
            .fetch(Coordinates::new(46.54, 9.44), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }
}
