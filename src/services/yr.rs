//! yr.no Locationforecast 2.0 client (fallback provider).
//!
//! Fetches the current conditions from the MET Norway API.
//! See: https://api.met.no/weatherapi/locationforecast/2.0/documentation
//!
//! Locationforecast has no history, so precipitation is only reported when
//! it is falling in the upcoming hour (treated as "raining now"). Otherwise
//! the precipitation fields are left as gaps for the gateway to handle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;

use crate::errors::ProviderError;
use crate::services::gateway::WeatherProvider;
use crate::services::observation::{Coordinates, RawObservation};

pub const YR_API_URL: &str = "https://api.met.no/weatherapi/locationforecast/2.0/complete";

const PROVIDER_NAME: &str = "yr.no";

const MS_TO_KMH: f64 = 3.6;

/// Client for the yr.no Locationforecast API.
#[derive(Debug, Clone)]
pub struct YrClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

// --- yr.no JSON response types ---

#[derive(Debug, Deserialize)]
struct YrResponse {
    properties: YrProperties,
}

#[derive(Debug, Deserialize)]
struct YrProperties {
    timeseries: Vec<YrTimeseries>,
}

#[derive(Debug, Deserialize)]
struct YrTimeseries {
    time: String,
    data: YrData,
}

#[derive(Debug, Deserialize)]
struct YrData {
    instant: YrInstant,
    next_1_hours: Option<YrPeriod>,
    next_6_hours: Option<YrPeriod>,
}

#[derive(Debug, Deserialize)]
struct YrInstant {
    details: YrInstantDetails,
}

#[derive(Debug, Deserialize)]
struct YrInstantDetails {
    air_temperature: Option<f64>,
    wind_speed: Option<f64>,
    relative_humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct YrPeriod {
    summary: Option<YrSummary>,
    details: Option<YrPeriodDetails>,
}

#[derive(Debug, Deserialize)]
struct YrSummary {
    symbol_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YrPeriodDetails {
    precipitation_amount: Option<f64>,
}

impl YrClient {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
        })
    }
}

#[async_trait]
impl WeatherProvider for YrClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch(
        &self,
        coordinates: Coordinates,
        timeout: Duration,
    ) -> Result<RawObservation, ProviderError> {
        // Limit to 4 decimal places per yr.no terms of service
        let mut url = format!(
            "{}?lat={:.4}&lon={:.4}",
            self.base_url, coordinates.latitude, coordinates.longitude
        );
        if let Some(altitude) = coordinates.elevation_m {
            url.push_str(&format!("&altitude={:.0}", altitude));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent).map_err(|e| ProviderError::Transport {
                provider: PROVIDER_NAME.to_string(),
                message: format!("Invalid User-Agent: {}", e),
            })?,
        );

        let response = self
            .client
            .get(&url)
            .headers(headers)
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

        let body: YrResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER_NAME, timeout, e))?;

        extract_current(&body, Utc::now())
    }
}

/// Whether a yr.no symbol code describes frozen precipitation.
fn is_frozen_symbol(symbol_code: &str) -> bool {
    let code = symbol_code.to_lowercase();
    code.contains("snow") || code.contains("sleet")
}

/// Extract the current conditions from a timeseries: the latest entry at or
/// before `now`.
fn extract_current(body: &YrResponse, now: DateTime<Utc>) -> Result<RawObservation, ProviderError> {
    let entries: Vec<_> = body
        .properties
        .timeseries
        .iter()
        .filter_map(|ts| {
            DateTime::parse_from_rfc3339(&ts.time)
                .ok()
                .map(|dt| (ts, dt.with_timezone(&Utc)))
        })
        .collect();

    // Latest entry at or before now; the earliest one if all lie ahead.
    let (entry, observed_at) = entries
        .iter()
        .filter(|(_, dt)| *dt <= now)
        .max_by_key(|(_, dt)| *dt)
        .or_else(|| entries.iter().min_by_key(|(_, dt)| *dt))
        .copied()
        .ok_or_else(|| ProviderError::Malformed {
            provider: PROVIDER_NAME.to_string(),
            message: "yr.no returned empty timeseries".to_string(),
        })?;

    let instant = &entry.data.instant.details;

    // Get period data (prefer next_1_hours, fall back to next_6_hours)
    let period = entry
        .data
        .next_1_hours
        .as_ref()
        .or(entry.data.next_6_hours.as_ref());
    let symbol_code = period
        .and_then(|p| p.summary.as_ref())
        .and_then(|s| s.symbol_code.as_deref())
        .unwrap_or("unknown");
    let precip_mm = period
        .and_then(|p| p.details.as_ref())
        .and_then(|d| d.precipitation_amount)
        .unwrap_or(0.0);

    let mut obs = RawObservation::empty(PROVIDER_NAME, observed_at);
    obs.temperature_c = instant.air_temperature;
    obs.wind_speed_kmh = instant.wind_speed.map(|ms| ms * MS_TO_KMH);
    obs.humidity_pct = instant.relative_humidity;

    let raining = precip_mm > 0.0;
    if raining {
        obs.precipitation_mm = Some(precip_mm);
        obs.hours_since_precipitation = Some(0.0);
    }

    let freezing = instant.air_temperature.is_some_and(|t| t <= 0.0);
    obs.snow_ice = Some(raining && (is_frozen_symbol(symbol_code) || freezing));

    Ok(obs)
}
