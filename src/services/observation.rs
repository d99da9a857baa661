//! Provider-neutral weather observation shapes.
//!
//! Each provider client normalizes its response into a `RawObservation`,
//! where every metric is optional. The gateway folds one or more raw readings
//! into a complete `Observation`, which is what the condition models consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Geographic position of a location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation above sea level in metres, when the registry knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation_m: Option<f64>,
}

impl Coordinates {
    #[cfg(test)]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation_m: None,
        }
    }

    /// Whether the coordinates are finite and inside WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude.abs() <= 90.0
            && self.longitude.abs() <= 180.0
            && self.elevation_m.map_or(true, f64::is_finite)
    }
}

/// A single provider's reading. Any metric the provider could not supply is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub provider: String,
    pub observed_at: DateTime<Utc>,
    /// Precipitation total over the lookback window (mm).
    pub precipitation_mm: Option<f64>,
    /// Hours since precipitation last ended. `Some(0.0)` means it is raining now.
    pub hours_since_precipitation: Option<f64>,
    pub temperature_c: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub snow_ice: Option<bool>,
}

impl RawObservation {
    pub fn empty(provider: &str, observed_at: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_string(),
            observed_at,
            precipitation_mm: None,
            hours_since_precipitation: None,
            temperature_c: None,
            wind_speed_kmh: None,
            humidity_pct: None,
            snow_ice: None,
        }
    }

    /// True when every metric the models need is present.
    pub fn is_complete(&self) -> bool {
        self.precipitation_mm.is_some()
            && self.temperature_c.is_some()
            && self.wind_speed_kmh.is_some()
            && self.humidity_pct.is_some()
            && self.snow_ice.is_some()
    }

    /// Fill gaps in `self` from `other`. Where both readings carry a value,
    /// the more recent reading wins, except for precipitation (see below).
    /// The provider label stays with `self`.
    pub fn merge(self, other: &RawObservation) -> RawObservation {
        let other_newer = other.observed_at > self.observed_at;
        let pick = |mine: Option<f64>, theirs: Option<f64>| match (mine, theirs) {
            (Some(m), Some(t)) => Some(if other_newer { t } else { m }),
            (m, t) => m.or(t),
        };
        let snow_ice = match (self.snow_ice, other.snow_ice) {
            (Some(m), Some(t)) => Some(if other_newer { t } else { m }),
            (m, t) => m.or(t),
        };

        // Amounts from different providers cover different windows (lookback
        // total vs. next hour), so the larger one is kept. Recency takes the
        // latest reported rain.
        let (precipitation_mm, hours_since_precipitation) =
            match (self.precipitation_mm, other.precipitation_mm) {
                (Some(m), Some(t)) => (
                    Some(m.max(t)),
                    match (self.hours_since_precipitation, other.hours_since_precipitation) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    },
                ),
                (None, Some(_)) => (other.precipitation_mm, other.hours_since_precipitation),
                _ => (self.precipitation_mm, self.hours_since_precipitation),
            };

        RawObservation {
            provider: self.provider,
            observed_at: self.observed_at.max(other.observed_at),
            precipitation_mm,
            hours_since_precipitation,
            temperature_c: pick(self.temperature_c, other.temperature_c),
            wind_speed_kmh: pick(self.wind_speed_kmh, other.wind_speed_kmh),
            humidity_pct: pick(self.humidity_pct, other.humidity_pct),
            snow_ice,
        }
    }
}

/// A normalized observation, ready for the condition models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Provider that answered first (primary, or the first fallback that succeeded).
    pub provider: String,
    /// Whether that provider was a fallback rather than the primary.
    pub from_fallback: bool,
    pub observed_at: DateTime<Utc>,
    pub precipitation_mm: f64,
    pub hours_since_precipitation: Option<f64>,
    pub temperature_c: f64,
    pub wind_speed_kmh: f64,
    pub humidity_pct: Option<f64>,
    pub snow_ice: bool,
}

impl Observation {
    /// Normalize a merged raw reading. Temperature is the only metric without
    /// a neutral default; a reading without it yields `None`.
    pub fn from_raw(raw: RawObservation, from_fallback: bool) -> Option<Self> {
        let temperature_c = raw.temperature_c.filter(|t| t.is_finite())?;
        let precipitation_mm = raw
            .precipitation_mm
            .filter(|p| p.is_finite())
            .unwrap_or(0.0)
            .max(0.0);
        let hours_since_precipitation = if precipitation_mm > 0.0 {
            raw.hours_since_precipitation
                .filter(|h| h.is_finite())
                .map(|h| h.max(0.0))
        } else {
            None
        };

        Some(Self {
            provider: raw.provider,
            from_fallback,
            observed_at: raw.observed_at,
            precipitation_mm,
            hours_since_precipitation,
            temperature_c,
            wind_speed_kmh: raw
                .wind_speed_kmh
                .filter(|w| w.is_finite())
                .unwrap_or(0.0)
                .max(0.0),
            humidity_pct: raw
                .humidity_pct
                .filter(|h| h.is_finite())
                .map(|h| h.clamp(0.0, 100.0)),
            snow_ice: raw.snow_ice.unwrap_or(false),
        })
    }
}
