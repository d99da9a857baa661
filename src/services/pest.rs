//! Pest (insect) activity risk.
//!
//! Threshold bands on temperature, moisture and season. Insects are dormant
//! in the cold, so anything below `DORMANT_BELOW_C` is `low` regardless of
//! the other signals.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const DORMANT_BELOW_C: f64 = 5.0;

/// (lower bound °C, score). Checked from the top down.
const TEMPERATURE_BANDS: [(f64, i32); 4] = [(27.0, 4), (20.0, 3), (12.0, 2), (5.0, 1)];

const HUMID_AT_PCT: f64 = 75.0;
const ARID_BELOW_PCT: f64 = 35.0;
const RECENT_RAIN_HOURS: f64 = 48.0;

/// Ordered pest risk levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PestRiskLevel {
    Low,
    Moderate,
    High,
    VeryHigh,
    Extreme,
}

impl PestRiskLevel {
    fn from_score(score: i32) -> Self {
        match score.clamp(0, 4) {
            0 => PestRiskLevel::Low,
            1 => PestRiskLevel::Moderate,
            2 => PestRiskLevel::High,
            3 => PestRiskLevel::VeryHigh,
            _ => PestRiskLevel::Extreme,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Season {
    Peak,
    Shoulder,
    Dormant,
}

/// Meteorological season relative to insect activity, flipped for the
/// southern hemisphere.
fn season(at: DateTime<Utc>, latitude: f64) -> Season {
    let month = at.month();
    let (peak, dormant) = if latitude >= 0.0 {
        ([6, 7, 8], [12, 1, 2])
    } else {
        ([12, 1, 2], [6, 7, 8])
    };
    if peak.contains(&month) {
        Season::Peak
    } else if dormant.contains(&month) {
        Season::Dormant
    } else {
        Season::Shoulder
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PestInput {
    pub temperature_c: f64,
    pub humidity_pct: Option<f64>,
    pub precipitation_mm: f64,
    pub hours_since_precipitation: Option<f64>,
    pub at: DateTime<Utc>,
    pub latitude: f64,
}

pub fn assess_pest_risk(input: &PestInput) -> PestRiskLevel {
    if input.temperature_c < DORMANT_BELOW_C {
        return PestRiskLevel::Low;
    }

    let mut score = TEMPERATURE_BANDS
        .iter()
        .find(|(lower, _)| input.temperature_c >= *lower)
        .map(|(_, s)| *s)
        .unwrap_or(0);

    let recent_rain = input.precipitation_mm > 0.0
        && input
            .hours_since_precipitation
            .map_or(true, |h| h <= RECENT_RAIN_HOURS);
    let humid = input.humidity_pct.is_some_and(|h| h >= HUMID_AT_PCT);
    let arid = input.humidity_pct.is_some_and(|h| h < ARID_BELOW_PCT);

    if humid || recent_rain {
        score += 1;
    } else if arid {
        score -= 1;
    }

    match season(input.at, input.latitude) {
        Season::Peak => score += 1,
        Season::Dormant => score -= 1,
        Season::Shoulder => {}
    }

    PestRiskLevel::from_score(score)
}
