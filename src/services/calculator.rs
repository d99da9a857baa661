//! Condition calculator.
//!
//! Composes the drying and pest models into one `ConditionAssessment` per
//! location. Pure: no I/O and no error path. Missing canopy is handled by the
//! caller passing `None`, which means neutral coverage and a
//! `canopy_unknown` label.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::services::canopy::CanopyReading;
use crate::services::drying::{DryingInput, DryingModel, DrynessCategory};
use crate::services::observation::Observation;
use crate::services::pest::{assess_pest_risk, PestInput, PestRiskLevel};
use crate::services::registry::Location;

/// Where the weather behind an assessment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Primary,
    Fallback,
    /// Last-known assessment served because a refresh failed.
    StaleCache,
}

/// Whether the canopy fraction used was measured or defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CanopySource {
    Measured,
    /// Lookup unavailable or disabled; neutral coverage (0) was used.
    CanopyUnknown,
}

/// Climbing conditions for one location at one point in time.
///
/// Replaced wholesale on every refresh, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConditionAssessment {
    pub location_id: Uuid,
    pub computed_at: DateTime<Utc>,
    pub dryness: DrynessCategory,
    /// Hours until the rock is dry. 999 means indeterminate (snow/ice).
    pub hours_until_dry: f64,
    pub pest_risk: PestRiskLevel,
    /// Timestamp of the observation the assessment was derived from.
    pub observed_at: DateTime<Utc>,
    pub data_source: DataSource,
    /// Provider that supplied the observation (e.g. "open-meteo").
    pub provider: String,
    pub canopy_source: CanopySource,
    /// Canopy fraction used in the drying model.
    pub canopy_fraction: f64,
    pub precipitation_mm: f64,
    pub hours_since_precipitation: Option<f64>,
    pub temperature_c: f64,
    pub wind_speed_kmh: f64,
    pub humidity_pct: Option<f64>,
    pub snow_ice: bool,
}

impl ConditionAssessment {
    /// Copy relabelled as served from the stale cache.
    pub fn as_stale(&self) -> Self {
        Self {
            data_source: DataSource::StaleCache,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionCalculator {
    drying: DryingModel,
}

impl ConditionCalculator {
    pub fn new(drying: DryingModel) -> Self {
        Self { drying }
    }

    pub fn assess(
        &self,
        location: &Location,
        observation: &Observation,
        canopy: Option<&CanopyReading>,
    ) -> ConditionAssessment {
        self.assess_at(location, observation, canopy, Utc::now())
    }

    /// Same as `assess` with an explicit computed-at time.
    pub fn assess_at(
        &self,
        location: &Location,
        observation: &Observation,
        canopy: Option<&CanopyReading>,
        computed_at: DateTime<Utc>,
    ) -> ConditionAssessment {
        let (canopy_fraction, canopy_source) = match canopy {
            Some(reading) => (reading.fraction, CanopySource::Measured),
            None => (0.0, CanopySource::CanopyUnknown),
        };

        let drying = self.drying.estimate(&DryingInput {
            precipitation_mm: observation.precipitation_mm,
            hours_since_precipitation: observation.hours_since_precipitation,
            temperature_c: observation.temperature_c,
            wind_speed_kmh: observation.wind_speed_kmh,
            canopy_fraction,
            snow_ice: observation.snow_ice,
        });
        if drying.is_indeterminate() {
            tracing::debug!(
                "Calculator: snow/ice reported at {}, drying time indeterminate",
                location.name
            );
        }

        let pest_risk = assess_pest_risk(&PestInput {
            temperature_c: observation.temperature_c,
            humidity_pct: observation.humidity_pct,
            precipitation_mm: observation.precipitation_mm,
            hours_since_precipitation: observation.hours_since_precipitation,
            at: observation.observed_at,
            latitude: location.coordinates.latitude,
        });

        ConditionAssessment {
            location_id: location.id,
            computed_at,
            dryness: drying.category,
            hours_until_dry: drying.hours_until_dry,
            pest_risk,
            observed_at: observation.observed_at,
            data_source: if observation.from_fallback {
                DataSource::Fallback
            } else {
                DataSource::Primary
            },
            provider: observation.provider.clone(),
            canopy_source,
            canopy_fraction,
            precipitation_mm: observation.precipitation_mm,
            hours_since_precipitation: observation.hours_since_precipitation,
            temperature_c: observation.temperature_c,
            wind_speed_kmh: observation.wind_speed_kmh,
            humidity_pct: observation.humidity_pct,
            snow_ice: observation.snow_ice,
        }
    }
}
