//! Rock drying model.
//!
//! Estimates how long a climbing surface needs to shed the moisture from
//! recent precipitation. The model is a pure function of the weather inputs
//! and the canopy fraction:
//!
//! - Snow or ice on the ground overrides everything: the estimate is the
//!   indeterminate sentinel and the category is `unknown`.
//! - The base drying rate (mm/h) rises with temperature above freezing and
//!   with wind speed.
//! - Canopy shades the rock and shelters it from wind, so the rate is
//!   multiplied by the exposed fraction `1 - canopy` (floored, so full cover
//!   still dries eventually).
//! - Hours until dry = moisture load / attenuated rate, minus the time that
//!   already passed since the precipitation ended, floored at zero.
//!
//! The output is monotonic: non-decreasing in precipitation and canopy,
//! non-increasing in temperature and wind.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Sentinel for "cannot estimate while snow or ice persists".
pub const SNOW_ICE_SENTINEL_HOURS: f64 = 999.0;

/// Upper bound for a computed (non-sentinel) estimate, so only the snow/ice
/// sentinel ever reaches `SNOW_ICE_SENTINEL_HOURS`.
pub const MAX_ESTIMATE_HOURS: f64 = 720.0;

/// Water freezes here; no evaporative contribution from temperature below it.
const FREEZING_POINT_C: f64 = 0.0;

/// Upper hour bounds of each category (exclusive).
const DRY_BELOW_HOURS: f64 = 1.0;
const NEARLY_DRY_BELOW_HOURS: f64 = 6.0;
const DAMP_BELOW_HOURS: f64 = 24.0;

/// Discretized surface state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DrynessCategory {
    Dry,
    NearlyDry,
    Damp,
    Wet,
    /// Reserved for the snow/ice sentinel.
    Unknown,
}

impl DrynessCategory {
    /// Step function over hours-until-dry. The sentinel maps to `Unknown`;
    /// every finite computed estimate maps to one of the four wetness bands.
    pub fn from_hours(hours: f64) -> Self {
        if hours >= SNOW_ICE_SENTINEL_HOURS || hours.is_nan() {
            DrynessCategory::Unknown
        } else if hours < DRY_BELOW_HOURS {
            DrynessCategory::Dry
        } else if hours < NEARLY_DRY_BELOW_HOURS {
            DrynessCategory::NearlyDry
        } else if hours < DAMP_BELOW_HOURS {
            DrynessCategory::Damp
        } else {
            DrynessCategory::Wet
        }
    }
}

/// Tunable coefficients of the drying-rate function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DryingCoefficients {
    /// Drying that happens even at freezing with no wind (mm/h). Must be > 0.
    pub base_rate_mm_h: f64,
    /// Additional mm/h per °C above freezing.
    pub temperature_mm_h_per_c: f64,
    /// Additional mm/h per km/h of wind.
    pub wind_mm_h_per_kmh: f64,
    /// Exposed fraction never drops below this, even under full canopy.
    pub min_exposure: f64,
}

impl Default for DryingCoefficients {
    fn default() -> Self {
        Self {
            base_rate_mm_h: 0.05,
            temperature_mm_h_per_c: 0.02,
            wind_mm_h_per_kmh: 0.01,
            min_exposure: 0.1,
        }
    }
}

/// Inputs to one drying estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DryingInput {
    /// Precipitation total over the lookback window (mm).
    pub precipitation_mm: f64,
    /// Hours since the precipitation ended; `None` when unknown.
    pub hours_since_precipitation: Option<f64>,
    pub temperature_c: f64,
    pub wind_speed_kmh: f64,
    /// Canopy-cover fraction in [0, 1]; 0 when unknown.
    pub canopy_fraction: f64,
    pub snow_ice: bool,
}

/// Result of one drying estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DryingEstimate {
    pub hours_until_dry: f64,
    pub category: DrynessCategory,
}

impl DryingEstimate {
    pub fn is_indeterminate(&self) -> bool {
        self.hours_until_dry >= SNOW_ICE_SENTINEL_HOURS
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryingModel {
    coefficients: DryingCoefficients,
}

impl DryingModel {
    pub fn new(coefficients: DryingCoefficients) -> Self {
        Self { coefficients }
    }

    /// Unattenuated drying rate in mm/h.
    pub fn base_rate(&self, temperature_c: f64, wind_speed_kmh: f64) -> f64 {
        let c = &self.coefficients;
        let warmth = (temperature_c - FREEZING_POINT_C).max(0.0);
        let wind = wind_speed_kmh.max(0.0);
        c.base_rate_mm_h + c.temperature_mm_h_per_c * warmth + c.wind_mm_h_per_kmh * wind
    }

    /// Drying rate after canopy shading.
    pub fn attenuated_rate(&self, temperature_c: f64, wind_speed_kmh: f64, canopy: f64) -> f64 {
        let exposure = (1.0 - canopy.clamp(0.0, 1.0)).max(self.coefficients.min_exposure);
        self.base_rate(temperature_c, wind_speed_kmh) * exposure
    }

    pub fn estimate(&self, input: &DryingInput) -> DryingEstimate {
        if input.snow_ice {
            return DryingEstimate {
                hours_until_dry: SNOW_ICE_SENTINEL_HOURS,
                category: DrynessCategory::Unknown,
            };
        }

        let load_mm = input.precipitation_mm.max(0.0);
        let rate = self.attenuated_rate(
            input.temperature_c,
            input.wind_speed_kmh,
            input.canopy_fraction,
        );
        let elapsed = input.hours_since_precipitation.unwrap_or(0.0).max(0.0);

        let hours = if load_mm <= 0.0 || rate <= 0.0 {
            0.0
        } else {
            (load_mm / rate - elapsed).clamp(0.0, MAX_ESTIMATE_HOURS)
        };

        DryingEstimate {
            hours_until_dry: hours,
            category: DrynessCategory::from_hours(hours),
        }
    }
}
