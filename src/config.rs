use std::str::FromStr;
use std::time::Duration;

use crate::services::open_meteo::OPEN_METEO_API_URL;
use crate::services::yr::YR_API_URL;

const DEFAULT_CANOPY_API_URL: &str = "https://canopy.example.org/v1/coverage";
const DEFAULT_YR_USER_AGENT: &str =
    "CragConditions/0.1 github.com/crag-conditions/crag-conditions-api";
/// Ten years; longer windows are clamped.
const MAX_CANOPY_VALIDITY_HOURS: u64 = 87_600;
const MAX_FRESHNESS_SECS: u64 = MAX_CANOPY_VALIDITY_HOURS * 3600;

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Directory containing `locations.json`.
    pub data_dir: String,
    /// Postgres URL for snapshot persistence. Unset disables persistence.
    pub database_url: Option<String>,
    pub open_meteo_base_url: String,
    pub yr_base_url: String,
    pub yr_user_agent: String,
    pub canopy_api_url: String,
    /// Unset disables the canopy lookup (neutral coverage everywhere).
    pub canopy_api_key: Option<String>,
    pub refresh_interval: Duration,
    /// Age after which a cached assessment is reported as stale.
    pub freshness: Duration,
    pub provider_timeout: Duration,
    pub canopy_timeout: Duration,
    pub force_refresh_timeout: Duration,
    pub refresh_concurrency: usize,
    /// How long a canopy reading is used before it is looked up again.
    pub canopy_validity: Duration,
    /// Minimum spacing between canopy lookups.
    pub canopy_min_spacing: Duration,
    /// Precipitation history window requested from the primary provider.
    pub lookback_hours: u32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_or("PORT", 8080),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            database_url: non_empty_var("DATABASE_URL"),
            open_meteo_base_url: std::env::var("OPEN_METEO_BASE_URL")
                .unwrap_or_else(|_| OPEN_METEO_API_URL.to_string()),
            yr_base_url: std::env::var("YR_BASE_URL").unwrap_or_else(|_| YR_API_URL.to_string()),
            yr_user_agent: std::env::var("YR_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_YR_USER_AGENT.to_string()),
            canopy_api_url: std::env::var("CANOPY_API_URL")
                .unwrap_or_else(|_| DEFAULT_CANOPY_API_URL.to_string()),
            canopy_api_key: non_empty_var("CANOPY_API_KEY"),
            refresh_interval: Duration::from_secs(env_or("REFRESH_INTERVAL_SECS", 900u64).max(1)),
            freshness: Duration::from_secs(
                env_or("FRESHNESS_SECS", 1800u64).min(MAX_FRESHNESS_SECS),
            ),
            provider_timeout: Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 10)),
            canopy_timeout: Duration::from_secs(env_or("CANOPY_TIMEOUT_SECS", 10)),
            force_refresh_timeout: Duration::from_secs(env_or("FORCE_REFRESH_TIMEOUT_SECS", 30)),
            refresh_concurrency: env_or("REFRESH_CONCURRENCY", 4usize).max(1),
            canopy_validity: Duration::from_secs(
                env_or("CANOPY_VALIDITY_HOURS", 720u64).min(MAX_CANOPY_VALIDITY_HOURS) * 3600,
            ),
            canopy_min_spacing: Duration::from_millis(env_or("CANOPY_MIN_SPACING_MS", 1100)),
            lookback_hours: env_or("LOOKBACK_HOURS", 48),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse `key` from the environment, falling back to `default` when unset or
/// unparseable.
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {}: '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names so parallel tests don't race.

    #[test]
    fn test_env_or_default_when_unset() {
        assert_eq!(env_or("CRAG_TEST_UNSET_VALUE", 42u64), 42);
    }

    #[test]
    fn test_env_or_parses_and_falls_back() {
        unsafe {
            std::env::set_var("CRAG_TEST_GOOD_VALUE", " 120 ");
            std::env::set_var("CRAG_TEST_BAD_VALUE", "fifteen");
        }
        assert_eq!(env_or("CRAG_TEST_GOOD_VALUE", 900u64), 120);
        assert_eq!(env_or("CRAG_TEST_BAD_VALUE", 900u64), 900);
    }

    #[test]
    fn test_non_empty_var() {
        unsafe {
            std::env::set_var("CRAG_TEST_EMPTY_KEY", "  ");
            std::env::set_var("CRAG_TEST_SET_KEY", "secret");
        }
        assert_eq!(non_empty_var("CRAG_TEST_EMPTY_KEY"), None);
        assert_eq!(non_empty_var("CRAG_TEST_SET_KEY"), Some("secret".to_string()));
        assert_eq!(non_empty_var("CRAG_TEST_MISSING_KEY"), None);
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::from_env();
        assert!(config.refresh_concurrency >= 1);
        assert!(config.refresh_interval >= Duration::from_secs(1));
        assert!(!config.yr_user_agent.is_empty());
    }

    #[test]
    fn test_windows_are_clamped() {
        unsafe {
            std::env::set_var("CANOPY_VALIDITY_HOURS", "9223372036854775807");
            std::env::set_var("FRESHNESS_SECS", "18446744073709551615");
        }
        let config = AppConfig::from_env();
        assert_eq!(
            config.canopy_validity,
            Duration::from_secs(MAX_CANOPY_VALIDITY_HOURS * 3600)
        );
        assert_eq!(config.freshness, Duration::from_secs(MAX_FRESHNESS_SECS));
        assert!(chrono::Duration::from_std(config.canopy_validity).is_ok());
        assert!(chrono::Duration::from_std(config.freshness).is_ok());
    }
}
