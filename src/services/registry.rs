//! File-backed location registry.
//!
//! Reads `locations.json` from the data directory: an array of crags with a
//! stable UUID, a display name and coordinates. The registry is reference
//! data; the condition engine only ever looks locations up by id.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::services::observation::Coordinates;

/// File name of the registry inside the data directory.
pub const REGISTRY_FILE: &str = "locations.json";

/// Errors that can occur while loading the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error reading registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("Registry JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A tracked climbing location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub coordinates: Coordinates,
}

/// Parse registry JSON, dropping entries with invalid coordinates and
/// duplicate ids (first entry wins).
pub fn parse_locations(json: &str) -> Result<Vec<Location>, RegistryError> {
    let raw: Vec<Location> = serde_json::from_str(json)?;
    let mut seen = HashSet::new();
    let mut locations = Vec::with_capacity(raw.len());

    for location in raw {
        if !location.coordinates.is_valid() {
            tracing::warn!(
                "Registry: skipping '{}' ({}): invalid coordinates {:?}",
                location.name,
                location.id,
                location.coordinates
            );
            continue;
        }
        if !seen.insert(location.id) {
            tracing::warn!(
                "Registry: skipping duplicate id {} ('{}')",
                location.id,
                location.name
            );
            continue;
        }
        locations.push(location);
    }

    Ok(locations)
}

/// Load the registry from `<dir>/locations.json`. A missing file is an
/// empty registry, not an error.
pub fn load_locations_from_dir(dir: &Path) -> Result<Vec<Location>, RegistryError> {
    let path = dir.join(REGISTRY_FILE);
    if !path.exists() {
        tracing::warn!("Registry file does not exist: {}", path.display());
        return Ok(Vec::new());
    }
    tracing::info!("Loading locations from {}", path.display());
    let json = std::fs::read_to_string(&path)?;
    let locations = parse_locations(&json)?;
    tracing::info!("  Loaded {} locations", locations.len());
    Ok(locations)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"[
        {
            "id": "6f1c2d4e-8a7b-4c3d-9e2f-1a2b3c4d5e6f",
            "name": "Magic Wood",
            "latitude": 46.5416,
            "longitude": 9.4383,
            "elevation_m": 1050
        },
        {
            "id": "0b9e8d7c-6b5a-4f3e-2d1c-0b9a8f7e6d5c",
            "name": "Fontainebleau - Bas Cuvier",
            "latitude": 48.4469,
            "longitude": 2.6384
        },
        {
            "id": "11111111-2222-4333-8444-555555555555",
            "name": "Broken",
            "latitude": 123.0,
            "longitude": 2.0
        },
        {
            "id": "6f1c2d4e-8a7b-4c3d-9e2f-1a2b3c4d5e6f",
            "name": "Magic Wood (duplicate)",
            "latitude": 46.0,
            "longitude": 9.0
        }
    ]"#;

    #[test]
    fn test_parse_locations_filters_invalid_and_duplicates() {
        let locations = parse_locations(REGISTRY).unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].name, "Magic Wood");
        assert_eq!(locations[0].coordinates.elevation_m, Some(1050.0));
        assert_eq!(locations[1].coordinates.elevation_m, None);
    }

    #[test]
    fn test_parse_locations_rejects_bad_json() {
        assert!(parse_locations("{ not json").is_err());
    }

    #[test]
    fn test_load_missing_dir_is_empty() {
        let dir = std::env::temp_dir().join(format!("crag-registry-missing-{}", Uuid::new_v4()));
        let locations = load_locations_from_dir(&dir).unwrap();
        assert!(locations.is_empty());
    }

    #[test]
    fn test_load_from_dir() {
        let dir = std::env::temp_dir().join(format!("crag-registry-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(REGISTRY_FILE), REGISTRY).unwrap();

        let locations = load_locations_from_dir(&dir).unwrap();
        assert_eq!(locations.len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
