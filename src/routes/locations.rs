use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::AppState;
use crate::services::conditions::AssessmentLookup;
use crate::services::drying::DrynessCategory;

/// Location summary for the list endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct LocationListItem {
    pub id: Uuid,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: Option<f64>,
    /// Dryness from the latest assessment, if any
    pub dryness: Option<DrynessCategory>,
    pub computed_at: Option<DateTime<Utc>>,
}

/// List all tracked locations with their latest dryness category.
#[utoipa::path(
    get,
    path = "/api/v1/locations",
    tag = "Locations",
    responses(
        (status = 200, description = "List of tracked locations", body = Vec<LocationListItem>),
    )
)]
pub async fn list_locations(State(state): State<AppState>) -> Json<Vec<LocationListItem>> {
    let locations = state.conditions.locations().await;
    let mut items = Vec::with_capacity(locations.len());

    for location in locations.iter() {
        let latest = match state.conditions.get_assessment(location.id).await {
            Ok(AssessmentLookup::Available { assessment, .. }) => Some(assessment),
            _ => None,
        };
        items.push(LocationListItem {
            id: location.id,
            name: location.name.clone(),
            latitude: location.coordinates.latitude,
            longitude: location.coordinates.longitude,
            elevation_m: location.coordinates.elevation_m,
            dryness: latest.as_ref().map(|a| a.dryness),
            computed_at: latest.as_ref().map(|a| a.computed_at),
        });
    }

    Json(items)
}
