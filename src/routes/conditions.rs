//! Condition HTTP endpoints.
//!
//! - GET  /api/v1/conditions/:location_id
//! - POST /api/v1/conditions/:location_id/refresh

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::AppState;
use crate::errors::{AppError, ErrorResponse};
use crate::services::calculator::{ConditionAssessment, DataSource};
use crate::services::conditions::AssessmentLookup;

/// Response header set when the body is older than the freshness threshold
/// or was served from the stale cache after a failed refresh.
pub const STALE_HEADER: &str = "X-Conditions-Stale";

/// Condition lookup result for one location.
#[derive(Debug, Serialize, ToSchema)]
pub struct ConditionsResponse {
    pub location_id: Uuid,
    /// false when the location has never been refreshed successfully
    pub available: bool,
    /// Seconds since the assessment was computed
    pub age_secs: Option<i64>,
    /// true when older than the freshness threshold or served after a failed refresh
    pub stale: bool,
    /// Age in seconds after which an assessment counts as stale
    pub freshness_secs: i64,
    /// Number of assessments stored for this location so far
    pub sequence: Option<u64>,
    /// true while a refresh for this location is running
    pub refreshing: bool,
    pub assessment: Option<ConditionAssessment>,
}

fn stale_headers(stale: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if stale {
        headers.insert(STALE_HEADER, HeaderValue::from_static("true"));
    }
    headers
}

/// Get the current conditions for a location.
///
/// Served from the in-memory cache only; never triggers an upstream fetch.
/// A known location without data returns 200 with `available: false`.
#[utoipa::path(
    get,
    path = "/api/v1/conditions/{location_id}",
    tag = "Conditions",
    params(
        ("location_id" = Uuid, Path, description = "Location UUID"),
    ),
    responses(
        (status = 200, description = "Latest assessment for the location", body = ConditionsResponse,
         headers(
             ("X-Conditions-Stale" = String, description = "Set to 'true' when the assessment is stale")
         )),
        (status = 404, description = "Unknown location", body = ErrorResponse),
    )
)]
pub async fn get_conditions(
    State(state): State<AppState>,
    Path(location_id): Path<Uuid>,
) -> Result<(HeaderMap, Json<ConditionsResponse>), AppError> {
    let freshness_secs = state.conditions.freshness().num_seconds();
    let response = match state.conditions.get_assessment(location_id).await? {
        AssessmentLookup::Available {
            assessment,
            staleness,
            sequence,
            refreshing,
        } => ConditionsResponse {
            location_id,
            available: true,
            age_secs: Some(staleness.age_secs),
            stale: staleness.is_stale,
            freshness_secs,
            sequence: Some(sequence),
            refreshing,
            assessment: Some(ConditionAssessment::clone(&assessment)),
        },
        AssessmentLookup::NeverRefreshed { refreshing } => ConditionsResponse {
            location_id,
            available: false,
            age_secs: None,
            stale: false,
            freshness_secs,
            sequence: None,
            refreshing,
            assessment: None,
        },
    };

    Ok((stale_headers(response.stale), Json(response)))
}

/// Refresh the conditions for a location now.
///
/// Joins an in-flight refresh if one is running. If the refresh fails but an
/// earlier assessment exists, that assessment is returned with
/// `data_source: stale_cache` and the stale header.
#[utoipa::path(
    post,
    path = "/api/v1/conditions/{location_id}/refresh",
    tag = "Conditions",
    params(
        ("location_id" = Uuid, Path, description = "Location UUID"),
    ),
    responses(
        (status = 200, description = "Fresh (or stale fallback) assessment", body = ConditionAssessment,
         headers(
             ("X-Conditions-Stale" = String, description = "Set to 'true' when the refresh failed and cached data is served")
         )),
        (status = 404, description = "Unknown location", body = ErrorResponse),
        (status = 502, description = "All weather providers failed and nothing is cached", body = ErrorResponse),
        (status = 504, description = "Refresh did not finish in time and nothing is cached", body = ErrorResponse),
    )
)]
pub async fn refresh_conditions(
    State(state): State<AppState>,
    Path(location_id): Path<Uuid>,
) -> Result<(HeaderMap, Json<ConditionAssessment>), AppError> {
    let assessment = state.conditions.force_refresh(location_id).await?;
    let stale = assessment.data_source == DataSource::StaleCache;
    Ok((
        stale_headers(stale),
        Json(ConditionAssessment::clone(&assessment)),
    ))
}
