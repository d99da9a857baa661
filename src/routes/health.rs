use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::AppState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok" when healthy, "degraded" when the scheduler is stalled or the DB is unreachable
    pub status: String,
    /// API version
    pub version: String,
    /// Whether the refresh loop completed a cycle recently
    pub scheduler: bool,
    /// Whether the snapshot database is reachable (null when not configured)
    pub database: Option<bool>,
}

/// Health check endpoint.
///
/// Always returns 200 so load balancers can distinguish partial failures
/// from an unreachable service.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let scheduler_ok = state.conditions.is_healthy().await;

    let db_ok = match &state.pool {
        Some(pool) => Some(
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(pool)
                .await
                .is_ok(),
        ),
        None => None,
    };

    let healthy = scheduler_ok && db_ok.unwrap_or(true);
    Json(HealthResponse {
        status: if healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        scheduler: scheduler_ok,
        database: db_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::conditions::ConditionService;
    use crate::services::scheduler::tests::scheduler_with;
    use crate::services::scheduler::SchedulerConfig;

    #[tokio::test]
    async fn test_health_without_database() {
        let scheduler = scheduler_with(vec![], vec![], SchedulerConfig::default());
        let Json(health) = health_check(State(AppState {
            conditions: ConditionService::new(scheduler),
            pool: None,
        }))
        .await;
        assert_eq!(health.status, "ok");
        assert!(health.scheduler);
        assert_eq!(health.database, None);
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }
}
