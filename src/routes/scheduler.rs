//! Scheduler status HTTP endpoint.
//!
//! GET /api/v1/scheduler/status returns the state of the background refresh
//! loop as JSON.

use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::services::scheduler::SchedulerStatus;

/// Get the current scheduler status.
///
/// Returns per-location info (last_attempt_at, last_success_at, last_result,
/// provider_failures) and global info (active, last cycle timings, next_tick_at).
#[utoipa::path(
    get,
    path = "/api/v1/scheduler/status",
    tag = "Scheduler",
    responses(
        (status = 200, description = "Current scheduler status", body = SchedulerStatus),
    )
)]
pub async fn get_scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    let status = state.conditions.scheduler().status();
    let s = status.read().await;
    Json(s.clone())
}
