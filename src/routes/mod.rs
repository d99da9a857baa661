pub mod conditions;
pub mod health;
pub mod locations;
pub mod scheduler;

use crate::services::conditions::ConditionService;

/// Shared application state for all handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) conditions: ConditionService,
    /// Snapshot database, when persistence is configured.
    pub(crate) pool: Option<sqlx::PgPool>,
}
