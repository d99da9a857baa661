use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::calculator::ConditionAssessment;

/// Last assessment persisted for a location, restored into the cache at startup.
#[derive(Debug, Clone, FromRow)]
#[allow(dead_code)] // updated_at is read only for diagnostics
pub struct AssessmentSnapshotRow {
    pub location_id: Uuid,
    pub computed_at: DateTime<Utc>,
    pub assessment: Json<ConditionAssessment>,
    pub updated_at: DateTime<Utc>,
}
