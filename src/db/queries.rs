use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::AssessmentSnapshotRow;
use crate::services::calculator::ConditionAssessment;

/// Insert or replace the snapshot for one location.
///
/// An older assessment never overwrites a newer one.
pub async fn upsert_assessment_snapshot(
    pool: &PgPool,
    assessment: &ConditionAssessment,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO assessment_snapshots (location_id, computed_at, assessment)
         VALUES ($1, $2, $3)
         ON CONFLICT (location_id) DO UPDATE
            SET computed_at = EXCLUDED.computed_at,
                assessment = EXCLUDED.assessment,
                updated_at = NOW()
          WHERE assessment_snapshots.computed_at <= EXCLUDED.computed_at",
    )
    .bind(assessment.location_id)
    .bind(assessment.computed_at)
    .bind(Json(assessment))
    .execute(pool)
    .await?;
    Ok(())
}

/// Load every persisted snapshot, keyed by location.
pub async fn load_assessment_snapshots(
    pool: &PgPool,
) -> Result<HashMap<Uuid, ConditionAssessment>, sqlx::Error> {
    let rows = sqlx::query_as::<_, AssessmentSnapshotRow>(
        "SELECT location_id, computed_at, assessment, updated_at FROM assessment_snapshots",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.location_id, row.assessment.0))
        .collect())
}
