//! Condition service: the read and refresh surface used by the HTTP layer.
//!
//! `get_assessment` only reads the cache. `force_refresh` delegates to the
//! scheduler so on-demand and periodic refreshes share one in-flight fetch
//! per location.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::ConditionError;
use crate::services::cache::{ConditionCache, Staleness};
use crate::services::calculator::ConditionAssessment;
use crate::services::registry::Location;
use crate::services::scheduler::ConditionScheduler;

/// Result of a cache read for a known location.
#[derive(Debug, Clone)]
pub enum AssessmentLookup {
    Available {
        assessment: Arc<ConditionAssessment>,
        staleness: Staleness,
        sequence: u64,
        refreshing: bool,
    },
    /// Known location that has never been refreshed successfully.
    NeverRefreshed { refreshing: bool },
}

#[derive(Clone)]
pub struct ConditionService {
    scheduler: Arc<ConditionScheduler>,
    cache: Arc<ConditionCache>,
}

impl ConditionService {
    pub fn new(scheduler: Arc<ConditionScheduler>) -> Self {
        let cache = scheduler.cache();
        Self { scheduler, cache }
    }

    pub fn scheduler(&self) -> &Arc<ConditionScheduler> {
        &self.scheduler
    }

    pub async fn get_assessment(
        &self,
        location_id: Uuid,
    ) -> Result<AssessmentLookup, ConditionError> {
        self.get_assessment_at(location_id, Utc::now()).await
    }

    pub async fn get_assessment_at(
        &self,
        location_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AssessmentLookup, ConditionError> {
        if self.scheduler.location(location_id).await.is_none() {
            return Err(ConditionError::UnknownLocation(location_id));
        }
        Ok(match self.cache.get_at(location_id, now).await {
            Some(cached) => AssessmentLookup::Available {
                assessment: cached.assessment,
                staleness: cached.staleness,
                sequence: cached.sequence,
                refreshing: cached.refreshing,
            },
            None => AssessmentLookup::NeverRefreshed {
                refreshing: self
                    .cache
                    .entry(location_id)
                    .await
                    .is_some_and(|e| e.fetch_in_progress),
            },
        })
    }

    pub async fn force_refresh(
        &self,
        location_id: Uuid,
    ) -> Result<Arc<ConditionAssessment>, ConditionError> {
        self.scheduler.force_refresh(location_id).await
    }

    pub async fn locations(&self) -> Arc<Vec<Location>> {
        self.scheduler.locations().await
    }

    /// Whether the refresh loop is alive: a cycle completed within two
    /// intervals (or the first one is still within that window).
    pub async fn is_healthy(&self) -> bool {
        let interval = self.scheduler.config().interval;
        let max_age = ChronoDuration::from_std(interval * 2)
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        self.scheduler
            .status()
            .read()
            .await
            .is_healthy(Utc::now(), max_age)
    }

    /// Age after which an assessment is reported stale.
    pub fn freshness(&self) -> ChronoDuration {
        self.cache.freshness()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::calculator::DataSource;
    use crate::services::gateway::tests::{complete_raw, FakeProvider};
    use crate::services::scheduler::tests::{location, scheduler_with};
    use crate::services::scheduler::SchedulerConfig;

    #[tokio::test]
    async fn test_unknown_location_is_error() {
        let scheduler = scheduler_with(vec![], vec![], SchedulerConfig::default());
        let service = ConditionService::new(scheduler);
        let id = Uuid::new_v4();
        assert!(matches!(
            service.get_assessment(id).await,
            Err(ConditionError::UnknownLocation(x)) if x == id
        ));
    }

    #[tokio::test]
    async fn test_known_location_without_data_is_never_refreshed() {
        let loc = location("Magic Wood");
        let service = ConditionService::new(scheduler_with(
            vec![Arc::new(FakeProvider::failing("primary"))],
            vec![loc.clone()],
            SchedulerConfig::default(),
        ));

        assert!(matches!(
            service.get_assessment(loc.id).await,
            Ok(AssessmentLookup::NeverRefreshed { refreshing: false })
        ));

        // A failed refresh still leaves the location without data.
        assert!(service.force_refresh(loc.id).await.is_err());
        assert!(matches!(
            service.get_assessment(loc.id).await,
            Ok(AssessmentLookup::NeverRefreshed { refreshing: false })
        ));
    }

    #[tokio::test]
    async fn test_get_after_force_refresh_returns_same_assessment() {
        let provider = Arc::new(FakeProvider::ok("primary", complete_raw("primary")));
        let loc = location("Magic Wood");
        let service = ConditionService::new(scheduler_with(
            vec![provider.clone()],
            vec![loc.clone()],
            SchedulerConfig::default(),
        ));

        let refreshed = service.force_refresh(loc.id).await.unwrap();
        match service.get_assessment(loc.id).await.unwrap() {
            AssessmentLookup::Available {
                assessment,
                staleness,
                sequence,
                refreshing,
            } => {
                assert_eq!(*assessment, *refreshed);
                assert_eq!(sequence, 1);
                assert!(!refreshing);
                assert!(!staleness.is_stale);
                assert_eq!(assessment.data_source, DataSource::Primary);
            }
            AssessmentLookup::NeverRefreshed { .. } => panic!("expected an assessment"),
        }
        // Reads never hit providers.
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_reads_report_staleness() {
        let provider = Arc::new(FakeProvider::ok("primary", complete_raw("primary")));
        let loc = location("Magic Wood");
        let service = ConditionService::new(scheduler_with(
            vec![provider],
            vec![loc.clone()],
            SchedulerConfig::default(),
        ));
        service.force_refresh(loc.id).await.unwrap();

        let later = Utc::now() + service.freshness() + ChronoDuration::minutes(1);
        match service.get_assessment_at(loc.id, later).await.unwrap() {
            AssessmentLookup::Available { staleness, .. } => assert!(staleness.is_stale),
            AssessmentLookup::NeverRefreshed { .. } => panic!("expected an assessment"),
        }
    }

    #[tokio::test]
    async fn test_reads_report_running_fetch() {
        let loc = location("Magic Wood");
        let scheduler = scheduler_with(vec![], vec![loc.clone()], SchedulerConfig::default());
        let cache = scheduler.cache();
        let service = ConditionService::new(scheduler);

        cache.begin_fetch(loc.id).await;
        assert!(matches!(
            service.get_assessment(loc.id).await,
            Ok(AssessmentLookup::NeverRefreshed { refreshing: true })
        ));

        cache.end_fetch(loc.id).await;
        assert!(matches!(
            service.get_assessment(loc.id).await,
            Ok(AssessmentLookup::NeverRefreshed { refreshing: false })
        ));
    }

    #[tokio::test]
    async fn test_fresh_scheduler_is_healthy() {
        let scheduler = scheduler_with(vec![], vec![], SchedulerConfig::default());
        let service = ConditionService::new(scheduler);
        assert!(service.is_healthy().await);
    }
}
