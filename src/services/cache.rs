//! Per-location assessment cache.
//!
//! Holds the latest `ConditionAssessment` for each location together with a
//! monotonic sequence number and a fetch-in-progress flag. Reads never touch
//! the network and never trigger a fetch. Replacement is atomic per
//! location: an assessment is swapped in as a whole `Arc` under the write
//! lock, so readers see either the old or the new record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::services::calculator::ConditionAssessment;

/// Cache slot for one location.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub assessment: Option<Arc<ConditionAssessment>>,
    /// Incremented on every accepted `put`.
    pub sequence: u64,
    pub fetch_in_progress: bool,
}

/// Age of an assessment relative to the freshness threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct Staleness {
    pub age_secs: i64,
    pub is_stale: bool,
}

/// Result of a cache read.
#[derive(Debug, Clone)]
pub struct CachedAssessment {
    pub assessment: Arc<ConditionAssessment>,
    pub staleness: Staleness,
    pub sequence: u64,
    /// A fetch for this location is running.
    pub refreshing: bool,
}

#[derive(Debug)]
pub struct ConditionCache {
    entries: RwLock<HashMap<Uuid, CacheEntry>>,
    freshness: chrono::Duration,
}

impl ConditionCache {
    pub fn new(freshness: chrono::Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            freshness,
        }
    }

    pub fn freshness(&self) -> chrono::Duration {
        self.freshness
    }

    pub fn staleness_at(&self, computed_at: DateTime<Utc>, now: DateTime<Utc>) -> Staleness {
        let age = (now - computed_at).max(chrono::Duration::zero());
        Staleness {
            age_secs: age.num_seconds(),
            is_stale: age > self.freshness,
        }
    }

    /// Last assessment stored for `location_id`, if any.
    pub async fn get(&self, location_id: Uuid) -> Option<CachedAssessment> {
        self.get_at(location_id, Utc::now()).await
    }

    pub async fn get_at(&self, location_id: Uuid, now: DateTime<Utc>) -> Option<CachedAssessment> {
        let entries = self.entries.read().await;
        let entry = entries.get(&location_id)?;
        let assessment = entry.assessment.clone()?;
        Some(CachedAssessment {
            staleness: self.staleness_at(assessment.computed_at, now),
            assessment,
            sequence: entry.sequence,
            refreshing: entry.fetch_in_progress,
        })
    }

    /// Full slot for `location_id`, including the fetch flag.
    pub async fn entry(&self, location_id: Uuid) -> Option<CacheEntry> {
        self.entries.read().await.get(&location_id).cloned()
    }

    /// Store a new assessment and return its sequence number. An assessment
    /// older than the one already stored is ignored so readers never go
    /// backwards in time.
    pub async fn put(&self, location_id: Uuid, assessment: ConditionAssessment) -> u64 {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(location_id).or_default();

        if let Some(current) = &entry.assessment {
            if current.computed_at > assessment.computed_at {
                tracing::debug!(
                    "Cache: ignoring out-of-order assessment for {} ({} < {})",
                    location_id,
                    assessment.computed_at,
                    current.computed_at
                );
                entry.fetch_in_progress = false;
                return entry.sequence;
            }
        }

        entry.assessment = Some(Arc::new(assessment));
        entry.sequence += 1;
        entry.fetch_in_progress = false;
        entry.sequence
    }

    /// Mark a fetch as started. Creates the slot lazily.
    pub async fn begin_fetch(&self, location_id: Uuid) {
        let mut entries = self.entries.write().await;
        entries.entry(location_id).or_default().fetch_in_progress = true;
    }

    /// Clear the fetch flag after a failed fetch, leaving the assessment intact.
    pub async fn end_fetch(&self, location_id: Uuid) {
        if let Some(entry) = self.entries.write().await.get_mut(&location_id) {
            entry.fetch_in_progress = false;
        }
    }

    /// Copy of every stored assessment, for persistence.
    pub async fn snapshot(&self) -> HashMap<Uuid, ConditionAssessment> {
        self.entries
            .read()
            .await
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .assessment
                    .as_ref()
                    .map(|a| (*id, ConditionAssessment::clone(a)))
            })
            .collect()
    }

    /// Seed the cache from persisted assessments. Returns how many were accepted.
    pub async fn restore(&self, assessments: HashMap<Uuid, ConditionAssessment>) -> usize {
        let mut restored = 0;
        for (id, assessment) in assessments {
            if assessment.location_id != id {
                tracing::warn!(
                    "Cache: snapshot key {} does not match assessment location {}, skipping",
                    id,
                    assessment.location_id
                );
                continue;
            }
            let before = self.entry(id).await.map(|e| e.sequence).unwrap_or(0);
            if self.put(id, assessment).await > before {
                restored += 1;
            }
        }
        restored
    }
}
