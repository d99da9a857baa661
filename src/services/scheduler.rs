//! Background refresh scheduler.
//!
//! Keeps the condition cache fresh for every tracked location:
//! - A fixed-interval ticker refreshes the whole tracked set, at most
//!   `concurrency` locations at a time.
//! - On-demand refreshes (`force_refresh`) go through the same path.
//! - Per location at most one fetch is in flight. A request that arrives
//!   while a fetch is running joins it and receives the same result.
//! - The fetch runs as its own task, so a caller that stops waiting (timeout)
//!   does not cancel it for the other waiters.
//! - A failed refresh leaves the previous cache entry in place and is simply
//!   retried on the next tick.
//! - Status is in-memory (`Arc<RwLock<SchedulerStatus>>`) and backs the
//!   status and health endpoints.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::queries;
use crate::errors::{CanopyError, ConditionError};
use crate::services::cache::ConditionCache;
use crate::services::calculator::{ConditionAssessment, ConditionCalculator, DataSource};
use crate::services::canopy::CanopyService;
use crate::services::gateway::ProviderGateway;
use crate::services::registry::Location;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Time between refresh cycles.
    pub interval: Duration,
    /// Bound on each individual provider call.
    pub provider_timeout: Duration,
    /// Bound on how long a `force_refresh` caller waits.
    pub force_refresh_timeout: Duration,
    /// Locations refreshed concurrently within one cycle.
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            provider_timeout: Duration::from_secs(10),
            force_refresh_timeout: Duration::from_secs(30),
            concurrency: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler state (in-memory, shared via Arc<RwLock<>>)
// ---------------------------------------------------------------------------

/// Status of a single location's last refresh attempt.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LocationRefreshStatus {
    pub location_id: Uuid,
    pub location_name: String,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// "pending", "ok", "stale" (failed, earlier assessment still cached)
    /// or "error: ..."
    pub last_result: String,
    /// Source of the last successful assessment.
    pub data_source: Option<DataSource>,
    /// Providers that failed during the last attempt (absorbed or not).
    pub provider_failures: Vec<String>,
}

impl LocationRefreshStatus {
    fn pending(location: &Location) -> Self {
        Self {
            location_id: location.id,
            location_name: location.name.clone(),
            last_attempt_at: None,
            last_success_at: None,
            last_result: "pending".to_string(),
            data_source: None,
            provider_failures: Vec::new(),
        }
    }
}

/// Global scheduler state, exposed via the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SchedulerStatus {
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub interval_secs: u64,
    pub next_tick_at: Option<DateTime<Utc>>,
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub total_cycles: u64,
    pub locations: Vec<LocationRefreshStatus>,
}

impl SchedulerStatus {
    pub fn new(interval: Duration) -> Self {
        Self {
            active: true,
            started_at: Utc::now(),
            interval_secs: interval.as_secs(),
            next_tick_at: None,
            last_cycle_started_at: None,
            last_cycle_completed_at: None,
            last_cycle_duration_ms: None,
            total_cycles: 0,
            locations: Vec::new(),
        }
    }

    /// Liveness: the last cycle completed within `max_age`, or no cycle has
    /// completed yet and the scheduler is younger than `max_age`.
    pub fn is_healthy(&self, now: DateTime<Utc>, max_age: ChronoDuration) -> bool {
        if !self.active {
            return false;
        }
        match self.last_cycle_completed_at {
            Some(done) => now - done <= max_age,
            None => now - self.started_at <= max_age,
        }
    }

    fn location_mut(&mut self, location_id: Uuid) -> Option<&mut LocationRefreshStatus> {
        self.locations
            .iter_mut()
            .find(|s| s.location_id == location_id)
    }
}

/// Shared scheduler status handle.
pub type SharedSchedulerStatus = Arc<RwLock<SchedulerStatus>>;

/// Counts from one completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub refreshed: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

type RefreshOutcome = Result<Arc<ConditionAssessment>, ConditionError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct Flight {
    generation: u64,
    refresh: SharedRefresh,
}

/// Removes a finished flight from the in-flight table, even if the fetch
/// task panics.
struct FlightGuard {
    scheduler: Arc<ConditionScheduler>,
    location_id: Uuid,
    generation: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut flights = self
            .scheduler
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if flights
            .get(&self.location_id)
            .is_some_and(|f| f.generation == self.generation)
        {
            flights.remove(&self.location_id);
        }
    }
}

pub struct ConditionScheduler {
    gateway: ProviderGateway,
    canopy: Arc<CanopyService>,
    calculator: ConditionCalculator,
    cache: Arc<ConditionCache>,
    locations: RwLock<Arc<Vec<Location>>>,
    in_flight: Mutex<HashMap<Uuid, Flight>>,
    next_generation: AtomicU64,
    status: SharedSchedulerStatus,
    pool: Option<PgPool>,
    config: SchedulerConfig,
}

impl ConditionScheduler {
    pub fn new(
        gateway: ProviderGateway,
        canopy: Arc<CanopyService>,
        calculator: ConditionCalculator,
        cache: Arc<ConditionCache>,
        locations: Vec<Location>,
        pool: Option<PgPool>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let mut status = SchedulerStatus::new(config.interval);
        status.locations = locations
            .iter()
            .map(LocationRefreshStatus::pending)
            .collect();

        Arc::new(Self {
            gateway,
            canopy,
            calculator,
            cache,
            locations: RwLock::new(Arc::new(locations)),
            in_flight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            status: Arc::new(RwLock::new(status)),
            pool,
            config,
        })
    }

    pub fn status(&self) -> SharedSchedulerStatus {
        self.status.clone()
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn cache(&self) -> Arc<ConditionCache> {
        self.cache.clone()
    }

    pub async fn locations(&self) -> Arc<Vec<Location>> {
        self.locations.read().await.clone()
    }

    pub async fn location(&self, location_id: Uuid) -> Option<Location> {
        self.locations
            .read()
            .await
            .iter()
            .find(|l| l.id == location_id)
            .cloned()
    }

    /// Swap in a new tracked set (registry reload). Status rows of retained
    /// locations survive; cache entries are never removed.
    pub async fn replace_locations(&self, locations: Vec<Location>) {
        let count = locations.len();
        {
            let mut s = self.status.write().await;
            let previous = std::mem::take(&mut s.locations);
            s.locations = locations
                .iter()
                .map(|loc| {
                    previous
                        .iter()
                        .find(|p| p.location_id == loc.id)
                        .cloned()
                        .map(|mut p| {
                            p.location_name = loc.name.clone();
                            p
                        })
                        .unwrap_or_else(|| LocationRefreshStatus::pending(loc))
                })
                .collect();
        }
        *self.locations.write().await = Arc::new(locations);
        tracing::info!("Scheduler: tracking {} locations", count);
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run the refresh loop until `shutdown` is cancelled. The first cycle
    /// starts immediately.
    ///
    /// Should be spawned via `tokio::spawn(scheduler.run(token))`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            "Scheduler started (interval {}s, concurrency {})",
            self.config.interval.as_secs(),
            self.config.concurrency
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.run_cycle() => {}
            }
        }

        self.status.write().await.active = false;
        tracing::info!("Scheduler stopped");
    }

    /// Refresh every tracked location once.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleSummary {
        let cycle_start = Utc::now();
        self.status.write().await.last_cycle_started_at = Some(cycle_start);

        let locations = self.locations().await;
        let outcomes: Vec<bool> = stream::iter(locations.iter().cloned())
            .map(|location| {
                let this = Arc::clone(self);
                async move { this.join_refresh(&location).await.is_ok() }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let refreshed = outcomes.iter().filter(|ok| **ok).count();
        let summary = CycleSummary {
            refreshed,
            failed: outcomes.len() - refreshed,
        };

        self.persist_snapshot().await;

        let duration_ms = (Utc::now() - cycle_start).num_milliseconds().max(0) as u64;
        {
            let mut s = self.status.write().await;
            s.last_cycle_completed_at = Some(Utc::now());
            s.last_cycle_duration_ms = Some(duration_ms);
            s.total_cycles += 1;
            s.next_tick_at = Some(
                cycle_start
                    + ChronoDuration::from_std(self.config.interval)
                        .unwrap_or_else(|_| ChronoDuration::seconds(900)),
            );
        }

        tracing::info!(
            "Scheduler: cycle complete in {}ms, {} refreshed, {} failed",
            duration_ms,
            summary.refreshed,
            summary.failed
        );

        summary
    }

    // -----------------------------------------------------------------------
    // On-demand refresh
    // -----------------------------------------------------------------------

    /// Refresh one location now and wait (bounded) for the result.
    ///
    /// Joins an in-flight fetch if there is one. If the refresh fails or the
    /// wait times out, the last cached assessment is returned relabelled as
    /// `stale_cache`; only without any cached value does the error surface.
    pub async fn force_refresh(
        self: &Arc<Self>,
        location_id: Uuid,
    ) -> Result<Arc<ConditionAssessment>, ConditionError> {
        let location = self
            .location(location_id)
            .await
            .ok_or(ConditionError::UnknownLocation(location_id))?;

        let flight = self.join_refresh(&location);
        let error = match tokio::time::timeout(self.config.force_refresh_timeout, flight).await {
            Ok(Ok(assessment)) => return Ok(assessment),
            Ok(Err(e)) => e,
            Err(_) => ConditionError::RefreshTimedOut(
                location_id,
                self.config.force_refresh_timeout.as_secs(),
            ),
        };

        match self.cache.get(location_id).await {
            Some(cached) => {
                tracing::warn!(
                    "Refresh of {} failed, serving stale assessment from {}: {}",
                    location_id,
                    cached.assessment.computed_at,
                    error
                );
                Ok(Arc::new(cached.assessment.as_stale()))
            }
            None => Err(error),
        }
    }

    /// Return the in-flight refresh for `location`, starting one if none is
    /// running.
    fn join_refresh(self: &Arc<Self>, location: &Location) -> SharedRefresh {
        let mut flights = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(flight) = flights.get(&location.id) {
            tracing::debug!("Coalescing refresh of {} into in-flight fetch", location.id);
            return flight.refresh.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            scheduler: Arc::clone(self),
            location_id: location.id,
            generation,
        };
        let this = Arc::clone(self);
        let target = location.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.fetch_and_store(&target).await
        });

        let location_id = location.id;
        let refresh = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ConditionError::RefreshAborted(location_id, e.to_string())),
            }
        }
        .boxed()
        .shared();

        flights.insert(
            location.id,
            Flight {
                generation,
                refresh: refresh.clone(),
            },
        );
        refresh
    }

    /// One upstream fetch for one location: weather and canopy in parallel,
    /// then assess and store.
    async fn fetch_and_store(&self, location: &Location) -> RefreshOutcome {
        self.cache.begin_fetch(location.id).await;
        let attempt_at = Utc::now();

        let (weather, canopy) = tokio::join!(
            self.gateway
                .fetch(location.coordinates, self.config.provider_timeout),
            self.canopy.reading_for(location),
        );

        let fetched = match weather {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    "Scheduler: refresh failed for {} ({}): {}",
                    location.name,
                    location.id,
                    e
                );
                self.cache.end_fetch(location.id).await;
                let has_previous = self.cache.get(location.id).await.is_some();
                if let Some(row) = self.status.write().await.location_mut(location.id) {
                    row.last_attempt_at = Some(attempt_at);
                    row.last_result = if has_previous {
                        "stale".to_string()
                    } else {
                        format!("error: {}", e)
                    };
                    row.provider_failures = vec![e.to_string()];
                }
                return Err(e);
            }
        };

        let canopy = match canopy {
            Ok(reading) => Some(reading),
            Err(CanopyError::Disabled) => None,
            Err(e) => {
                tracing::warn!(
                    "Scheduler: {} for {}, using neutral coverage",
                    ConditionError::from(e),
                    location.id
                );
                None
            }
        };

        let assessment = self
            .calculator
            .assess(location, &fetched.observation, canopy.as_ref());
        self.cache.put(location.id, assessment.clone()).await;

        tracing::debug!(
            "Scheduler: {} ({}) → {:?}, {:.1}h until dry, pest {:?}, via {}",
            location.name,
            location.id,
            assessment.dryness,
            assessment.hours_until_dry,
            assessment.pest_risk,
            assessment.provider
        );

        if let Some(row) = self.status.write().await.location_mut(location.id) {
            row.last_attempt_at = Some(attempt_at);
            row.last_success_at = Some(assessment.computed_at);
            row.last_result = "ok".to_string();
            row.data_source = Some(assessment.data_source);
            row.provider_failures = fetched.failures.iter().map(|f| f.to_string()).collect();
        }

        Ok(Arc::new(assessment))
    }

    async fn persist_snapshot(&self) {
        let Some(pool) = &self.pool else {
            return;
        };
        let snapshot = self.cache.snapshot().await;
        let mut failed = 0;
        for assessment in snapshot.values() {
            if let Err(e) = queries::upsert_assessment_snapshot(pool, assessment).await {
                failed += 1;
                tracing::error!(
                    "Scheduler: failed to persist snapshot for {}: {}",
                    assessment.location_id,
                    e
                );
            }
        }
        tracing::debug!(
            "Scheduler: persisted {}/{} snapshots",
            snapshot.len() - failed,
            snapshot.len()
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
