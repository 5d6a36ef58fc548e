//! In-memory [`TripStore`] used for local development and tests.
//!
//! One row set serves both the procedure and the direct paths, so shape
//! equivalence between them is inherent. The procedure transition path
//! runs the real state machine server-side; the direct path applies the
//! conditional patch the way the hosted store's filtered update would.
//!
//! Failure injection covers everything the gateway and session have to
//! cope with: transient outages, missing procedures, and slow fetches
//! for staleness scenarios. Call counters and a concurrent-depth gauge
//! let tests assert single-flight behaviour.

use async_trait::async_trait;
use chrono::Utc;
use rp_core::{DriverProfile, ReferenceData, Trip, TripEvent, machine};
use rp_gateway::{RejectReason, StoreError, TransitionPatch, TripStore, procedures};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Seedable in-memory trip store.
///
/// Cloning is cheap and shares all state, including injected failures
/// and counters.
#[derive(Clone)]
pub struct MemoryStore {
    inner: std::sync::Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Inner {
    rows: RwLock<HashMap<Uuid, Trip>>,
    reference: RwLock<ReferenceData>,
    profiles: RwLock<HashMap<Uuid, DriverProfile>>,

    fetch_rpc_enabled: AtomicBool,
    transition_rpc_enabled: AtomicBool,
    /// Next n fetches (either path) fail with `Unavailable`.
    failing_fetches: AtomicU32,
    /// Artificial latency before serving a fetch.
    fetch_delay: StdMutex<Option<Duration>>,

    fetch_calls: AtomicU32,
    rpc_fetch_calls: AtomicU32,
    direct_fetch_calls: AtomicU32,
    concurrent_fetches: AtomicU32,
    max_concurrent_fetches: AtomicU32,
}

/// RAII depth gauge for in-flight fetches.
struct DepthGuard<'a>(&'a Inner);

impl<'a> DepthGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let depth = inner.concurrent_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_concurrent_fetches.fetch_max(depth, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.concurrent_fetches.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    /// An empty store with both procedures deployed.
    #[must_use]
    pub fn new() -> Self {
        let inner = Inner::default();
        inner.fetch_rpc_enabled.store(true, Ordering::SeqCst);
        inner.transition_rpc_enabled.store(true, Ordering::SeqCst);
        Self {
            inner: std::sync::Arc::new(inner),
        }
    }

    /// Insert or replace a trip row.
    pub async fn seed_trip(&self, trip: Trip) {
        self.inner.rows.write().await.insert(trip.id, trip);
    }

    /// Insert or replace several trip rows.
    pub async fn seed_trips(&self, trips: impl IntoIterator<Item = Trip>) {
        let mut rows = self.inner.rows.write().await;
        for trip in trips {
            rows.insert(trip.id, trip);
        }
    }

    /// Replace the reference tables.
    pub async fn seed_reference(&self, reference: ReferenceData) {
        *self.inner.reference.write().await = reference;
    }

    /// Insert or replace a driver record.
    pub async fn seed_profile(&self, profile: DriverProfile) {
        self.inner.profiles.write().await.insert(profile.id, profile);
    }

    /// Read a row back (test assertions against "server" truth).
    pub async fn row(&self, trip_id: Uuid) -> Option<Trip> {
        self.inner.rows.read().await.get(&trip_id).cloned()
    }

    // ── Failure injection ───────────────────────────────────────────

    /// The next `n` fetches (either path) fail with `Unavailable`.
    pub fn fail_fetches(&self, n: u32) {
        self.inner.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Undeploy the fetch procedure: its calls answer `ProcedureMissing`.
    pub fn disable_fetch_rpc(&self) {
        self.inner.fetch_rpc_enabled.store(false, Ordering::SeqCst);
    }

    /// Undeploy the transition procedure.
    pub fn disable_transition_rpc(&self) {
        self.inner
            .transition_rpc_enabled
            .store(false, Ordering::SeqCst);
    }

    /// Delay every fetch by `delay` (staleness scenarios).
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.inner.fetch_delay.lock().expect("fetch_delay lock") = delay;
    }

    // ── Instrumentation ─────────────────────────────────────────────

    /// Total fetches served or failed, both paths.
    #[must_use]
    pub fn fetch_calls(&self) -> u32 {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    /// Fetches that went through the procedure path.
    #[must_use]
    pub fn rpc_fetch_calls(&self) -> u32 {
        self.inner.rpc_fetch_calls.load(Ordering::SeqCst)
    }

    /// Fetches that went through the direct path.
    #[must_use]
    pub fn direct_fetch_calls(&self) -> u32 {
        self.inner.direct_fetch_calls.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently in-flight fetches.
    #[must_use]
    pub fn max_concurrent_fetches(&self) -> u32 {
        self.inner.max_concurrent_fetches.load(Ordering::SeqCst)
    }

    // ── Shared fetch plumbing ───────────────────────────────────────

    async fn fetch_common(&self) -> Result<(), StoreError> {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.fetch_delay.lock().expect("fetch_delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Consume one injected failure, if any are queued.
        let mut remaining = self.inner.failing_fetches.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.inner.failing_fetches.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(StoreError::Unavailable {
                        message: "injected outage".into(),
                    });
                }
                Err(actual) => remaining = actual,
            }
        }
        Ok(())
    }

    async fn trips_for(&self, driver_id: Uuid) -> Result<Vec<Trip>, StoreError> {
        let rows = self.inner.rows.read().await;
        let mut trips: Vec<Trip> = rows
            .values()
            .filter(|t| t.driver_id == driver_id)
            .cloned()
            .collect();
        trips.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(trips)
    }
}

#[async_trait]
impl TripStore for MemoryStore {
    async fn fetch_trips_rpc(&self, driver_id: Uuid) -> Result<Vec<Trip>, StoreError> {
        let _depth = DepthGuard::enter(&self.inner);
        if !self.inner.fetch_rpc_enabled.load(Ordering::SeqCst) {
            return Err(StoreError::ProcedureMissing {
                procedure: procedures::FETCH_TRIPS.into(),
            });
        }
        self.inner.rpc_fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_common().await?;
        self.trips_for(driver_id).await
    }

    async fn select_trips(&self, driver_id: Uuid) -> Result<Vec<Trip>, StoreError> {
        let _depth = DepthGuard::enter(&self.inner);
        self.inner.direct_fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_common().await?;
        self.trips_for(driver_id).await
    }

    async fn transition_rpc(
        &self,
        trip_id: Uuid,
        driver_id: Uuid,
        event: TripEvent,
    ) -> Result<Trip, StoreError> {
        if !self.inner.transition_rpc_enabled.load(Ordering::SeqCst) {
            return Err(StoreError::ProcedureMissing {
                procedure: procedures::APPLY_TRANSITION.into(),
            });
        }

        let mut rows = self.inner.rows.write().await;
        let Some(current) = rows.get(&trip_id) else {
            return Err(StoreError::Rejected {
                reason: RejectReason::NotAssigned { trip_id, driver_id },
            });
        };
        if current.driver_id != driver_id {
            return Err(StoreError::Rejected {
                reason: RejectReason::NotAssigned { trip_id, driver_id },
            });
        }

        // The procedure re-validates the transition server-side.
        let next = machine::try_transition(current, event, driver_id).map_err(|e| {
            StoreError::Rejected {
                reason: RejectReason::Invalid(e),
            }
        })?;
        rows.insert(trip_id, next.clone());
        Ok(next)
    }

    async fn update_trip(
        &self,
        trip_id: Uuid,
        driver_id: Uuid,
        patch: TransitionPatch,
    ) -> Result<Trip, StoreError> {
        let mut rows = self.inner.rows.write().await;

        // Filtered update: id AND driver AND expected status must match,
        // all under one write lock, like the hosted store's single
        // conditional UPDATE.
        let Some(current) = rows.get(&trip_id) else {
            return Err(StoreError::Rejected {
                reason: RejectReason::NotAssigned { trip_id, driver_id },
            });
        };
        if current.driver_id != driver_id {
            return Err(StoreError::Rejected {
                reason: RejectReason::NotAssigned { trip_id, driver_id },
            });
        }
        if current.acceptance != patch.expected {
            return Err(StoreError::Rejected {
                reason: RejectReason::StaleState {
                    trip_id,
                    expected: patch.expected,
                    actual: current.acceptance,
                },
            });
        }

        let mut next = current.clone();
        if let Some(acceptance) = patch.acceptance {
            next.acceptance = acceptance;
        }
        if let Some(lifecycle) = patch.lifecycle {
            next.lifecycle = lifecycle;
        }
        if patch.accepted_at.is_some() {
            next.accepted_at = patch.accepted_at;
            next.accepted_by = patch.accepted_by;
        }
        if patch.started_at.is_some() {
            next.started_at = patch.started_at;
        }
        if patch.completed_at.is_some() {
            next.completed_at = patch.completed_at;
            next.completed_by = patch.completed_by;
        }
        next.revision += 1;

        rows.insert(trip_id, next.clone());
        Ok(next)
    }

    async fn fetch_reference(&self) -> Result<ReferenceData, StoreError> {
        Ok(self.inner.reference.read().await.clone())
    }

    async fn fetch_driver_profile(&self, driver_id: Uuid) -> Result<DriverProfile, StoreError> {
        self.inner
            .profiles
            .read()
            .await
            .get(&driver_id)
            .cloned()
            .ok_or(StoreError::DriverNotFound { driver_id })
    }

    async fn touch_last_login(&self, driver_id: Uuid) -> Result<(), StoreError> {
        let mut profiles = self.inner.profiles.write().await;
        match profiles.get_mut(&driver_id) {
            Some(profile) => {
                profile.last_login = Some(Utc::now());
                Ok(())
            }
            None => Err(StoreError::DriverNotFound { driver_id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::{AcceptanceStatus, LifecycleStatus, TripBuilder};

    fn pending(driver: Uuid) -> Trip {
        TripBuilder::new(driver, Utc::now()).price(10.0).build().unwrap()
    }

    #[tokio::test]
    async fn rpc_transition_runs_the_state_machine() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        let trip = pending(driver);
        store.seed_trip(trip.clone()).await;

        let updated = store
            .transition_rpc(trip.id, driver, TripEvent::Accept)
            .await
            .unwrap();
        assert_eq!(updated.acceptance, AcceptanceStatus::Accepted);

        // Skipping straight to complete is rejected server-side.
        let err = store
            .transition_rpc(trip.id, driver, TripEvent::Complete)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected {
                reason: RejectReason::Invalid(_)
            }
        ));
    }

    #[tokio::test]
    async fn rpc_transition_enforces_ownership() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        let trip = pending(driver);
        store.seed_trip(trip.clone()).await;

        let err = store
            .transition_rpc(trip.id, Uuid::new_v4(), TripEvent::Accept)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected {
                reason: RejectReason::NotAssigned { .. }
            }
        ));
    }

    #[tokio::test]
    async fn direct_update_is_conditional_on_expected_status() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        let trip = pending(driver);
        store.seed_trip(trip.clone()).await;

        // Another device already accepted the trip.
        store
            .transition_rpc(trip.id, driver, TripEvent::Accept)
            .await
            .unwrap();

        // Our conditional decline, keyed on pending, must lose the race.
        let patch = TransitionPatch::for_event(
            TripEvent::Decline,
            driver,
            AcceptanceStatus::Pending,
            Utc::now(),
        );
        let err = store.update_trip(trip.id, driver, patch).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected {
                reason: RejectReason::StaleState { .. }
            }
        ));
    }

    #[tokio::test]
    async fn direct_complete_flips_lifecycle_only() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        let mut trip = pending(driver);
        trip.acceptance = AcceptanceStatus::Started;
        store.seed_trip(trip.clone()).await;

        let patch = TransitionPatch::for_event(
            TripEvent::Complete,
            driver,
            AcceptanceStatus::Started,
            Utc::now(),
        );
        let updated = store.update_trip(trip.id, driver, patch).await.unwrap();
        assert_eq!(updated.lifecycle, LifecycleStatus::Completed);
        assert_eq!(updated.acceptance, AcceptanceStatus::Started);
        assert_eq!(updated.completed_by, Some(driver));
    }

    #[tokio::test]
    async fn injected_failures_burn_down() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        store.fail_fetches(2);

        assert!(store.fetch_trips_rpc(driver).await.is_err());
        assert!(store.fetch_trips_rpc(driver).await.is_err());
        assert!(store.fetch_trips_rpc(driver).await.is_ok());
        assert_eq!(store.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn disabled_procedures_answer_missing() {
        let store = MemoryStore::new();
        store.disable_fetch_rpc();
        let err = store.fetch_trips_rpc(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::ProcedureMissing { .. }));

        store.disable_transition_rpc();
        let err = store
            .transition_rpc(Uuid::new_v4(), Uuid::new_v4(), TripEvent::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ProcedureMissing { .. }));
    }

    #[tokio::test]
    async fn touch_last_login_updates_the_profile() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        store
            .seed_profile(DriverProfile {
                id: driver,
                name: "Niko".into(),
                license: "DL-2041".into(),
                phone: None,
                last_login: None,
            })
            .await;

        store.touch_last_login(driver).await.unwrap();
        let profile = store.fetch_driver_profile(driver).await.unwrap();
        assert!(profile.last_login.is_some());
    }
}
