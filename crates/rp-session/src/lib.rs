// SPDX-License-Identifier: MIT OR Apache-2.0
//! Driver session orchestration.
//!
//! One [`DriverSession`] exists per driver login. It owns the trip
//! cache, the retry controller, and a handle to the dual-path gateway,
//! and exposes the operations the two view surfaces (dispatcher and
//! driver portal) call: fetch/refresh, transition, and the read surface
//! the dashboard renders from.
//!
//! Concurrency model (cooperative, event-driven):
//! - at most one trip fetch in flight per session, enforced by the
//!   retry controller's state machine;
//! - transitions on *different* trips proceed independently, but a
//!   second transition on the same trip while one is pending is refused;
//! - after [`DriverSession::close`] (logout), results of still-in-flight
//!   calls are dropped instead of being committed to the discarded cache.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use rp_cache::{ScheduleBoard, TripCache};
use rp_config::PortalConfig;
use rp_core::{DriverProfile, DriverStats, ReferenceData, TransitionError, Trip, TripEvent, machine};
use rp_gateway::{Gateway, GatewayError, RejectReason, StoreError, TripStore};
use rp_retry::{FailOutcome, FetchState, RetryController};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Session token ───────────────────────────────────────────────────

/// Cloneable closed-flag shared between a session and its in-flight
/// calls. All clones observe [`close`](SessionToken::close) immediately.
#[derive(Clone, Default)]
pub struct SessionToken {
    closed: Arc<AtomicBool>,
}

impl SessionToken {
    /// A token that is **not** closed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the session closed. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Errors ──────────────────────────────────────────────────────────

/// The user-facing error taxonomy of the session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// The transition is illegal; detected locally before any network
    /// call, surfaced synchronously, never retried.
    #[error(transparent)]
    Validation(#[from] TransitionError),

    /// The store refused the operation (ownership mismatch, lost race).
    /// Hard failure, distinct from transient errors, never retried.
    #[error("rejected: {reason}")]
    Rejected {
        /// Why the store said no.
        reason: RejectReason,
    },

    /// Automatic retries are exhausted; a manual refresh is required.
    #[error("gave up after {attempts} automatic retries: {source}")]
    RetriesExhausted {
        /// Automatic attempts consumed.
        attempts: u32,
        /// The last failure seen.
        source: GatewayError,
    },

    /// A transition on this trip is already pending from this session.
    #[error("a transition on trip {trip_id} is already in progress")]
    TransitionInFlight {
        /// The busy trip.
        trip_id: Uuid,
    },

    /// The trip is not in this session's cache.
    #[error("trip {trip_id} is not in this session")]
    UnknownTrip {
        /// The unknown id.
        trip_id: Uuid,
    },

    /// The session was closed (logout) before the result could land.
    #[error("session is closed")]
    SessionClosed,

    /// A single-shot gateway failure (transitions are never auto-retried).
    #[error(transparent)]
    Gateway(GatewayError),
}

// ── Fetch outcome ───────────────────────────────────────────────────

/// What a [`sync`](DriverSession::sync) or
/// [`refresh`](DriverSession::refresh) call accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// A fetch ran and the cache now holds this many trips.
    Completed {
        /// Cached trip count after the fetch.
        trips: usize,
    },
    /// Another fetch was already in flight; no second one was started.
    AlreadyInFlight,
}

// ── Per-trip in-flight guard ────────────────────────────────────────

/// Removes the trip id from the in-flight set on drop, whatever path
/// the transition takes.
struct TripGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    trip_id: Uuid,
}

impl<'a> TripGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<Uuid>>, trip_id: Uuid) -> Result<Self, SessionError> {
        let mut in_flight = set.lock().expect("in_flight lock");
        if !in_flight.insert(trip_id) {
            return Err(SessionError::TransitionInFlight { trip_id });
        }
        Ok(Self { set, trip_id })
    }
}

impl Drop for TripGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().expect("in_flight lock").remove(&self.trip_id);
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// One driver's login session.
///
/// All locks are held only for short, non-suspending critical sections;
/// the async work (gateway calls, backoff sleeps) happens outside them.
pub struct DriverSession {
    driver_id: Uuid,
    gateway: Gateway,
    request_timeout: Duration,
    token: SessionToken,

    cache: RwLock<TripCache>,
    retry: Mutex<RetryController>,
    reference: RwLock<ReferenceData>,
    profile: RwLock<Option<DriverProfile>>,
    in_flight: Mutex<HashSet<Uuid>>,
    last_error: RwLock<Option<GatewayError>>,
}

impl DriverSession {
    /// Open a session for `driver_id` against `store`, configured by
    /// `config` (injected, never ambient).
    #[must_use]
    pub fn new(store: Arc<dyn TripStore>, driver_id: Uuid, config: PortalConfig) -> Self {
        info!(
            target: "rp.session",
            %driver_id,
            application = %config.gateway.application_name,
            "driver session opened"
        );
        Self {
            driver_id,
            gateway: Gateway::new(store),
            request_timeout: Duration::from_millis(config.gateway.request_timeout_ms),
            token: SessionToken::new(),
            cache: RwLock::new(TripCache::new()),
            retry: Mutex::new(RetryController::new(config.retry.to_policy())),
            reference: RwLock::new(ReferenceData::default()),
            profile: RwLock::new(None),
            in_flight: Mutex::new(HashSet::new()),
            last_error: RwLock::new(None),
        }
    }

    /// The driver this session belongs to.
    #[must_use]
    pub fn driver_id(&self) -> Uuid {
        self.driver_id
    }

    /// The underlying gateway (capability probe inspection).
    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Close the session (logout): discard the cache and stop any
    /// in-flight call from committing its result.
    pub fn close(&self) {
        info!(target: "rp.session", driver_id = %self.driver_id, "session closed");
        self.token.close();
        self.cache.write().expect("cache lock").clear();
    }

    /// Returns `true` once the session is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_closed()
    }

    // ── Fetch cycle ─────────────────────────────────────────────────

    /// Automatic fetch: run the retry loop until success, exhaustion, or
    /// a non-retryable failure.
    ///
    /// While a fetch is already in flight, returns
    /// [`Refresh::AlreadyInFlight`] without starting a second one. Once
    /// the controller is exhausted, keeps failing fast until
    /// [`refresh`](Self::refresh) resets it.
    pub async fn sync(&self) -> Result<Refresh, SessionError> {
        if self.token.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        self.fetch_cycle().await
    }

    /// Manual refresh: reset the retry streak and fetch.
    ///
    /// A refresh while a fetch is in flight queues behind it logically —
    /// it neither resets the streak nor starts a second fetch.
    pub async fn refresh(&self) -> Result<Refresh, SessionError> {
        if self.token.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        {
            let mut retry = self.retry.lock().expect("retry lock");
            if !retry.reset() {
                debug!(target: "rp.session", "refresh ignored, fetch in flight");
                return Ok(Refresh::AlreadyInFlight);
            }
        }
        self.fetch_cycle().await
    }

    async fn fetch_cycle(&self) -> Result<Refresh, SessionError> {
        loop {
            let attempt = {
                let mut retry = self.retry.lock().expect("retry lock");
                match retry.begin() {
                    Some(attempt) => attempt,
                    None => {
                        return match retry.state() {
                            FetchState::Exhausted => {
                                let source = self.last_error().unwrap_or(GatewayError::Transient {
                                    source: StoreError::Unavailable {
                                        message: "retries exhausted".into(),
                                    },
                                });
                                Err(SessionError::RetriesExhausted {
                                    attempts: retry.policy().max_attempts,
                                    source,
                                })
                            }
                            _ => Ok(Refresh::AlreadyInFlight),
                        };
                    }
                }
            };

            debug!(target: "rp.session", attempt, "fetching trips");
            let ticket = self.cache.read().expect("cache lock").begin_fetch();
            let result = self.call(self.gateway.fetch_driver_trips(self.driver_id)).await;

            match result {
                Ok(trips) => {
                    {
                        let mut retry = self.retry.lock().expect("retry lock");
                        retry.succeed();
                    }
                    if self.token.is_closed() {
                        debug!(target: "rp.session", "dropping fetch result, session closed");
                        return Err(SessionError::SessionClosed);
                    }
                    let count = trips.len();
                    let skipped = self
                        .cache
                        .write()
                        .expect("cache lock")
                        .commit_fetch(ticket, trips);
                    if skipped > 0 {
                        debug!(target: "rp.session", skipped, "kept newer local writes");
                    }
                    *self.last_error.write().expect("last_error lock") = None;

                    self.load_extras().await;

                    info!(target: "rp.session", trips = count, "trips refreshed");
                    return Ok(Refresh::Completed {
                        trips: self.cache.read().expect("cache lock").len(),
                    });
                }
                Err(err) if err.is_retryable() => {
                    *self.last_error.write().expect("last_error lock") = Some(err.clone());
                    let outcome = self.retry.lock().expect("retry lock").fail();
                    match outcome {
                        FailOutcome::Backoff(delay) => {
                            warn!(
                                target: "rp.session",
                                error = %err,
                                delay_ms = delay.as_millis() as u64,
                                "fetch failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            if self.token.is_closed() {
                                return Err(SessionError::SessionClosed);
                            }
                        }
                        FailOutcome::Exhausted { attempts } => {
                            warn!(target: "rp.session", error = %err, "fetch retries exhausted");
                            return Err(SessionError::RetriesExhausted {
                                attempts,
                                source: err,
                            });
                        }
                    }
                }
                Err(err) => {
                    // Not retryable: unwind the Fetching state without
                    // counting it against the transient streak.
                    self.retry.lock().expect("retry lock").succeed();
                    *self.last_error.write().expect("last_error lock") = Some(err.clone());
                    return Err(SessionError::Gateway(err));
                }
            }
        }
    }

    /// Reference data, profile, and the last-login stamp ride along
    /// after a successful trip fetch. All best-effort: a miss here must
    /// not fail the refresh.
    async fn load_extras(&self) {
        match self.call(self.gateway.fetch_reference_data()).await {
            Ok(reference) if !self.token.is_closed() => {
                *self.reference.write().expect("reference lock") = reference;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(target: "rp.session", error = %err, "reference data load skipped");
            }
        }

        match self.call(self.gateway.fetch_driver_profile(self.driver_id)).await {
            Ok(profile) if !self.token.is_closed() => {
                *self.profile.write().expect("profile lock") = Some(profile);
            }
            Ok(_) => {}
            Err(err) => {
                debug!(target: "rp.session", error = %err, "profile load skipped");
            }
        }

        self.gateway.touch_last_login(self.driver_id).await;
    }

    /// Wrap a gateway future with the configured request deadline.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transient {
                source: StoreError::Timeout {
                    elapsed_ms: self.request_timeout.as_millis() as u64,
                },
            }),
        }
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Apply a lifecycle transition to one of this session's trips.
    ///
    /// Validates locally first (validation errors cost no network call),
    /// then writes through the gateway keyed on the acceptance status
    /// this session last observed, and finally applies the store's
    /// answer to the cache as an optimistic update.
    ///
    /// Single-shot: transient failures are returned to the caller, not
    /// retried.
    pub async fn transition(
        &self,
        trip_id: Uuid,
        event: TripEvent,
    ) -> Result<Trip, SessionError> {
        if self.token.is_closed() {
            return Err(SessionError::SessionClosed);
        }

        let _guard = TripGuard::acquire(&self.in_flight, trip_id)?;

        let current = self
            .cache
            .read()
            .expect("cache lock")
            .get(trip_id)
            .cloned()
            .ok_or(SessionError::UnknownTrip { trip_id })?;

        // Local validation; the store will check again, but an illegal
        // request must fail here, synchronously.
        machine::try_transition(&current, event, self.driver_id)?;

        let updated = self
            .call(self.gateway.apply_transition(
                trip_id,
                self.driver_id,
                event,
                current.acceptance,
            ))
            .await
            .map_err(|err| {
                warn!(target: "rp.session", %trip_id, %event, error = %err, "transition failed");
                match err {
                    GatewayError::Rejected { reason } => SessionError::Rejected { reason },
                    other => SessionError::Gateway(other),
                }
            })?;

        if self.token.is_closed() {
            debug!(target: "rp.session", %trip_id, "dropping transition result, session closed");
            return Err(SessionError::SessionClosed);
        }

        info!(target: "rp.session", %trip_id, %event, "transition applied");
        self.cache
            .write()
            .expect("cache lock")
            .apply_local(updated.clone());
        Ok(updated)
    }

    // ── Read surface ────────────────────────────────────────────────

    /// All cached trips, sorted by pickup time.
    #[must_use]
    pub fn trips(&self) -> Vec<Trip> {
        self.cache.read().expect("cache lock").snapshot()
    }

    /// One cached trip.
    #[must_use]
    pub fn trip(&self, trip_id: Uuid) -> Option<Trip> {
        self.cache.read().expect("cache lock").get(trip_id).cloned()
    }

    /// Dashboard counters.
    #[must_use]
    pub fn stats(&self) -> DriverStats {
        self.cache.read().expect("cache lock").stats()
    }

    /// Bucketed schedule relative to the current wall clock.
    #[must_use]
    pub fn board(&self) -> ScheduleBoard {
        self.board_at(Utc::now())
    }

    /// Bucketed schedule relative to `now` (deterministic tests).
    #[must_use]
    pub fn board_at(&self, now: DateTime<Utc>) -> ScheduleBoard {
        self.cache.read().expect("cache lock").board(now)
    }

    /// Company/car-type lookup tables (empty until the first fetch).
    #[must_use]
    pub fn reference(&self) -> ReferenceData {
        self.reference.read().expect("reference lock").clone()
    }

    /// The driver's record, if the profile load has succeeded.
    #[must_use]
    pub fn profile(&self) -> Option<DriverProfile> {
        self.profile.read().expect("profile lock").clone()
    }

    /// Current fetch/retry state, for surfacing in the UI.
    #[must_use]
    pub fn retry_state(&self) -> FetchState {
        self.retry.lock().expect("retry lock").state()
    }

    /// The most recent gateway failure, cleared by a successful fetch.
    #[must_use]
    pub fn last_error(&self) -> Option<GatewayError> {
        self.last_error.read().expect("last_error lock").clone()
    }
}

impl std::fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSession")
            .field("driver_id", &self.driver_id)
            .field("closed", &self.token.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::{AcceptanceStatus, TripBuilder};
    use rp_store_mock::MemoryStore;

    fn session_with(store: &MemoryStore, driver: Uuid) -> DriverSession {
        DriverSession::new(Arc::new(store.clone()), driver, PortalConfig::default())
    }

    fn pending(driver: Uuid) -> Trip {
        TripBuilder::new(driver, Utc::now() + chrono::Duration::hours(3))
            .price(42.0)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn sync_populates_the_cache() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        store.seed_trip(pending(driver)).await;
        store.seed_trip(pending(driver)).await;

        let session = session_with(&store, driver);
        let outcome = session.sync().await.unwrap();
        assert_eq!(outcome, Refresh::Completed { trips: 2 });
        assert_eq!(session.trips().len(), 2);
        assert_eq!(session.retry_state(), FetchState::Idle);
    }

    #[tokio::test]
    async fn transition_validates_locally_before_the_network() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        let trip = pending(driver);
        store.seed_trip(trip.clone()).await;

        let session = session_with(&store, driver);
        session.sync().await.unwrap();

        // Start from pending is illegal; the store must not even be asked.
        let err = session.transition(trip.id, TripEvent::Start).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(TransitionError::InvalidTransition { .. })
        ));
        assert_eq!(store.row(trip.id).await.unwrap().acceptance, AcceptanceStatus::Pending);
    }

    #[tokio::test]
    async fn transition_applies_optimistically() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        let trip = pending(driver);
        store.seed_trip(trip.clone()).await;

        let session = session_with(&store, driver);
        session.sync().await.unwrap();

        let updated = session.transition(trip.id, TripEvent::Accept).await.unwrap();
        assert_eq!(updated.acceptance, AcceptanceStatus::Accepted);
        // Visible in the cache without another fetch.
        assert_eq!(
            session.trip(trip.id).unwrap().acceptance,
            AcceptanceStatus::Accepted
        );
    }

    #[tokio::test]
    async fn unknown_trip_is_reported() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        let session = session_with(&store, driver);
        session.sync().await.unwrap();

        let err = session
            .transition(Uuid::new_v4(), TripEvent::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownTrip { .. }));
    }

    #[tokio::test]
    async fn closed_session_refuses_everything() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        let trip = pending(driver);
        store.seed_trip(trip.clone()).await;

        let session = session_with(&store, driver);
        session.sync().await.unwrap();
        session.close();

        assert!(session.trips().is_empty(), "cache is discarded on close");
        assert_eq!(session.sync().await, Err(SessionError::SessionClosed));
        assert_eq!(
            session.transition(trip.id, TripEvent::Accept).await,
            Err(SessionError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn reference_and_profile_ride_along() {
        let store = MemoryStore::new();
        let driver = Uuid::new_v4();
        store.seed_trip(pending(driver)).await;
        store
            .seed_profile(DriverProfile {
                id: driver,
                name: "Maria".into(),
                license: "DL-7".into(),
                phone: None,
                last_login: None,
            })
            .await;

        let session = session_with(&store, driver);
        session.sync().await.unwrap();

        let profile = session.profile().unwrap();
        assert_eq!(profile.name, "Maria");
        // The ride-along also stamps last_login.
        assert!(store.fetch_driver_profile(driver).await.unwrap().last_login.is_some());
    }
}
