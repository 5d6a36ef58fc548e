// SPDX-License-Identifier: MIT OR Apache-2.0
//! Remote store gateway for the driver portal.
//!
//! The hosted backend exposes two ways to do everything that matters:
//! a server-side procedure (atomic, access-controlled) and a plain
//! filtered table operation. Procedures are not deployed in every
//! environment, so [`Gateway`] tries the procedure first and degrades to
//! the direct path when the store reports the distinguished
//! "procedure missing" error — once per session per procedure, cached in
//! a [`ProcedureProbe`] rather than re-probed at every call site.
//!
//! The direct transition path trades the procedure's server-side
//! re-validation for a conditional write keyed on trip id, driver id,
//! and the expected current acceptance status. A lost race comes back
//! as [`RejectReason::StaleState`], never as a silent overwrite.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rp_core::{
    AcceptanceStatus, DriverProfile, LifecycleStatus, ReferenceData, TransitionError, Trip,
    TripEvent,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// The raw operations the remote store exposes.
///
/// Implementations are opaque to the core: a hosted Postgres backend in
/// production, [an in-memory store](https://docs.rs/rp-store-mock) in
/// tests. The `*_rpc` methods are the server-side procedures; the rest
/// are direct table operations.
#[async_trait]
pub trait TripStore: Send + Sync {
    /// Server-side aggregation procedure: the driver's trips with access
    /// control resolved on the server.
    async fn fetch_trips_rpc(&self, driver_id: Uuid) -> Result<Vec<Trip>, StoreError>;

    /// Direct filtered read of the driver's trips, ordered by pickup time.
    async fn select_trips(&self, driver_id: Uuid) -> Result<Vec<Trip>, StoreError>;

    /// Atomic server-side transition procedure. Enforces ownership and
    /// state validity before writing.
    async fn transition_rpc(
        &self,
        trip_id: Uuid,
        driver_id: Uuid,
        event: TripEvent,
    ) -> Result<Trip, StoreError>;

    /// Conditional direct write: matches on trip id, driver id, *and* the
    /// patch's expected acceptance status, then applies the patch fields.
    async fn update_trip(
        &self,
        trip_id: Uuid,
        driver_id: Uuid,
        patch: TransitionPatch,
    ) -> Result<Trip, StoreError>;

    /// Read the company and car-type lookup tables.
    async fn fetch_reference(&self) -> Result<ReferenceData, StoreError>;

    /// Read the driver's own record.
    async fn fetch_driver_profile(&self, driver_id: Uuid) -> Result<DriverProfile, StoreError>;

    /// Stamp the driver's `last_login`. Best-effort; callers swallow
    /// failures (the column may not exist in older deployments).
    async fn touch_last_login(&self, driver_id: Uuid) -> Result<(), StoreError>;
}

/// Errors surfaced by a [`TripStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The named server-side procedure is not deployed. Triggers the
    /// fallback path inside the gateway; never escapes it.
    #[error("procedure {procedure} does not exist")]
    ProcedureMissing {
        /// Name of the missing procedure.
        procedure: String,
    },

    /// Network failure, 5xx-equivalent, or other transient outage.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Human-readable detail.
        message: String,
    },

    /// The call exceeded its deadline.
    #[error("store call timed out after {elapsed_ms}ms")]
    Timeout {
        /// How long the call ran before giving up.
        elapsed_ms: u64,
    },

    /// The driver id is unknown to the store.
    #[error("driver {driver_id} not found")]
    DriverNotFound {
        /// The unknown id.
        driver_id: Uuid,
    },

    /// The store refused the write. Hard failure, never retried.
    #[error("store rejected the operation: {reason}")]
    Rejected {
        /// Why the write was refused.
        reason: RejectReason,
    },
}

impl StoreError {
    /// Returns `true` when a retry could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::Timeout { .. }
        )
    }
}

/// Why a store write was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    /// No row matched the trip/driver pairing — the trip does not exist
    /// or belongs to another driver.
    #[error("trip {trip_id} is not assigned to driver {driver_id}")]
    NotAssigned {
        /// The targeted trip.
        trip_id: Uuid,
        /// The requesting driver.
        driver_id: Uuid,
    },

    /// The conditional write lost a race: the row no longer holds the
    /// expected acceptance status.
    #[error("trip {trip_id} is no longer {expected} (now {actual})")]
    StaleState {
        /// The targeted trip.
        trip_id: Uuid,
        /// Status the write was keyed on.
        expected: AcceptanceStatus,
        /// Status the row actually held.
        actual: AcceptanceStatus,
    },

    /// Server-side validation rejected the transition.
    #[error(transparent)]
    Invalid(#[from] TransitionError),
}

// ---------------------------------------------------------------------------
// Transition patch
// ---------------------------------------------------------------------------

/// The exact field set the direct-write fallback applies for one event.
///
/// `expected` keys the conditional write: the row must still hold that
/// acceptance status or the store answers [`RejectReason::StaleState`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPatch {
    /// Acceptance status the row must currently hold.
    pub expected: AcceptanceStatus,
    /// New acceptance status, if the event changes it.
    pub acceptance: Option<AcceptanceStatus>,
    /// New lifecycle status (only the complete event flips it).
    pub lifecycle: Option<LifecycleStatus>,
    /// Stamp for the accept event.
    pub accepted_at: Option<DateTime<Utc>>,
    /// Stamp for the accept event.
    pub accepted_by: Option<Uuid>,
    /// Stamp for the start event.
    pub started_at: Option<DateTime<Utc>>,
    /// Stamp for the complete event.
    pub completed_at: Option<DateTime<Utc>>,
    /// Stamp for the complete event.
    pub completed_by: Option<Uuid>,
}

impl TransitionPatch {
    /// Build the patch the fallback path writes for `event`, stamped at
    /// `now` on behalf of `driver_id`.
    #[must_use]
    pub fn for_event(
        event: TripEvent,
        driver_id: Uuid,
        expected: AcceptanceStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let mut patch = Self {
            expected,
            acceptance: None,
            lifecycle: None,
            accepted_at: None,
            accepted_by: None,
            started_at: None,
            completed_at: None,
            completed_by: None,
        };
        match event {
            TripEvent::Accept => {
                patch.acceptance = Some(AcceptanceStatus::Accepted);
                patch.accepted_at = Some(now);
                patch.accepted_by = Some(driver_id);
            }
            TripEvent::Decline => {
                patch.acceptance = Some(AcceptanceStatus::Declined);
            }
            TripEvent::Start => {
                patch.acceptance = Some(AcceptanceStatus::Started);
                patch.started_at = Some(now);
            }
            TripEvent::Complete => {
                // Acceptance stays put; completion is a lifecycle flip.
                patch.lifecycle = Some(LifecycleStatus::Completed);
                patch.completed_at = Some(now);
                patch.completed_by = Some(driver_id);
            }
        }
        patch
    }
}

// ---------------------------------------------------------------------------
// Capability probe
// ---------------------------------------------------------------------------

/// Procedure names the gateway probes for.
pub mod procedures {
    /// The driver-trips aggregation procedure.
    pub const FETCH_TRIPS: &str = "get_driver_trips_with_context";
    /// The atomic transition procedure.
    pub const APPLY_TRANSITION: &str = "update_driver_trip_status";
}

/// Per-session cache of which server-side procedures exist.
///
/// Starts optimistic. The first [`StoreError::ProcedureMissing`] for a
/// procedure flips its flag; every later call goes straight to the
/// fallback without re-probing.
#[derive(Debug)]
pub struct ProcedureProbe {
    fetch_rpc: AtomicBool,
    transition_rpc: AtomicBool,
}

impl ProcedureProbe {
    /// A probe assuming both procedures are deployed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fetch_rpc: AtomicBool::new(true),
            transition_rpc: AtomicBool::new(true),
        }
    }

    /// Is the fetch procedure believed to exist?
    #[must_use]
    pub fn fetch_rpc_available(&self) -> bool {
        self.fetch_rpc.load(Ordering::Relaxed)
    }

    /// Is the transition procedure believed to exist?
    #[must_use]
    pub fn transition_rpc_available(&self) -> bool {
        self.transition_rpc.load(Ordering::Relaxed)
    }

    fn mark_fetch_missing(&self) {
        self.fetch_rpc.store(false, Ordering::Relaxed);
    }

    fn mark_transition_missing(&self) {
        self.transition_rpc.store(false, Ordering::Relaxed);
    }
}

impl Default for ProcedureProbe {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Errors the gateway surfaces to its callers.
///
/// `ProcedureMissing` never appears here: it silently triggers the
/// fallback exactly once per call, and a fallback failure is classified
/// like any other.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The driver id is unknown to the store.
    #[error("driver {driver_id} not found")]
    DriverNotFound {
        /// The unknown id.
        driver_id: Uuid,
    },

    /// Transient store failure; the retry controller may try again.
    #[error("transient store failure: {source}")]
    Transient {
        /// The underlying store error.
        source: StoreError,
    },

    /// The store refused the operation. Hard failure, never retried.
    #[error("operation rejected: {reason}")]
    Rejected {
        /// Why the store said no.
        reason: RejectReason,
    },
}

impl GatewayError {
    /// Returns `true` when the retry controller should schedule another
    /// attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient { .. })
    }

    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::DriverNotFound { driver_id } => GatewayError::DriverNotFound { driver_id },
            StoreError::Rejected { reason } => GatewayError::Rejected { reason },
            // ProcedureMissing only reaches here if a *fallback* path
            // reported it, which means the store is misbehaving; treat it
            // like an outage.
            other => GatewayError::Transient { source: other },
        }
    }
}

/// Dual-path facade over a [`TripStore`].
///
/// Cheap to clone; clones share the probe, so a procedure discovered
/// missing stays missing for the whole session.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<dyn TripStore>,
    probe: Arc<ProcedureProbe>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("probe", &self.probe).finish()
    }
}

impl Gateway {
    /// Wrap a store with a fresh (optimistic) probe.
    #[must_use]
    pub fn new(store: Arc<dyn TripStore>) -> Self {
        Self {
            store,
            probe: Arc::new(ProcedureProbe::new()),
        }
    }

    /// The shared capability probe, for inspection in tests and status
    /// panels.
    #[must_use]
    pub fn probe(&self) -> &ProcedureProbe {
        &self.probe
    }

    /// Fetch the driver's trips, procedure first, direct read on
    /// fallback. Both paths return the same trip shape, sorted by pickup
    /// time (then id, for a stable order).
    pub async fn fetch_driver_trips(&self, driver_id: Uuid) -> Result<Vec<Trip>, GatewayError> {
        let mut trips = if self.probe.fetch_rpc_available() {
            match self.store.fetch_trips_rpc(driver_id).await {
                Ok(trips) => trips,
                Err(StoreError::ProcedureMissing { procedure }) => {
                    debug!(
                        target: "rp.gateway",
                        procedure,
                        "procedure missing, using direct query"
                    );
                    self.probe.mark_fetch_missing();
                    self.store
                        .select_trips(driver_id)
                        .await
                        .map_err(GatewayError::from_store)?
                }
                Err(other) => {
                    warn!(target: "rp.gateway", error = %other, "trip fetch failed");
                    return Err(GatewayError::from_store(other));
                }
            }
        } else {
            self.store
                .select_trips(driver_id)
                .await
                .map_err(GatewayError::from_store)?
        };

        trips.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(trips)
    }

    /// Apply a transition, procedure first, conditional direct write on
    /// fallback.
    ///
    /// `expected` is the acceptance status the caller last observed; the
    /// fallback write is keyed on it so a concurrent change surfaces as
    /// [`RejectReason::StaleState`] instead of being overwritten.
    pub async fn apply_transition(
        &self,
        trip_id: Uuid,
        driver_id: Uuid,
        event: TripEvent,
        expected: AcceptanceStatus,
    ) -> Result<Trip, GatewayError> {
        if self.probe.transition_rpc_available() {
            match self.store.transition_rpc(trip_id, driver_id, event).await {
                Ok(trip) => return Ok(trip),
                Err(StoreError::ProcedureMissing { procedure }) => {
                    debug!(
                        target: "rp.gateway",
                        procedure,
                        "procedure missing, using direct update"
                    );
                    self.probe.mark_transition_missing();
                }
                Err(other) => {
                    warn!(target: "rp.gateway", error = %other, %trip_id, "transition failed");
                    return Err(GatewayError::from_store(other));
                }
            }
        }

        let patch = TransitionPatch::for_event(event, driver_id, expected, Utc::now());
        self.store
            .update_trip(trip_id, driver_id, patch)
            .await
            .map_err(|err| {
                warn!(target: "rp.gateway", error = %err, %trip_id, "direct update failed");
                GatewayError::from_store(err)
            })
    }

    /// Read the lookup tables. Plain table reads in every deployment, so
    /// no dual path.
    pub async fn fetch_reference_data(&self) -> Result<ReferenceData, GatewayError> {
        self.store
            .fetch_reference()
            .await
            .map_err(GatewayError::from_store)
    }

    /// Read the driver's own record.
    pub async fn fetch_driver_profile(
        &self,
        driver_id: Uuid,
    ) -> Result<DriverProfile, GatewayError> {
        self.store
            .fetch_driver_profile(driver_id)
            .await
            .map_err(GatewayError::from_store)
    }

    /// Stamp `last_login`. Failures are logged and swallowed — older
    /// deployments lack the column.
    pub async fn touch_last_login(&self, driver_id: Uuid) {
        if let Err(err) = self.store.touch_last_login(driver_id).await {
            debug!(
                target: "rp.gateway",
                error = %err,
                %driver_id,
                "last_login update skipped"
            );
        }
    }
}
