// SPDX-License-Identifier: MIT OR Apache-2.0
//! rp-core
//!
//! The stable contract for the RidePilot driver portal.
//!
//! Everything downstream — the gateway, the cache, the session — speaks
//! in terms of the types defined here. If you only take one dependency,
//! take this one.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod machine;

pub use machine::{TerminalStatus, TransitionError, TripEvent};

/// Coarse project axis, independent of the driver's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    /// The booking is live: still awaiting or undergoing driver action.
    Active,

    /// The booking is done. Terminal — no acceptance event is legal.
    Completed,
}

/// The driver-response axis of a trip's lifecycle.
///
/// Transitions along this axis are owned by [`machine::try_transition`];
/// nothing else should mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceStatus {
    /// Offered to the driver, no response yet.
    Pending,

    /// Driver has accepted and will run the trip.
    Accepted,

    /// Driver is on the road.
    Started,

    /// Driver turned the trip down. Terminal.
    Declined,
}

impl std::fmt::Display for AcceptanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AcceptanceStatus::Pending => "pending",
            AcceptanceStatus::Accepted => "accepted",
            AcceptanceStatus::Started => "started",
            AcceptanceStatus::Declined => "declined",
        };
        f.write_str(s)
    }
}

/// How the client settles the trip. Informational from the driver's side;
/// this core never mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Already paid (card, invoice, prepaid).
    Paid,
    /// Collected by the driver on the day.
    Charge,
}

/// A single booking assignment as seen from the assigned driver's
/// perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Trip {
    /// Opaque unique identifier. Immutable.
    pub id: Uuid,

    /// The assigned driver. Set once at assignment time; the lifecycle
    /// never rewrites it.
    pub driver_id: Uuid,

    /// Operating company (read-only reference).
    pub company_id: Uuid,

    /// Requested vehicle class (read-only reference).
    pub car_type_id: Uuid,

    pub client_name: String,
    pub client_phone: String,

    pub pickup_location: String,
    pub dropoff_location: String,

    /// The composed pickup date + time. A single timestamp; used for
    /// urgency classification and display ordering.
    pub scheduled_at: DateTime<Utc>,

    pub passengers: u32,

    /// Trip price, non-negative.
    pub price: f64,

    /// Optional override of `price` for the driver's earnings. Only an
    /// override when present *and* positive — see [`Trip::earnings`].
    pub driver_fee: Option<f64>,

    /// Coarse active/completed axis.
    pub lifecycle: LifecycleStatus,

    /// Driver-response axis.
    pub acceptance: AcceptanceStatus,

    pub payment: PaymentStatus,

    pub description: Option<String>,
    pub booking_ref: Option<String>,

    /// Stamped by the accept transition.
    pub accepted_at: Option<DateTime<Utc>>,
    /// Stamped by the accept transition.
    pub accepted_by: Option<Uuid>,
    /// Stamped by the start transition.
    pub started_at: Option<DateTime<Utc>>,
    /// Stamped by the complete transition.
    pub completed_at: Option<DateTime<Utc>>,
    /// Stamped by the complete transition.
    pub completed_by: Option<Uuid>,

    pub created_at: DateTime<Utc>,

    /// Logical version counter, bumped by every applied transition.
    /// The cache uses it to order stale fetch results against newer
    /// local writes.
    pub revision: u64,
}

impl Trip {
    /// What the driver earns on this trip: the fee override when present
    /// and positive, otherwise the trip price.
    #[must_use]
    pub fn earnings(&self) -> f64 {
        match self.driver_fee {
            Some(fee) if fee > 0.0 => fee,
            _ => self.price,
        }
    }

    /// Returns `true` if no further acceptance transition is legal.
    ///
    /// A trip is terminal once its lifecycle is completed or the driver
    /// has declined it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.lifecycle == LifecycleStatus::Completed
            || self.acceptance == AcceptanceStatus::Declined
    }

    /// Urgency bucket of this trip relative to `now`.
    #[must_use]
    pub fn urgency(&self, now: DateTime<Utc>) -> Urgency {
        Urgency::classify(self.scheduled_at, now)
    }
}

/// How close a trip's pickup time is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Pickup time has already passed.
    Past,
    /// Pickup within the next two hours.
    Urgent,
    /// Pickup within the next twenty-four hours.
    Soon,
    /// Further out than a day.
    Scheduled,
}

impl Urgency {
    /// Classify a pickup timestamp against `now`.
    #[must_use]
    pub fn classify(scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let delta = scheduled_at.signed_duration_since(now);
        if delta < Duration::zero() {
            Urgency::Past
        } else if delta <= Duration::hours(2) {
            Urgency::Urgent
        } else if delta <= Duration::hours(24) {
            Urgency::Soon
        } else {
            Urgency::Scheduled
        }
    }
}

/// Headline counters for a driver's dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct DriverStats {
    /// Trips still awaiting a response.
    pub pending: usize,
    /// Trips accepted but not yet started.
    pub accepted: usize,
    /// Trips whose lifecycle is completed.
    pub completed: usize,
    /// Earnings summed over completed trips (fee override respected).
    pub total_earnings: f64,
}

impl DriverStats {
    /// Compute stats over a slice of trips.
    #[must_use]
    pub fn compute(trips: &[Trip]) -> Self {
        let mut stats = DriverStats::default();
        for trip in trips {
            match trip.acceptance {
                AcceptanceStatus::Pending => stats.pending += 1,
                AcceptanceStatus::Accepted => stats.accepted += 1,
                _ => {}
            }
            if trip.lifecycle == LifecycleStatus::Completed {
                stats.completed += 1;
                stats.total_earnings += trip.earnings();
            }
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

/// An operating company, as the driver portal sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
}

/// A vehicle class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CarType {
    pub id: Uuid,
    pub name: String,
    pub capacity: u32,
    pub description: Option<String>,
}

/// Read-only lookup tables fetched once per session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceData {
    pub companies: Vec<Company>,
    pub car_types: Vec<CarType>,
}

impl ReferenceData {
    /// Display name for a company, falling back when the id is unknown.
    #[must_use]
    pub fn company_name(&self, id: Uuid) -> &str {
        self.companies
            .iter()
            .find(|c| c.id == id)
            .map_or("Unknown Company", |c| c.name.as_str())
    }

    /// Display name for a vehicle class, falling back when the id is unknown.
    #[must_use]
    pub fn car_type_name(&self, id: Uuid) -> &str {
        self.car_types
            .iter()
            .find(|c| c.id == id)
            .map_or("Standard Vehicle", |c| c.name.as_str())
    }
}

/// The driver's own record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DriverProfile {
    pub id: Uuid,
    pub name: String,
    pub license: String,
    pub phone: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Errors from [`TripBuilder::build`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TripBuildError {
    /// `price` was negative.
    #[error("price must be non-negative, got {value}")]
    NegativePrice {
        /// The rejected value.
        value: f64,
    },

    /// `driver_fee` was negative.
    #[error("driver_fee must be non-negative, got {value}")]
    NegativeDriverFee {
        /// The rejected value.
        value: f64,
    },
}

/// Fluent constructor for [`Trip`] values.
///
/// Defaults to a freshly assigned trip: `Pending` / `Active`, zero price,
/// one passenger, payment on the day.
#[derive(Debug, Clone)]
pub struct TripBuilder {
    trip: Trip,
}

impl TripBuilder {
    /// Start building a trip assigned to `driver_id`, scheduled at
    /// `scheduled_at`.
    #[must_use]
    pub fn new(driver_id: Uuid, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            trip: Trip {
                id: Uuid::new_v4(),
                driver_id,
                company_id: Uuid::nil(),
                car_type_id: Uuid::nil(),
                client_name: String::new(),
                client_phone: String::new(),
                pickup_location: String::new(),
                dropoff_location: String::new(),
                scheduled_at,
                passengers: 1,
                price: 0.0,
                driver_fee: None,
                lifecycle: LifecycleStatus::Active,
                acceptance: AcceptanceStatus::Pending,
                payment: PaymentStatus::Charge,
                description: None,
                booking_ref: None,
                accepted_at: None,
                accepted_by: None,
                started_at: None,
                completed_at: None,
                completed_by: None,
                created_at: Utc::now(),
                revision: 0,
            },
        }
    }

    /// Override the generated trip id.
    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.trip.id = id;
        self
    }

    /// Set the operating company reference.
    #[must_use]
    pub fn company(mut self, id: Uuid) -> Self {
        self.trip.company_id = id;
        self
    }

    /// Set the vehicle class reference.
    #[must_use]
    pub fn car_type(mut self, id: Uuid) -> Self {
        self.trip.car_type_id = id;
        self
    }

    /// Set the client's name and phone.
    #[must_use]
    pub fn client(mut self, name: impl Into<String>, phone: impl Into<String>) -> Self {
        self.trip.client_name = name.into();
        self.trip.client_phone = phone.into();
        self
    }

    /// Set pickup and dropoff locations.
    #[must_use]
    pub fn route(mut self, pickup: impl Into<String>, dropoff: impl Into<String>) -> Self {
        self.trip.pickup_location = pickup.into();
        self.trip.dropoff_location = dropoff.into();
        self
    }

    /// Set the passenger count.
    #[must_use]
    pub fn passengers(mut self, count: u32) -> Self {
        self.trip.passengers = count;
        self
    }

    /// Set the trip price.
    #[must_use]
    pub fn price(mut self, price: f64) -> Self {
        self.trip.price = price;
        self
    }

    /// Set the driver-fee override.
    #[must_use]
    pub fn driver_fee(mut self, fee: f64) -> Self {
        self.trip.driver_fee = Some(fee);
        self
    }

    /// Set the payment mode.
    #[must_use]
    pub fn payment(mut self, payment: PaymentStatus) -> Self {
        self.trip.payment = payment;
        self
    }

    /// Attach a free-form description.
    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.trip.description = Some(text.into());
        self
    }

    /// Attach an external booking reference.
    #[must_use]
    pub fn booking_ref(mut self, reference: impl Into<String>) -> Self {
        self.trip.booking_ref = Some(reference.into());
        self
    }

    /// Start from a non-default acceptance status (test fixtures).
    #[must_use]
    pub fn acceptance(mut self, status: AcceptanceStatus) -> Self {
        self.trip.acceptance = status;
        self
    }

    /// Start from a non-default lifecycle status (test fixtures).
    #[must_use]
    pub fn lifecycle(mut self, status: LifecycleStatus) -> Self {
        self.trip.lifecycle = status;
        self
    }

    /// Finalize, validating money fields.
    pub fn build(self) -> Result<Trip, TripBuildError> {
        if self.trip.price < 0.0 {
            return Err(TripBuildError::NegativePrice {
                value: self.trip.price,
            });
        }
        if let Some(fee) = self.trip.driver_fee
            && fee < 0.0
        {
            return Err(TripBuildError::NegativeDriverFee { value: fee });
        }
        Ok(self.trip)
    }
}
