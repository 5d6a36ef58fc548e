// SPDX-License-Identifier: MIT OR Apache-2.0
//! RidePilot driver portal core, re-exported as one facade crate.
//!
//! Downstream surfaces (the dispatcher console, the driver portal)
//! depend on this crate and get the whole stack: domain model and
//! lifecycle machine, dual-path store gateway, trip cache, retry
//! controller, configuration, and the per-login session orchestrator.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use rp_cache as cache;
pub use rp_config as config;
pub use rp_core as core;
pub use rp_gateway as gateway;
pub use rp_retry as retry;
pub use rp_session as session;

pub use rp_core::{
    AcceptanceStatus, DriverStats, LifecycleStatus, PaymentStatus, TransitionError, Trip,
    TripEvent, Urgency,
};
pub use rp_gateway::{Gateway, GatewayError, RejectReason, StoreError, TripStore};
pub use rp_session::{DriverSession, Refresh, SessionError};
