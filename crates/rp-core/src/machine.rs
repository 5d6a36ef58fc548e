// SPDX-License-Identifier: MIT OR Apache-2.0
//! The trip acceptance state machine.
//!
//! Pure transition logic over [`Trip`] values: ownership guard, terminality,
//! and the legal transition table. No storage, no clock dependency beyond
//! the caller-supplied timestamp. Both the dispatcher surface and the
//! driver portal validate through here, so the table lives in exactly one
//! place.

use crate::{AcceptanceStatus, LifecycleStatus, Trip};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A requested lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TripEvent {
    /// Driver takes the trip (`Pending → Accepted`).
    Accept,
    /// Driver turns the trip down (`Pending → Declined`).
    Decline,
    /// Driver is on the way (`Accepted → Started`).
    Start,
    /// Trip is done (`Started`, lifecycle flips to `Completed`).
    Complete,
}

impl std::fmt::Display for TripEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TripEvent::Accept => "accept",
            TripEvent::Decline => "decline",
            TripEvent::Start => "start",
            TripEvent::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Which terminal state a trip is stuck in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Lifecycle is completed.
    Completed,
    /// The driver declined the trip.
    Declined,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Declined => "declined",
        };
        f.write_str(s)
    }
}

/// Why a requested transition is illegal.
///
/// All three variants are detected locally, before any network call, and
/// must never be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransitionError {
    /// The requester is not the assigned driver.
    #[error("driver {requester} is not assigned to this trip (assigned: {owner})")]
    NotOwner {
        /// Who asked.
        requester: Uuid,
        /// Who the trip belongs to.
        owner: Uuid,
    },

    /// The trip is in a terminal state; no event is legal.
    #[error("trip is already {status}; no further transitions are possible")]
    AlreadyTerminal {
        /// The terminal state the trip is in.
        status: TerminalStatus,
    },

    /// The event is not defined for the trip's current state.
    #[error("cannot {event} a trip that is {from}")]
    InvalidTransition {
        /// Acceptance status at the time of the request.
        from: AcceptanceStatus,
        /// The rejected event.
        event: TripEvent,
    },
}

/// The events legal from a trip's current state.
///
/// Ownership is not considered here; this is the table only. Useful for
/// view adapters deciding which actions to offer.
#[must_use]
pub fn legal_events(trip: &Trip) -> &'static [TripEvent] {
    if trip.is_terminal() {
        return &[];
    }
    match trip.acceptance {
        AcceptanceStatus::Pending => &[TripEvent::Accept, TripEvent::Decline],
        AcceptanceStatus::Accepted => &[TripEvent::Start],
        AcceptanceStatus::Started => &[TripEvent::Complete],
        AcceptanceStatus::Declined => &[],
    }
}

/// Validate and apply `event` to `trip`, stamping timestamps with `now`.
///
/// Guard order: ownership, then terminality, then the transition table.
/// On success returns the updated trip value with its revision bumped;
/// the input is untouched either way.
pub fn try_transition_at(
    trip: &Trip,
    event: TripEvent,
    requester: Uuid,
    now: DateTime<Utc>,
) -> Result<Trip, TransitionError> {
    if requester != trip.driver_id {
        return Err(TransitionError::NotOwner {
            requester,
            owner: trip.driver_id,
        });
    }

    if trip.lifecycle == LifecycleStatus::Completed {
        return Err(TransitionError::AlreadyTerminal {
            status: TerminalStatus::Completed,
        });
    }
    if trip.acceptance == AcceptanceStatus::Declined {
        return Err(TransitionError::AlreadyTerminal {
            status: TerminalStatus::Declined,
        });
    }

    let mut next = trip.clone();
    match (trip.acceptance, event) {
        (AcceptanceStatus::Pending, TripEvent::Accept) => {
            next.acceptance = AcceptanceStatus::Accepted;
            next.accepted_at = Some(now);
            next.accepted_by = Some(requester);
        }
        (AcceptanceStatus::Pending, TripEvent::Decline) => {
            next.acceptance = AcceptanceStatus::Declined;
        }
        (AcceptanceStatus::Accepted, TripEvent::Start) => {
            next.acceptance = AcceptanceStatus::Started;
            next.started_at = Some(now);
        }
        (AcceptanceStatus::Started, TripEvent::Complete) => {
            // The acceptance field is left as-is: completed trips are
            // identified by lifecycle, not by an acceptance value.
            next.lifecycle = LifecycleStatus::Completed;
            next.completed_at = Some(now);
            next.completed_by = Some(requester);
        }
        (from, event) => {
            return Err(TransitionError::InvalidTransition { from, event });
        }
    }

    next.revision = trip.revision.saturating_add(1);
    Ok(next)
}

/// [`try_transition_at`] stamped with the current wall clock.
pub fn try_transition(
    trip: &Trip,
    event: TripEvent,
    requester: Uuid,
) -> Result<Trip, TransitionError> {
    try_transition_at(trip, event, requester, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TripBuilder;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap()
    }

    fn pending_trip(driver: Uuid) -> Trip {
        TripBuilder::new(driver, now() + chrono::Duration::hours(4))
            .price(50.0)
            .build()
            .unwrap()
    }

    #[test]
    fn accept_from_pending_stamps_and_bumps() {
        let driver = Uuid::new_v4();
        let trip = pending_trip(driver);

        let next = try_transition_at(&trip, TripEvent::Accept, driver, now()).unwrap();
        assert_eq!(next.acceptance, AcceptanceStatus::Accepted);
        assert_eq!(next.accepted_at, Some(now()));
        assert_eq!(next.accepted_by, Some(driver));
        assert_eq!(next.revision, trip.revision + 1);
        // Input is untouched.
        assert_eq!(trip.acceptance, AcceptanceStatus::Pending);
    }

    #[test]
    fn decline_from_pending_is_terminal() {
        let driver = Uuid::new_v4();
        let trip = pending_trip(driver);

        let declined = try_transition_at(&trip, TripEvent::Decline, driver, now()).unwrap();
        assert_eq!(declined.acceptance, AcceptanceStatus::Declined);
        assert!(declined.is_terminal());

        for event in [TripEvent::Accept, TripEvent::Start, TripEvent::Complete] {
            let err = try_transition_at(&declined, event, driver, now()).unwrap_err();
            assert_eq!(
                err,
                TransitionError::AlreadyTerminal {
                    status: TerminalStatus::Declined
                }
            );
        }
    }

    #[test]
    fn full_lifecycle_accept_start_complete() {
        let driver = Uuid::new_v4();
        let trip = pending_trip(driver);

        let accepted = try_transition_at(&trip, TripEvent::Accept, driver, now()).unwrap();
        let started = try_transition_at(&accepted, TripEvent::Start, driver, now()).unwrap();
        assert_eq!(started.acceptance, AcceptanceStatus::Started);
        assert_eq!(started.started_at, Some(now()));

        let done = try_transition_at(&started, TripEvent::Complete, driver, now()).unwrap();
        assert_eq!(done.lifecycle, LifecycleStatus::Completed);
        assert_eq!(done.completed_by, Some(driver));
        // Acceptance is no longer authoritative but must not be rewritten.
        assert_eq!(done.acceptance, AcceptanceStatus::Started);
        assert_eq!(done.revision, 3);

        let err = try_transition_at(&done, TripEvent::Accept, driver, now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::AlreadyTerminal {
                status: TerminalStatus::Completed
            }
        );
    }

    #[test]
    fn pending_only_allows_accept_or_decline() {
        let driver = Uuid::new_v4();
        let trip = pending_trip(driver);

        for event in [TripEvent::Start, TripEvent::Complete] {
            let err = try_transition_at(&trip, event, driver, now()).unwrap_err();
            assert_eq!(
                err,
                TransitionError::InvalidTransition {
                    from: AcceptanceStatus::Pending,
                    event
                }
            );
        }
    }

    #[test]
    fn no_skipping_states() {
        let driver = Uuid::new_v4();
        let accepted = try_transition_at(&pending_trip(driver), TripEvent::Accept, driver, now())
            .unwrap();

        let err = try_transition_at(&accepted, TripEvent::Complete, driver, now()).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
        // No going back either.
        let err = try_transition_at(&accepted, TripEvent::Accept, driver, now()).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }

    #[test]
    fn ownership_guard_fires_before_state_checks() {
        let driver = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let mut trip = pending_trip(driver);
        trip.lifecycle = LifecycleStatus::Completed;

        // Even on a terminal trip, a foreign requester sees NotOwner.
        let err = try_transition_at(&trip, TripEvent::Accept, stranger, now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::NotOwner {
                requester: stranger,
                owner: driver
            }
        );
    }

    #[test]
    fn legal_events_mirror_the_table() {
        let driver = Uuid::new_v4();
        let trip = pending_trip(driver);
        assert_eq!(legal_events(&trip), &[TripEvent::Accept, TripEvent::Decline]);

        let accepted = try_transition_at(&trip, TripEvent::Accept, driver, now()).unwrap();
        assert_eq!(legal_events(&accepted), &[TripEvent::Start]);

        let started = try_transition_at(&accepted, TripEvent::Start, driver, now()).unwrap();
        assert_eq!(legal_events(&started), &[TripEvent::Complete]);

        let done = try_transition_at(&started, TripEvent::Complete, driver, now()).unwrap();
        assert!(legal_events(&done).is_empty());
    }

    #[test]
    fn transition_error_serde_roundtrip() {
        let errors = [
            TransitionError::NotOwner {
                requester: Uuid::new_v4(),
                owner: Uuid::new_v4(),
            },
            TransitionError::AlreadyTerminal {
                status: TerminalStatus::Declined,
            },
            TransitionError::InvalidTransition {
                from: AcceptanceStatus::Accepted,
                event: TripEvent::Accept,
            },
        ];
        for err in &errors {
            let json = serde_json::to_string(err).unwrap();
            let back: TransitionError = serde_json::from_str(&json).unwrap();
            assert_eq!(&back, err);
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::TripBuilder;
    use proptest::prelude::*;

    fn arb_status() -> impl Strategy<Value = AcceptanceStatus> {
        prop_oneof![
            Just(AcceptanceStatus::Pending),
            Just(AcceptanceStatus::Accepted),
            Just(AcceptanceStatus::Started),
            Just(AcceptanceStatus::Declined),
        ]
    }

    fn arb_lifecycle() -> impl Strategy<Value = LifecycleStatus> {
        prop_oneof![
            Just(LifecycleStatus::Active),
            Just(LifecycleStatus::Completed),
        ]
    }

    fn arb_event() -> impl Strategy<Value = TripEvent> {
        prop_oneof![
            Just(TripEvent::Accept),
            Just(TripEvent::Decline),
            Just(TripEvent::Start),
            Just(TripEvent::Complete),
        ]
    }

    fn rank(status: AcceptanceStatus) -> u8 {
        match status {
            AcceptanceStatus::Pending => 0,
            AcceptanceStatus::Accepted => 1,
            AcceptanceStatus::Started => 2,
            AcceptanceStatus::Declined => 3,
        }
    }

    proptest! {
        /// A foreign requester is rejected with NotOwner for every
        /// state/event combination.
        #[test]
        fn foreign_requester_always_not_owner(
            acceptance in arb_status(),
            lifecycle in arb_lifecycle(),
            event in arb_event(),
        ) {
            let driver = Uuid::new_v4();
            let stranger = Uuid::new_v4();
            let trip = TripBuilder::new(driver, Utc::now())
                .acceptance(acceptance)
                .lifecycle(lifecycle)
                .build()
                .unwrap();

            let err = try_transition(&trip, event, stranger).unwrap_err();
            let is_not_owner = matches!(err, TransitionError::NotOwner { .. });
            prop_assert!(is_not_owner);
        }

        /// No event sequence ever moves the acceptance axis backwards or
        /// reopens a terminal trip.
        #[test]
        fn event_sequences_are_monotonic(events in prop::collection::vec(arb_event(), 1..12)) {
            let driver = Uuid::new_v4();
            let mut trip = TripBuilder::new(driver, Utc::now()).build().unwrap();

            for event in events {
                let was_terminal = trip.is_terminal();
                let before = rank(trip.acceptance);
                match try_transition(&trip, event, driver) {
                    Ok(next) => {
                        prop_assert!(!was_terminal);
                        prop_assert!(rank(next.acceptance) >= before);
                        prop_assert_eq!(next.revision, trip.revision + 1);
                        trip = next;
                    }
                    Err(_) => {
                        // Rejected events leave nothing behind; `trip` is
                        // unchanged by construction.
                    }
                }
            }
        }

        /// Completion always flips the lifecycle and only ever happens
        /// from Started.
        #[test]
        fn complete_only_from_started(acceptance in arb_status()) {
            let driver = Uuid::new_v4();
            let trip = TripBuilder::new(driver, Utc::now())
                .acceptance(acceptance)
                .build()
                .unwrap();

            match try_transition(&trip, TripEvent::Complete, driver) {
                Ok(next) => {
                    prop_assert_eq!(acceptance, AcceptanceStatus::Started);
                    prop_assert_eq!(next.lifecycle, LifecycleStatus::Completed);
                }
                Err(_) => prop_assert_ne!(acceptance, AcceptanceStatus::Started),
            }
        }
    }
}
