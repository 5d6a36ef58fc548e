// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-session trip cache for the driver portal.
//!
//! The cache is the UI's source of truth between fetches: populated by a
//! full fetch, patched optimistically after each successful transition,
//! discarded on logout. It carries no merge logic beyond last-write-wins
//! per trip — cross-client convergence is the live subscription's job —
//! but it does enforce one ordering guarantee: a fetch that was *issued*
//! before a local write may never overwrite that write when it lands.
//!
//! The guarantee is sequence-based. Every local mutation bumps a session
//! counter; [`TripCache::begin_fetch`] captures the counter into a
//! [`FetchTicket`], and [`TripCache::commit_fetch`] skips any trip the
//! session touched after the ticket was cut.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Datelike, Utc};
use rp_core::{DriverStats, LifecycleStatus, Trip, Urgency};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Snapshot of the session counter at the moment a fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    seq: u64,
}

/// In-memory view of one driver's trips.
#[derive(Debug, Default)]
pub struct TripCache {
    entries: HashMap<Uuid, CacheEntry>,
    seq: u64,
}

#[derive(Debug)]
struct CacheEntry {
    trip: Trip,
    /// Session counter value of the last local write to this trip.
    /// Zero for entries that arrived via fetch.
    touched_seq: u64,
}

impl TripCache {
    /// An empty cache (session start).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut a ticket before issuing a fetch. Anything written locally
    /// after this point outranks the fetch's results.
    #[must_use]
    pub fn begin_fetch(&self) -> FetchTicket {
        FetchTicket { seq: self.seq }
    }

    /// Replace the entry set with a fetch result.
    ///
    /// Trips the session touched after `ticket` keep their local value;
    /// everything else — including entries absent from the fetch — is
    /// replaced wholesale. Returns how many fetched trips were skipped
    /// in favour of a newer local write.
    pub fn commit_fetch(&mut self, ticket: FetchTicket, trips: Vec<Trip>) -> usize {
        let mut kept: HashMap<Uuid, CacheEntry> = self
            .entries
            .drain()
            .filter(|(_, e)| e.touched_seq > ticket.seq)
            .collect();

        let mut skipped = 0;
        let mut next: HashMap<Uuid, CacheEntry> = HashMap::with_capacity(trips.len());
        for trip in trips {
            if let Some(local) = kept.remove(&trip.id) {
                debug!(
                    target: "rp.cache",
                    trip_id = %trip.id,
                    "stale fetch result skipped; local write is newer"
                );
                skipped += 1;
                next.insert(trip.id, local);
            } else {
                next.insert(trip.id, CacheEntry {
                    trip,
                    touched_seq: 0,
                });
            }
        }
        // Locally written trips the fetch didn't return at all.
        next.extend(kept);

        self.entries = next;
        skipped
    }

    /// Upsert one trip after a successful transition (optimistic update).
    pub fn apply_local(&mut self, trip: Trip) {
        self.seq += 1;
        self.entries.insert(trip.id, CacheEntry {
            trip,
            touched_seq: self.seq,
        });
    }

    /// Look up a single trip.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&Trip> {
        self.entries.get(&id).map(|e| &e.trip)
    }

    /// All trips, sorted by pickup time then id for a deterministic order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Trip> {
        let mut trips: Vec<Trip> = self.entries.values().map(|e| e.trip.clone()).collect();
        trips.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        trips
    }

    /// Number of cached trips.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything (logout).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Dashboard counters over the cached trips.
    #[must_use]
    pub fn stats(&self) -> DriverStats {
        DriverStats::compute(&self.snapshot())
    }

    /// Bucketed schedule view relative to `now`.
    #[must_use]
    pub fn board(&self, now: DateTime<Utc>) -> ScheduleBoard {
        ScheduleBoard::organize(self.snapshot(), now)
    }
}

/// The dashboard's bucketed schedule: urgent first, then the rest of
/// today, then everything upcoming, with completed trips set aside.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleBoard {
    /// Active trips with pickup within the next two hours.
    pub urgent: Vec<Trip>,
    /// Other active trips scheduled for today.
    pub today: Vec<Trip>,
    /// Remaining active trips (including already-past ones).
    pub upcoming: Vec<Trip>,
    /// Trips whose lifecycle is completed.
    pub completed: Vec<Trip>,
}

impl ScheduleBoard {
    /// Bucket and sort `trips` relative to `now`.
    ///
    /// "Today" compares calendar dates in UTC; each bucket is sorted by
    /// pickup time.
    #[must_use]
    pub fn organize(trips: Vec<Trip>, now: DateTime<Utc>) -> Self {
        let mut board = ScheduleBoard::default();

        for trip in trips {
            if trip.lifecycle == LifecycleStatus::Completed {
                board.completed.push(trip);
                continue;
            }
            let same_day = trip.scheduled_at.num_days_from_ce() == now.num_days_from_ce();
            match trip.urgency(now) {
                Urgency::Urgent => board.urgent.push(trip),
                _ if same_day => board.today.push(trip),
                _ => board.upcoming.push(trip),
            }
        }

        for bucket in [
            &mut board.urgent,
            &mut board.today,
            &mut board.upcoming,
            &mut board.completed,
        ] {
            bucket.sort_by_key(|t| t.scheduled_at);
        }
        board
    }

    /// Total trips across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.urgent.len() + self.today.len() + self.upcoming.len() + self.completed.len()
    }

    /// Returns `true` when every bucket is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
