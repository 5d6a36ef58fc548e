// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry and single-flight semantics of the session's fetch cycle,
//! driven under paused time so the backoff schedule is asserted exactly.

use chrono::{Duration as ChronoDuration, Utc};
use ridepilot::core::{Trip, TripBuilder};
use ridepilot::retry::FetchState;
use ridepilot::session::{DriverSession, Refresh, SessionError};
use rp_store_mock::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

fn trip_for(driver: Uuid) -> Trip {
    TripBuilder::new(driver, Utc::now() + ChronoDuration::hours(2))
        .price(30.0)
        .build()
        .unwrap()
}

fn session_over(store: &MemoryStore, driver: Uuid) -> DriverSession {
    // RUST_LOG=rp=debug shows the retry schedule while debugging.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    DriverSession::new(
        Arc::new(store.clone()),
        driver,
        rp_config::PortalConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn transient_outage_is_retried_with_linear_backoff() {
    let store = MemoryStore::new();
    let driver = Uuid::new_v4();
    store.seed_trip(trip_for(driver)).await;
    store.fail_fetches(2);

    let session = session_over(&store, driver);
    let began = Instant::now();
    let outcome = session.sync().await.unwrap();

    assert_eq!(outcome, Refresh::Completed { trips: 1 });
    // Initial attempt + 2 retries after 1s and 2s of backoff.
    assert_eq!(store.fetch_calls(), 3);
    assert_eq!(began.elapsed(), Duration::from_secs(3));
    assert_eq!(session.retry_state(), FetchState::Idle);
    assert!(session.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn persistent_outage_exhausts_after_three_retries() {
    let store = MemoryStore::new();
    let driver = Uuid::new_v4();
    store.seed_trip(trip_for(driver)).await;
    store.fail_fetches(u32::MAX);

    let session = session_over(&store, driver);
    let began = Instant::now();
    let err = session.sync().await.unwrap_err();

    match err {
        SessionError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    // Initial attempt + exactly 3 automatic retries, never a 4th.
    assert_eq!(store.fetch_calls(), 4);
    // Backoff slept 1s + 2s + 3s before giving up.
    assert_eq!(began.elapsed(), Duration::from_secs(6));
    assert_eq!(session.retry_state(), FetchState::Exhausted);
    assert!(session.last_error().is_some());
}

#[tokio::test(start_paused = true)]
async fn exhausted_session_fails_fast_until_manual_refresh() {
    let store = MemoryStore::new();
    let driver = Uuid::new_v4();
    store.seed_trip(trip_for(driver)).await;
    store.fail_fetches(u32::MAX);

    let session = session_over(&store, driver);
    session.sync().await.unwrap_err();
    let calls_after_exhaustion = store.fetch_calls();

    // Further automatic syncs do not touch the store.
    let err = session.sync().await.unwrap_err();
    assert!(matches!(err, SessionError::RetriesExhausted { .. }));
    assert_eq!(store.fetch_calls(), calls_after_exhaustion);

    // A manual refresh re-arms the controller and runs a fresh streak.
    store.fail_fetches(0);
    let outcome = session.refresh().await.unwrap();
    assert_eq!(outcome, Refresh::Completed { trips: 1 });
    assert_eq!(session.retry_state(), FetchState::Idle);
}

#[tokio::test(start_paused = true)]
async fn fetches_are_single_flight() {
    let store = MemoryStore::new();
    let driver = Uuid::new_v4();
    store.seed_trip(trip_for(driver)).await;
    store.set_fetch_delay(Some(Duration::from_secs(5)));

    let session = Arc::new(session_over(&store, driver));

    let background = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.sync().await })
    };
    // Let the background sync enter the store before piling on.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    // While the fetch is in flight, both sync and refresh step aside.
    assert_eq!(session.sync().await.unwrap(), Refresh::AlreadyInFlight);
    assert_eq!(session.refresh().await.unwrap(), Refresh::AlreadyInFlight);
    assert_eq!(session.retry_state(), FetchState::Fetching);

    let outcome = background.await.unwrap().unwrap();
    assert_eq!(outcome, Refresh::Completed { trips: 1 });
    assert_eq!(store.max_concurrent_fetches(), 1);
    assert_eq!(store.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_fetches_immediately() {
    let store = MemoryStore::new();
    let driver = Uuid::new_v4();
    store.seed_trip(trip_for(driver)).await;
    store.fail_fetches(u32::MAX);

    let session = session_over(&store, driver);
    session.sync().await.unwrap_err();
    assert_eq!(session.retry_state(), FetchState::Exhausted);

    store.fail_fetches(0);
    let began = Instant::now();
    session.refresh().await.unwrap();
    // The fresh streak succeeds on its first attempt, no backoff sleep.
    assert_eq!(began.elapsed(), Duration::ZERO);
}
