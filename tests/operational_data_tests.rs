/// Operational-data broker tests
///
/// Provider fan-out, merge into the working tree, and the bounded wait.
/// Run with: cargo test --test operational_data_tests
mod common;

use rustconfdb::{
    Credentials, Datastore, DbError, NotifEventFilter, SubscriberEvent, SubscriptionKind,
    TypedValue, Value,
};
use std::time::{Duration, Instant};

#[tokio::test]
async fn provider_data_merges_into_reads() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let provider = conn
        .session_start(Credentials::new("daemon"), Datastore::Running)
        .await
        .unwrap();
    let (_id, mut rx) = provider
        .subscribe(
            "state-module",
            Some("/state-module:stats"),
            SubscriptionKind::OperationalData,
            0,
            NotifEventFilter::Both,
            false,
        )
        .await
        .unwrap();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let SubscriberEvent::DataRequested { xpath, reply } = event {
                assert_eq!(xpath, "/state-module:stats");
                let _ = reply.send(Ok(vec![TypedValue::new(
                    "/state-module:stats/counter",
                    Value::Uint64(42),
                )]));
            }
        }
    });

    let reader = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();
    let counter = reader
        .get_item("/state-module:stats/counter")
        .await
        .unwrap();
    assert_eq!(counter.value, Value::Uint64(42));
}

#[tokio::test]
async fn silent_provider_cannot_stall_a_read() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let provider = conn
        .session_start(Credentials::new("daemon"), Datastore::Running)
        .await
        .unwrap();
    let (_id, mut rx) = provider
        .subscribe(
            "state-module",
            Some("/state-module:stats"),
            SubscriptionKind::OperationalData,
            0,
            NotifEventFilter::Both,
            false,
        )
        .await
        .unwrap();
    // hold the reply senders without ever answering
    tokio::spawn(async move {
        let mut parked = Vec::new();
        while let Some(event) = rx.recv().await {
            if let SubscriberEvent::DataRequested { reply, .. } = event {
                parked.push(reply);
            }
        }
    });

    let reader = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();
    let started = Instant::now();
    // the read completes with whatever arrived (nothing), it is not dropped
    let result = reader.get_item("/state-module:stats/counter").await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(DbError::NotFound(_))));
    // bounded by the operational-data wait (300 ms in the test config) plus
    // scheduling slack, far below the request timeout
    assert!(elapsed >= Duration::from_millis(250), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "waited too long: {:?}", elapsed);
}

#[tokio::test]
async fn slow_provider_does_not_shadow_faster_answers() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    // registered first: a provider that parks every request past the deadline
    let stalling = conn
        .session_start(Credentials::new("stalling"), Datastore::Running)
        .await
        .unwrap();
    let (_stall_id, mut stall_rx) = stalling
        .subscribe(
            "state-module",
            Some("/state-module:stats"),
            SubscriptionKind::OperationalData,
            0,
            NotifEventFilter::Both,
            false,
        )
        .await
        .unwrap();
    tokio::spawn(async move {
        let mut parked = Vec::new();
        while let Some(event) = stall_rx.recv().await {
            if let SubscriberEvent::DataRequested { reply, .. } = event {
                parked.push(reply);
            }
        }
    });

    // registered second: answers immediately
    let fast = conn
        .session_start(Credentials::new("fast"), Datastore::Running)
        .await
        .unwrap();
    let (_fast_id, mut fast_rx) = fast
        .subscribe(
            "state-module",
            Some("/state-module:stats"),
            SubscriptionKind::OperationalData,
            0,
            NotifEventFilter::Both,
            false,
        )
        .await
        .unwrap();
    tokio::spawn(async move {
        while let Some(event) = fast_rx.recv().await {
            if let SubscriberEvent::DataRequested { reply, .. } = event {
                let _ = reply.send(Ok(vec![TypedValue::new(
                    "/state-module:stats/counter",
                    Value::Uint64(7),
                )]));
            }
        }
    });

    let reader = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();
    let started = Instant::now();
    let counter = reader
        .get_item("/state-module:stats/counter")
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // the fast answer landed even though an earlier provider stalled
    assert_eq!(counter.value, Value::Uint64(7));
    // the read still waits out (only) the shared deadline for the stalled one
    assert!(elapsed >= Duration::from_millis(250), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "waited too long: {:?}", elapsed);
}

#[tokio::test]
async fn reads_without_providers_skip_the_wait() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let reader = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();
    let started = Instant::now();
    let result = reader.get_item("/state-module:stats/counter").await;
    assert!(matches!(result, Err(DbError::NotFound(_))));
    assert!(started.elapsed() < Duration::from_millis(250));
}
