/// RPC, action and event-notification tests
///
/// Input-default materialization, bad elements, nested action presence,
/// notification delivery and replay.
/// Run with: cargo test --test rpc_action_tests
mod common;

use rustconfdb::{
    Credentials, Datastore, DbError, EditFlags, NotifEventFilter, SubscriberEvent,
    SubscriptionKind, TypedValue, Value,
};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn rpc_input_defaults_are_materialized() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let provider = conn
        .session_start(Credentials::new("daemon"), Datastore::Running)
        .await
        .unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let (_id, mut rx) = provider
        .subscribe(
            "test-module",
            Some("/test-module:activate-software-image"),
            SubscriptionKind::Rpc,
            0,
            NotifEventFilter::Both,
            false,
        )
        .await
        .unwrap();
    {
        let received = Arc::clone(&received);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let SubscriberEvent::Rpc { input, reply, .. } = event {
                    received.lock().unwrap().extend(input.iter().cloned());
                    let _ = reply.send(Ok(vec![TypedValue::new(
                        "/test-module:activate-software-image/status",
                        Value::String("installed".into()),
                    )]));
                }
            }
        });
    }

    let caller = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();
    let output = caller
        .rpc_send(
            "/test-module:activate-software-image",
            vec![TypedValue::new(
                "/test-module:activate-software-image/image-name",
                Value::String("acmefw-2.3".into()),
            )],
        )
        .await
        .unwrap();

    // the default `location` leaf was added to the validated input
    let inputs = received.lock().unwrap().clone();
    assert_eq!(inputs.len(), 2);
    assert!(inputs.iter().any(|v| v.xpath.ends_with("/location") && v.origin_default));

    assert_eq!(output.len(), 1);
    assert_eq!(output[0].value, Value::String("installed".into()));
}

#[tokio::test]
async fn unknown_rpc_input_is_bad_element() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();
    let caller = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();

    let err = caller
        .rpc_send(
            "/test-module:activate-software-image",
            vec![TypedValue::new(
                "/test-module:activate-software-image/non-existing-input",
                Value::String("x".into()),
            )],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::BadElement(_)));
}

#[tokio::test]
async fn rpc_without_handler_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();
    let caller = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();

    let err = caller
        .rpc_send("/test-module:activate-software-image", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NotFound(_)));
}

#[tokio::test]
async fn nested_action_requires_existing_parent() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let provider = conn
        .session_start(Credentials::new("daemon"), Datastore::Startup)
        .await
        .unwrap();
    let (_id, mut rx) = provider
        .subscribe(
            "test-module",
            None,
            SubscriptionKind::Action,
            0,
            NotifEventFilter::Both,
            false,
        )
        .await
        .unwrap();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let SubscriberEvent::Action { reply, .. } = event {
                let _ = reply.send(Ok(Vec::new()));
            }
        }
    });

    let session = conn
        .session_start(Credentials::new("admin"), Datastore::Startup)
        .await
        .unwrap();
    session
        .set_item(
            "/test-module:kernel-modules/kernel-module[name='irqbypass.ko']",
            None,
            EditFlags::default(),
        )
        .await
        .unwrap();

    session
        .action_send(
            "/test-module:kernel-modules/kernel-module[name=\"irqbypass.ko\"]/status-change",
            Vec::new(),
        )
        .await
        .unwrap();

    let err = session
        .action_send(
            "/test-module:kernel-modules/kernel-module[name=\"non-existent-module\"]/status-change",
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::BadElement(_)));
}

#[tokio::test]
async fn event_notification_is_delivered_and_retained() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let listener = conn
        .session_start(Credentials::new("daemon"), Datastore::Running)
        .await
        .unwrap();
    let (_id, mut rx) = listener
        .subscribe(
            "test-module",
            Some("/test-module:link-down"),
            SubscriptionKind::EventNotification,
            0,
            NotifEventFilter::Both,
            false,
        )
        .await
        .unwrap();

    let sender = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();
    sender
        .event_notif_send(
            "/test-module:link-down",
            vec![TypedValue::new(
                "/test-module:link-down/severity",
                Value::String("major".into()),
            )],
        )
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        SubscriberEvent::EventNotification { xpath, values, .. } => {
            assert_eq!(xpath, "/test-module:link-down");
            assert_eq!(values.len(), 1);
            assert_eq!(values[0].value, Value::String("major".into()));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // replayable from the retained store
    let replayed = db
        .replay_notifications(Some("/test-module:link-down"), 0, i64::MAX)
        .unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].values[0].value, Value::String("major".into()));
}

#[tokio::test]
async fn notification_argument_type_is_checked() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();
    let sender = conn
        .session_start(Credentials::new("admin"), Datastore::Running)
        .await
        .unwrap();

    let err = sender
        .event_notif_send(
            "/test-module:link-down",
            vec![TypedValue::new(
                "/test-module:link-down/severity",
                Value::Uint8(3),
            )],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidArg(_)));
}
