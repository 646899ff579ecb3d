/// Concurrent access tests
///
/// Session isolation, refresh-and-replay over concurrent commits, and
/// per-session dispatch serialization.
/// Run with: cargo test --test concurrent_access_tests
mod common;

use rustconfdb::{Credentials, Datastore, DbError, EditFlags, Value};
use std::sync::Arc;

#[tokio::test]
async fn stale_reader_sees_old_snapshot_until_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let writer = conn
        .session_start(Credentials::new("alice"), Datastore::Startup)
        .await
        .unwrap();
    let reader = conn
        .session_start(Credentials::new("bob"), Datastore::Startup)
        .await
        .unwrap();

    let xpath = "/example-module:container/list[key1='a'][key2='b']/leaf";
    // the reader caches the (empty) module before the writer commits
    assert!(matches!(
        reader.get_item(xpath).await,
        Err(DbError::NotFound(_))
    ));

    writer
        .set_item(xpath, Some(Value::String("v".into())), EditFlags::default())
        .await
        .unwrap();
    writer.commit().await.unwrap();

    // still the old snapshot from the cached working copy
    assert!(matches!(
        reader.get_item(xpath).await,
        Err(DbError::NotFound(_))
    ));

    // refresh discards the stale copy; the next read reloads from disk
    reader.refresh().await.unwrap();
    let value = reader.get_item(xpath).await.unwrap();
    assert_eq!(value.value, Value::String("v".into()));
}

#[tokio::test]
async fn concurrent_commit_is_rebased_by_replay() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let a = conn
        .session_start(Credentials::new("alice"), Datastore::Startup)
        .await
        .unwrap();
    let b = conn
        .session_start(Credentials::new("bob"), Datastore::Startup)
        .await
        .unwrap();

    a.set_item(
        "/example-module:container/list[key1='a'][key2='x']/leaf",
        Some(Value::String("from-a".into())),
        EditFlags::default(),
    )
    .await
    .unwrap();
    b.set_item(
        "/example-module:container/list[key1='b'][key2='y']/leaf",
        Some(Value::String("from-b".into())),
        EditFlags::default(),
    )
    .await
    .unwrap();

    a.commit().await.unwrap();
    // B's base is stale now; its commit refreshes and replays the log
    b.commit().await.unwrap();

    let reader = conn
        .session_start(Credentials::new("carol"), Datastore::Startup)
        .await
        .unwrap();
    let items = reader
        .get_items("/example-module:container/list")
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn one_session_never_dispatches_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let session = Arc::new(
        conn.session_start(Credentials::new("admin"), Datastore::Startup)
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for index in 0..16 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            session
                .set_item(
                    &format!(
                        "/example-module:container/list[key1='k{}'][key2='x']/leaf",
                        index
                    ),
                    Some(Value::String(format!("v{}", index))),
                    EditFlags::default(),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    session.commit().await.unwrap();

    let reader = conn
        .session_start(Credentials::new("reader"), Datastore::Startup)
        .await
        .unwrap();
    let items = reader
        .get_items("/example-module:container/list")
        .await
        .unwrap();
    assert_eq!(items.len(), 16);
}

#[tokio::test]
async fn parallel_readers_share_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_db(dir.path()).await;
    let conn = db.connect();

    let writer = conn
        .session_start(Credentials::new("admin"), Datastore::Startup)
        .await
        .unwrap();
    writer
        .set_item(
            "/example-module:container/list[key1='a'][key2='b']/leaf",
            Some(Value::String("v".into())),
            EditFlags::default(),
        )
        .await
        .unwrap();
    writer.commit().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let conn = db.connect();
        tasks.push(tokio::spawn(async move {
            let session = conn
                .session_start(Credentials::new("reader"), Datastore::Startup)
                .await
                .unwrap();
            for _ in 0..10 {
                let value = session
                    .get_item("/example-module:container/list[key1='a'][key2='b']/leaf")
                    .await
                    .unwrap();
                assert_eq!(value.value, Value::String("v".into()));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
