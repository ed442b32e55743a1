use eventstore_backend_sqlite::{connect_in_memory, SqliteStore};
use eventstore_core::{EventLog, NewEvent, SnapshotStore, UniqueConstraint};

async fn store() -> SqliteStore {
    let pool = connect_in_memory().await.expect("migrations should apply cleanly");
    SqliteStore::new(pool)
}

#[tokio::test]
async fn append_persists_contiguous_versions() {
    let store = store().await;
    let events = vec![NewEvent::new("Opened", b"a".to_vec()), NewEvent::new("Renamed", b"b".to_vec())];
    let committed = store.append("acc-1", "Account", 0, events).await.unwrap();
    assert_eq!(committed[0].version, 1);
    assert_eq!(committed[1].version, 2);

    let loaded = store.load_stream("acc-1", 0).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(store.current_version("acc-1").await.unwrap(), 2);
}

#[tokio::test]
async fn append_rejects_stale_expected_version() {
    let store = store().await;
    store.append("acc-1", "Account", 0, vec![NewEvent::new("Opened", Vec::new())]).await.unwrap();
    let err = store.append("acc-1", "Account", 0, vec![NewEvent::new("Renamed", Vec::new())]).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn append_idempotent_is_a_no_op_on_repeat_command() {
    let store = store().await;
    let r1 = store
        .append_idempotent(
            "acc-1",
            "Account",
            0,
            vec![NewEvent::new("Opened", Vec::new())],
            "cmd-1",
            chrono::Duration::days(1),
        )
        .await
        .unwrap();
    assert!(!r1.already_processed);

    let r2 = store
        .append_idempotent(
            "acc-1",
            "Account",
            0,
            vec![NewEvent::new("Opened", Vec::new())],
            "cmd-1",
            chrono::Duration::days(1),
        )
        .await
        .unwrap();
    assert!(r2.already_processed);
    assert_eq!(store.current_version("acc-1").await.unwrap(), 1);
}

#[tokio::test]
async fn unique_constraint_blocks_competing_aggregate() {
    let store = store().await;
    store
        .append(
            "u-1",
            "Account",
            0,
            vec![NewEvent::new("Opened", Vec::new()).with_constraint(UniqueConstraint::claim("email", "x@y.z"))],
        )
        .await
        .unwrap();

    let err = store
        .append(
            "u-2",
            "Account",
            0,
            vec![NewEvent::new("Opened", Vec::new()).with_constraint(UniqueConstraint::claim("email", "x@y.z"))],
        )
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn snapshot_round_trips_through_latest() {
    let store = store().await;
    let snapshot = eventstore_core::Snapshot {
        aggregate_id: "acc-1".into(),
        aggregate_type: "Account".into(),
        version: 5,
        payload: vec![1, 2, 3],
        created_at: chrono::Utc::now(),
        meta: Default::default(),
    };
    store.save(snapshot.clone()).await.unwrap();
    let loaded = store.latest("acc-1").await.unwrap();
    assert_eq!(loaded.version, 5);
    assert_eq!(loaded.payload, vec![1, 2, 3]);
}
