use helmsman::helmsman::op::Phase;
use helmsman::helmsman::store::memory::MemoryStore;
use helmsman::helmsman::store::{KvStore, Record, RecordStatus, Storage};

use std::sync::Arc;
use std::time::Duration;

async fn new_storage() -> (Storage, String) {
    let store = Arc::new(MemoryStore::new());
    let leader_key = store.campaign("test-host").await.expect("campaign");
    let storage = Storage::new(store);
    (storage, leader_key)
}

#[tokio::test]
async fn record_ids_are_strictly_increasing() {
    let (storage, leader_key) = new_storage().await;

    let mut previous = 0;
    for _ in 0..5 {
        let id = storage.next_record_id().await.expect("next id");
        assert!(id > previous, "ids must increase: {previous} then {id}");
        previous = id;

        let record = Record::new(id, "nop", Phase::K8sMaintain, Vec::new(), &leader_key);
        storage
            .register_record(&leader_key, &record)
            .await
            .expect("register");
    }

    let records = storage.get_records(0).await.expect("list");
    assert_eq!(records.len(), 5);
    let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
}

#[tokio::test]
async fn every_record_terminates_exactly_once() {
    let (storage, leader_key) = new_storage().await;

    let id = storage.next_record_id().await.expect("next id");
    let mut record = Record::new(
        id,
        "etcd-bootstrap",
        Phase::EtcdBoot,
        vec!["10.0.0.1".to_string()],
        &leader_key,
    );
    storage
        .register_record(&leader_key, &record)
        .await
        .expect("register");

    record.complete();
    storage
        .update_record(&leader_key, &record)
        .await
        .expect("update");

    let records = storage.get_records(0).await.expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Completed);
    assert!(records[0].finished_at.is_some());
}

#[tokio::test]
async fn watch_records_follows_from_a_start_id() {
    let (storage, leader_key) = new_storage().await;

    for name in ["rivers-bootstrap", "etcd-bootstrap", "etcd-start"] {
        let id = storage.next_record_id().await.expect("next id");
        let record = Record::new(id, name, Phase::Rivers, Vec::new(), &leader_key);
        storage
            .register_record(&leader_key, &record)
            .await
            .expect("register");
    }

    let mut follow = storage.watch_records(2).await.expect("watch");

    // Existing records from the start id come first.
    let first = follow.recv().await.expect("record 2");
    assert_eq!(first.id, 2);
    let second = follow.recv().await.expect("record 3");
    assert_eq!(second.id, 3);

    // A new commit flows through the same stream.
    let id = storage.next_record_id().await.expect("next id");
    let record = Record::new(id, "etcd-wait-cluster", Phase::EtcdWait, Vec::new(), &leader_key);
    storage
        .register_record(&leader_key, &record)
        .await
        .expect("register");

    let third = tokio::time::timeout(Duration::from_secs(5), follow.recv())
        .await
        .expect("stream stays live")
        .expect("record 4");
    assert_eq!(third.id, 4);
    assert_eq!(third.operator_name, "etcd-wait-cluster");
}
