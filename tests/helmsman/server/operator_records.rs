use helmsman::helmsman::infra::Infrastructure;
use helmsman::helmsman::op::reboot::RebootDequeueOp;
use helmsman::helmsman::op::{Commander, OpContext, Operator};
use helmsman::helmsman::store::memory::MemoryStore;
use helmsman::helmsman::store::{KvStore, Storage};
use helmsman::helmsman::util::is_lost_leadership;

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn leader_context(store: Arc<MemoryStore>) -> (Storage, OpContext, String) {
    let leader_key = store.campaign("test-host").await.expect("campaign");
    let storage = Storage::new(store);
    let infra = Arc::new(Infrastructure::new(
        HashMap::new(),
        None,
        None,
        storage.clone(),
        &leader_key,
    ));
    let ctx = OpContext::new(infra, CancellationToken::new());
    (storage, ctx, leader_key)
}

#[tokio::test]
async fn dequeue_op_removes_entries_under_the_leader_guard() {
    let store = Arc::new(MemoryStore::new());
    let (storage, ctx, _leader_key) = leader_context(store.clone()).await;

    let first = storage.push_reboot_entry("10.0.0.4").await.expect("push");
    let second = storage.push_reboot_entry("10.0.0.5").await.expect("push");
    assert_eq!(first.index, 1);
    assert_eq!(second.index, 2);

    let mut op = RebootDequeueOp::new(&[first]);
    op.cleanup(&ctx).await.expect("cleanup");
    let commander = op.next_command().expect("one command");
    commander.run(&ctx).await.expect("dequeue");
    assert!(op.next_command().is_none());

    let remaining = storage.reboot_queue_entries().await.expect("entries");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].node, "10.0.0.5");
}

#[tokio::test]
async fn dequeue_fails_with_lost_leadership_after_expiry() {
    let store = Arc::new(MemoryStore::new());
    let (storage, ctx, _leader_key) = leader_context(store.clone()).await;

    let entry = storage.push_reboot_entry("10.0.0.4").await.expect("push");
    store.expire_leadership();

    let mut op = RebootDequeueOp::new(&[entry]);
    let commander = op.next_command().expect("one command");
    let err = commander.run(&ctx).await.expect_err("guard must trip");
    assert!(is_lost_leadership(&err));

    // The entry is untouched; the next leader resumes from it.
    let remaining = storage.reboot_queue_entries().await.expect("entries");
    assert_eq!(remaining.len(), 1);
}
