/*
 * Copyright (C) 2024 The Helmsman Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::helmsman::store::{KvEvent, KvStore, KEY_LEADER};
use crate::helmsman::util::{DynError, LostLeadership};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};

const WATCH_CHANNEL_CAPACITY: usize = 128;

struct MemoryState {
    data: BTreeMap<String, String>,
    leader: Option<String>,
}

/// An in-process store with the same guard semantics as the real backend.
///
/// Used by unit and scenario tests; leadership can be revoked at any point
/// with `expire_leadership` to exercise the `LostLeadership` paths.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    notify: Notify,
    events: broadcast::Sender<KvEvent>,
    leader_seq: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        MemoryStore {
            state: Mutex::new(MemoryState {
                data: BTreeMap::new(),
                leader: None,
            }),
            notify: Notify::new(),
            events,
            leader_seq: AtomicI64::new(1),
        }
    }

    /// Simulates lease expiry: the current leader loses its guard.
    pub fn expire_leadership(&self) {
        let mut state = self.state.lock().unwrap();
        state.leader = None;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn current_leader(&self) -> Option<String> {
        self.state.lock().unwrap().leader.clone()
    }

    fn publish(&self, key: &str, value: &str) {
        let _ = self.events.send(KvEvent {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DynError> {
        Ok(self.state.lock().unwrap().data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), DynError> {
        self.state
            .lock()
            .unwrap()
            .data
            .insert(key.to_string(), value.to_string());
        self.publish(key, value);
        Ok(())
    }

    async fn put_guarded(&self, leader_key: &str, key: &str, value: &str) -> Result<(), DynError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.leader.as_deref() != Some(leader_key) {
                return Err(Box::new(LostLeadership));
            }
            state.data.insert(key.to_string(), value.to_string());
        }
        self.publish(key, value);
        Ok(())
    }

    async fn delete_guarded(&self, leader_key: &str, key: &str) -> Result<(), DynError> {
        let mut state = self.state.lock().unwrap();
        if state.leader.as_deref() != Some(leader_key) {
            return Err(Box::new(LostLeadership));
        }
        state.data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, DynError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn next_sequence(&self, key: &str) -> Result<i64, DynError> {
        let mut state = self.state.lock().unwrap();
        let next = state
            .data
            .get(key)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        state.data.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>, DynError> {
        let mut updates = self.events.subscribe();
        let prefix = prefix.to_string();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(event) => {
                        if !event.key.starts_with(&prefix) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }

    async fn campaign(&self, name: &str) -> Result<String, DynError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a resign between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if state.leader.is_none() {
                    let id = self.leader_seq.fetch_add(1, Ordering::SeqCst);
                    let key = format!("{KEY_LEADER}/{name}/{id:08}");
                    state.leader = Some(key.clone());
                    return Ok(key);
                }
            }
            notified.await;
        }
    }

    async fn resign(&self, leader_key: &str) -> Result<(), DynError> {
        let mut state = self.state.lock().unwrap();
        if state.leader.as_deref() == Some(leader_key) {
            state.leader = None;
            drop(state);
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guarded_writes_require_live_leadership() {
        let store = MemoryStore::new();
        let leader_key = store.campaign("host-1").await.expect("campaign");

        store
            .put_guarded(&leader_key, "cluster", "{}")
            .await
            .expect("guarded write while leading");

        store.expire_leadership();
        let err = store
            .put_guarded(&leader_key, "cluster", "{}")
            .await
            .expect_err("guard must fail after expiry");
        assert!(crate::helmsman::util::is_lost_leadership(&err));
    }

    #[tokio::test]
    async fn campaign_blocks_until_resign() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let first = store.campaign("host-1").await.expect("first campaign");

        let contender = {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move { store.campaign("host-2").await })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        store.resign(&first).await.expect("resign");
        let second = contender.await.expect("join").expect("second campaign");
        assert_ne!(first, second);
        assert_eq!(store.current_leader(), Some(second));
    }

    #[tokio::test]
    async fn sequences_increment_atomically() {
        let store = MemoryStore::new();
        assert_eq!(store.next_sequence("records/next").await.expect("seq"), 1);
        assert_eq!(store.next_sequence("records/next").await.expect("seq"), 2);
        assert_eq!(store.next_sequence("reboots/next").await.expect("seq"), 1);
    }

    #[tokio::test]
    async fn watch_sees_prefixed_changes_only() {
        let store = MemoryStore::new();
        let mut watch = store.watch("records/").await.expect("watch");

        store.put("cluster", "{}").await.expect("put");
        store.put("records/0001", "one").await.expect("put");

        let event = watch.recv().await.expect("event");
        assert_eq!(event.key, "records/0001");
        assert_eq!(event.value, "one");
    }
}
