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

pub mod etcd;
pub mod memory;
pub mod record;

use crate::helmsman::cluster::resource::{ResourceDefinition, ResourceKind, REVISION_ANNOTATION};
use crate::helmsman::cluster::{Cluster, Constraints, VaultConfig, CONFIG_VERSION};
use crate::helmsman::reboot::{RebootQueueEntry, RebootStatus};
use crate::helmsman::util::{new_error, with_context, DynError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use record::{Record, RecordStatus};

pub const KEY_CLUSTER: &str = "cluster";
pub const KEY_CONSTRAINTS: &str = "constraints";
pub const KEY_VAULT: &str = "vault";
pub const KEY_CA_PREFIX: &str = "ca/";
pub const KEY_RECORDS_PREFIX: &str = "records/";
pub const KEY_RECORD_ID: &str = "records/next";
pub const KEY_LEADER: &str = "leader";
pub const KEY_RESOURCES_PREFIX: &str = "resources/";
pub const KEY_REBOOTS_PREFIX: &str = "reboots/";
pub const KEY_REBOOT_ID: &str = "reboots/next";
pub const KEY_CONFIG_VERSION: &str = "config-version";

/// One change observed on a watched prefix.
#[derive(Clone, Debug)]
pub struct KvEvent {
    pub key: String,
    pub value: String,
}

/// Linearizable key-value storage with leases and leader election.
///
/// Every mutating engine write goes through the guarded variants, which
/// succeed only while the given leader key is backed by a live lease and
/// fail with `LostLeadership` otherwise.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, DynError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), DynError>;
    async fn put_guarded(&self, leader_key: &str, key: &str, value: &str) -> Result<(), DynError>;
    async fn delete_guarded(&self, leader_key: &str, key: &str) -> Result<(), DynError>;
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, DynError>;
    /// Atomically increments and returns the counter stored at `key`.
    async fn next_sequence(&self, key: &str) -> Result<i64, DynError>;
    /// Streams changes under `prefix` committed after the subscription.
    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>, DynError>;
    /// Blocks until this process holds the leadership, returning its key.
    async fn campaign(&self, name: &str) -> Result<String, DynError>;
    async fn resign(&self, leader_key: &str) -> Result<(), DynError>;
}

fn record_key(id: i64) -> String {
    format!("{KEY_RECORDS_PREFIX}{id:016}")
}

fn reboot_key(index: i64) -> String {
    format!("{KEY_REBOOTS_PREFIX}{index:016}")
}

/// Typed access to everything the engine persists.
#[derive(Clone)]
pub struct Storage {
    kv: Arc<dyn KvStore>,
}

impl Storage {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Storage { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DynError> {
        match self.kv.get(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .map_err(|err| with_context(err, format!("decoding {key}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), DynError> {
        let raw = serde_json::to_string(value)
            .map_err(|err| with_context(err, format!("encoding {key}")))?;
        self.kv.put(key, &raw).await
    }

    async fn put_json_guarded<T: Serialize>(
        &self,
        leader_key: &str,
        key: &str,
        value: &T,
    ) -> Result<(), DynError> {
        let raw = serde_json::to_string(value)
            .map_err(|err| with_context(err, format!("encoding {key}")))?;
        self.kv.put_guarded(leader_key, key, &raw).await
    }

    pub async fn get_cluster(&self) -> Result<Option<Cluster>, DynError> {
        self.get_json(KEY_CLUSTER).await
    }

    pub async fn put_cluster(&self, cluster: &Cluster) -> Result<(), DynError> {
        self.put_json(KEY_CLUSTER, cluster).await
    }

    pub async fn get_constraints(&self) -> Result<Constraints, DynError> {
        Ok(self.get_json(KEY_CONSTRAINTS).await?.unwrap_or_default())
    }

    pub async fn put_constraints(&self, constraints: &Constraints) -> Result<(), DynError> {
        self.put_json(KEY_CONSTRAINTS, constraints).await
    }

    pub async fn get_vault_config(&self) -> Result<Option<VaultConfig>, DynError> {
        self.get_json(KEY_VAULT).await
    }

    pub async fn put_vault_config(&self, config: &VaultConfig) -> Result<(), DynError> {
        self.put_json(KEY_VAULT, config).await
    }

    pub async fn get_ca_certificate(&self, name: &str) -> Result<Option<String>, DynError> {
        self.kv.get(&format!("{KEY_CA_PREFIX}{name}")).await
    }

    pub async fn put_ca_certificate(&self, name: &str, pem: &str) -> Result<(), DynError> {
        self.kv.put(&format!("{KEY_CA_PREFIX}{name}"), pem).await
    }

    /// Stores predating the version key run the initial layout.
    pub async fn get_config_version(&self) -> Result<String, DynError> {
        Ok(self
            .kv
            .get(KEY_CONFIG_VERSION)
            .await?
            .unwrap_or_else(|| "1".to_string()))
    }

    pub async fn set_config_version(&self, leader_key: &str) -> Result<(), DynError> {
        self.kv
            .put_guarded(leader_key, KEY_CONFIG_VERSION, CONFIG_VERSION)
            .await
    }

    pub async fn next_record_id(&self) -> Result<i64, DynError> {
        self.kv.next_sequence(KEY_RECORD_ID).await
    }

    pub async fn register_record(&self, leader_key: &str, record: &Record) -> Result<(), DynError> {
        self.put_json_guarded(leader_key, &record_key(record.id), record)
            .await
    }

    pub async fn update_record(&self, leader_key: &str, record: &Record) -> Result<(), DynError> {
        self.put_json_guarded(leader_key, &record_key(record.id), record)
            .await
    }

    /// Returns records in id order; a non-zero `count` keeps only the most
    /// recent ones.
    pub async fn get_records(&self, count: usize) -> Result<Vec<Record>, DynError> {
        let mut records = Vec::new();
        for (key, raw) in self.kv.list(KEY_RECORDS_PREFIX).await? {
            if key == KEY_RECORD_ID {
                continue;
            }
            let record: Record = serde_json::from_str(&raw)
                .map_err(|err| with_context(err, format!("decoding {key}")))?;
            records.push(record);
        }
        records.sort_by_key(|r| r.id);
        if count > 0 && records.len() > count {
            records.drain(..records.len() - count);
        }
        Ok(records)
    }

    /// Follow mode over the records stream.
    ///
    /// Emits every record with an id at or above `from_id`: the existing
    /// ones first, then new commits as they happen.
    pub async fn watch_records(&self, from_id: i64) -> Result<mpsc::Receiver<Record>, DynError> {
        let mut updates = self.kv.watch(KEY_RECORDS_PREFIX).await?;
        let existing = self.get_records(0).await?;
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            for record in existing {
                if record.id < from_id {
                    continue;
                }
                if tx.send(record).await.is_err() {
                    return;
                }
            }
            // Updates to already-delivered records flow through as well;
            // followers see every state transition at least once.
            while let Some(event) = updates.recv().await {
                if event.key == KEY_RECORD_ID {
                    continue;
                }
                let Ok(record) = serde_json::from_str::<Record>(&event.value) else {
                    continue;
                };
                if record.id < from_id {
                    continue;
                }
                if tx.send(record).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Lists user resources sorted by rank, then key.
    ///
    /// The key encodes `<rank>/<kind>/<namespace>/<name>`; the value is the
    /// manifest itself, whose revision annotation seeds the definition.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDefinition>, DynError> {
        let mut resources = Vec::new();
        for (key, raw) in self.kv.list(KEY_RESOURCES_PREFIX).await? {
            let suffix = &key[KEY_RESOURCES_PREFIX.len()..];
            let parts: Vec<&str> = suffix.split('/').collect();
            let (rank_raw, kind_raw, namespace, name) = match parts.as_slice() {
                [rank, kind, namespace, name] => (*rank, *kind, (*namespace).to_string(), *name),
                [rank, kind, name] => (*rank, *kind, String::new(), *name),
                _ => continue,
            };
            let rank: u32 = rank_raw
                .parse()
                .map_err(|_| new_error(format!("resource key {key} has a bad rank")))?;
            let kind: ResourceKind = serde_json::from_value(serde_json::Value::String(
                kind_raw.to_string(),
            ))
            .map_err(|_| new_error(format!("resource key {key} has unknown kind {kind_raw}")))?;

            let manifest = raw.into_bytes();
            let revision = serde_json::from_slice::<serde_json::Value>(&manifest)
                .ok()
                .and_then(|value| {
                    value
                        .pointer(&format!("/metadata/annotations/{}", REVISION_ANNOTATION.replace('/', "~1")))
                        .and_then(|rev| rev.as_str().map(str::to_string))
                })
                .and_then(|rev| rev.parse().ok())
                .unwrap_or(1);

            resources.push(ResourceDefinition {
                kind,
                namespace,
                name: name.to_string(),
                rank,
                manifest,
                revision,
            });
        }
        crate::helmsman::cluster::resource::sort_resources(&mut resources);
        Ok(resources)
    }

    pub async fn put_resource(&self, resource: &ResourceDefinition) -> Result<(), DynError> {
        let key = if resource.namespace.is_empty() {
            format!(
                "{KEY_RESOURCES_PREFIX}{}/{}/{}",
                resource.rank,
                resource.kind.as_str(),
                resource.name
            )
        } else {
            format!(
                "{KEY_RESOURCES_PREFIX}{}/{}/{}/{}",
                resource.rank,
                resource.kind.as_str(),
                resource.namespace,
                resource.name
            )
        };
        let manifest = String::from_utf8(resource.manifest.clone())
            .map_err(|err| with_context(err, "resource manifest is not UTF-8"))?;
        self.kv.put(&key, &manifest).await
    }

    /// Returns queue entries sorted by index.
    pub async fn reboot_queue_entries(&self) -> Result<Vec<RebootQueueEntry>, DynError> {
        let mut entries = Vec::new();
        for (key, raw) in self.kv.list(KEY_REBOOTS_PREFIX).await? {
            if key == KEY_REBOOT_ID {
                continue;
            }
            let entry: RebootQueueEntry = serde_json::from_str(&raw)
                .map_err(|err| with_context(err, format!("decoding {key}")))?;
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }

    pub async fn push_reboot_entry(&self, node: &str) -> Result<RebootQueueEntry, DynError> {
        let index = self.kv.next_sequence(KEY_REBOOT_ID).await?;
        let entry = RebootQueueEntry::new(index, node, chrono::Utc::now());
        self.put_json(&reboot_key(index), &entry).await?;
        Ok(entry)
    }

    /// Withdraws one entry unless its reboot command already ran; the
    /// dequeue operation removes it on the next tick. Like enqueue, this is
    /// an operator-side write and takes no leader key.
    pub async fn cancel_reboot_entry(&self, index: i64) -> Result<bool, DynError> {
        let key = reboot_key(index);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(false);
        };
        let mut entry: RebootQueueEntry = serde_json::from_str(&raw)
            .map_err(|err| with_context(err, format!("decoding {key}")))?;
        if !entry.status.is_cancellable() {
            return Ok(false);
        }
        entry.transition(RebootStatus::Cancelled, chrono::Utc::now());
        self.put_json(&key, &entry).await?;
        Ok(true)
    }

    /// Withdraws every entry still waiting for its reboot and returns how
    /// many were cancelled.
    pub async fn cancel_all_reboot_entries(&self) -> Result<usize, DynError> {
        let mut cancelled = 0;
        for entry in self.reboot_queue_entries().await? {
            if self.cancel_reboot_entry(entry.index).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub async fn update_reboot_entry(
        &self,
        leader_key: &str,
        entry: &RebootQueueEntry,
    ) -> Result<(), DynError> {
        self.put_json_guarded(leader_key, &reboot_key(entry.index), entry)
            .await
    }

    pub async fn delete_reboot_entry(&self, leader_key: &str, index: i64) -> Result<(), DynError> {
        self.kv.delete_guarded(leader_key, &reboot_key(index)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helmsman::store::memory::MemoryStore;

    #[test]
    fn record_keys_sort_lexically() {
        let low = record_key(9);
        let high = record_key(10);
        assert!(low < high);
        assert_eq!(low, "records/0000000000000009");
    }

    #[tokio::test]
    async fn cancellation_spares_entries_already_rebooting() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let leader_key = store.campaign("test-host").await.expect("campaign");
        let storage = Storage::new(store);

        let waiting = storage.push_reboot_entry("10.0.0.4").await.expect("push");
        let mut rebooting = storage.push_reboot_entry("10.0.0.5").await.expect("push");
        rebooting.transition(RebootStatus::Rebooting, chrono::Utc::now());
        storage
            .update_reboot_entry(&leader_key, &rebooting)
            .await
            .expect("update");

        assert_eq!(
            storage
                .cancel_all_reboot_entries()
                .await
                .expect("cancel all"),
            1
        );
        // Cancelling again finds nothing left to withdraw.
        assert!(!storage
            .cancel_reboot_entry(waiting.index)
            .await
            .expect("repeat cancel"));
        assert!(!storage.cancel_reboot_entry(999).await.expect("missing"));

        let entries = storage.reboot_queue_entries().await.expect("entries");
        assert_eq!(entries[0].status, RebootStatus::Cancelled);
        assert_eq!(entries[1].status, RebootStatus::Rebooting);

        // A cancelled entry leaves the queue through the dequeue bucket.
        let args = crate::helmsman::reboot::compute_buckets(
            &entries,
            chrono::Utc::now(),
            std::time::Duration::from_secs(600),
            &crate::helmsman::reboot::QueueObservation::default(),
        );
        let dequeued: Vec<_> = args.reboot_dequeued.iter().map(|e| e.node.as_str()).collect();
        assert_eq!(dequeued, vec!["10.0.0.4"]);
    }

    #[tokio::test]
    async fn resources_round_trip_in_rank_order() {
        let storage = Storage::new(std::sync::Arc::new(MemoryStore::new()));

        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "settings",
                "namespace": "default",
                "annotations": { (REVISION_ANNOTATION): "4" },
            },
        });
        let high = ResourceDefinition {
            kind: ResourceKind::ConfigMap,
            namespace: "default".to_string(),
            name: "settings".to_string(),
            rank: 20,
            manifest: serde_json::to_vec(&manifest).expect("manifest"),
            revision: 4,
        };
        let low = ResourceDefinition {
            kind: ResourceKind::ServiceAccount,
            namespace: "default".to_string(),
            name: "runner".to_string(),
            rank: 10,
            manifest: b"{\"apiVersion\":\"v1\",\"kind\":\"ServiceAccount\",\"metadata\":{\"name\":\"runner\",\"namespace\":\"default\"}}".to_vec(),
            revision: 1,
        };

        storage.put_resource(&high).await.expect("put high");
        storage.put_resource(&low).await.expect("put low");

        let listed = storage.list_resources().await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "runner");
        assert_eq!(listed[0].rank, 10);
        assert_eq!(listed[1].name, "settings");
        // The revision is recovered from the manifest annotation.
        assert_eq!(listed[1].revision, 4);
        assert_eq!(listed[0].revision, 1);
    }
}
