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

use crate::helmsman::logger::log_warn;
use crate::helmsman::store::{KvEvent, KvStore, KEY_LEADER};
use crate::helmsman::util::{new_error, with_context, DynError, LostLeadership};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const COMPONENT: &str = "store";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const WATCH_CHANNEL_CAPACITY: usize = 128;

struct LeaderSession {
    decoded_key: String,
    leader: Value,
    lease_id: String,
    keepalive: JoinHandle<()>,
}

/// Store backend speaking the etcd v3 JSON gateway.
///
/// All keys live under a fixed prefix. Guarded writes are transactions
/// conditioned on the election key still existing, so an expired lease
/// surfaces as `LostLeadership` on the next write.
pub struct EtcdStore {
    http: reqwest::Client,
    endpoints: Vec<String>,
    prefix: String,
    session_ttl: Duration,
    leader: Mutex<Option<LeaderSession>>,
}

impl EtcdStore {
    pub fn new(endpoints: &[String], session_ttl: Duration) -> Result<EtcdStore, DynError> {
        if endpoints.is_empty() {
            return Err(new_error("at least one store endpoint is required"));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| with_context(err, "failed to build store http client"))?;
        Ok(EtcdStore {
            http,
            endpoints: endpoints.to_vec(),
            prefix: "/cke/".to_string(),
            session_ttl,
            leader: Mutex::new(None),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn encode_key(&self, key: &str) -> String {
        BASE64.encode(self.full_key(key))
    }

    fn decode_key(&self, b64: &str) -> Option<String> {
        let raw = BASE64.decode(b64).ok()?;
        let full = String::from_utf8(raw).ok()?;
        full.strip_prefix(&self.prefix).map(str::to_string)
    }

    async fn post(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value, DynError> {
        let mut last_error = new_error("no store endpoint configured");
        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
            let request = self.http.post(&url).timeout(timeout).json(body);
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|err| with_context(err, format!("decoding {path}")));
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    last_error = new_error(format!("{url} returned {status}: {text}"));
                }
                Err(err) => last_error = with_context(err, format!("POST {url}")),
            }
        }
        Err(last_error)
    }

    async fn txn_guarded(&self, leader_key: &str, success_op: Value) -> Result<(), DynError> {
        let compare = serde_json::json!([{
            "key": BASE64.encode(self.full_key(leader_key)),
            "target": "CREATE",
            "result": "GREATER",
            "create_revision": "0",
        }]);
        let body = serde_json::json!({
            "compare": compare,
            "success": [success_op],
        });
        let response = self.post("/v3/kv/txn", &body, REQUEST_TIMEOUT).await?;
        if response.get("succeeded").and_then(Value::as_bool) != Some(true) {
            return Err(Box::new(LostLeadership));
        }
        Ok(())
    }

    async fn get_with_revision(&self, key: &str) -> Result<Option<(String, String)>, DynError> {
        let body = serde_json::json!({ "key": self.encode_key(key) });
        let response = self.post("/v3/kv/range", &body, REQUEST_TIMEOUT).await?;
        let Some(kv) = response
            .get("kvs")
            .and_then(Value::as_array)
            .and_then(|kvs| kvs.first())
        else {
            return Ok(None);
        };
        let value = kv
            .get("value")
            .and_then(Value::as_str)
            .map(|raw| BASE64.decode(raw))
            .transpose()
            .map_err(|err| with_context(err, format!("decoding value of {key}")))?
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default();
        let revision = kv
            .get("mod_revision")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .to_string();
        Ok(Some((value, revision)))
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DynError> {
        Ok(self.get_with_revision(key).await?.map(|(value, _)| value))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), DynError> {
        let body = serde_json::json!({
            "key": self.encode_key(key),
            "value": BASE64.encode(value),
        });
        self.post("/v3/kv/put", &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn put_guarded(&self, leader_key: &str, key: &str, value: &str) -> Result<(), DynError> {
        self.txn_guarded(
            leader_key,
            serde_json::json!({
                "request_put": {
                    "key": self.encode_key(key),
                    "value": BASE64.encode(value),
                },
            }),
        )
        .await
    }

    async fn delete_guarded(&self, leader_key: &str, key: &str) -> Result<(), DynError> {
        self.txn_guarded(
            leader_key,
            serde_json::json!({
                "request_delete_range": { "key": self.encode_key(key) },
            }),
        )
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, DynError> {
        let mut range_end = self.full_key(prefix).into_bytes();
        if let Some(last) = range_end.last_mut() {
            *last += 1;
        }
        let body = serde_json::json!({
            "key": self.encode_key(prefix),
            "range_end": BASE64.encode(range_end),
            "sort_order": "ASCEND",
            "sort_target": "KEY",
        });
        let response = self.post("/v3/kv/range", &body, REQUEST_TIMEOUT).await?;
        let mut pairs = Vec::new();
        for kv in response
            .get("kvs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(key) = kv
                .get("key")
                .and_then(Value::as_str)
                .and_then(|raw| self.decode_key(raw))
            else {
                continue;
            };
            let value = kv
                .get("value")
                .and_then(Value::as_str)
                .and_then(|raw| BASE64.decode(raw).ok())
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                .unwrap_or_default();
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    async fn next_sequence(&self, key: &str) -> Result<i64, DynError> {
        loop {
            let current = self.get_with_revision(key).await?;
            let (next, compare) = match &current {
                Some((value, revision)) => (
                    value.parse::<i64>().unwrap_or(0) + 1,
                    serde_json::json!({
                        "key": self.encode_key(key),
                        "target": "MOD",
                        "result": "EQUAL",
                        "mod_revision": revision,
                    }),
                ),
                None => (
                    1,
                    serde_json::json!({
                        "key": self.encode_key(key),
                        "target": "CREATE",
                        "result": "EQUAL",
                        "create_revision": "0",
                    }),
                ),
            };
            let body = serde_json::json!({
                "compare": [compare],
                "success": [{
                    "request_put": {
                        "key": self.encode_key(key),
                        "value": BASE64.encode(next.to_string()),
                    },
                }],
            });
            let response = self.post("/v3/kv/txn", &body, REQUEST_TIMEOUT).await?;
            if response.get("succeeded").and_then(Value::as_bool) == Some(true) {
                return Ok(next);
            }
        }
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>, DynError> {
        let mut range_end = self.full_key(prefix).into_bytes();
        if let Some(last) = range_end.last_mut() {
            *last += 1;
        }
        let body = serde_json::json!({
            "create_request": {
                "key": self.encode_key(prefix),
                "range_end": BASE64.encode(range_end),
            },
        });

        let url = format!(
            "{}/v3/watch",
            self.endpoints.first().expect("endpoints checked in new").trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .timeout(BLOCKING_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|err| with_context(err, "opening watch stream"))?;
        if !response.status().is_success() {
            return Err(new_error(format!("watch stream returned {}", response.status())));
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let prefix_owned = self.prefix.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let Ok(frame) = serde_json::from_slice::<Value>(&line) else {
                        continue;
                    };
                    let events = frame
                        .pointer("/result/events")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    for event in events {
                        let Some(kv) = event.get("kv") else { continue };
                        let Some(key) = kv
                            .get("key")
                            .and_then(Value::as_str)
                            .and_then(|raw| BASE64.decode(raw).ok())
                            .and_then(|bytes| String::from_utf8(bytes).ok())
                            .and_then(|full| full.strip_prefix(&prefix_owned).map(str::to_string))
                        else {
                            continue;
                        };
                        let value = kv
                            .get("value")
                            .and_then(Value::as_str)
                            .and_then(|raw| BASE64.decode(raw).ok())
                            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                            .unwrap_or_default();
                        if tx.send(KvEvent { key, value }).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn campaign(&self, name: &str) -> Result<String, DynError> {
        let ttl = self.session_ttl.as_secs().max(5);
        let grant = self
            .post(
                "/v3/lease/grant",
                &serde_json::json!({ "TTL": ttl.to_string() }),
                REQUEST_TIMEOUT,
            )
            .await?;
        let lease_id = grant
            .get("ID")
            .and_then(Value::as_str)
            .ok_or_else(|| new_error("lease grant returned no ID"))?
            .to_string();

        let keepalive = {
            let http = self.http.clone();
            let endpoints = self.endpoints.clone();
            let lease = lease_id.clone();
            let interval = Duration::from_secs((ttl / 3).max(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let body = serde_json::json!({ "ID": lease });
                    let mut refreshed = false;
                    for endpoint in &endpoints {
                        let url = format!("{}/v3/lease/keepalive", endpoint.trim_end_matches('/'));
                        if let Ok(response) = http
                            .post(&url)
                            .timeout(REQUEST_TIMEOUT)
                            .json(&body)
                            .send()
                            .await
                        {
                            if response.status().is_success() {
                                refreshed = true;
                                break;
                            }
                        }
                    }
                    if !refreshed {
                        log_warn(COMPONENT, "lease keepalive failed", &[]);
                    }
                }
            })
        };

        let campaign_body = serde_json::json!({
            "name": BASE64.encode(self.full_key(KEY_LEADER)),
            "lease": lease_id,
            "value": BASE64.encode(name),
        });
        let response = match self
            .post("/v3/election/campaign", &campaign_body, BLOCKING_TIMEOUT)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                keepalive.abort();
                return Err(err);
            }
        };
        let Some(leader) = response.get("leader").cloned() else {
            keepalive.abort();
            return Err(new_error("campaign returned no leader"));
        };
        let Some(decoded_key) = leader
            .get("key")
            .and_then(Value::as_str)
            .and_then(|raw| self.decode_key(raw))
        else {
            keepalive.abort();
            return Err(new_error("campaign returned an unparsable key"));
        };

        let mut guard = self.leader.lock().unwrap();
        *guard = Some(LeaderSession {
            decoded_key: decoded_key.clone(),
            leader,
            lease_id,
            keepalive,
        });
        Ok(decoded_key)
    }

    async fn resign(&self, leader_key: &str) -> Result<(), DynError> {
        let session = {
            let mut guard = self.leader.lock().unwrap();
            match guard.as_ref() {
                Some(session) if session.decoded_key == leader_key => guard.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return Ok(());
        };
        session.keepalive.abort();

        let resign_body = serde_json::json!({ "leader": session.leader });
        if let Err(err) = self
            .post("/v3/election/resign", &resign_body, REQUEST_TIMEOUT)
            .await
        {
            log_warn(COMPONENT, "resign failed", &[("error", &err.to_string())]);
        }
        let revoke_body = serde_json::json!({ "ID": session.lease_id });
        if let Err(err) = self
            .post("/v3/lease/revoke", &revoke_body, REQUEST_TIMEOUT)
            .await
        {
            log_warn(COMPONENT, "lease revoke failed", &[("error", &err.to_string())]);
        }
        Ok(())
    }
}
