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

use crate::helmsman::cluster::status::EtcdMember;
use crate::helmsman::util::{new_error, with_context, DynError};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub const ETCD_CLIENT_PORT: u16 = 2379;
pub const ETCD_PEER_PORT: u16 = 2380;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Health of a single etcd endpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointHealth {
    pub healthy: bool,
    pub revision: i64,
}

/// The slice of the etcd cluster API the engine uses.
#[async_trait]
pub trait EtcdFacade: Send + Sync {
    async fn member_list(&self) -> Result<Vec<EtcdMember>, DynError>;
    async fn member_add(&self, peer_url: &str) -> Result<(), DynError>;
    async fn member_remove(&self, id: u64) -> Result<(), DynError>;
    /// Probes one member endpoint for liveness and its current revision.
    async fn endpoint_status(&self, address: &str) -> EndpointHealth;
}

/// Facade over the etcd v3 JSON gateway on the control plane quorum.
pub struct HttpEtcd {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpEtcd {
    pub fn new(addresses: &[String]) -> Result<HttpEtcd, DynError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| with_context(err, "failed to build etcd http client"))?;
        Ok(HttpEtcd {
            http,
            endpoints: addresses
                .iter()
                .map(|addr| format!("http://{addr}:{ETCD_CLIENT_PORT}"))
                .collect(),
        })
    }

    async fn post_first(&self, path: &str, body: Value) -> Result<Value, DynError> {
        let mut last_error = new_error("no etcd endpoint configured");
        for endpoint in &self.endpoints {
            let url = format!("{endpoint}{path}");
            match self.http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|err| with_context(err, format!("decoding {path}")));
                }
                Ok(response) => {
                    last_error = new_error(format!("{url} returned {}", response.status()));
                }
                Err(err) => {
                    last_error = with_context(err, format!("POST {url}"));
                }
            }
        }
        Err(last_error)
    }
}

fn parse_u64(value: &Value) -> u64 {
    match value {
        Value::String(s) => s.parse().unwrap_or_default(),
        Value::Number(n) => n.as_u64().unwrap_or_default(),
        _ => 0,
    }
}

fn parse_i64(value: &Value) -> i64 {
    match value {
        Value::String(s) => s.parse().unwrap_or_default(),
        Value::Number(n) => n.as_i64().unwrap_or_default(),
        _ => 0,
    }
}

fn parse_member(value: &Value) -> EtcdMember {
    EtcdMember {
        id: value.get("ID").map(parse_u64).unwrap_or_default(),
        name: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        peer_urls: value
            .get("peerURLs")
            .and_then(Value::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

#[async_trait]
impl EtcdFacade for HttpEtcd {
    async fn member_list(&self) -> Result<Vec<EtcdMember>, DynError> {
        let response = self
            .post_first("/v3/cluster/member/list", serde_json::json!({}))
            .await?;
        let members = response
            .get("members")
            .and_then(Value::as_array)
            .map(|members| members.iter().map(parse_member).collect())
            .unwrap_or_default();
        Ok(members)
    }

    async fn member_add(&self, peer_url: &str) -> Result<(), DynError> {
        self.post_first(
            "/v3/cluster/member/add",
            serde_json::json!({ "peerURLs": [peer_url] }),
        )
        .await?;
        Ok(())
    }

    async fn member_remove(&self, id: u64) -> Result<(), DynError> {
        self.post_first(
            "/v3/cluster/member/remove",
            serde_json::json!({ "ID": id.to_string() }),
        )
        .await?;
        Ok(())
    }

    async fn endpoint_status(&self, address: &str) -> EndpointHealth {
        let url = format!("http://{address}:{ETCD_CLIENT_PORT}/v3/maintenance/status");
        let response = match self.http.post(&url).json(&serde_json::json!({})).send().await {
            Ok(response) if response.status().is_success() => response,
            _ => return EndpointHealth::default(),
        };
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(_) => return EndpointHealth::default(),
        };
        let revision = body
            .pointer("/header/revision")
            .map(parse_i64)
            .unwrap_or_default();
        EndpointHealth {
            healthy: true,
            revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_parsing_accepts_string_ids() {
        let raw = serde_json::json!({
            "ID": "10276657743932975437",
            "name": "10.0.0.11",
            "peerURLs": ["http://10.0.0.11:2380"],
        });
        let member = parse_member(&raw);
        assert_eq!(member.id, 10276657743932975437);
        assert_eq!(member.name, "10.0.0.11");
        assert_eq!(member.peer_urls, vec!["http://10.0.0.11:2380"]);
    }

    #[test]
    fn member_parsing_tolerates_unstarted_members() {
        let raw = serde_json::json!({
            "ID": 42,
            "peerURLs": ["http://10.0.0.12:2380"],
        });
        let member = parse_member(&raw);
        assert_eq!(member.id, 42);
        assert!(member.name.is_empty());
    }
}
