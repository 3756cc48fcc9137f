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

pub mod resource;
pub mod status;

use crate::helmsman::util::{new_error, DynError};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Version of the node configuration layout managed by this build.
///
/// When the stored `config-version` differs, the upgrade operation runs
/// before anything else.
pub const CONFIG_VERSION: &str = "1";

/// A bind mount made available to a managed container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn new(source: &str, destination: &str, read_only: bool) -> Self {
        Mount {
            source: source.to_string(),
            destination: destination.to_string(),
            read_only,
        }
    }
}

/// Parameters for one managed container, split into the part the engine
/// generates and the part the operator supplies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParams {
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub extra_binds: Vec<Mount>,
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

/// A member of the declared cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub address: String,
    pub user: String,
    #[serde(default)]
    pub control_plane: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl Node {
    /// Name under which this node registers with Kubernetes.
    pub fn nodename(&self) -> &str {
        match &self.hostname {
            Some(hostname) if !hostname.is_empty() => hostname,
            _ => &self.address,
        }
    }

    pub fn validate(&self) -> Result<(), DynError> {
        if self.address.is_empty() {
            return Err(new_error("node address must not be empty"));
        }
        if self.user.is_empty() {
            return Err(new_error(format!("node {} has no ssh user", self.address)));
        }
        let mut keys = HashSet::new();
        for taint in &self.taints {
            if taint.key.is_empty() {
                return Err(new_error(format!("node {} has a taint without a key", self.address)));
            }
            if !keys.insert(taint.key.as_str()) {
                return Err(new_error(format!(
                    "node {} repeats taint key {}",
                    self.address, taint.key
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EtcdParams {
    #[serde(flatten)]
    pub params: ServiceParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

impl EtcdParams {
    pub fn volume_name(&self) -> &str {
        match &self.volume_name {
            Some(name) if !name.is_empty() => name,
            _ => "etcd-helmsman",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KubeletParams {
    #[serde(flatten)]
    pub params: ServiceParams,
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,
}

impl Default for KubeletParams {
    fn default() -> Self {
        KubeletParams {
            params: ServiceParams::default(),
            cluster_domain: default_cluster_domain(),
        }
    }
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyParams {
    #[serde(flatten)]
    pub params: ServiceParams,
    #[serde(default)]
    pub disable: bool,
}

/// Per-component tunables.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub etcd: EtcdParams,
    #[serde(default)]
    pub rivers: ServiceParams,
    #[serde(default)]
    pub etcd_rivers: ServiceParams,
    #[serde(default)]
    pub api_server: ServiceParams,
    #[serde(default)]
    pub controller_manager: ServiceParams,
    #[serde(default)]
    pub scheduler: ServiceParams,
    #[serde(default)]
    pub kubelet: KubeletParams,
    #[serde(default)]
    pub proxy: ProxyParams,
}

/// Reboot behavior for queued nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reboot {
    #[serde(default)]
    pub reboot_command: Vec<String>,
    #[serde(default)]
    pub boot_check_command: Vec<String>,
    #[serde(default = "default_command_timeout", with = "duration_secs")]
    pub command_timeout: Duration,
    #[serde(default = "default_eviction_timeout", with = "duration_secs")]
    pub eviction_timeout: Duration,
    #[serde(default)]
    pub protected_namespaces: Vec<String>,
}

impl Default for Reboot {
    fn default() -> Self {
        Reboot {
            reboot_command: Vec::new(),
            boot_check_command: Vec::new(),
            command_timeout: default_command_timeout(),
            eviction_timeout: default_eviction_timeout(),
            protected_namespaces: Vec::new(),
        }
    }
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_eviction_timeout() -> Duration {
    Duration::from_secs(600)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EtcdBackup {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pvc_name: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub rotate: usize,
}

/// The desired state of one cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub nodes: Vec<Node>,
    pub service_subnet: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub reboot: Reboot,
    #[serde(default)]
    pub etcd_backup: EtcdBackup,
}

impl Cluster {
    pub fn validate(&self) -> Result<(), DynError> {
        if self.name.is_empty() {
            return Err(new_error("cluster name must not be empty"));
        }
        if !self.nodes.iter().any(|n| n.control_plane) {
            return Err(new_error("at least one control plane node is required"));
        }
        parse_cidr(&self.service_subnet)?;

        let mut addresses = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !addresses.insert(node.address.as_str()) {
                return Err(new_error(format!("duplicate node address {}", node.address)));
            }
        }
        Ok(())
    }

    pub fn control_plane_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.control_plane).count()
    }
}

fn parse_cidr(subnet: &str) -> Result<(), DynError> {
    let (addr, prefix) = subnet
        .split_once('/')
        .ok_or_else(|| new_error(format!("service subnet {subnet} is not a CIDR")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| new_error(format!("service subnet {subnet} has an invalid prefix")))?;
    let is_v4 = addr.parse::<std::net::Ipv4Addr>().is_ok();
    let is_v6 = addr.parse::<std::net::Ipv6Addr>().is_ok();
    if !is_v4 && !is_v6 {
        return Err(new_error(format!("service subnet {subnet} has an invalid address")));
    }
    let max = if is_v4 { 32 } else { 128 };
    if prefix > max {
        return Err(new_error(format!("service subnet {subnet} prefix exceeds {max}")));
    }
    Ok(())
}

/// Operational constraints checked against the declared cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub control_plane_count: usize,
    #[serde(default)]
    pub minimum_workers: usize,
    #[serde(default)]
    pub maximum_workers: usize,
    #[serde(default)]
    pub reboot_maximum_unreachable: usize,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            control_plane_count: 1,
            minimum_workers: 0,
            maximum_workers: 0,
            reboot_maximum_unreachable: 0,
        }
    }
}

impl Constraints {
    pub fn check(&self, cluster: &Cluster) -> Result<(), DynError> {
        if self.control_plane_count % 2 == 0 {
            return Err(new_error("control plane count must be odd"));
        }
        if self.control_plane_count > cluster.nodes.len() {
            return Err(new_error("control plane count exceeds the number of nodes"));
        }
        if cluster.control_plane_count() != self.control_plane_count {
            return Err(new_error(format!(
                "declared control plane nodes ({}) do not match the constraint ({})",
                cluster.control_plane_count(),
                self.control_plane_count
            )));
        }
        let workers = cluster.nodes.len() - cluster.control_plane_count();
        if workers < self.minimum_workers {
            return Err(new_error("not enough worker nodes"));
        }
        if self.maximum_workers != 0 && workers > self.maximum_workers {
            return Err(new_error("too many worker nodes"));
        }
        Ok(())
    }
}

/// Connection settings for the certificate authority backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    pub endpoint: String,
    pub role_id: String,
    pub secret_id: String,
}

impl VaultConfig {
    pub fn validate(&self) -> Result<(), DynError> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(new_error(format!("vault endpoint {} is not a URL", self.endpoint)));
        }
        if self.role_id.is_empty() || self.secret_id.is_empty() {
            return Err(new_error("vault role_id and secret_id are required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: &str, control_plane: bool) -> Node {
        Node {
            address: address.to_string(),
            user: "cybozu".to_string(),
            control_plane,
            ..Default::default()
        }
    }

    fn cluster(nodes: Vec<Node>) -> Cluster {
        Cluster {
            name: "test".to_string(),
            nodes,
            service_subnet: "10.68.0.0/16".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_requires_control_plane() {
        let c = cluster(vec![node("10.0.0.1", false)]);
        assert!(c.validate().is_err());

        let c = cluster(vec![node("10.0.0.1", true)]);
        c.validate().expect("valid cluster");
    }

    #[test]
    fn validate_rejects_duplicate_addresses() {
        let c = cluster(vec![node("10.0.0.1", true), node("10.0.0.1", false)]);
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_taint_keys() {
        let mut n = node("10.0.0.1", true);
        n.taints = vec![
            Taint {
                key: "k".to_string(),
                value: "a".to_string(),
                effect: TaintEffect::NoSchedule,
            },
            Taint {
                key: "k".to_string(),
                value: "b".to_string(),
                effect: TaintEffect::NoExecute,
            },
        ];
        assert!(cluster(vec![n]).validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_subnet() {
        let mut c = cluster(vec![node("10.0.0.1", true)]);
        c.service_subnet = "not-a-subnet".to_string();
        assert!(c.validate().is_err());
        c.service_subnet = "10.68.0.0/40".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn constraints_require_odd_control_plane_count() {
        let c = cluster(vec![node("10.0.0.1", true), node("10.0.0.2", true)]);
        let constraints = Constraints {
            control_plane_count: 2,
            ..Default::default()
        };
        assert!(constraints.check(&c).is_err());
    }

    #[test]
    fn constraints_bound_workers() {
        let c = cluster(vec![
            node("10.0.0.1", true),
            node("10.0.0.2", false),
            node("10.0.0.3", false),
        ]);
        let constraints = Constraints {
            control_plane_count: 1,
            minimum_workers: 1,
            maximum_workers: 2,
            ..Default::default()
        };
        constraints.check(&c).expect("within bounds");

        let tight = Constraints {
            control_plane_count: 1,
            minimum_workers: 3,
            maximum_workers: 3,
            ..Default::default()
        };
        assert!(tight.check(&c).is_err());
    }

    #[test]
    fn nodename_prefers_hostname() {
        let mut n = node("10.0.0.1", false);
        assert_eq!(n.nodename(), "10.0.0.1");
        n.hostname = Some("worker-1".to_string());
        assert_eq!(n.nodename(), "worker-1");
    }
}
