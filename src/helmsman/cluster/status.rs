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

use crate::helmsman::cluster::{Cluster, ServiceParams};
use crate::helmsman::k8s::{ConfigMap, EndpointSlice, Endpoints, Node as KubeNode, Service};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Observed state of one managed container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub builtin_params: ServiceParams,
    #[serde(default)]
    pub extra_params: ServiceParams,
}

/// Observed state of the etcd container on one node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EtcdStatus {
    #[serde(flatten)]
    pub service: ServiceStatus,
    /// The etcd data volume exists on the node.
    #[serde(default)]
    pub has_data: bool,
    /// The join marker was written after the member joined the cluster.
    #[serde(default)]
    pub member_marked: bool,
}

/// Observed state of a component that exposes a health endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KubeComponentStatus {
    #[serde(flatten)]
    pub service: ServiceStatus,
    #[serde(default)]
    pub is_healthy: bool,
}

/// Everything observed about a single node in one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub ssh_connected: bool,
    #[serde(default)]
    pub etcd: EtcdStatus,
    #[serde(default)]
    pub rivers: ServiceStatus,
    #[serde(default)]
    pub etcd_rivers: ServiceStatus,
    #[serde(default)]
    pub api_server: KubeComponentStatus,
    #[serde(default)]
    pub controller_manager: ServiceStatus,
    #[serde(default)]
    pub scheduler: ServiceStatus,
    #[serde(default)]
    pub kubelet: ServiceStatus,
    #[serde(default)]
    pub proxy: ServiceStatus,
}

/// One member reported by the etcd cluster API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EtcdMember {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub peer_urls: Vec<String>,
}

/// Cluster-wide etcd view keyed by member address.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EtcdClusterStatus {
    pub is_healthy: bool,
    #[serde(default)]
    pub members: HashMap<String, EtcdMember>,
    /// Whether each member's committed index is within tolerance of the head.
    #[serde(default)]
    pub in_sync_members: HashMap<String, bool>,
}

/// Tracked state of an applied resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub has_been_ssa: bool,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterDnsStatus {
    #[serde(default)]
    pub config_map: Option<ConfigMap>,
    /// Service IP of the in-cluster resolver once it has one.
    #[serde(default)]
    pub cluster_ip: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDnsStatus {
    #[serde(default)]
    pub config_map: Option<ConfigMap>,
}

/// View of the cluster through the Kubernetes API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesClusterStatus {
    pub is_control_plane_ready: bool,
    #[serde(default)]
    pub nodes: Vec<KubeNode>,
    #[serde(default)]
    pub dns_service: Option<Service>,
    #[serde(default)]
    pub cluster_dns: ClusterDnsStatus,
    #[serde(default)]
    pub node_dns: NodeDnsStatus,
    #[serde(default)]
    pub master_endpoints: Option<Endpoints>,
    #[serde(default)]
    pub master_endpoint_slice: Option<EndpointSlice>,
    #[serde(default)]
    pub etcd_service: Option<Service>,
    #[serde(default)]
    pub etcd_endpoints: Option<Endpoints>,
    #[serde(default)]
    pub etcd_endpoint_slice: Option<EndpointSlice>,
    #[serde(default)]
    pub resource_statuses: HashMap<String, ResourceStatus>,
}

impl KubernetesClusterStatus {
    /// True once at least half of the declared nodes are registered and Ready.
    ///
    /// Deployments are held back until this holds so that replicas do not
    /// pile up on the first registered node.
    pub fn is_ready(&self, cluster: &Cluster) -> bool {
        let ready = self.nodes.iter().filter(|n| n.is_ready()).count();
        ready * 2 >= cluster.nodes.len()
    }
}

/// An immutable observation of the whole cluster, produced once per tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub node_statuses: HashMap<String, NodeStatus>,
    #[serde(default)]
    pub etcd: EtcdClusterStatus,
    #[serde(default)]
    pub kubernetes: KubernetesClusterStatus,
    #[serde(default)]
    pub config_version: String,
}

impl ClusterStatus {
    pub fn node_status(&self, address: &str) -> Option<&NodeStatus> {
        self.node_statuses.get(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helmsman::cluster::Node;
    use crate::helmsman::k8s;

    #[test]
    fn readiness_counts_ready_nodes() {
        let cluster = Cluster {
            name: "t".to_string(),
            nodes: vec![
                Node {
                    address: "10.0.0.1".to_string(),
                    user: "op".to_string(),
                    control_plane: true,
                    ..Default::default()
                },
                Node {
                    address: "10.0.0.2".to_string(),
                    user: "op".to_string(),
                    ..Default::default()
                },
            ],
            service_subnet: "10.68.0.0/16".to_string(),
            ..Default::default()
        };

        let mut ks = KubernetesClusterStatus::default();
        assert!(!ks.is_ready(&cluster));

        ks.nodes = vec![k8s::Node::ready("10.0.0.1")];
        assert!(ks.is_ready(&cluster));
    }
}
