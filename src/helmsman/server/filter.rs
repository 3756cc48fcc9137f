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

use crate::helmsman::cluster::status::{ClusterStatus, NodeStatus, ServiceStatus};
use crate::helmsman::cluster::{Cluster, Node, ServiceParams};
use crate::helmsman::engine::{image_for, ETCD_IMAGE};
use crate::helmsman::k8s::{Node as KubeNode, NodeTaint};
use crate::helmsman::op::etcd::{etcd_builtin_params, peer_url};
use crate::helmsman::op::k8s::{
    apiserver_params, controller_manager_params, kubelet_builtin_params, proxy_params,
    scheduler_params,
};
use crate::helmsman::op::rivers::rivers_params;
use crate::helmsman::op::{
    API_SERVER_CONTAINER, ETCD_RIVERS_CONTAINER, ETCD_RIVERS_LISTEN_PORT,
    ETCD_RIVERS_UPSTREAM_PORT, REBOOT_ANNOTATION, RIVERS_CONTAINER, RIVERS_LISTEN_PORT,
    RIVERS_UPSTREAM_PORT,
};

use std::sync::OnceLock;

fn default_node_status() -> &'static NodeStatus {
    static DEFAULT: OnceLock<NodeStatus> = OnceLock::new();
    DEFAULT.get_or_init(NodeStatus::default)
}

fn outdated(status: &ServiceStatus, builtin: &ServiceParams, extra: &ServiceParams, image: &str) -> bool {
    status.image != image || &status.builtin_params != builtin || &status.extra_params != extra
}

/// Classification predicates over the declared cluster and one observation.
///
/// Every method is pure; the decision engine consumes nothing else.
pub struct NodeFilter<'a> {
    cluster: &'a Cluster,
    status: &'a ClusterStatus,
}

impl<'a> NodeFilter<'a> {
    pub fn new(cluster: &'a Cluster, status: &'a ClusterStatus) -> Self {
        NodeFilter { cluster, status }
    }

    pub fn cluster(&self) -> &'a Cluster {
        self.cluster
    }

    pub fn node_status(&self, node: &Node) -> &NodeStatus {
        self.status
            .node_statuses
            .get(&node.address)
            .unwrap_or_else(|| default_node_status())
    }

    pub fn control_plane(&self) -> Vec<&'a Node> {
        self.cluster.nodes.iter().filter(|n| n.control_plane).collect()
    }

    pub fn workers(&self) -> Vec<&'a Node> {
        self.cluster.nodes.iter().filter(|n| !n.control_plane).collect()
    }

    pub fn all_nodes(&self) -> Vec<&'a Node> {
        self.cluster.nodes.iter().collect()
    }

    fn role_allowed(node: &Node, include_cp: bool, include_non_cp: bool) -> bool {
        if node.control_plane {
            include_cp
        } else {
            include_non_cp
        }
    }

    /// Keeps nodes of the allowed roles that answered over ssh.
    pub fn ssh_connected_nodes(
        &self,
        nodes: Vec<&'a Node>,
        include_cp: bool,
        include_non_cp: bool,
    ) -> Vec<&'a Node> {
        nodes
            .into_iter()
            .filter(|n| Self::role_allowed(n, include_cp, include_non_cp))
            .filter(|n| self.node_status(n).ssh_connected)
            .collect()
    }

    /// Keeps nodes of the allowed roles that did not answer over ssh.
    pub fn ssh_not_connected_nodes(
        &self,
        nodes: Vec<&'a Node>,
        include_cp: bool,
        include_non_cp: bool,
    ) -> Vec<&'a Node> {
        nodes
            .into_iter()
            .filter(|n| Self::role_allowed(n, include_cp, include_non_cp))
            .filter(|n| !self.node_status(n).ssh_connected)
            .collect()
    }

    // ---- etcd

    pub fn etcd_bootstrapped(&self) -> bool {
        self.control_plane()
            .iter()
            .any(|n| self.node_status(n).etcd.has_data)
    }

    /// Members that own data but whose container is not running.
    pub fn etcd_stopped_members(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let etcd = &self.node_status(n).etcd;
                etcd.has_data && !etcd.service.running
            })
            .collect()
    }

    /// Members added to the cluster that never started: their member entry
    /// exists with an empty name.
    pub fn etcd_unstarted_members(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let url = peer_url(&n.address);
                self.status
                    .etcd
                    .members
                    .values()
                    .any(|m| m.name.is_empty() && m.peer_urls.contains(&url))
            })
            .collect()
    }

    /// Control plane nodes with no member entry at all.
    pub fn etcd_new_members(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let url = peer_url(&n.address);
                !self
                    .status
                    .etcd
                    .members
                    .values()
                    .any(|m| m.name == n.address || m.peer_urls.contains(&url))
            })
            .collect()
    }

    fn member_in_sync(&self, name: &str) -> bool {
        self.status
            .etcd
            .in_sync_members
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    /// Members that do not belong to the declared cluster at all, selected
    /// by their sync state.
    pub fn etcd_non_cluster_members(&self, in_sync: bool) -> Vec<(String, u64)> {
        self.status
            .etcd
            .members
            .iter()
            .filter(|(address, _)| !self.cluster.nodes.iter().any(|n| &n.address == *address))
            .filter(|(address, _)| self.member_in_sync(address) == in_sync)
            .map(|(address, member)| (address.clone(), member.id))
            .collect()
    }

    /// Members on declared nodes that are no longer control plane, selected
    /// by their sync state.
    pub fn etcd_non_cp_members(&self, in_sync: bool) -> (Vec<&'a Node>, Vec<u64>) {
        let mut nodes = Vec::new();
        let mut ids = Vec::new();
        for (address, member) in &self.status.etcd.members {
            let Some(node) = self
                .cluster
                .nodes
                .iter()
                .find(|n| &n.address == address && !n.control_plane)
            else {
                continue;
            };
            if self.member_in_sync(address) != in_sync {
                continue;
            }
            nodes.push(node);
            ids.push(member.id);
        }
        (nodes, ids)
    }

    /// Running members missing the join marker.
    pub fn etcd_unmarked_members(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let etcd = &self.node_status(n).etcd;
                self.status.etcd.members.contains_key(&n.address)
                    && etcd.service.running
                    && !etcd.member_marked
            })
            .collect()
    }

    /// Running members whose image or parameters drifted.
    pub fn etcd_outdated_members(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let etcd = &self.node_status(n).etcd;
                if !etcd.service.running || !self.status.etcd.members.contains_key(&n.address) {
                    return false;
                }
                outdated(
                    &etcd.service,
                    &etcd_builtin_params(n, &self.cluster.options.etcd),
                    &self.cluster.options.etcd.params,
                    ETCD_IMAGE,
                )
            })
            .collect()
    }

    /// Healthy, fully populated, and in sync: safe for disruptive changes.
    pub fn etcd_is_good(&self) -> bool {
        if !self.status.etcd.is_healthy || self.status.etcd.members.is_empty() {
            return false;
        }
        self.status
            .etcd
            .members
            .keys()
            .all(|name| self.member_in_sync(name))
    }

    // ---- rivers

    pub fn rivers_stopped_nodes(&self) -> Vec<&'a Node> {
        self.all_nodes()
            .into_iter()
            .filter(|n| !self.node_status(n).rivers.running)
            .collect()
    }

    pub fn rivers_outdated_nodes(&self) -> Vec<&'a Node> {
        let params = rivers_params(
            &self.control_plane(),
            RIVERS_UPSTREAM_PORT,
            RIVERS_LISTEN_PORT,
        );
        self.all_nodes()
            .into_iter()
            .filter(|n| {
                let rivers = &self.node_status(n).rivers;
                rivers.running
                    && outdated(
                        rivers,
                        &params,
                        &self.cluster.options.rivers,
                        image_for(RIVERS_CONTAINER),
                    )
            })
            .collect()
    }

    pub fn etcd_rivers_stopped_nodes(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| !self.node_status(n).etcd_rivers.running)
            .collect()
    }

    pub fn etcd_rivers_outdated_nodes(&self) -> Vec<&'a Node> {
        let params = rivers_params(
            &self.control_plane(),
            ETCD_RIVERS_UPSTREAM_PORT,
            ETCD_RIVERS_LISTEN_PORT,
        );
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let rivers = &self.node_status(n).etcd_rivers;
                rivers.running
                    && outdated(
                        rivers,
                        &params,
                        &self.cluster.options.etcd_rivers,
                        image_for(ETCD_RIVERS_CONTAINER),
                    )
            })
            .collect()
    }

    // ---- kubernetes components

    pub fn api_server_stopped_nodes(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| !self.node_status(n).api_server.service.running)
            .collect()
    }

    pub fn api_server_outdated_nodes(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let api_server = &self.node_status(n).api_server.service;
                api_server.running
                    && outdated(
                        api_server,
                        &apiserver_params(n, &self.cluster.service_subnet),
                        &self.cluster.options.api_server,
                        image_for(API_SERVER_CONTAINER),
                    )
            })
            .collect()
    }

    pub fn controller_manager_stopped_nodes(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| !self.node_status(n).controller_manager.running)
            .collect()
    }

    pub fn controller_manager_outdated_nodes(&self) -> Vec<&'a Node> {
        let params =
            controller_manager_params(&self.cluster.name, &self.cluster.service_subnet);
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let cm = &self.node_status(n).controller_manager;
                cm.running
                    && outdated(
                        cm,
                        &params,
                        &self.cluster.options.controller_manager,
                        image_for(crate::helmsman::op::CONTROLLER_MANAGER_CONTAINER),
                    )
            })
            .collect()
    }

    pub fn scheduler_stopped_nodes(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| !self.node_status(n).scheduler.running)
            .collect()
    }

    pub fn scheduler_outdated_nodes(&self) -> Vec<&'a Node> {
        let params = scheduler_params(&self.cluster.name);
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let scheduler = &self.node_status(n).scheduler;
                scheduler.running
                    && outdated(
                        scheduler,
                        &params,
                        &self.cluster.options.scheduler,
                        image_for(crate::helmsman::op::SCHEDULER_CONTAINER),
                    )
            })
            .collect()
    }

    pub fn kubelet_stopped_nodes(&self) -> Vec<&'a Node> {
        self.all_nodes()
            .into_iter()
            .filter(|n| !self.node_status(n).kubelet.running)
            .collect()
    }

    /// Stopped kubelets whose node object is still registered.
    pub fn kubelet_stopped_registered_nodes(&self) -> Vec<&'a Node> {
        self.kubelet_stopped_nodes()
            .into_iter()
            .filter(|n| {
                self.status
                    .kubernetes
                    .nodes
                    .iter()
                    .any(|k| k.name() == n.nodename())
            })
            .collect()
    }

    /// Kubelets running under a name other than the declared one.
    pub fn kubelet_unrecognized_nodes(&self) -> Vec<&'a Node> {
        self.all_nodes()
            .into_iter()
            .filter(|n| {
                let kubelet = &self.node_status(n).kubelet;
                if !kubelet.running {
                    return false;
                }
                let expected = format!("--hostname-override={}", n.nodename());
                !kubelet.builtin_params.extra_args.contains(&expected)
            })
            .collect()
    }

    pub fn kubelet_outdated_nodes(&self) -> Vec<&'a Node> {
        self.all_nodes()
            .into_iter()
            .filter(|n| {
                let kubelet = &self.node_status(n).kubelet;
                kubelet.running
                    && outdated(
                        kubelet,
                        &kubelet_builtin_params(n, &self.cluster.options.kubelet),
                        &self.cluster.options.kubelet.params,
                        image_for(crate::helmsman::op::KUBELET_CONTAINER),
                    )
            })
            .collect()
    }

    pub fn proxy_stopped_nodes(&self) -> Vec<&'a Node> {
        if self.cluster.options.proxy.disable {
            return Vec::new();
        }
        self.all_nodes()
            .into_iter()
            .filter(|n| !self.node_status(n).proxy.running)
            .collect()
    }

    pub fn proxy_outdated_nodes(&self) -> Vec<&'a Node> {
        if self.cluster.options.proxy.disable {
            return Vec::new();
        }
        let params = proxy_params(&self.cluster.name);
        self.all_nodes()
            .into_iter()
            .filter(|n| {
                let proxy = &self.node_status(n).proxy;
                proxy.running
                    && outdated(
                        proxy,
                        &params,
                        &self.cluster.options.proxy.params,
                        image_for(crate::helmsman::op::PROXY_CONTAINER),
                    )
            })
            .collect()
    }

    /// Proxies running although the cluster disables kube-proxy.
    pub fn proxy_running_unexpectedly_nodes(&self) -> Vec<&'a Node> {
        if !self.cluster.options.proxy.disable {
            return Vec::new();
        }
        self.all_nodes()
            .into_iter()
            .filter(|n| self.node_status(n).proxy.running)
            .collect()
    }

    // ---- api server health

    pub fn healthy_api_server_nodes(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let api_server = &self.node_status(n).api_server;
                api_server.service.running && api_server.is_healthy
            })
            .collect()
    }

    pub fn unhealthy_api_server_nodes(&self) -> Vec<&'a Node> {
        self.control_plane()
            .into_iter()
            .filter(|n| {
                let api_server = &self.node_status(n).api_server;
                !(api_server.service.running && api_server.is_healthy)
            })
            .collect()
    }

    /// The API server node used for this tick's API operations.
    pub fn healthy_api_server(&self) -> &'a Node {
        self.healthy_api_server_nodes()
            .first()
            .copied()
            .unwrap_or_else(|| {
                self.control_plane()
                    .first()
                    .copied()
                    .expect("a validated cluster has a control plane node")
            })
    }

    // ---- node objects

    fn declared_node(&self, name: &str) -> Option<&'a Node> {
        self.cluster.nodes.iter().find(|n| n.nodename() == name)
    }

    /// Registered nodes whose labels, annotations, or taints drifted from
    /// the declaration. Returns the merged objects to apply; keys absent
    /// from the declaration are never removed.
    pub fn outdated_attrs_nodes(&self) -> Vec<KubeNode> {
        let mut result = Vec::new();
        for kube_node in &self.status.kubernetes.nodes {
            let Some(declared) = self.declared_node(kube_node.name()) else {
                continue;
            };
            let mut merged = kube_node.clone();
            let mut drift = false;

            for (key, value) in &declared.labels {
                if merged.metadata.labels.get(key) != Some(value) {
                    merged.metadata.labels.insert(key.clone(), value.clone());
                    drift = true;
                }
            }
            for (key, value) in &declared.annotations {
                if merged.metadata.annotations.get(key) != Some(value) {
                    merged
                        .metadata
                        .annotations
                        .insert(key.clone(), value.clone());
                    drift = true;
                }
            }
            for taint in &declared.taints {
                let desired = NodeTaint {
                    key: taint.key.clone(),
                    value: taint.value.clone(),
                    effect: taint.effect.as_str().to_string(),
                };
                match merged.spec.taints.iter_mut().find(|t| t.key == taint.key) {
                    Some(existing) if *existing == desired => {}
                    Some(existing) => {
                        *existing = desired;
                        drift = true;
                    }
                    None => {
                        merged.spec.taints.push(desired);
                        drift = true;
                    }
                }
            }

            if drift {
                result.push(merged);
            }
        }
        result
    }

    /// Node objects with no declared counterpart.
    pub fn non_cluster_nodes(&self) -> Vec<&KubeNode> {
        self.status
            .kubernetes
            .nodes
            .iter()
            .filter(|k| self.declared_node(k.name()).is_none())
            .collect()
    }

    /// Nodes this engine cordoned for a reboot.
    pub fn cordoned_nodes(&self) -> Vec<&KubeNode> {
        self.status
            .kubernetes
            .nodes
            .iter()
            .filter(|k| {
                k.spec.unschedulable && k.metadata.annotations.contains_key(REBOOT_ANNOTATION)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helmsman::cluster::status::{EtcdMember, KubeComponentStatus};
    use crate::helmsman::test_support::{connected_status, test_cluster};

    #[test]
    fn ssh_filters_respect_roles() {
        let cluster = test_cluster(3, 2);
        let mut status = connected_status(&cluster);
        status
            .node_statuses
            .get_mut("10.0.0.4")
            .expect("worker status")
            .ssh_connected = false;

        let nf = NodeFilter::new(&cluster, &status);
        let not_connected = nf.ssh_not_connected_nodes(nf.all_nodes(), true, true);
        assert_eq!(not_connected.len(), 1);
        assert_eq!(not_connected[0].address, "10.0.0.4");

        // Only control plane nodes count when workers are excluded.
        assert!(nf.ssh_not_connected_nodes(nf.all_nodes(), true, false).is_empty());
    }

    #[test]
    fn etcd_member_classification() {
        let cluster = test_cluster(3, 1);
        let mut status = connected_status(&cluster);

        // 10.0.0.1 is a settled member, 10.0.0.2 was added but never
        // started, 10.0.0.3 is absent, and an old node lingers.
        status.etcd.members.insert(
            "10.0.0.1".to_string(),
            EtcdMember {
                id: 1,
                name: "10.0.0.1".to_string(),
                peer_urls: vec![peer_url("10.0.0.1")],
            },
        );
        status.etcd.members.insert(
            "10.0.0.2".to_string(),
            EtcdMember {
                id: 2,
                name: String::new(),
                peer_urls: vec![peer_url("10.0.0.2")],
            },
        );
        status.etcd.members.insert(
            "10.9.9.9".to_string(),
            EtcdMember {
                id: 9,
                name: "10.9.9.9".to_string(),
                peer_urls: vec![peer_url("10.9.9.9")],
            },
        );
        status
            .etcd
            .in_sync_members
            .insert("10.0.0.1".to_string(), true);
        status
            .etcd
            .in_sync_members
            .insert("10.9.9.9".to_string(), true);

        let nf = NodeFilter::new(&cluster, &status);

        let unstarted: Vec<_> = nf
            .etcd_unstarted_members()
            .iter()
            .map(|n| n.address.clone())
            .collect();
        assert_eq!(unstarted, vec!["10.0.0.2"]);

        let new: Vec<_> = nf
            .etcd_new_members()
            .iter()
            .map(|n| n.address.clone())
            .collect();
        assert_eq!(new, vec!["10.0.0.3"]);

        let stray = nf.etcd_non_cluster_members(true);
        assert_eq!(stray, vec![("10.9.9.9".to_string(), 9)]);
        assert!(nf.etcd_non_cluster_members(false).is_empty());
    }

    #[test]
    fn etcd_is_good_requires_sync_everywhere() {
        let cluster = test_cluster(1, 0);
        let mut status = connected_status(&cluster);
        status.etcd.is_healthy = true;
        status.etcd.members.insert(
            "10.0.0.1".to_string(),
            EtcdMember {
                id: 1,
                name: "10.0.0.1".to_string(),
                peer_urls: vec![peer_url("10.0.0.1")],
            },
        );
        {
            let nf = NodeFilter::new(&cluster, &status);
            assert!(!nf.etcd_is_good());
        }

        status
            .etcd
            .in_sync_members
            .insert("10.0.0.1".to_string(), true);
        let nf = NodeFilter::new(&cluster, &status);
        assert!(nf.etcd_is_good());
    }

    #[test]
    fn healthy_api_server_prefers_healthy_nodes() {
        let cluster = test_cluster(2, 0);
        let mut status = connected_status(&cluster);
        status.node_statuses.get_mut("10.0.0.2").expect("status").api_server =
            KubeComponentStatus {
                service: ServiceStatus {
                    running: true,
                    ..Default::default()
                },
                is_healthy: true,
            };

        let nf = NodeFilter::new(&cluster, &status);
        assert_eq!(nf.healthy_api_server().address, "10.0.0.2");
        assert_eq!(nf.unhealthy_api_server_nodes().len(), 1);
    }

    #[test]
    fn attribute_drift_is_additive_only() {
        let mut cluster = test_cluster(1, 1);
        cluster.nodes[1]
            .labels
            .insert("rack".to_string(), "r1".to_string());

        let mut status = connected_status(&cluster);
        let mut registered = KubeNode::ready("10.0.0.2");
        registered
            .metadata
            .labels
            .insert("extra".to_string(), "kept".to_string());
        status.kubernetes.nodes = vec![KubeNode::ready("10.0.0.1"), registered];

        let nf = NodeFilter::new(&cluster, &status);
        let drifted = nf.outdated_attrs_nodes();
        assert_eq!(drifted.len(), 1);
        let merged = &drifted[0];
        assert_eq!(merged.name(), "10.0.0.2");
        assert_eq!(merged.metadata.labels.get("rack"), Some(&"r1".to_string()));
        assert_eq!(merged.metadata.labels.get("extra"), Some(&"kept".to_string()));
    }

    #[test]
    fn non_cluster_nodes_are_detected() {
        let cluster = test_cluster(1, 0);
        let mut status = connected_status(&cluster);
        status.kubernetes.nodes = vec![KubeNode::ready("10.0.0.1"), KubeNode::ready("10.9.9.9")];

        let nf = NodeFilter::new(&cluster, &status);
        let stray: Vec<_> = nf.non_cluster_nodes().iter().map(|n| n.name()).collect();
        assert_eq!(stray, vec!["10.9.9.9"]);
    }
}
