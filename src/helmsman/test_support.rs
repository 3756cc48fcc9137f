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

//! Shared fixtures for unit and scenario tests.

use crate::helmsman::agent::{Agent, AgentError, AgentOutput};
use crate::helmsman::cluster::status::{
    ClusterStatus, EtcdMember, KubeComponentStatus, NodeStatus, ServiceStatus,
};
use crate::helmsman::cluster::{Cluster, Node, CONFIG_VERSION};
use crate::helmsman::engine::image_for;
use crate::helmsman::k8s::Node as KubeNode;
use crate::helmsman::op;
use crate::helmsman::op::etcd::{etcd_builtin_params, peer_url};
use crate::helmsman::op::k8s::{
    apiserver_params, controller_manager_params, kubelet_builtin_params, proxy_params,
    scheduler_params,
};
use crate::helmsman::op::rivers::rivers_params;
use crate::helmsman::util::DynError;

use async_trait::async_trait;
use std::sync::Mutex;

/// Builds a cluster of `cp` control plane nodes and `workers` workers with
/// addresses 10.0.0.1 onward.
pub fn test_cluster(cp: usize, workers: usize) -> Cluster {
    let mut nodes = Vec::new();
    for i in 0..cp + workers {
        nodes.push(Node {
            address: format!("10.0.0.{}", i + 1),
            user: "cybozu".to_string(),
            control_plane: i < cp,
            ..Default::default()
        });
    }
    Cluster {
        name: "test".to_string(),
        nodes,
        service_subnet: "10.68.0.0/16".to_string(),
        ..Default::default()
    }
}

/// A status where every node answers over ssh and nothing runs yet.
pub fn connected_status(cluster: &Cluster) -> ClusterStatus {
    let mut status = ClusterStatus {
        config_version: CONFIG_VERSION.to_string(),
        ..Default::default()
    };
    for node in &cluster.nodes {
        status.node_statuses.insert(
            node.address.clone(),
            NodeStatus {
                ssh_connected: true,
                ..Default::default()
            },
        );
    }
    status
}

fn current(builtin: crate::helmsman::cluster::ServiceParams, extra: crate::helmsman::cluster::ServiceParams, container: &str) -> ServiceStatus {
    ServiceStatus {
        running: true,
        image: image_for(container).to_string(),
        builtin_params: builtin,
        extra_params: extra,
    }
}

/// A status describing a fully converged cluster: everything runs with the
/// exact parameters the engine would generate, etcd is healthy and in sync,
/// and the Kubernetes view matches the declaration.
pub fn converged_status(cluster: &Cluster) -> ClusterStatus {
    let mut status = connected_status(cluster);
    let cp: Vec<&Node> = cluster.nodes.iter().filter(|n| n.control_plane).collect();

    for node in &cluster.nodes {
        let ns = status
            .node_statuses
            .get_mut(&node.address)
            .expect("node status exists");
        ns.rivers = current(
            rivers_params(&cp, op::RIVERS_UPSTREAM_PORT, op::RIVERS_LISTEN_PORT),
            cluster.options.rivers.clone(),
            op::RIVERS_CONTAINER,
        );
        ns.kubelet = current(
            kubelet_builtin_params(node, &cluster.options.kubelet),
            cluster.options.kubelet.params.clone(),
            op::KUBELET_CONTAINER,
        );
        if !cluster.options.proxy.disable {
            ns.proxy = current(
                proxy_params(&cluster.name),
                cluster.options.proxy.params.clone(),
                op::PROXY_CONTAINER,
            );
        }

        if node.control_plane {
            ns.etcd_rivers = current(
                rivers_params(
                    &cp,
                    op::ETCD_RIVERS_UPSTREAM_PORT,
                    op::ETCD_RIVERS_LISTEN_PORT,
                ),
                cluster.options.etcd_rivers.clone(),
                op::ETCD_RIVERS_CONTAINER,
            );
            ns.etcd.service = current(
                etcd_builtin_params(node, &cluster.options.etcd),
                cluster.options.etcd.params.clone(),
                op::ETCD_CONTAINER,
            );
            ns.etcd.has_data = true;
            ns.etcd.member_marked = true;
            ns.api_server = KubeComponentStatus {
                service: current(
                    apiserver_params(node, &cluster.service_subnet),
                    cluster.options.api_server.clone(),
                    op::API_SERVER_CONTAINER,
                ),
                is_healthy: true,
            };
            ns.controller_manager = current(
                controller_manager_params(&cluster.name, &cluster.service_subnet),
                cluster.options.controller_manager.clone(),
                op::CONTROLLER_MANAGER_CONTAINER,
            );
            ns.scheduler = current(
                scheduler_params(&cluster.name),
                cluster.options.scheduler.clone(),
                op::SCHEDULER_CONTAINER,
            );

            status.etcd.members.insert(
                node.address.clone(),
                EtcdMember {
                    id: node.address.bytes().map(u64::from).sum(),
                    name: node.address.clone(),
                    peer_urls: vec![peer_url(&node.address)],
                },
            );
            status
                .etcd
                .in_sync_members
                .insert(node.address.clone(), true);
        }
    }
    status.etcd.is_healthy = true;

    status.kubernetes.is_control_plane_ready = true;
    status.kubernetes.nodes = cluster
        .nodes
        .iter()
        .map(|n| KubeNode::ready(n.nodename()))
        .collect();
    status
}

/// An `Agent` whose responses are scripted and whose command lines are kept
/// for assertions.
pub struct RecordingAgent {
    commands: Mutex<Vec<String>>,
    response: Mutex<AgentOutput>,
    failure: Mutex<Option<(i32, Vec<u8>, Vec<u8>)>>,
}

impl Default for RecordingAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingAgent {
    pub fn new() -> Self {
        RecordingAgent {
            commands: Mutex::new(Vec::new()),
            response: Mutex::new(AgentOutput::default()),
            failure: Mutex::new(None),
        }
    }

    /// Every subsequent `run` succeeds with this stdout.
    pub fn respond_with(&self, stdout: &str) {
        let mut response = self.response.lock().unwrap();
        response.stdout = stdout.as_bytes().to_vec();
        *self.failure.lock().unwrap() = None;
    }

    /// Every subsequent `run` fails with this exit status and streams.
    pub fn fail_with(&self, status: i32, stderr: &str, stdout: &str) {
        *self.failure.lock().unwrap() = Some((
            status,
            stderr.as_bytes().to_vec(),
            stdout.as_bytes().to_vec(),
        ));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    async fn run(&self, cmdline: &str) -> Result<AgentOutput, DynError> {
        self.commands.lock().unwrap().push(cmdline.to_string());
        if let Some((status, stderr, stdout)) = self.failure.lock().unwrap().clone() {
            return Err(Box::new(AgentError {
                cmdline: cmdline.to_string(),
                exit_status: Some(status),
                stdout,
                stderr,
            }));
        }
        Ok(AgentOutput {
            stdout: self.response.lock().unwrap().stdout.clone(),
            stderr: Vec::new(),
        })
    }

    async fn run_with_input(&self, cmdline: &str, _input: &str) -> Result<(), DynError> {
        self.commands.lock().unwrap().push(cmdline.to_string());
        Ok(())
    }
}

