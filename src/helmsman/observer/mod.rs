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

pub mod aggregate;

use crate::helmsman::agent::Agent;
use crate::helmsman::cluster::status::{
    EtcdClusterStatus, EtcdStatus, KubeComponentStatus, NodeStatus, ServiceStatus,
};
use crate::helmsman::cluster::{Cluster, Node};
use crate::helmsman::engine::{ContainerEngine, Docker};
use crate::helmsman::etcd::EtcdFacade;
use crate::helmsman::k8s::{KubeClient, KubeTls};
use crate::helmsman::logger::log_debug;
use crate::helmsman::observability::metrics;
use crate::helmsman::op::{
    ALL_CONTAINERS, API_SERVER_CONTAINER, CONTROLLER_MANAGER_CONTAINER, ETCD_ADDED_MEMBER_FILE,
    ETCD_CONTAINER, ETCD_RIVERS_CONTAINER, KUBELET_CONTAINER, PROXY_CONTAINER, RIVERS_CONTAINER,
    SCHEDULER_CONTAINER,
};
use crate::helmsman::util::DynError;

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "observer";

/// Members whose revision trails the head by more than this are considered
/// out of sync.
const REVISION_TOLERANCE: i64 = 8;

async fn probe_node(
    node: &Node,
    agent: Arc<dyn Agent>,
    kube_tls: Option<&KubeTls>,
    etcd_volume: &str,
) -> Result<NodeStatus, DynError> {
    let engine = Docker::new(agent.clone());
    let containers = engine.inspect(&ALL_CONTAINERS).await?;
    let service = |name: &str| -> ServiceStatus {
        containers.get(name).cloned().unwrap_or_default()
    };

    let has_data = engine.volume_exists(etcd_volume).await.unwrap_or(false);
    let member_marked = agent
        .run(&format!("test -f {ETCD_ADDED_MEMBER_FILE}"))
        .await
        .is_ok();

    let api_server_service = service(API_SERVER_CONTAINER);
    let api_server_healthy = if node.control_plane && api_server_service.running {
        match kube_tls {
            Some(tls) => match KubeClient::new(
                &format!("https://{}:{}", node.address, crate::helmsman::infra::API_SERVER_PORT),
                tls,
            ) {
                Ok(client) => client.is_ready().await,
                Err(_) => false,
            },
            None => false,
        }
    } else {
        false
    };

    Ok(NodeStatus {
        ssh_connected: true,
        etcd: EtcdStatus {
            service: service(ETCD_CONTAINER),
            has_data,
            member_marked,
        },
        rivers: service(RIVERS_CONTAINER),
        etcd_rivers: service(ETCD_RIVERS_CONTAINER),
        api_server: KubeComponentStatus {
            service: api_server_service,
            is_healthy: api_server_healthy,
        },
        controller_manager: service(CONTROLLER_MANAGER_CONTAINER),
        scheduler: service(SCHEDULER_CONTAINER),
        kubelet: service(KUBELET_CONTAINER),
        proxy: service(PROXY_CONTAINER),
    })
}

/// Probes all nodes concurrently with a bounded per-host budget.
///
/// A slow or broken host only affects its own entry: it is reported as
/// `ssh_connected=false` and the tick proceeds.
pub async fn observe_nodes(
    cluster: &Cluster,
    agents: &HashMap<String, Arc<dyn Agent>>,
    kube_tls: Option<&KubeTls>,
    per_host_timeout: Duration,
) -> HashMap<String, NodeStatus> {
    let etcd_volume = cluster.options.etcd.volume_name();
    let probes = cluster.nodes.iter().map(|node| async move {
        let status = match agents.get(&node.address) {
            Some(agent) => {
                match tokio::time::timeout(
                    per_host_timeout,
                    probe_node(node, agent.clone(), kube_tls, etcd_volume),
                )
                .await
                {
                    Ok(Ok(status)) => status,
                    Ok(Err(err)) => {
                        log_debug(
                            COMPONENT,
                            "node probe failed",
                            &[("node", node.address.as_str()), ("error", &err.to_string())],
                        );
                        NodeStatus::default()
                    }
                    Err(_) => {
                        log_debug(
                            COMPONENT,
                            "node probe timed out",
                            &[("node", node.address.as_str())],
                        );
                        NodeStatus::default()
                    }
                }
            }
            None => NodeStatus::default(),
        };
        (node.address.clone(), status)
    });

    let statuses: HashMap<String, NodeStatus> = join_all(probes).await.into_iter().collect();
    for (address, status) in &statuses {
        metrics::set_node_reachable(address, status.ssh_connected);
    }
    statuses
}

/// Collects membership and per-endpoint health from the etcd quorum.
pub async fn observe_etcd(etcd: &Arc<dyn EtcdFacade>) -> EtcdClusterStatus {
    let members = match etcd.member_list().await {
        Ok(members) => members,
        Err(_) => return EtcdClusterStatus::default(),
    };

    let mut status = EtcdClusterStatus::default();
    let mut revisions = Vec::new();
    let mut healthy = 0usize;

    for member in members {
        let address = if member.name.is_empty() {
            // An added-but-unstarted member is only known by its peer URL.
            member
                .peer_urls
                .first()
                .and_then(|url| url.strip_prefix("http://"))
                .and_then(|rest| rest.split(':').next())
                .unwrap_or_default()
                .to_string()
        } else {
            member.name.clone()
        };
        if address.is_empty() {
            continue;
        }

        let health = etcd.endpoint_status(&address).await;
        if health.healthy {
            healthy += 1;
            revisions.push((address.clone(), health.revision));
        }
        status.members.insert(address, member);
    }

    let head = revisions.iter().map(|(_, rev)| *rev).max().unwrap_or(0);
    for (address, revision) in revisions {
        status
            .in_sync_members
            .insert(address, revision + REVISION_TOLERANCE >= head);
    }

    status.is_healthy = !status.members.is_empty() && healthy * 2 > status.members.len();
    status
}
