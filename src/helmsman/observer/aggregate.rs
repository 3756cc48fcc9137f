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

use crate::helmsman::cluster::resource::{static_resources, ResourceDefinition};
use crate::helmsman::cluster::status::{ClusterStatus, NodeStatus, ResourceStatus};
use crate::helmsman::cluster::{Cluster, Node};
use crate::helmsman::etcd::EtcdFacade;
use crate::helmsman::k8s::{KubeClient, KubeTls};
use crate::helmsman::logger::log_debug;
use crate::helmsman::observer::{observe_etcd, observe_nodes};
use crate::helmsman::op::{
    CLUSTER_DNS_CONFIGMAP, DEFAULT_NAMESPACE, ETCD_ENDPOINTS_NAME, ETCD_SERVICE_NAME,
    NODE_DNS_CONFIGMAP, SYSTEM_NAMESPACE,
};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "aggregate";

fn first_healthy_api_server<'a>(
    cluster: &'a Cluster,
    node_statuses: &HashMap<String, NodeStatus>,
) -> Option<&'a Node> {
    cluster.nodes.iter().find(|n| {
        n.control_plane
            && node_statuses
                .get(&n.address)
                .map(|ns| ns.api_server.service.running && ns.api_server.is_healthy)
                .unwrap_or(false)
    })
}

fn resource_status_from(object: &Value) -> ResourceStatus {
    let annotations = object
        .pointer("/metadata/annotations")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let has_been_ssa = object
        .pointer("/metadata/managedFields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields.iter().any(|field| {
                field.get("manager").and_then(Value::as_str) == Some("helmsman")
            })
        })
        .unwrap_or(false);

    // Workloads complete once their rollout catches up; everything else is
    // complete by existing.
    let completed = match object.get("kind").and_then(Value::as_str) {
        Some("Deployment") | Some("DaemonSet") => {
            let desired = object
                .pointer("/spec/replicas")
                .and_then(Value::as_i64)
                .or_else(|| {
                    object
                        .pointer("/status/desiredNumberScheduled")
                        .and_then(Value::as_i64)
                })
                .unwrap_or(1);
            let ready = object
                .pointer("/status/readyReplicas")
                .and_then(Value::as_i64)
                .or_else(|| object.pointer("/status/numberReady").and_then(Value::as_i64))
                .unwrap_or(0);
            ready >= desired
        }
        _ => true,
    };

    ResourceStatus {
        annotations,
        has_been_ssa,
        completed,
    }
}

async fn read_kubernetes(
    client: &KubeClient,
    resources: &[ResourceDefinition],
    status: &mut ClusterStatus,
) {
    let ks = &mut status.kubernetes;
    ks.is_control_plane_ready = client.is_ready().await;

    match client.list_nodes().await {
        Ok(nodes) => ks.nodes = nodes,
        Err(err) => log_debug(COMPONENT, "node list failed", &[("error", &err.to_string())]),
    }

    if let Ok(service) = client.get_service(SYSTEM_NAMESPACE, CLUSTER_DNS_CONFIGMAP).await {
        if let Some(service) = &service {
            match service.spec.cluster_ip.as_str() {
                "" | "None" => {}
                ip => ks.cluster_dns.cluster_ip = ip.to_string(),
            }
        }
        ks.dns_service = service;
    }
    if let Ok(config_map) = client
        .get_config_map(SYSTEM_NAMESPACE, CLUSTER_DNS_CONFIGMAP)
        .await
    {
        ks.cluster_dns.config_map = config_map;
    }
    if let Ok(config_map) = client
        .get_config_map(SYSTEM_NAMESPACE, NODE_DNS_CONFIGMAP)
        .await
    {
        ks.node_dns.config_map = config_map;
    }

    if let Ok(endpoints) = client.get_endpoints(DEFAULT_NAMESPACE, "kubernetes").await {
        ks.master_endpoints = endpoints;
    }
    if let Ok(slice) = client
        .get_endpoint_slice(DEFAULT_NAMESPACE, "kubernetes")
        .await
    {
        ks.master_endpoint_slice = slice;
    }
    if let Ok(service) = client.get_service(SYSTEM_NAMESPACE, ETCD_SERVICE_NAME).await {
        ks.etcd_service = service;
    }
    if let Ok(endpoints) = client
        .get_endpoints(SYSTEM_NAMESPACE, ETCD_ENDPOINTS_NAME)
        .await
    {
        ks.etcd_endpoints = endpoints;
    }
    if let Ok(slice) = client
        .get_endpoint_slice(SYSTEM_NAMESPACE, ETCD_ENDPOINTS_NAME)
        .await
    {
        ks.etcd_endpoint_slice = slice;
    }

    let statics = static_resources();
    for res in statics.iter().chain(resources.iter()) {
        match client.get_object(&res.manifest).await {
            Ok(Some(object)) => {
                ks.resource_statuses
                    .insert(res.key(), resource_status_from(&object));
            }
            Ok(None) => {}
            Err(err) => log_debug(
                COMPONENT,
                "resource status read failed",
                &[("resource", &res.key()), ("error", &err.to_string())],
            ),
        }
    }
}

/// Produces the tick's immutable observation of the whole cluster.
///
/// Node probing, etcd membership, and the Kubernetes view are merged; any
/// part that cannot be read simply stays at its zero value and the
/// decision engine treats it as absent.
pub async fn get_cluster_status(
    cluster: &Cluster,
    agents: &HashMap<String, Arc<dyn crate::helmsman::agent::Agent>>,
    etcd: &Arc<dyn EtcdFacade>,
    kube_tls: Option<&KubeTls>,
    resources: &[ResourceDefinition],
    config_version: String,
    per_host_timeout: Duration,
) -> ClusterStatus {
    let mut status = ClusterStatus {
        config_version,
        ..Default::default()
    };

    status.node_statuses = observe_nodes(cluster, agents, kube_tls, per_host_timeout).await;
    status.etcd = observe_etcd(etcd).await;

    let api_server = first_healthy_api_server(cluster, &status.node_statuses);
    if let (Some(node), Some(tls)) = (api_server, kube_tls) {
        match KubeClient::new(
            &format!("https://{}:{}", node.address, crate::helmsman::infra::API_SERVER_PORT),
            tls,
        ) {
            Ok(client) => read_kubernetes(&client, resources, &mut status).await,
            Err(err) => log_debug(
                COMPONENT,
                "kubernetes client unavailable",
                &[("error", &err.to_string())],
            ),
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_status_reads_ssa_and_completion() {
        let deployment = serde_json::json!({
            "kind": "Deployment",
            "metadata": {
                "annotations": {"cke.cybozu.com/revision": "3"},
                "managedFields": [
                    {"manager": "kubectl"},
                    {"manager": "helmsman"},
                ],
            },
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 1},
        });
        let status = resource_status_from(&deployment);
        assert!(status.has_been_ssa);
        assert!(!status.completed);
        assert_eq!(
            status.annotations.get("cke.cybozu.com/revision"),
            Some(&"3".to_string())
        );

        let config_map = serde_json::json!({
            "kind": "ConfigMap",
            "metadata": {},
        });
        let status = resource_status_from(&config_map);
        assert!(!status.has_been_ssa);
        assert!(status.completed);
    }
}
