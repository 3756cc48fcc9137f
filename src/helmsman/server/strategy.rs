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

use crate::helmsman::cluster::resource::{static_resources, ResourceDefinition, ResourceKind};
use crate::helmsman::cluster::status::{ClusterStatus, KubernetesClusterStatus};
use crate::helmsman::cluster::{Cluster, Constraints, Node, CONFIG_VERSION};
use crate::helmsman::k8s::{
    EndpointAddress, EndpointConditions, EndpointPort, EndpointSlice, EndpointSlicePort,
    EndpointSubset, Endpoints, ObjectMeta, Service, SliceEndpoint,
};
use crate::helmsman::logger::{log_info, log_warn};
use crate::helmsman::op::k8s::{
    APIServerRestartOp, ContainerStopOp, ControllerManagerBootOp, ControllerManagerRestartOp,
    KubeEndpointsOp, KubeNodeRemoveOp, KubeNodeUpdateOp, KubeProxyBootOp, KubeProxyRestartOp,
    KubeWaitOp, KubeletBootOp, KubeletRestartOp, SchedulerBootOp, SchedulerRestartOp,
};
use crate::helmsman::op::reboot::{
    RebootDequeueOp, RebootDrainStartOp, RebootDrainTimeoutOp, RebootRebootOp,
    RebootRecalcMetricsOp, RebootUncordonOp,
};
use crate::helmsman::op::resource::{NopOp, ResourceApplyOp};
use crate::helmsman::op::{
    clusterdns, etcd as etcdop, nodedns, rivers as riversop, Operator, Phase,
    DEFAULT_NAMESPACE, ETCD_ENDPOINTS_NAME, ETCD_RIVERS_CONTAINER, ETCD_RIVERS_LISTEN_PORT,
    ETCD_RIVERS_UPSTREAM_PORT, ETCD_SERVICE_NAME, RIVERS_CONTAINER, RIVERS_LISTEN_PORT,
    RIVERS_UPSTREAM_PORT, SYSTEM_NAMESPACE,
};
use crate::helmsman::reboot::{reboot_processing, RebootArgs};
use crate::helmsman::server::filter::NodeFilter;

use std::time::Duration;

const COMPONENT: &str = "strategy";

/// Knobs the decision engine takes from the process configuration.
#[derive(Clone, Debug)]
pub struct DecideConfig {
    pub max_concurrent_updates: usize,
    pub drain_retry_times: usize,
    pub drain_retry_interval: Duration,
}

impl Default for DecideConfig {
    fn default() -> Self {
        DecideConfig {
            max_concurrent_updates: 10,
            drain_retry_times: 5,
            drain_retry_interval: Duration::from_secs(10),
        }
    }
}

/// Returns the next operations to run and the phase that produced them.
///
/// The cascade is evaluated top to bottom and the first non-empty result
/// wins; an empty list with `Phase::Completed` means convergence.
pub fn decide_ops(
    cluster: &Cluster,
    status: &ClusterStatus,
    constraints: &Constraints,
    resources: &[ResourceDefinition],
    reboot_args: &RebootArgs,
    config: &DecideConfig,
) -> (Vec<Box<dyn Operator>>, Phase) {
    let nf = NodeFilter::new(cluster, status);

    // 0. Migrate node-side state after an engine upgrade.
    if status.config_version != CONFIG_VERSION {
        if !nf
            .ssh_not_connected_nodes(nf.all_nodes(), true, false)
            .is_empty()
        {
            log_warn(COMPONENT, "cannot upgrade for unreachable nodes", &[]);
            return (Vec::new(), Phase::UpgradeAborted);
        }
        return (
            vec![Box::new(crate::helmsman::op::upgrade::UpgradeOp::new(
                &nf.control_plane(),
            ))],
            Phase::Upgrade,
        );
    }

    // 1. Run or restart rivers so every node can reach the control plane.
    let ops = rivers_ops(cluster, &nf, config.max_concurrent_updates);
    if !ops.is_empty() {
        return (ops, Phase::Rivers);
    }

    // 2. Bootstrap the etcd cluster once.
    if !nf.etcd_bootstrapped() {
        if !nf
            .ssh_not_connected_nodes(nf.all_nodes(), true, false)
            .is_empty()
        {
            log_warn(COMPONENT, "cannot bootstrap etcd for unreachable nodes", &[]);
            return (Vec::new(), Phase::EtcdBootAborted);
        }
        return (
            vec![Box::new(etcdop::EtcdBootOp::new(
                &nf.control_plane(),
                &cluster.options.etcd,
            ))],
            Phase::EtcdBoot,
        );
    }

    // 3. Start stopped members that still own their data.
    let stopped = nf.ssh_connected_nodes(nf.etcd_stopped_members(), true, false);
    if !stopped.is_empty() {
        return (
            vec![Box::new(etcdop::EtcdStartOp::new(
                &stopped,
                &cluster.options.etcd,
            ))],
            Phase::EtcdStart,
        );
    }

    // 4. Wait for the etcd cluster to answer.
    if !status.etcd.is_healthy {
        return (
            vec![Box::new(etcdop::EtcdWaitClusterOp::new(&nf.control_plane()))],
            Phase::EtcdWait,
        );
    }

    // 5. Run or restart the kubernetes components.
    let ops = k8s_ops(cluster, &nf, config.max_concurrent_updates);
    if !ops.is_empty() {
        return (ops, Phase::K8sStart);
    }

    // 6. Maintain etcd membership, only with every control plane reachable.
    if nf
        .ssh_not_connected_nodes(nf.all_nodes(), true, false)
        .is_empty()
    {
        if let Some(op) = etcd_maint_op(cluster, &nf) {
            return (vec![op], Phase::EtcdMaintain);
        }
    }

    // 7. Maintain kubernetes resources.
    let ops = k8s_maint_ops(cluster, status, resources, reboot_args, &nf);
    if !ops.is_empty() {
        return (ops, Phase::K8sMaintain);
    }

    // 8. Stop control plane services on demoted nodes.
    let ops = clean_ops(cluster, &nf);
    if !ops.is_empty() {
        return (ops, Phase::StopCp);
    }

    // 9. Uncordon nodes this engine cordoned and no longer processes.
    if let Some(op) = reboot_uncordon_op(reboot_args, &nf) {
        return (vec![op], Phase::UncordonNodes);
    }

    // 10. Work the reboot queue.
    let (ops, phase_reboot) = reboot_ops(cluster, constraints, reboot_args, &nf, config);
    if phase_reboot {
        if !nf.etcd_is_good() {
            log_warn(
                COMPONENT,
                "cannot reboot nodes because etcd is not responding and in sync",
                &[],
            );
            return (Vec::new(), Phase::RebootNodes);
        }
        return (ops, Phase::RebootNodes);
    }

    (Vec::new(), Phase::Completed)
}

/// Splits a target set into operator batches of bounded width.
fn split_operators<'a, F>(
    nodes: Vec<&'a Node>,
    max_concurrent_updates: usize,
    mut make: F,
) -> Vec<Box<dyn Operator>>
where
    F: FnMut(&[&'a Node]) -> Box<dyn Operator>,
{
    let mut ops = Vec::new();
    let mut start = 0;
    while start < nodes.len() {
        let end = (start + max_concurrent_updates).min(nodes.len());
        ops.push(make(&nodes[start..end]));
        start = end;
    }
    ops
}

fn rivers_ops(
    cluster: &Cluster,
    nf: &NodeFilter<'_>,
    max_concurrent_updates: usize,
) -> Vec<Box<dyn Operator>> {
    let mut ops = Vec::new();
    let cp = nf.control_plane();

    let nodes = nf.ssh_connected_nodes(nf.rivers_stopped_nodes(), true, true);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        Box::new(riversop::RiversBootOp::new(
            batch,
            &cp,
            &cluster.options.rivers,
            RIVERS_CONTAINER,
            RIVERS_UPSTREAM_PORT,
            RIVERS_LISTEN_PORT,
        ))
    }));
    let nodes = nf.ssh_connected_nodes(nf.rivers_outdated_nodes(), true, true);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        Box::new(riversop::RiversRestartOp::new(
            batch,
            &cp,
            &cluster.options.rivers,
            RIVERS_CONTAINER,
            RIVERS_UPSTREAM_PORT,
            RIVERS_LISTEN_PORT,
        ))
    }));
    let nodes = nf.ssh_connected_nodes(nf.etcd_rivers_stopped_nodes(), true, false);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        Box::new(riversop::RiversBootOp::new(
            batch,
            &cp,
            &cluster.options.etcd_rivers,
            ETCD_RIVERS_CONTAINER,
            ETCD_RIVERS_UPSTREAM_PORT,
            ETCD_RIVERS_LISTEN_PORT,
        ))
    }));
    let nodes = nf.ssh_connected_nodes(nf.etcd_rivers_outdated_nodes(), true, false);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        Box::new(riversop::RiversRestartOp::new(
            batch,
            &cp,
            &cluster.options.etcd_rivers,
            ETCD_RIVERS_CONTAINER,
            ETCD_RIVERS_UPSTREAM_PORT,
            ETCD_RIVERS_LISTEN_PORT,
        ))
    }));
    ops
}

fn k8s_ops(
    cluster: &Cluster,
    nf: &NodeFilter<'_>,
    max_concurrent_updates: usize,
) -> Vec<Box<dyn Operator>> {
    let mut ops: Vec<Box<dyn Operator>> = Vec::new();

    // Control plane components.
    let nodes = nf.ssh_connected_nodes(nf.api_server_stopped_nodes(), true, false);
    if !nodes.is_empty() {
        ops.push(APIServerRestartOp::new(
            &nodes,
            &cluster.service_subnet,
            &cluster.options.api_server,
        ));
    }
    let nodes = nf.ssh_connected_nodes(nf.api_server_outdated_nodes(), true, false);
    if !nodes.is_empty() {
        ops.push(APIServerRestartOp::new(
            &nodes,
            &cluster.service_subnet,
            &cluster.options.api_server,
        ));
    }
    let nodes = nf.ssh_connected_nodes(nf.controller_manager_stopped_nodes(), true, false);
    if !nodes.is_empty() {
        ops.push(ControllerManagerBootOp::new(
            &nodes,
            &cluster.name,
            &cluster.service_subnet,
            &cluster.options.controller_manager,
        ));
    }
    let nodes = nf.ssh_connected_nodes(nf.controller_manager_outdated_nodes(), true, false);
    if !nodes.is_empty() {
        ops.push(ControllerManagerRestartOp::new(
            &nodes,
            &cluster.name,
            &cluster.service_subnet,
            &cluster.options.controller_manager,
        ));
    }
    let nodes = nf.ssh_connected_nodes(nf.scheduler_stopped_nodes(), true, false);
    if !nodes.is_empty() {
        ops.push(SchedulerBootOp::new(
            &nodes,
            &cluster.name,
            &cluster.options.scheduler,
        ));
    }
    let nodes = nf.ssh_connected_nodes(nf.scheduler_outdated_nodes(), true, false);
    if !nodes.is_empty() {
        ops.push(SchedulerRestartOp::new(
            &nodes,
            &cluster.name,
            &cluster.options.scheduler,
        ));
    }

    // Node components.
    let nodes = nf.ssh_connected_nodes(nf.kubelet_unrecognized_nodes(), true, true);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        Box::new(KubeletRestartOp::new(batch, &cluster.options.kubelet))
    }));
    let registered = nf.kubelet_stopped_registered_nodes();
    let nodes = nf.ssh_connected_nodes(nf.kubelet_stopped_nodes(), true, true);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        Box::new(KubeletBootOp::new(
            batch,
            &registered,
            &cluster.options.kubelet,
        ))
    }));
    let nodes = nf.ssh_connected_nodes(nf.kubelet_outdated_nodes(), true, true);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        Box::new(KubeletRestartOp::new(batch, &cluster.options.kubelet))
    }));
    let nodes = nf.ssh_connected_nodes(nf.proxy_stopped_nodes(), true, true);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        KubeProxyBootOp::new(batch, &cluster.name, &cluster.options.proxy.params)
    }));
    let nodes = nf.ssh_connected_nodes(nf.proxy_outdated_nodes(), true, true);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        KubeProxyRestartOp::new(batch, &cluster.name, &cluster.options.proxy.params)
    }));
    let nodes = nf.ssh_connected_nodes(nf.proxy_running_unexpectedly_nodes(), true, true);
    ops.extend(split_operators(nodes, max_concurrent_updates, |batch| {
        ContainerStopOp::proxy(batch)
    }));

    ops
}

/// Membership maintenance. Called only when every control plane node is
/// reachable, so connectivity filtering is not repeated here.
fn etcd_maint_op(cluster: &Cluster, nf: &NodeFilter<'_>) -> Option<Box<dyn Operator>> {
    let members = nf.etcd_non_cluster_members(false);
    if !members.is_empty() {
        return Some(Box::new(etcdop::EtcdRemoveMemberOp::new(&members)));
    }
    let (nodes, ids) = nf.etcd_non_cp_members(false);
    if !nodes.is_empty() {
        let reachable = nf.ssh_connected_nodes(nodes, false, true);
        return Some(Box::new(etcdop::EtcdDestroyMemberOp::new(
            &reachable,
            &ids,
            &cluster.options.etcd,
        )));
    }
    let nodes = nf.etcd_unstarted_members();
    if let Some(node) = nodes.first() {
        return Some(Box::new(etcdop::EtcdAddMemberOp::new(
            node,
            &cluster.options.etcd,
        )));
    }
    let nodes = nf.etcd_unmarked_members();
    if !nodes.is_empty() {
        return Some(Box::new(etcdop::EtcdMarkMemberOp::new(&nodes)));
    }

    if !nf.etcd_is_good() {
        log_warn(COMPONENT, "etcd is not good for maintenance", &[]);
        // Fall through to kubernetes maintenance.
        return None;
    }

    // Adding members or touching healthy members happens only in sync.
    let nodes = nf.etcd_new_members();
    if let Some(node) = nodes.first() {
        return Some(Box::new(etcdop::EtcdAddMemberOp::new(
            node,
            &cluster.options.etcd,
        )));
    }
    let members = nf.etcd_non_cluster_members(true);
    if !members.is_empty() {
        return Some(Box::new(etcdop::EtcdRemoveMemberOp::new(&members)));
    }
    let (nodes, ids) = nf.etcd_non_cp_members(true);
    if !nodes.is_empty() {
        let reachable = nf.ssh_connected_nodes(nodes, false, true);
        return Some(Box::new(etcdop::EtcdDestroyMemberOp::new(
            &reachable,
            &ids,
            &cluster.options.etcd,
        )));
    }
    let nodes = nf.etcd_outdated_members();
    if let Some(node) = nodes.first() {
        return Some(Box::new(etcdop::EtcdRestartOp::new(
            node,
            &cluster.options.etcd,
        )));
    }

    None
}

fn k8s_maint_ops(
    cluster: &Cluster,
    status: &ClusterStatus,
    resources: &[ResourceDefinition],
    reboot_args: &RebootArgs,
    nf: &NodeFilter<'_>,
) -> Vec<Box<dyn Operator>> {
    let ks = &status.kubernetes;
    let api_server = nf.healthy_api_server();

    if !ks.is_control_plane_ready {
        return vec![Box::new(KubeWaitOp::new(api_server))];
    }

    let mut ops = Vec::new();
    ops.extend(decide_resource_ops(
        api_server,
        ks,
        resources,
        ks.is_ready(cluster),
    ));
    ops.extend(decide_cluster_dns_ops(api_server, cluster, ks));
    ops.extend(decide_node_dns_ops(api_server, cluster, ks));

    // The default/kubernetes endpoints mirror the healthy API servers,
    // with nodes leaving for a reboot parked as not ready.
    let mut master_ready = Vec::new();
    let mut master_not_ready = Vec::new();
    for node in nf.healthy_api_server_nodes() {
        if draining_for_reboot(reboot_args, &node.address) {
            master_not_ready.push(node.address.clone());
        } else {
            master_ready.push(node.address.clone());
        }
    }
    for node in nf.unhealthy_api_server_nodes() {
        master_not_ready.push(node.address.clone());
    }
    let master = EndpointParams {
        namespace: DEFAULT_NAMESPACE.to_string(),
        name: "kubernetes".to_string(),
        ready_ips: master_ready,
        not_ready_ips: master_not_ready,
        port: 6443,
        port_name: "https".to_string(),
        service_name: "kubernetes".to_string(),
    };
    ops.extend(decide_ep_eps_ops(
        &master,
        ks.master_endpoints.as_ref(),
        ks.master_endpoint_slice.as_ref(),
        api_server,
    ));

    // Endpoints need a backing Service or the endpoint controller reaps
    // them.
    if let Some(op) = decide_etcd_service_op(ks.etcd_service.as_ref(), api_server) {
        ops.push(op);
    }

    let mut etcd_ready = Vec::new();
    let mut etcd_not_ready = Vec::new();
    for node in nf.control_plane() {
        if draining_for_reboot(reboot_args, &node.address) {
            etcd_not_ready.push(node.address.clone());
        } else {
            etcd_ready.push(node.address.clone());
        }
    }
    let etcd = EndpointParams {
        namespace: SYSTEM_NAMESPACE.to_string(),
        name: ETCD_ENDPOINTS_NAME.to_string(),
        ready_ips: etcd_ready,
        not_ready_ips: etcd_not_ready,
        port: 2379,
        port_name: String::new(),
        service_name: ETCD_SERVICE_NAME.to_string(),
    };
    ops.extend(decide_ep_eps_ops(
        &etcd,
        ks.etcd_endpoints.as_ref(),
        ks.etcd_endpoint_slice.as_ref(),
        api_server,
    ));

    let nodes = nf.outdated_attrs_nodes();
    if !nodes.is_empty() {
        ops.push(Box::new(KubeNodeUpdateOp::new(api_server, nodes)));
    }

    let names: Vec<String> = nf
        .non_cluster_nodes()
        .iter()
        .map(|n| n.name().to_string())
        .collect();
    if !names.is_empty() {
        ops.push(Box::new(KubeNodeRemoveOp::new(api_server, names)));
    }

    ops
}

fn draining_for_reboot(reboot_args: &RebootArgs, address: &str) -> bool {
    reboot_processing(&reboot_args.rq_entries, address)
        || reboot_args
            .newly_drained
            .iter()
            .any(|entry| entry.node == address)
}

fn desired_dns_servers(cluster: &Cluster, ks: &KubernetesClusterStatus) -> Vec<String> {
    if let Some(service) = &ks.dns_service {
        match service.spec.cluster_ip.as_str() {
            "" | "None" => {}
            ip => return vec![ip.to_string()],
        }
    }
    cluster.dns_servers.clone()
}

fn decide_cluster_dns_ops(
    api_server: &Node,
    cluster: &Cluster,
    ks: &KubernetesClusterStatus,
) -> Vec<Box<dyn Operator>> {
    let servers = desired_dns_servers(cluster, ks);
    let domain = &cluster.options.kubelet.cluster_domain;

    match &ks.cluster_dns.config_map {
        None => vec![clusterdns::create_config_map_op(api_server, domain, &servers)],
        Some(actual) => {
            let expected = clusterdns::config_map(domain, &servers);
            if actual.data.get("Corefile") != expected.data.get("Corefile") {
                vec![clusterdns::update_config_map_op(api_server, expected)]
            } else {
                Vec::new()
            }
        }
    }
}

fn decide_node_dns_ops(
    api_server: &Node,
    cluster: &Cluster,
    ks: &KubernetesClusterStatus,
) -> Vec<Box<dyn Operator>> {
    if ks.cluster_dns.cluster_ip.is_empty() {
        return Vec::new();
    }

    let servers = desired_dns_servers(cluster, ks);
    let domain = &cluster.options.kubelet.cluster_domain;

    match &ks.node_dns.config_map {
        None => vec![nodedns::create_config_map_op(
            api_server,
            &ks.cluster_dns.cluster_ip,
            domain,
            &servers,
        )],
        Some(actual) => {
            let expected = nodedns::config_map(&ks.cluster_dns.cluster_ip, domain, &servers);
            if actual.data.get("unbound.conf") != expected.data.get("unbound.conf") {
                vec![nodedns::update_config_map_op(api_server, expected)]
            } else {
                Vec::new()
            }
        }
    }
}

struct EndpointParams {
    namespace: String,
    name: String,
    ready_ips: Vec<String>,
    not_ready_ips: Vec<String>,
    port: i32,
    port_name: String,
    service_name: String,
}

fn expected_endpoints(params: &EndpointParams) -> Endpoints {
    let mut endpoints = Endpoints {
        metadata: ObjectMeta::named(&params.namespace, &params.name),
        subsets: vec![EndpointSubset {
            addresses: params
                .ready_ips
                .iter()
                .map(|ip| EndpointAddress { ip: ip.clone() })
                .collect(),
            not_ready_addresses: params
                .not_ready_ips
                .iter()
                .map(|ip| EndpointAddress { ip: ip.clone() })
                .collect(),
            ports: vec![EndpointPort {
                name: if params.port_name.is_empty() {
                    None
                } else {
                    Some(params.port_name.clone())
                },
                port: params.port,
            }],
        }],
    };
    endpoints.metadata.labels.insert(
        "endpointslice.kubernetes.io/skip-mirror".to_string(),
        "true".to_string(),
    );
    endpoints
}

fn expected_endpoint_slice(params: &EndpointParams) -> EndpointSlice {
    let mut slice = EndpointSlice {
        metadata: ObjectMeta::named(&params.namespace, &params.name),
        address_type: "IPv4".to_string(),
        endpoints: Vec::new(),
        ports: vec![EndpointSlicePort {
            name: Some(params.port_name.clone()),
            port: Some(params.port),
        }],
    };
    slice.metadata.labels.insert(
        "endpointslice.kubernetes.io/managed-by".to_string(),
        "cke.cybozu.com".to_string(),
    );
    slice.metadata.labels.insert(
        "kubernetes.io/service-name".to_string(),
        params.service_name.clone(),
    );
    for ip in &params.ready_ips {
        slice.endpoints.push(SliceEndpoint {
            addresses: vec![ip.clone()],
            conditions: EndpointConditions { ready: Some(true) },
        });
    }
    for ip in &params.not_ready_ips {
        slice.endpoints.push(SliceEndpoint {
            addresses: vec![ip.clone()],
            conditions: EndpointConditions { ready: Some(false) },
        });
    }
    slice
}

fn decide_ep_eps_ops(
    params: &EndpointParams,
    actual_endpoints: Option<&Endpoints>,
    actual_slice: Option<&EndpointSlice>,
    api_server: &Node,
) -> Vec<Box<dyn Operator>> {
    let mut ops = Vec::new();
    if let Some(op) = decide_ep_op(&expected_endpoints(params), actual_endpoints, api_server) {
        ops.push(op);
    }
    if let Some(op) = decide_eps_op(&expected_endpoint_slice(params), actual_slice, api_server) {
        ops.push(op);
    }
    ops
}

/// Emits a create or update when the observed Endpoints is not equivalent
/// to the expectation; `None` means the object may stay as it is.
fn decide_ep_op(
    expect: &Endpoints,
    actual: Option<&Endpoints>,
    api_server: &Node,
) -> Option<Box<dyn Operator>> {
    let Some(actual) = actual else {
        return Some(KubeEndpointsOp::create_endpoints(api_server, expect.clone()));
    };
    let update = || Some(KubeEndpointsOp::update_endpoints(api_server, expect.clone()));

    if actual.subsets.len() != 1 {
        return update();
    }
    for (key, value) in &expect.metadata.labels {
        if actual.metadata.labels.get(key) != Some(value) {
            return update();
        }
    }

    let subset = &actual.subsets[0];
    let expect_subset = &expect.subsets[0];
    if subset.ports.len() != 1 || subset.ports[0].port != expect_subset.ports[0].port {
        return update();
    }
    if subset.addresses.len() != expect_subset.addresses.len()
        || subset.not_ready_addresses.len() != expect_subset.not_ready_addresses.len()
    {
        return update();
    }

    let expected_ips: std::collections::HashSet<&str> = expect_subset
        .addresses
        .iter()
        .map(|a| a.ip.as_str())
        .collect();
    if subset
        .addresses
        .iter()
        .any(|a| !expected_ips.contains(a.ip.as_str()))
    {
        return update();
    }
    let expected_ips: std::collections::HashSet<&str> = expect_subset
        .not_ready_addresses
        .iter()
        .map(|a| a.ip.as_str())
        .collect();
    if subset
        .not_ready_addresses
        .iter()
        .any(|a| !expected_ips.contains(a.ip.as_str()))
    {
        return update();
    }

    None
}

fn decide_eps_op(
    expect: &EndpointSlice,
    actual: Option<&EndpointSlice>,
    api_server: &Node,
) -> Option<Box<dyn Operator>> {
    let Some(actual) = actual else {
        return Some(KubeEndpointsOp::create_endpoint_slice(
            api_server,
            expect.clone(),
        ));
    };
    let update = || {
        Some(KubeEndpointsOp::update_endpoint_slice(
            api_server,
            expect.clone(),
        ))
    };

    for (key, value) in &expect.metadata.labels {
        if actual.metadata.labels.get(key) != Some(value) {
            return update();
        }
    }
    if actual.address_type != expect.address_type {
        return update();
    }
    if actual.endpoints.len() != expect.endpoints.len() {
        return update();
    }
    for (actual_ep, expect_ep) in actual.endpoints.iter().zip(expect.endpoints.iter()) {
        match (actual_ep.conditions.ready, expect_ep.conditions.ready) {
            (Some(a), Some(e)) if a == e => {}
            _ => return update(),
        }
        if actual_ep.addresses.len() != expect_ep.addresses.len() {
            return update();
        }
        let expected: std::collections::HashSet<&str> =
            expect_ep.addresses.iter().map(String::as_str).collect();
        if actual_ep
            .addresses
            .iter()
            .any(|a| !expected.contains(a.as_str()))
        {
            return update();
        }
    }
    if actual.ports.len() != 1 {
        return update();
    }
    if actual.ports[0].name != expect.ports[0].name || actual.ports[0].port != expect.ports[0].port
    {
        return update();
    }

    None
}

fn decide_etcd_service_op(
    actual: Option<&Service>,
    api_server: &Node,
) -> Option<Box<dyn Operator>> {
    let Some(service) = actual else {
        return Some(KubeEndpointsOp::create_etcd_service(api_server));
    };
    let spec = &service.spec;
    if spec.ports.len() != 1
        || spec.ports[0].port != 2379
        || spec.service_type != "ClusterIP"
        || spec.cluster_ip != "None"
    {
        return Some(KubeEndpointsOp::update_etcd_service(api_server));
    }
    None
}

fn decide_resource_ops(
    api_server: &Node,
    ks: &KubernetesClusterStatus,
    resources: &[ResourceDefinition],
    is_ready: bool,
) -> Vec<Box<dyn Operator>> {
    let mut ops: Vec<Box<dyn Operator>> = Vec::new();

    for res in static_resources() {
        // Deployments wait until enough nodes are ready, avoiding a herd on
        // the first registered node.
        if res.kind == ResourceKind::Deployment && !is_ready {
            continue;
        }
        let status = ks.resource_statuses.get(&res.key()).cloned().unwrap_or_default();
        if !ks.resource_statuses.contains_key(&res.key()) || res.need_update(&status) {
            ops.push(Box::new(ResourceApplyOp::new(
                api_server,
                res,
                !status.has_been_ssa,
            )));
            // One static resource per tick keeps their declared order.
            return ops;
        }
    }

    let Some(first) = resources.first() else {
        return ops;
    };
    let mut rank = first.rank;

    for res in resources {
        if res.rank != rank && !ops.is_empty() {
            return ops;
        }
        if res.kind == ResourceKind::Deployment && !is_ready {
            rank = res.rank;
            continue;
        }
        match ks.resource_statuses.get(&res.key()) {
            None => {
                log_info(
                    COMPONENT,
                    "need to create",
                    &[
                        ("resource", &res.key()),
                        ("rank", &res.rank.to_string()),
                    ],
                );
                ops.push(Box::new(ResourceApplyOp::new(api_server, res.clone(), true)));
            }
            Some(status) => {
                if res.need_update(status) {
                    log_info(
                        COMPONENT,
                        "need to update",
                        &[
                            ("resource", &res.key()),
                            ("rank", &res.rank.to_string()),
                        ],
                    );
                    ops.push(Box::new(ResourceApplyOp::new(
                        api_server,
                        res.clone(),
                        !status.has_been_ssa,
                    )));
                } else if !status.completed {
                    log_info(COMPONENT, "need to wait", &[("resource", &res.key())]);
                    ops.push(Box::new(NopOp));
                }
            }
        }
        rank = res.rank;
    }
    ops
}

fn clean_ops(cluster: &Cluster, nf: &NodeFilter<'_>) -> Vec<Box<dyn Operator>> {
    let mut api_servers = Vec::new();
    let mut controller_managers = Vec::new();
    let mut schedulers = Vec::new();
    let mut etcds = Vec::new();
    let mut etcd_rivers = Vec::new();

    for node in &cluster.nodes {
        if node.control_plane {
            continue;
        }
        let ns = nf.node_status(node);
        if !ns.ssh_connected {
            continue;
        }
        if ns.etcd.service.running && nf.etcd_is_good() {
            etcds.push(node);
        }
        if ns.api_server.service.running {
            api_servers.push(node);
        }
        if ns.controller_manager.running {
            controller_managers.push(node);
        }
        if ns.scheduler.running {
            schedulers.push(node);
        }
        if ns.etcd_rivers.running {
            etcd_rivers.push(node);
        }
    }

    let mut ops = Vec::new();
    if !api_servers.is_empty() {
        ops.push(ContainerStopOp::api_server(&api_servers));
    }
    if !controller_managers.is_empty() {
        ops.push(ContainerStopOp::controller_manager(&controller_managers));
    }
    if !schedulers.is_empty() {
        ops.push(ContainerStopOp::scheduler(&schedulers));
    }
    if !etcds.is_empty() {
        ops.push(ContainerStopOp::etcd(&etcds));
    }
    if !etcd_rivers.is_empty() {
        ops.push(ContainerStopOp::etcd_rivers(&etcd_rivers));
    }
    ops
}

fn reboot_uncordon_op(
    reboot_args: &RebootArgs,
    nf: &NodeFilter<'_>,
) -> Option<Box<dyn Operator>> {
    let cordoned = nf.cordoned_nodes();
    if cordoned.is_empty() {
        return None;
    }
    let names: Vec<String> = cordoned
        .iter()
        .filter(|n| !reboot_processing(&reboot_args.rq_entries, n.name()))
        .map(|n| n.name().to_string())
        .collect();
    if names.is_empty() {
        return None;
    }
    Some(Box::new(RebootUncordonOp::new(
        nf.healthy_api_server(),
        names,
    )))
}

fn reboot_ops(
    cluster: &Cluster,
    constraints: &Constraints,
    reboot_args: &RebootArgs,
    nf: &NodeFilter<'_>,
    config: &DecideConfig,
) -> (Vec<Box<dyn Operator>>, bool) {
    if reboot_args.rq_entries.is_empty() {
        return (Vec::new(), false);
    }
    if cluster.reboot.reboot_command.is_empty() {
        log_warn(COMPONENT, "reboot command is not configured", &[]);
        return (Vec::new(), false);
    }
    if cluster.reboot.boot_check_command.is_empty() {
        log_warn(COMPONENT, "boot check command is not configured", &[]);
        return (Vec::new(), false);
    }

    let mut ops: Vec<Box<dyn Operator>> = Vec::new();
    let mut phase_reboot = false;

    if !reboot_args.newly_drained.is_empty() {
        phase_reboot = true;
        let ssh_check_nodes: Vec<&Node> = cluster
            .nodes
            .iter()
            .filter(|n| !reboot_processing(&reboot_args.rq_entries, &n.address))
            .collect();
        let unreachable = nf.ssh_not_connected_nodes(ssh_check_nodes, true, true);
        if unreachable.len() > constraints.reboot_maximum_unreachable {
            log_warn(
                COMPONENT,
                "cannot reboot nodes because too many nodes are unreachable",
                &[],
            );
        } else {
            ops.push(Box::new(RebootDrainStartOp::new(
                nf.healthy_api_server(),
                &reboot_args.newly_drained,
                &cluster.reboot,
                config.drain_retry_times,
                config.drain_retry_interval,
            )));
        }
    }
    if !reboot_args.drain_completed.is_empty() {
        phase_reboot = true;
        ops.push(Box::new(RebootRebootOp::new(
            &reboot_args.drain_completed,
            &cluster.reboot,
        )));
    }
    if !reboot_args.drain_timedout.is_empty() {
        phase_reboot = true;
        ops.push(Box::new(RebootDrainTimeoutOp::new(
            &reboot_args.drain_timedout,
        )));
    }
    if !reboot_args.reboot_dequeued.is_empty() {
        phase_reboot = true;
        ops.push(Box::new(RebootDequeueOp::new(&reboot_args.reboot_dequeued)));
    }
    if !ops.is_empty() {
        phase_reboot = true;
        ops.push(Box::new(RebootRecalcMetricsOp::new()));
    }

    (ops, phase_reboot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helmsman::cluster::resource::REVISION_ANNOTATION;
    use crate::helmsman::cluster::status::{EtcdStatus, ResourceStatus};
    use crate::helmsman::reboot::{RebootQueueEntry, RebootStatus};
    use crate::helmsman::test_support::{connected_status, converged_status, test_cluster};
    use chrono::Utc;

    fn decide(
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> (Vec<Box<dyn Operator>>, Phase) {
        decide_with(cluster, status, &RebootArgs::default())
    }

    fn decide_with(
        cluster: &Cluster,
        status: &ClusterStatus,
        reboot_args: &RebootArgs,
    ) -> (Vec<Box<dyn Operator>>, Phase) {
        let constraints = Constraints {
            control_plane_count: cluster.control_plane_count(),
            reboot_maximum_unreachable: 0,
            ..Default::default()
        };
        decide_ops(
            cluster,
            status,
            &constraints,
            &[],
            reboot_args,
            &DecideConfig::default(),
        )
    }

    fn op_names(ops: &[Box<dyn Operator>]) -> Vec<&'static str> {
        ops.iter().map(|op| op.name()).collect()
    }

    /// Completes the Kubernetes view so that maintenance finds nothing to
    /// do: matching DNS ConfigMaps, endpoints, slices, service, and every
    /// static resource applied at its current revision.
    fn fill_kubernetes(cluster: &Cluster, status: &mut ClusterStatus) {
        let cp_ips: Vec<String> = cluster
            .nodes
            .iter()
            .filter(|n| n.control_plane)
            .map(|n| n.address.clone())
            .collect();

        let domain = cluster.options.kubelet.cluster_domain.clone();
        status.kubernetes.cluster_dns.config_map =
            Some(clusterdns::config_map(&domain, &cluster.dns_servers));

        let master = EndpointParams {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: "kubernetes".to_string(),
            ready_ips: cp_ips.clone(),
            not_ready_ips: Vec::new(),
            port: 6443,
            port_name: "https".to_string(),
            service_name: "kubernetes".to_string(),
        };
        status.kubernetes.master_endpoints = Some(expected_endpoints(&master));
        status.kubernetes.master_endpoint_slice = Some(expected_endpoint_slice(&master));

        status.kubernetes.etcd_service =
            Some(crate::helmsman::op::k8s::desired_etcd_service());
        let etcd = EndpointParams {
            namespace: SYSTEM_NAMESPACE.to_string(),
            name: ETCD_ENDPOINTS_NAME.to_string(),
            ready_ips: cp_ips,
            not_ready_ips: Vec::new(),
            port: 2379,
            port_name: String::new(),
            service_name: ETCD_SERVICE_NAME.to_string(),
        };
        status.kubernetes.etcd_endpoints = Some(expected_endpoints(&etcd));
        status.kubernetes.etcd_endpoint_slice = Some(expected_endpoint_slice(&etcd));

        for res in static_resources() {
            let mut annotations = std::collections::HashMap::new();
            annotations.insert(REVISION_ANNOTATION.to_string(), res.revision.to_string());
            status.kubernetes.resource_statuses.insert(
                res.key(),
                ResourceStatus {
                    annotations,
                    has_been_ssa: true,
                    completed: true,
                },
            );
        }
    }

    fn converged(cluster: &Cluster) -> ClusterStatus {
        let mut status = converged_status(cluster);
        fill_kubernetes(cluster, &mut status);
        status
    }

    #[test]
    fn converged_cluster_is_completed() {
        let cluster = test_cluster(3, 2);
        let status = converged(&cluster);
        let (ops, phase) = decide(&cluster, &status);
        assert!(op_names(&ops).is_empty(), "got {:?}", op_names(&ops));
        assert_eq!(phase, Phase::Completed);
    }

    #[test]
    fn fresh_cluster_walks_rivers_then_etcd_then_k8s() {
        let cluster = test_cluster(3, 0);

        // Tick 1: nothing runs anywhere, rivers come first.
        let status = connected_status(&cluster);
        let (ops, phase) = decide(&cluster, &status);
        assert_eq!(phase, Phase::Rivers);
        assert!(op_names(&ops).contains(&"rivers-bootstrap"));

        // Tick 2: rivers run, etcd is not bootstrapped.
        let mut status = converged(&cluster);
        for node in &cluster.nodes {
            let ns = status.node_statuses.get_mut(&node.address).expect("status");
            ns.etcd = EtcdStatus::default();
            ns.api_server = Default::default();
            ns.controller_manager = Default::default();
            ns.scheduler = Default::default();
            ns.kubelet = Default::default();
            ns.proxy = Default::default();
        }
        status.etcd = Default::default();
        let (ops, phase) = decide(&cluster, &status);
        assert_eq!(phase, Phase::EtcdBoot);
        assert_eq!(op_names(&ops), vec!["etcd-bootstrap"]);

        // Tick 3: etcd is up, the kubernetes components follow.
        let mut status = converged(&cluster);
        for node in &cluster.nodes {
            let ns = status.node_statuses.get_mut(&node.address).expect("status");
            ns.api_server = Default::default();
            ns.controller_manager = Default::default();
            ns.scheduler = Default::default();
            ns.kubelet = Default::default();
            ns.proxy = Default::default();
        }
        let (ops, phase) = decide(&cluster, &status);
        assert_eq!(phase, Phase::K8sStart);
        let names = op_names(&ops);
        assert!(names.contains(&"apiserver-restart"));
        assert!(names.contains(&"controller-manager-bootstrap"));
        assert!(names.contains(&"scheduler-bootstrap"));
        assert!(names.contains(&"kubelet-bootstrap"));
        assert!(names.contains(&"kube-proxy-bootstrap"));
    }

    #[test]
    fn etcd_boot_requires_all_control_planes() {
        let cluster = test_cluster(3, 0);
        let mut status = converged(&cluster);
        for node in &cluster.nodes {
            status
                .node_statuses
                .get_mut(&node.address)
                .expect("status")
                .etcd = EtcdStatus::default();
        }
        status.etcd = Default::default();
        status
            .node_statuses
            .get_mut("10.0.0.2")
            .expect("status")
            .ssh_connected = false;

        let (ops, phase) = decide(&cluster, &status);
        assert!(ops.is_empty());
        assert_eq!(phase, Phase::EtcdBootAborted);
    }

    #[test]
    fn upgrade_requires_all_control_planes() {
        let cluster = test_cluster(3, 0);
        let mut status = converged(&cluster);
        status.config_version = "0".to_string();

        let (ops, phase) = decide(&cluster, &status);
        assert_eq!(phase, Phase::Upgrade);
        assert_eq!(op_names(&ops), vec!["upgrade"]);

        status
            .node_statuses
            .get_mut("10.0.0.3")
            .expect("status")
            .ssh_connected = false;
        let (ops, phase) = decide(&cluster, &status);
        assert!(ops.is_empty());
        assert_eq!(phase, Phase::UpgradeAborted);
    }

    #[test]
    fn one_new_member_is_added_at_a_time() {
        let cluster = test_cluster(4, 0);
        let mut status = converged(&cluster);

        // The fourth control plane node runs everything but never joined
        // etcd.
        status
            .node_statuses
            .get_mut("10.0.0.4")
            .expect("status")
            .etcd = EtcdStatus::default();
        status.etcd.members.remove("10.0.0.4");
        status.etcd.in_sync_members.remove("10.0.0.4");

        let (ops, phase) = decide(&cluster, &status);
        assert_eq!(phase, Phase::EtcdMaintain);
        assert_eq!(op_names(&ops), vec!["etcd-add-member"]);
        assert_eq!(ops[0].targets(), vec!["10.0.0.4"]);
    }

    #[test]
    fn ranked_resources_apply_lowest_rank_first() {
        let cluster = test_cluster(1, 1);
        let mut status = converged(&cluster);

        let low = ResourceDefinition {
            kind: ResourceKind::ConfigMap,
            namespace: "default".to_string(),
            name: "settings".to_string(),
            rank: 10,
            manifest: b"{}".to_vec(),
            revision: 2,
        };
        let high = ResourceDefinition {
            kind: ResourceKind::ConfigMap,
            namespace: "default".to_string(),
            name: "later".to_string(),
            rank: 20,
            manifest: b"{}".to_vec(),
            revision: 1,
        };

        // Rank 10 exists at revision 1 and needs an update; rank 20 does
        // not exist yet.
        let mut annotations = std::collections::HashMap::new();
        annotations.insert(REVISION_ANNOTATION.to_string(), "1".to_string());
        status.kubernetes.resource_statuses.insert(
            low.key(),
            ResourceStatus {
                annotations,
                has_been_ssa: true,
                completed: true,
            },
        );

        let constraints = Constraints {
            control_plane_count: 1,
            ..Default::default()
        };
        let (ops, phase) = decide_ops(
            &cluster,
            &status,
            &constraints,
            &[low.clone(), high],
            &RebootArgs::default(),
            &DecideConfig::default(),
        );
        assert_eq!(phase, Phase::K8sMaintain);
        assert_eq!(op_names(&ops), vec!["resource-apply"]);
        assert_eq!(ops[0].targets(), vec![low.key()]);
    }

    #[test]
    fn reboot_respects_unreachable_budget() {
        let mut cluster = test_cluster(3, 2);
        cluster.reboot.reboot_command = vec!["sudo".to_string(), "reboot".to_string()];
        cluster.reboot.boot_check_command = vec!["true".to_string()];

        let mut status = converged(&cluster);
        status
            .node_statuses
            .get_mut("10.0.0.5")
            .expect("status")
            .ssh_connected = false;

        let now = Utc::now();
        let entries = vec![
            RebootQueueEntry::new(1, "10.0.0.4", now),
            RebootQueueEntry::new(2, "10.0.0.5", now),
        ];
        let reboot_args = RebootArgs {
            rq_entries: entries.clone(),
            newly_drained: entries,
            ..Default::default()
        };

        let (ops, phase) = decide_with(&cluster, &status, &reboot_args);
        assert_eq!(phase, Phase::RebootNodes);
        assert!(ops.is_empty(), "got {:?}", op_names(&ops));
    }

    #[test]
    fn reboot_drain_starts_within_budget() {
        let mut cluster = test_cluster(3, 2);
        cluster.reboot.reboot_command = vec!["sudo".to_string(), "reboot".to_string()];
        cluster.reboot.boot_check_command = vec!["true".to_string()];

        let status = converged(&cluster);
        let now = Utc::now();
        let entries = vec![RebootQueueEntry::new(1, "10.0.0.4", now)];
        let reboot_args = RebootArgs {
            rq_entries: entries.clone(),
            newly_drained: entries,
            ..Default::default()
        };

        let (ops, phase) = decide_with(&cluster, &status, &reboot_args);
        assert_eq!(phase, Phase::RebootNodes);
        assert_eq!(
            op_names(&ops),
            vec!["reboot-drain-start", "reboot-recalc-metrics"]
        );
    }

    #[test]
    fn reboot_phase_is_blocked_by_bad_etcd() {
        let mut cluster = test_cluster(3, 1);
        cluster.reboot.reboot_command = vec!["reboot".to_string()];
        cluster.reboot.boot_check_command = vec!["true".to_string()];

        let mut status = converged(&cluster);
        status.etcd.in_sync_members.insert("10.0.0.2".to_string(), false);

        let now = Utc::now();
        let entries = vec![RebootQueueEntry::new(1, "10.0.0.4", now)];
        let reboot_args = RebootArgs {
            rq_entries: entries.clone(),
            newly_drained: entries,
            ..Default::default()
        };

        let (ops, phase) = decide_with(&cluster, &status, &reboot_args);
        assert_eq!(phase, Phase::RebootNodes);
        assert!(ops.is_empty());
    }

    #[test]
    fn operators_never_exceed_max_width() {
        let cluster = test_cluster(1, 7);
        let status = connected_status(&cluster);
        let constraints = Constraints {
            control_plane_count: 1,
            ..Default::default()
        };
        let config = DecideConfig {
            max_concurrent_updates: 3,
            ..Default::default()
        };
        let (ops, phase) = decide_ops(
            &cluster,
            &status,
            &constraints,
            &[],
            &RebootArgs::default(),
            &config,
        );
        assert_eq!(phase, Phase::Rivers);
        assert!(!ops.is_empty());
        for op in &ops {
            assert!(
                op.targets().len() <= 3,
                "{} touches {} nodes",
                op.name(),
                op.targets().len()
            );
        }
    }

    #[test]
    fn demoted_nodes_get_cleaned() {
        let cluster = test_cluster(3, 1);
        let mut status = converged(&cluster);
        // The worker still runs control plane bits from a former life, but
        // is not an etcd member.
        let ns = status.node_statuses.get_mut("10.0.0.4").expect("status");
        ns.api_server.service.running = true;
        ns.scheduler.running = true;

        let (ops, phase) = decide(&cluster, &status);
        assert_eq!(phase, Phase::StopCp);
        let names = op_names(&ops);
        assert!(names.contains(&"apiserver-stop"));
        assert!(names.contains(&"scheduler-stop"));
    }

    #[test]
    fn cordoned_nodes_get_uncordoned_when_not_processing() {
        let cluster = test_cluster(3, 1);
        let mut status = converged(&cluster);
        let mut node = crate::helmsman::k8s::Node::ready("10.0.0.4");
        node.spec.unschedulable = true;
        node.metadata.annotations.insert(
            crate::helmsman::op::REBOOT_ANNOTATION.to_string(),
            "true".to_string(),
        );
        status.kubernetes.nodes[3] = node;

        let (ops, phase) = decide(&cluster, &status);
        assert_eq!(phase, Phase::UncordonNodes);
        assert_eq!(op_names(&ops), vec!["reboot-uncordon"]);
        assert_eq!(ops[0].targets(), vec!["10.0.0.4"]);
    }

    #[test]
    fn endpoints_update_on_missing_managed_label() {
        let cluster = test_cluster(1, 0);
        let api_server = &cluster.nodes[0];
        let params = EndpointParams {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: "kubernetes".to_string(),
            ready_ips: vec!["10.0.0.1".to_string()],
            not_ready_ips: Vec::new(),
            port: 6443,
            port_name: "https".to_string(),
            service_name: "kubernetes".to_string(),
        };
        let expect = expected_endpoints(&params);

        // Identical object: no operation.
        assert!(decide_ep_op(&expect, Some(&expect), api_server).is_none());

        // Same addresses and ports but the skip-mirror label is absent.
        let mut actual = expect.clone();
        actual.metadata.labels.clear();
        let op = decide_ep_op(&expect, Some(&actual), api_server).expect("update emitted");
        assert_eq!(op.name(), "update-endpoints");

        // Address replaced by a stranger: same cardinality, different set.
        let mut actual = expect.clone();
        actual.subsets[0].addresses[0].ip = "10.9.9.9".to_string();
        assert!(decide_ep_op(&expect, Some(&actual), api_server).is_some());

        // Missing object: create.
        let op = decide_ep_op(&expect, None, api_server).expect("create emitted");
        assert_eq!(op.name(), "create-endpoints");
    }

    #[test]
    fn endpoint_slice_update_on_ready_pointer_drift() {
        let cluster = test_cluster(1, 0);
        let api_server = &cluster.nodes[0];
        let params = EndpointParams {
            namespace: SYSTEM_NAMESPACE.to_string(),
            name: ETCD_ENDPOINTS_NAME.to_string(),
            ready_ips: vec!["10.0.0.1".to_string()],
            not_ready_ips: Vec::new(),
            port: 2379,
            port_name: String::new(),
            service_name: ETCD_SERVICE_NAME.to_string(),
        };
        let expect = expected_endpoint_slice(&params);

        assert!(decide_eps_op(&expect, Some(&expect), api_server).is_none());

        let mut actual = expect.clone();
        actual.endpoints[0].conditions.ready = None;
        assert!(decide_eps_op(&expect, Some(&actual), api_server).is_some());

        let mut actual = expect.clone();
        actual.ports[0].port = Some(2380);
        assert!(decide_eps_op(&expect, Some(&actual), api_server).is_some());
    }

    #[test]
    fn drained_master_moves_to_not_ready_endpoints() {
        let mut cluster = test_cluster(3, 0);
        cluster.reboot.reboot_command = vec!["sudo".to_string(), "reboot".to_string()];
        cluster.reboot.boot_check_command = vec!["true".to_string()];
        let mut status = converged(&cluster);
        // Pretend 10.0.0.2 is draining; its endpoints entry must move to
        // not-ready, which shows up as an endpoints update.
        let now = Utc::now();
        let mut entry = RebootQueueEntry::new(1, "10.0.0.2", now);
        entry.transition(RebootStatus::Draining, now);
        let reboot_args = RebootArgs {
            rq_entries: vec![entry],
            ..Default::default()
        };
        // fill_kubernetes built the endpoints with every CP ready, so the
        // decision must now want an update.
        let (ops, phase) = decide_with(&cluster, &status, &reboot_args);
        assert_eq!(phase, Phase::K8sMaintain);
        let names = op_names(&ops);
        assert!(names.contains(&"update-endpoints"), "got {names:?}");
        assert!(names.contains(&"update-endpointslice"));

        // With matching not-ready endpoints in place, nothing is emitted.
        let cp_ready: Vec<String> = vec!["10.0.0.1".to_string(), "10.0.0.3".to_string()];
        let master = EndpointParams {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: "kubernetes".to_string(),
            ready_ips: cp_ready.clone(),
            not_ready_ips: vec!["10.0.0.2".to_string()],
            port: 6443,
            port_name: "https".to_string(),
            service_name: "kubernetes".to_string(),
        };
        status.kubernetes.master_endpoints = Some(expected_endpoints(&master));
        status.kubernetes.master_endpoint_slice = Some(expected_endpoint_slice(&master));
        let etcd = EndpointParams {
            namespace: SYSTEM_NAMESPACE.to_string(),
            name: ETCD_ENDPOINTS_NAME.to_string(),
            ready_ips: cp_ready,
            not_ready_ips: vec!["10.0.0.2".to_string()],
            port: 2379,
            port_name: String::new(),
            service_name: ETCD_SERVICE_NAME.to_string(),
        };
        status.kubernetes.etcd_endpoints = Some(expected_endpoints(&etcd));
        status.kubernetes.etcd_endpoint_slice = Some(expected_endpoint_slice(&etcd));

        let reboot_args = RebootArgs {
            rq_entries: vec![{
                let mut entry = RebootQueueEntry::new(1, "10.0.0.2", now);
                entry.transition(RebootStatus::Draining, now);
                entry
            }],
            ..Default::default()
        };
        let (ops, phase) = decide_with(&cluster, &status, &reboot_args);
        // A drain in flight with nothing to do this tick is convergence;
        // the queue manager surfaces the entry again when it moves.
        assert!(ops.is_empty());
        assert_eq!(phase, Phase::Completed);
    }

    #[test]
    fn priority_is_monotonic_across_phases() {
        let cluster = test_cluster(3, 1);

        // Break something at phase 1 and something at phase 7; phase 1
        // wins and nothing from 7 leaks out.
        let mut status = converged(&cluster);
        status
            .node_statuses
            .get_mut("10.0.0.4")
            .expect("status")
            .rivers
            .running = false;
        status.kubernetes.cluster_dns.config_map = None;

        let (ops, phase) = decide(&cluster, &status);
        assert_eq!(phase, Phase::Rivers);
        for op in &ops {
            assert!(
                op.name().starts_with("rivers"),
                "phase leak: {}",
                op.name()
            );
        }
    }
}
