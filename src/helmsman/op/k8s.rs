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

use crate::helmsman::cluster::{KubeletParams, Mount, Node, ServiceParams};
use crate::helmsman::engine::ContainerEngine;
use crate::helmsman::k8s::{EndpointSlice, Endpoints, Node as KubeNode, Service, ServicePort};
use crate::helmsman::op::commands::{
    ImagePullCommand, MakeDirsCommand, RunContainerCommand, StopContainersCommand,
};
use crate::helmsman::op::{
    CommandSpec, Commander, OpContext, Operator, API_SERVER_CONTAINER,
    CONTROLLER_MANAGER_CONTAINER, ETCD_CONTAINER, ETCD_RIVERS_CONTAINER,
    ETCD_RIVERS_LISTEN_PORT, ETCD_SERVICE_NAME, KUBELET_CONTAINER, PROXY_CONTAINER,
    SCHEDULER_CONTAINER, SYSTEM_NAMESPACE,
};
use crate::helmsman::util::{new_error, DynError};

use async_trait::async_trait;
use std::time::Duration;

const PKI_DIR: &str = "/etc/helmsman/pki";
const KUBELET_ROOT: &str = "/var/lib/kubelet";
const WAIT_KUBE_ATTEMPTS: usize = 60;
const WAIT_KUBE_INTERVAL: Duration = Duration::from_secs(2);

/// Builtin parameters for kube-apiserver on one node.
///
/// The apiserver reaches etcd through the local etcd-rivers proxy so that a
/// member outage never severs a single apiserver.
pub fn apiserver_params(node: &Node, service_subnet: &str) -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "kube-apiserver".to_string(),
            "--allow-privileged".to_string(),
            format!("--etcd-servers=http://127.0.0.1:{ETCD_RIVERS_LISTEN_PORT}"),
            format!("--service-cluster-ip-range={service_subnet}"),
            "--secure-port=6443".to_string(),
            format!("--advertise-address={}", node.address),
            format!("--client-ca-file={PKI_DIR}/kubernetes-ca.crt"),
            format!("--tls-cert-file={PKI_DIR}/apiserver.crt"),
            format!("--tls-private-key-file={PKI_DIR}/apiserver.key"),
        ],
        extra_binds: vec![Mount::new(PKI_DIR, PKI_DIR, true)],
        ..Default::default()
    }
}

pub fn controller_manager_params(cluster_name: &str, service_subnet: &str) -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "kube-controller-manager".to_string(),
            format!("--cluster-name={cluster_name}"),
            format!("--cluster-cidr={service_subnet}"),
            format!("--kubeconfig={PKI_DIR}/controller-manager.kubeconfig"),
            "--use-service-account-credentials=true".to_string(),
            format!("--service-account-private-key-file={PKI_DIR}/service-account.key"),
        ],
        extra_binds: vec![Mount::new(PKI_DIR, PKI_DIR, true)],
        ..Default::default()
    }
}

pub fn scheduler_params(cluster_name: &str) -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "kube-scheduler".to_string(),
            format!("--kubeconfig={PKI_DIR}/scheduler.kubeconfig"),
            format!("--leader-elect-resource-name={cluster_name}"),
        ],
        extra_binds: vec![Mount::new(PKI_DIR, PKI_DIR, true)],
        ..Default::default()
    }
}

pub fn kubelet_builtin_params(node: &Node, kubelet: &KubeletParams) -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "kubelet".to_string(),
            format!("--hostname-override={}", node.nodename()),
            format!("--cluster-domain={}", kubelet.cluster_domain),
            format!("--kubeconfig={PKI_DIR}/kubelet.kubeconfig"),
            format!("--root-dir={KUBELET_ROOT}"),
        ],
        extra_binds: vec![
            Mount::new(PKI_DIR, PKI_DIR, true),
            Mount::new(KUBELET_ROOT, KUBELET_ROOT, false),
            Mount::new("/var/log/pods", "/var/log/pods", false),
        ],
        ..Default::default()
    }
}

pub fn proxy_params(_cluster_name: &str) -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "kube-proxy".to_string(),
            format!("--kubeconfig={PKI_DIR}/proxy.kubeconfig"),
            "--proxy-mode=iptables".to_string(),
            "--metrics-bind-address=127.0.0.1:10249".to_string(),
        ],
        extra_binds: vec![
            Mount::new(PKI_DIR, PKI_DIR, true),
            Mount::new("/lib/modules", "/lib/modules", true),
        ],
        ..Default::default()
    }
}

fn privileged_opts() -> Vec<String> {
    vec!["--privileged".to_string()]
}

/// Restart pattern shared by the control plane components: pull once, then
/// roll each node through stop and start so peers keep serving.
struct ComponentRollOp {
    op_name: &'static str,
    container: &'static str,
    nodes: Vec<String>,
    params: Vec<ServiceParams>,
    extra: ServiceParams,
    opts: Vec<String>,
    stop_first: bool,
    step: usize,
}

#[async_trait]
impl Operator for ComponentRollOp {
    fn name(&self) -> &'static str {
        self.op_name
    }

    fn targets(&self) -> Vec<String> {
        self.nodes.clone()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        if step == 0 {
            return Some(Box::new(ImagePullCommand {
                nodes: self.nodes.clone(),
                name: self.container.to_string(),
            }));
        }

        let per_node = if self.stop_first { 2 } else { 1 };
        let index = (step - 1) / per_node;
        if index >= self.nodes.len() {
            return None;
        }
        let node = self.nodes[index].clone();
        if self.stop_first && (step - 1) % per_node == 0 {
            return Some(Box::new(StopContainersCommand {
                nodes: vec![node],
                name: self.container.to_string(),
            }));
        }
        let mut command = RunContainerCommand::new(
            vec![node],
            self.container,
            self.params[index].clone(),
            self.extra.clone(),
        );
        command.opts = self.opts.clone();
        Some(Box::new(command))
    }
}

pub struct APIServerRestartOp;

impl APIServerRestartOp {
    pub fn new(
        nodes: &[&Node],
        service_subnet: &str,
        extra: &ServiceParams,
    ) -> Box<dyn Operator> {
        Box::new(ComponentRollOp {
            op_name: "apiserver-restart",
            container: API_SERVER_CONTAINER,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: nodes
                .iter()
                .map(|n| apiserver_params(n, service_subnet))
                .collect(),
            extra: extra.clone(),
            opts: Vec::new(),
            stop_first: true,
            step: 0,
        })
    }
}

pub struct ControllerManagerBootOp;

impl ControllerManagerBootOp {
    pub fn new(nodes: &[&Node], cluster_name: &str, service_subnet: &str, extra: &ServiceParams) -> Box<dyn Operator> {
        Box::new(ComponentRollOp {
            op_name: "controller-manager-bootstrap",
            container: CONTROLLER_MANAGER_CONTAINER,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: nodes
                .iter()
                .map(|_| controller_manager_params(cluster_name, service_subnet))
                .collect(),
            extra: extra.clone(),
            opts: Vec::new(),
            stop_first: false,
            step: 0,
        })
    }
}

pub struct ControllerManagerRestartOp;

impl ControllerManagerRestartOp {
    pub fn new(nodes: &[&Node], cluster_name: &str, service_subnet: &str, extra: &ServiceParams) -> Box<dyn Operator> {
        Box::new(ComponentRollOp {
            op_name: "controller-manager-restart",
            container: CONTROLLER_MANAGER_CONTAINER,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: nodes
                .iter()
                .map(|_| controller_manager_params(cluster_name, service_subnet))
                .collect(),
            extra: extra.clone(),
            opts: Vec::new(),
            stop_first: true,
            step: 0,
        })
    }
}

pub struct SchedulerBootOp;

impl SchedulerBootOp {
    pub fn new(nodes: &[&Node], cluster_name: &str, extra: &ServiceParams) -> Box<dyn Operator> {
        Box::new(ComponentRollOp {
            op_name: "scheduler-bootstrap",
            container: SCHEDULER_CONTAINER,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: nodes.iter().map(|_| scheduler_params(cluster_name)).collect(),
            extra: extra.clone(),
            opts: Vec::new(),
            stop_first: false,
            step: 0,
        })
    }
}

pub struct SchedulerRestartOp;

impl SchedulerRestartOp {
    pub fn new(nodes: &[&Node], cluster_name: &str, extra: &ServiceParams) -> Box<dyn Operator> {
        Box::new(ComponentRollOp {
            op_name: "scheduler-restart",
            container: SCHEDULER_CONTAINER,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: nodes.iter().map(|_| scheduler_params(cluster_name)).collect(),
            extra: extra.clone(),
            opts: Vec::new(),
            stop_first: true,
            step: 0,
        })
    }
}

/// Boots kubelet with its working directories in place.
///
/// Nodes that are already registered with the API keep their directories;
/// only genuinely fresh nodes get the initial layout.
pub struct KubeletBootOp {
    nodes: Vec<Node>,
    fresh: Vec<String>,
    kubelet: KubeletParams,
    step: usize,
}

impl KubeletBootOp {
    pub fn new(nodes: &[&Node], registered: &[&Node], kubelet: &KubeletParams) -> Self {
        let fresh = nodes
            .iter()
            .filter(|n| !registered.iter().any(|r| r.address == n.address))
            .map(|n| n.address.clone())
            .collect();
        KubeletBootOp {
            nodes: nodes.iter().map(|n| (*n).clone()).collect(),
            fresh,
            kubelet: kubelet.clone(),
            step: 0,
        }
    }

    fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.address.clone()).collect()
    }
}

#[async_trait]
impl Operator for KubeletBootOp {
    fn name(&self) -> &'static str {
        "kubelet-bootstrap"
    }

    fn targets(&self) -> Vec<String> {
        self.addresses()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(MakeDirsCommand {
                nodes: self.fresh.clone(),
                dirs: vec![
                    KUBELET_ROOT.to_string(),
                    "/var/log/pods".to_string(),
                    "/opt/volume/bin".to_string(),
                ],
            })),
            1 => Some(Box::new(ImagePullCommand {
                nodes: self.addresses(),
                name: KUBELET_CONTAINER.to_string(),
            })),
            2 => {
                let mut command = RunContainerCommand::new(
                    self.addresses(),
                    KUBELET_CONTAINER,
                    ServiceParams::default(),
                    self.kubelet.params.clone(),
                );
                command.opts = privileged_opts();
                // Each node gets its own hostname override.
                Some(Box::new(PerNodeRunCommand {
                    inner: command,
                    params: self
                        .nodes
                        .iter()
                        .map(|n| kubelet_builtin_params(n, &self.kubelet))
                        .collect(),
                }))
            }
            _ => None,
        }
    }
}

/// Runs one container per node with node-specific builtin parameters.
struct PerNodeRunCommand {
    inner: RunContainerCommand,
    params: Vec<ServiceParams>,
}

#[async_trait]
impl Commander for PerNodeRunCommand {
    fn command(&self) -> CommandSpec {
        self.inner.command()
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for (node, params) in self.inner.nodes.iter().zip(self.params.iter()) {
            ctx.inf
                .engine(node)?
                .run_system(
                    &self.inner.name,
                    &self.inner.opts,
                    params,
                    &self.inner.init_args,
                    &self.inner.extra,
                )
                .await?;
        }
        Ok(())
    }
}

pub struct KubeletRestartOp {
    nodes: Vec<Node>,
    kubelet: KubeletParams,
    step: usize,
}

impl KubeletRestartOp {
    pub fn new(nodes: &[&Node], kubelet: &KubeletParams) -> Self {
        KubeletRestartOp {
            nodes: nodes.iter().map(|n| (*n).clone()).collect(),
            kubelet: kubelet.clone(),
            step: 0,
        }
    }

    fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.address.clone()).collect()
    }
}

#[async_trait]
impl Operator for KubeletRestartOp {
    fn name(&self) -> &'static str {
        "kubelet-restart"
    }

    fn targets(&self) -> Vec<String> {
        self.addresses()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(ImagePullCommand {
                nodes: self.addresses(),
                name: KUBELET_CONTAINER.to_string(),
            })),
            1 => Some(Box::new(StopContainersCommand {
                nodes: self.addresses(),
                name: KUBELET_CONTAINER.to_string(),
            })),
            2 => {
                let mut command = RunContainerCommand::new(
                    self.addresses(),
                    KUBELET_CONTAINER,
                    ServiceParams::default(),
                    self.kubelet.params.clone(),
                );
                command.opts = privileged_opts();
                Some(Box::new(PerNodeRunCommand {
                    inner: command,
                    params: self
                        .nodes
                        .iter()
                        .map(|n| kubelet_builtin_params(n, &self.kubelet))
                        .collect(),
                }))
            }
            _ => None,
        }
    }
}

pub struct KubeProxyBootOp;

impl KubeProxyBootOp {
    pub fn new(nodes: &[&Node], cluster_name: &str, extra: &ServiceParams) -> Box<dyn Operator> {
        Box::new(ComponentRollOp {
            op_name: "kube-proxy-bootstrap",
            container: PROXY_CONTAINER,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: nodes.iter().map(|_| proxy_params(cluster_name)).collect(),
            extra: extra.clone(),
            opts: privileged_opts(),
            stop_first: false,
            step: 0,
        })
    }
}

pub struct KubeProxyRestartOp;

impl KubeProxyRestartOp {
    pub fn new(nodes: &[&Node], cluster_name: &str, extra: &ServiceParams) -> Box<dyn Operator> {
        Box::new(ComponentRollOp {
            op_name: "kube-proxy-restart",
            container: PROXY_CONTAINER,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: nodes.iter().map(|_| proxy_params(cluster_name)).collect(),
            extra: extra.clone(),
            opts: privileged_opts(),
            stop_first: true,
            step: 0,
        })
    }
}

/// Stops one named container on a set of nodes.
pub struct ContainerStopOp {
    op_name: &'static str,
    container: &'static str,
    nodes: Vec<String>,
    step: usize,
}

impl ContainerStopOp {
    fn boxed(op_name: &'static str, container: &'static str, nodes: &[&Node]) -> Box<dyn Operator> {
        Box::new(ContainerStopOp {
            op_name,
            container,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            step: 0,
        })
    }

    pub fn proxy(nodes: &[&Node]) -> Box<dyn Operator> {
        Self::boxed("kube-proxy-stop", PROXY_CONTAINER, nodes)
    }

    pub fn api_server(nodes: &[&Node]) -> Box<dyn Operator> {
        Self::boxed("apiserver-stop", API_SERVER_CONTAINER, nodes)
    }

    pub fn controller_manager(nodes: &[&Node]) -> Box<dyn Operator> {
        Self::boxed("controller-manager-stop", CONTROLLER_MANAGER_CONTAINER, nodes)
    }

    pub fn scheduler(nodes: &[&Node]) -> Box<dyn Operator> {
        Self::boxed("scheduler-stop", SCHEDULER_CONTAINER, nodes)
    }

    pub fn etcd(nodes: &[&Node]) -> Box<dyn Operator> {
        Self::boxed("etcd-stop", ETCD_CONTAINER, nodes)
    }

    pub fn etcd_rivers(nodes: &[&Node]) -> Box<dyn Operator> {
        Self::boxed("etcd-rivers-stop", ETCD_RIVERS_CONTAINER, nodes)
    }
}

#[async_trait]
impl Operator for ContainerStopOp {
    fn name(&self) -> &'static str {
        self.op_name
    }

    fn targets(&self) -> Vec<String> {
        self.nodes.clone()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(StopContainersCommand {
                nodes: self.nodes.clone(),
                name: self.container.to_string(),
            })),
            _ => None,
        }
    }
}

/// Waits until the control plane answers its readiness probe.
pub struct KubeWaitOp {
    api_server: Node,
    step: usize,
}

impl KubeWaitOp {
    pub fn new(api_server: &Node) -> Self {
        KubeWaitOp {
            api_server: api_server.clone(),
            step: 0,
        }
    }
}

struct WaitKubeCommand {
    api_server: Node,
}

#[async_trait]
impl Commander for WaitKubeCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("wait-kubernetes", &self.api_server.address, "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let client = ctx.inf.kube_client(&self.api_server)?;
        for _ in 0..WAIT_KUBE_ATTEMPTS {
            if ctx.cancel.is_cancelled() {
                return Err(new_error("cancelled while waiting for kubernetes"));
            }
            if client.is_ready().await {
                return Ok(());
            }
            tokio::time::sleep(WAIT_KUBE_INTERVAL).await;
        }
        Err(new_error("kubernetes control plane did not become ready"))
    }
}

#[async_trait]
impl Operator for KubeWaitOp {
    fn name(&self) -> &'static str {
        "wait-kubernetes"
    }

    fn targets(&self) -> Vec<String> {
        vec![self.api_server.address.clone()]
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(WaitKubeCommand {
                api_server: self.api_server.clone(),
            })),
            _ => None,
        }
    }
}

/// Applies desired labels, annotations, and taints to registered nodes.
pub struct KubeNodeUpdateOp {
    api_server: Node,
    nodes: Vec<KubeNode>,
    step: usize,
}

impl KubeNodeUpdateOp {
    pub fn new(api_server: &Node, nodes: Vec<KubeNode>) -> Self {
        KubeNodeUpdateOp {
            api_server: api_server.clone(),
            nodes,
            step: 0,
        }
    }
}

struct PatchNodesCommand {
    api_server: Node,
    nodes: Vec<KubeNode>,
}

#[async_trait]
impl Commander for PatchNodesCommand {
    fn command(&self) -> CommandSpec {
        let names: Vec<&str> = self.nodes.iter().map(|n| n.name()).collect();
        CommandSpec::new("update-nodes", &names.join(","), "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let client = ctx.inf.kube_client(&self.api_server)?;
        for node in &self.nodes {
            client.patch_node(node).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for KubeNodeUpdateOp {
    fn name(&self) -> &'static str {
        "update-nodes"
    }

    fn targets(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(PatchNodesCommand {
                api_server: self.api_server.clone(),
                nodes: self.nodes.clone(),
            })),
            _ => None,
        }
    }
}

/// Deletes node objects that have no counterpart in the declared cluster.
pub struct KubeNodeRemoveOp {
    api_server: Node,
    names: Vec<String>,
    step: usize,
}

impl KubeNodeRemoveOp {
    pub fn new(api_server: &Node, names: Vec<String>) -> Self {
        KubeNodeRemoveOp {
            api_server: api_server.clone(),
            names,
            step: 0,
        }
    }
}

struct RemoveNodesCommand {
    api_server: Node,
    names: Vec<String>,
}

#[async_trait]
impl Commander for RemoveNodesCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("remove-nodes", &self.names.join(","), "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let client = ctx.inf.kube_client(&self.api_server)?;
        for name in &self.names {
            client.delete_node(name).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for KubeNodeRemoveOp {
    fn name(&self) -> &'static str {
        "remove-nodes"
    }

    fn targets(&self) -> Vec<String> {
        self.names.clone()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(RemoveNodesCommand {
                api_server: self.api_server.clone(),
                names: self.names.clone(),
            })),
            _ => None,
        }
    }
}

enum EndpointsAction {
    CreateEndpoints(Endpoints),
    UpdateEndpoints(Endpoints),
    CreateSlice(EndpointSlice),
    UpdateSlice(EndpointSlice),
    CreateEtcdService,
    UpdateEtcdService,
}

/// One create-or-update against the discovery objects the engine owns.
pub struct KubeEndpointsOp {
    op_name: &'static str,
    api_server: Node,
    action: Option<EndpointsAction>,
    target: String,
}

impl KubeEndpointsOp {
    pub fn create_endpoints(api_server: &Node, endpoints: Endpoints) -> Box<dyn Operator> {
        let target = endpoints.metadata.name.clone().unwrap_or_default();
        Box::new(KubeEndpointsOp {
            op_name: "create-endpoints",
            api_server: api_server.clone(),
            action: Some(EndpointsAction::CreateEndpoints(endpoints)),
            target,
        })
    }

    pub fn update_endpoints(api_server: &Node, endpoints: Endpoints) -> Box<dyn Operator> {
        let target = endpoints.metadata.name.clone().unwrap_or_default();
        Box::new(KubeEndpointsOp {
            op_name: "update-endpoints",
            api_server: api_server.clone(),
            action: Some(EndpointsAction::UpdateEndpoints(endpoints)),
            target,
        })
    }

    pub fn create_endpoint_slice(api_server: &Node, slice: EndpointSlice) -> Box<dyn Operator> {
        let target = slice.metadata.name.clone().unwrap_or_default();
        Box::new(KubeEndpointsOp {
            op_name: "create-endpointslice",
            api_server: api_server.clone(),
            action: Some(EndpointsAction::CreateSlice(slice)),
            target,
        })
    }

    pub fn update_endpoint_slice(api_server: &Node, slice: EndpointSlice) -> Box<dyn Operator> {
        let target = slice.metadata.name.clone().unwrap_or_default();
        Box::new(KubeEndpointsOp {
            op_name: "update-endpointslice",
            api_server: api_server.clone(),
            action: Some(EndpointsAction::UpdateSlice(slice)),
            target,
        })
    }

    pub fn create_etcd_service(api_server: &Node) -> Box<dyn Operator> {
        Box::new(KubeEndpointsOp {
            op_name: "create-etcd-service",
            api_server: api_server.clone(),
            action: Some(EndpointsAction::CreateEtcdService),
            target: ETCD_SERVICE_NAME.to_string(),
        })
    }

    pub fn update_etcd_service(api_server: &Node) -> Box<dyn Operator> {
        Box::new(KubeEndpointsOp {
            op_name: "update-etcd-service",
            api_server: api_server.clone(),
            action: Some(EndpointsAction::UpdateEtcdService),
            target: ETCD_SERVICE_NAME.to_string(),
        })
    }
}

/// Headless service fronting the etcd endpoints in the system namespace.
pub fn desired_etcd_service() -> Service {
    Service {
        metadata: crate::helmsman::k8s::ObjectMeta::named(SYSTEM_NAMESPACE, ETCD_SERVICE_NAME),
        spec: crate::helmsman::k8s::service::ServiceSpec {
            ports: vec![ServicePort {
                name: None,
                port: 2379,
                protocol: Some("TCP".to_string()),
            }],
            cluster_ip: "None".to_string(),
            service_type: "ClusterIP".to_string(),
            ..Default::default()
        },
    }
}

struct EndpointsCommand {
    api_server: Node,
    action: EndpointsAction,
    name: &'static str,
    target: String,
}

#[async_trait]
impl Commander for EndpointsCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new(self.name, &self.target, "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let client = ctx.inf.kube_client(&self.api_server)?;
        match &self.action {
            EndpointsAction::CreateEndpoints(ep) => client.create_endpoints(ep).await,
            EndpointsAction::UpdateEndpoints(ep) => client.update_endpoints(ep).await,
            EndpointsAction::CreateSlice(slice) => client.create_endpoint_slice(slice).await,
            EndpointsAction::UpdateSlice(slice) => client.update_endpoint_slice(slice).await,
            EndpointsAction::CreateEtcdService => {
                client.create_service(&desired_etcd_service()).await
            }
            EndpointsAction::UpdateEtcdService => {
                client.update_service(&desired_etcd_service()).await
            }
        }
    }
}

#[async_trait]
impl Operator for KubeEndpointsOp {
    fn name(&self) -> &'static str {
        self.op_name
    }

    fn targets(&self) -> Vec<String> {
        vec![self.target.clone()]
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let action = self.action.take()?;
        Some(Box::new(EndpointsCommand {
            api_server: self.api_server.clone(),
            action,
            name: self.op_name,
            target: self.target.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: &str) -> Node {
        Node {
            address: address.to_string(),
            user: "op".to_string(),
            control_plane: true,
            ..Default::default()
        }
    }

    #[test]
    fn apiserver_restart_rolls_nodes_one_by_one() {
        let n1 = node("10.0.0.1");
        let n2 = node("10.0.0.2");
        let mut op = APIServerRestartOp::new(&[&n1, &n2], "10.68.0.0/16", &ServiceParams::default());

        let commands: Vec<CommandSpec> = std::iter::from_fn(|| op.next_command())
            .map(|c| c.command())
            .collect();
        let names: Vec<&str> = commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "image-pull",
                "stop-containers",
                "run-container",
                "stop-containers",
                "run-container",
            ]
        );
        assert_eq!(commands[1].target, "10.0.0.1");
        assert_eq!(commands[3].target, "10.0.0.2");
    }

    #[test]
    fn kubelet_params_follow_hostname_override() {
        let mut n = node("10.0.0.5");
        n.hostname = Some("worker-5".to_string());
        let params = kubelet_builtin_params(&n, &KubeletParams::default());
        assert!(params
            .extra_args
            .contains(&"--hostname-override=worker-5".to_string()));
        assert!(params
            .extra_args
            .contains(&"--cluster-domain=cluster.local".to_string()));
    }

    #[test]
    fn etcd_service_is_headless() {
        let service = desired_etcd_service();
        assert_eq!(service.spec.cluster_ip, "None");
        assert_eq!(service.spec.ports.len(), 1);
        assert_eq!(service.spec.ports[0].port, 2379);
    }
}
