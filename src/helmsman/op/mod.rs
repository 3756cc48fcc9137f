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

pub mod clusterdns;
pub mod commands;
pub mod etcd;
pub mod k8s;
pub mod nodedns;
pub mod reboot;
pub mod resource;
pub mod rivers;
pub mod upgrade;

use crate::helmsman::infra::Infrastructure;
use crate::helmsman::util::DynError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const RIVERS_CONTAINER: &str = "rivers";
pub const ETCD_RIVERS_CONTAINER: &str = "etcd-rivers";
pub const ETCD_CONTAINER: &str = "etcd";
pub const API_SERVER_CONTAINER: &str = "kube-apiserver";
pub const CONTROLLER_MANAGER_CONTAINER: &str = "kube-controller-manager";
pub const SCHEDULER_CONTAINER: &str = "kube-scheduler";
pub const KUBELET_CONTAINER: &str = "kubelet";
pub const PROXY_CONTAINER: &str = "kube-proxy";

/// The containers probed on every node, in inspection order.
pub const ALL_CONTAINERS: [&str; 8] = [
    RIVERS_CONTAINER,
    ETCD_RIVERS_CONTAINER,
    ETCD_CONTAINER,
    API_SERVER_CONTAINER,
    CONTROLLER_MANAGER_CONTAINER,
    SCHEDULER_CONTAINER,
    KUBELET_CONTAINER,
    PROXY_CONTAINER,
];

pub const RIVERS_UPSTREAM_PORT: u16 = 6443;
pub const RIVERS_LISTEN_PORT: u16 = 16443;
pub const ETCD_RIVERS_UPSTREAM_PORT: u16 = 2379;
pub const ETCD_RIVERS_LISTEN_PORT: u16 = 12379;

pub const SYSTEM_NAMESPACE: &str = "kube-system";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const ETCD_SERVICE_NAME: &str = "cke-etcd";
pub const ETCD_ENDPOINTS_NAME: &str = "cke-etcd";
pub const CLUSTER_DNS_CONFIGMAP: &str = "cluster-dns";
pub const NODE_DNS_CONFIGMAP: &str = "node-dns";

/// Annotation placed on nodes the engine cordons for a reboot.
pub const REBOOT_ANNOTATION: &str = "cke.cybozu.com/reboot";

/// Marker file recording that the local etcd joined the cluster.
pub const ETCD_ADDED_MEMBER_FILE: &str = "/var/lib/helmsman/etcd-added-member";

/// Label of the highest-priority step that produced operations this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Upgrade,
    UpgradeAborted,
    Rivers,
    EtcdBoot,
    EtcdBootAborted,
    EtcdStart,
    EtcdWait,
    K8sStart,
    EtcdMaintain,
    K8sMaintain,
    StopCp,
    UncordonNodes,
    RebootNodes,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Upgrade => "upgrade",
            Phase::UpgradeAborted => "upgrade-aborted",
            Phase::Rivers => "rivers",
            Phase::EtcdBoot => "etcd-boot",
            Phase::EtcdBootAborted => "etcd-boot-aborted",
            Phase::EtcdStart => "etcd-start",
            Phase::EtcdWait => "etcd-wait",
            Phase::K8sStart => "k8s-start",
            Phase::EtcdMaintain => "etcd-maintain",
            Phase::K8sMaintain => "k8s-maintain",
            Phase::StopCp => "stop-cp",
            Phase::UncordonNodes => "uncordon-nodes",
            Phase::RebootNodes => "reboot-nodes",
            Phase::Completed => "completed",
        }
    }

    pub fn all() -> &'static [Phase] {
        &[
            Phase::Upgrade,
            Phase::UpgradeAborted,
            Phase::Rivers,
            Phase::EtcdBoot,
            Phase::EtcdBootAborted,
            Phase::EtcdStart,
            Phase::EtcdWait,
            Phase::K8sStart,
            Phase::EtcdMaintain,
            Phase::K8sMaintain,
            Phase::StopCp,
            Phase::UncordonNodes,
            Phase::RebootNodes,
            Phase::Completed,
        ]
    }
}

/// Persistable description of one commander invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub detail: String,
}

impl CommandSpec {
    pub fn new(name: &str, target: &str, detail: &str) -> Self {
        CommandSpec {
            name: name.to_string(),
            target: target.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Execution context handed to commanders.
///
/// Bundles the shared infrastructure handles with the tick's cancellation
/// token so every side effect can be interrupted.
#[derive(Clone)]
pub struct OpContext {
    pub inf: Arc<Infrastructure>,
    pub cancel: CancellationToken,
}

impl OpContext {
    pub fn new(inf: Arc<Infrastructure>, cancel: CancellationToken) -> Self {
        OpContext { inf, cancel }
    }
}

/// One externally visible side effect.
#[async_trait]
pub trait Commander: Send + Sync {
    /// Structured description stored on the operation record.
    fn command(&self) -> CommandSpec;

    /// Performs the side effect.
    async fn run(&self, ctx: &OpContext) -> Result<(), DynError>;
}

/// A named, resumable unit of work producing a sequence of commanders.
#[async_trait]
pub trait Operator: Send {
    fn name(&self) -> &'static str;

    /// Addresses this operation touches, for the record and the logs.
    fn targets(&self) -> Vec<String>;

    /// Idempotent preparation; must tolerate half-applied prior state.
    async fn cleanup(&mut self, ctx: &OpContext) -> Result<(), DynError>;

    /// Returns the next commander, or `None` once the operation is done.
    fn next_command(&mut self) -> Option<Box<dyn Commander>>;
}

/// Joins node addresses for command targets and record entries.
pub fn targets_of(addresses: &[String]) -> String {
    addresses.join(",")
}
