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

use crate::helmsman::cluster::{EtcdParams, Mount, Node, ServiceParams};
use crate::helmsman::engine::ContainerEngine;
use crate::helmsman::etcd::{EtcdFacade, ETCD_CLIENT_PORT, ETCD_PEER_PORT};
use crate::helmsman::op::commands::{
    ImagePullCommand, MakeFileCommand, RemoveFileCommand, StopContainersCommand,
    VolumeCreateCommand, VolumeRemoveCommand,
};
use crate::helmsman::op::{
    targets_of, CommandSpec, Commander, OpContext, Operator, ETCD_ADDED_MEMBER_FILE,
    ETCD_CONTAINER,
};
use crate::helmsman::util::{new_error, with_context, DynError};

use async_trait::async_trait;
use std::time::Duration;

const ETCD_DATA_DIR: &str = "/var/lib/etcd";
const WAIT_SYNC_ATTEMPTS: usize = 60;
const WAIT_SYNC_INTERVAL: Duration = Duration::from_secs(2);

pub fn peer_url(address: &str) -> String {
    format!("http://{address}:{ETCD_PEER_PORT}")
}

/// Builtin parameters for an etcd member, independent of how it joins.
///
/// These are the parameters drift detection compares, so nothing about
/// cluster composition may appear here.
pub fn etcd_builtin_params(node: &Node, params: &EtcdParams) -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "etcd".to_string(),
            format!("--name={}", node.address),
            format!("--listen-peer-urls=http://0.0.0.0:{ETCD_PEER_PORT}"),
            format!("--listen-client-urls=http://0.0.0.0:{ETCD_CLIENT_PORT}"),
            format!("--initial-advertise-peer-urls={}", peer_url(&node.address)),
            format!(
                "--advertise-client-urls=http://{}:{}",
                node.address, ETCD_CLIENT_PORT
            ),
            format!("--data-dir={ETCD_DATA_DIR}"),
        ],
        extra_binds: vec![Mount::new(params.volume_name(), ETCD_DATA_DIR, false)],
        ..Default::default()
    }
}

fn initial_cluster_args(members: &[(String, String)], state: &str) -> Vec<String> {
    let roster: Vec<String> = members
        .iter()
        .map(|(name, url)| format!("{name}={url}"))
        .collect();
    vec![
        format!("--initial-cluster={}", roster.join(",")),
        format!("--initial-cluster-state={state}"),
        "--initial-cluster-token=helmsman-etcd".to_string(),
    ]
}

/// Runs an etcd container on every target with the given join arguments.
struct RunEtcdCommand {
    nodes: Vec<String>,
    params: Vec<ServiceParams>,
    init_args: Vec<String>,
    extra: ServiceParams,
}

#[async_trait]
impl Commander for RunEtcdCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("run-container", &targets_of(&self.nodes), ETCD_CONTAINER)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for (node, params) in self.nodes.iter().zip(self.params.iter()) {
            ctx.inf
                .engine(node)?
                .run_system(ETCD_CONTAINER, &[], params, &self.init_args, &self.extra)
                .await
                .map_err(|err| with_context(err, format!("on {node}")))?;
        }
        Ok(())
    }
}

/// Polls the cluster until every probed member answers healthily.
struct WaitEtcdSyncCommand {
    endpoints: Vec<String>,
}

#[async_trait]
impl Commander for WaitEtcdSyncCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("wait-etcd-sync", &targets_of(&self.endpoints), "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let etcd = ctx.inf.etcd()?;
        for _ in 0..WAIT_SYNC_ATTEMPTS {
            if ctx.cancel.is_cancelled() {
                return Err(new_error("cancelled while waiting for etcd"));
            }
            let mut all_healthy = true;
            for endpoint in &self.endpoints {
                if !etcd.endpoint_status(endpoint).await.healthy {
                    all_healthy = false;
                    break;
                }
            }
            if all_healthy {
                return Ok(());
            }
            tokio::time::sleep(WAIT_SYNC_INTERVAL).await;
        }
        Err(new_error("etcd cluster did not become healthy in time"))
    }
}

/// Adds one member through the cluster API, then starts it against the
/// refreshed roster.
struct AddEtcdMemberCommand {
    node: Node,
    params: ServiceParams,
    extra: ServiceParams,
}

#[async_trait]
impl Commander for AddEtcdMemberCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("add-etcd-member", &self.node.address, "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let etcd = ctx.inf.etcd()?;
        let url = peer_url(&self.node.address);

        let members = etcd.member_list().await?;
        if !members
            .iter()
            .any(|member| member.peer_urls.contains(&url))
        {
            etcd.member_add(&url).await?;
        }

        let members = etcd.member_list().await?;
        let mut roster = Vec::new();
        for member in &members {
            let Some(peer) = member.peer_urls.first() else {
                continue;
            };
            let name = if peer == &url || !member.name.is_empty() {
                if peer == &url {
                    self.node.address.clone()
                } else {
                    member.name.clone()
                }
            } else {
                continue;
            };
            roster.push((name, peer.clone()));
        }

        ctx.inf
            .engine(&self.node.address)?
            .run_system(
                ETCD_CONTAINER,
                &[],
                &self.params,
                &initial_cluster_args(&roster, "existing"),
                &self.extra,
            )
            .await
    }
}

/// Removes members from the cluster by id.
struct RemoveEtcdMemberCommand {
    ids: Vec<u64>,
}

#[async_trait]
impl Commander for RemoveEtcdMemberCommand {
    fn command(&self) -> CommandSpec {
        let ids: Vec<String> = self.ids.iter().map(u64::to_string).collect();
        CommandSpec::new("remove-etcd-member", &ids.join(","), "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let etcd = ctx.inf.etcd()?;
        for id in &self.ids {
            etcd.member_remove(*id).await?;
        }
        Ok(())
    }
}

fn mark_member_command(nodes: Vec<String>) -> Box<dyn Commander> {
    struct MarkMemberCommand {
        nodes: Vec<String>,
    }

    #[async_trait]
    impl Commander for MarkMemberCommand {
        fn command(&self) -> CommandSpec {
            CommandSpec::new("mark-etcd-member", &targets_of(&self.nodes), ETCD_ADDED_MEMBER_FILE)
        }

        async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
            for node in &self.nodes {
                MakeFileCommand {
                    node: node.clone(),
                    path: ETCD_ADDED_MEMBER_FILE.to_string(),
                    content: "added\n".to_string(),
                }
                .run(ctx)
                .await?;
            }
            Ok(())
        }
    }

    Box::new(MarkMemberCommand { nodes })
}

/// Bootstraps a brand-new etcd cluster over all control plane nodes.
pub struct EtcdBootOp {
    nodes: Vec<Node>,
    params: EtcdParams,
    step: usize,
}

impl EtcdBootOp {
    pub fn new(cp: &[&Node], params: &EtcdParams) -> Self {
        EtcdBootOp {
            nodes: cp.iter().map(|n| (*n).clone()).collect(),
            params: params.clone(),
            step: 0,
        }
    }

    fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.address.clone()).collect()
    }
}

#[async_trait]
impl Operator for EtcdBootOp {
    fn name(&self) -> &'static str {
        "etcd-bootstrap"
    }

    fn targets(&self) -> Vec<String> {
        self.addresses()
    }

    async fn cleanup(&mut self, ctx: &OpContext) -> Result<(), DynError> {
        // A half-bootstrapped cluster leaves containers behind; removing
        // them again must succeed.
        StopContainersCommand {
            nodes: self.addresses(),
            name: ETCD_CONTAINER.to_string(),
        }
        .run(ctx)
        .await
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(ImagePullCommand {
                nodes: self.addresses(),
                name: ETCD_CONTAINER.to_string(),
            })),
            1 => Some(Box::new(VolumeCreateCommand {
                nodes: self.addresses(),
                volume: self.params.volume_name().to_string(),
            })),
            2 => {
                let roster: Vec<(String, String)> = self
                    .nodes
                    .iter()
                    .map(|n| (n.address.clone(), peer_url(&n.address)))
                    .collect();
                Some(Box::new(RunEtcdCommand {
                    nodes: self.addresses(),
                    params: self
                        .nodes
                        .iter()
                        .map(|n| etcd_builtin_params(n, &self.params))
                        .collect(),
                    init_args: initial_cluster_args(&roster, "new"),
                    extra: self.params.params.clone(),
                }))
            }
            3 => Some(Box::new(WaitEtcdSyncCommand {
                endpoints: self.addresses(),
            })),
            4 => Some(mark_member_command(self.addresses())),
            _ => None,
        }
    }
}

/// Starts stopped members that still own their data.
pub struct EtcdStartOp {
    nodes: Vec<Node>,
    params: EtcdParams,
    step: usize,
}

impl EtcdStartOp {
    pub fn new(nodes: &[&Node], params: &EtcdParams) -> Self {
        EtcdStartOp {
            nodes: nodes.iter().map(|n| (*n).clone()).collect(),
            params: params.clone(),
            step: 0,
        }
    }

    fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.address.clone()).collect()
    }
}

#[async_trait]
impl Operator for EtcdStartOp {
    fn name(&self) -> &'static str {
        "etcd-start"
    }

    fn targets(&self) -> Vec<String> {
        self.addresses()
    }

    async fn cleanup(&mut self, ctx: &OpContext) -> Result<(), DynError> {
        StopContainersCommand {
            nodes: self.addresses(),
            name: ETCD_CONTAINER.to_string(),
        }
        .run(ctx)
        .await
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(ImagePullCommand {
                nodes: self.addresses(),
                name: ETCD_CONTAINER.to_string(),
            })),
            1 => Some(Box::new(RunEtcdCommand {
                nodes: self.addresses(),
                params: self
                    .nodes
                    .iter()
                    .map(|n| etcd_builtin_params(n, &self.params))
                    .collect(),
                init_args: Vec::new(),
                extra: self.params.params.clone(),
            })),
            2 => Some(Box::new(WaitEtcdSyncCommand {
                endpoints: self.addresses(),
            })),
            _ => None,
        }
    }
}

/// Blocks the cascade until the cluster answers healthily again.
pub struct EtcdWaitClusterOp {
    endpoints: Vec<String>,
    step: usize,
}

impl EtcdWaitClusterOp {
    pub fn new(cp: &[&Node]) -> Self {
        EtcdWaitClusterOp {
            endpoints: cp.iter().map(|n| n.address.clone()).collect(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for EtcdWaitClusterOp {
    fn name(&self) -> &'static str {
        "etcd-wait-cluster"
    }

    fn targets(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(WaitEtcdSyncCommand {
                endpoints: self.endpoints.clone(),
            })),
            _ => None,
        }
    }
}

/// Joins a single new or unstarted member, one at a time.
pub struct EtcdAddMemberOp {
    node: Node,
    params: EtcdParams,
    step: usize,
}

impl EtcdAddMemberOp {
    pub fn new(node: &Node, params: &EtcdParams) -> Self {
        EtcdAddMemberOp {
            node: node.clone(),
            params: params.clone(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for EtcdAddMemberOp {
    fn name(&self) -> &'static str {
        "etcd-add-member"
    }

    fn targets(&self) -> Vec<String> {
        vec![self.node.address.clone()]
    }

    async fn cleanup(&mut self, ctx: &OpContext) -> Result<(), DynError> {
        StopContainersCommand {
            nodes: vec![self.node.address.clone()],
            name: ETCD_CONTAINER.to_string(),
        }
        .run(ctx)
        .await
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let address = self.node.address.clone();
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(VolumeRemoveCommand {
                nodes: vec![address],
                volume: self.params.volume_name().to_string(),
            })),
            1 => Some(Box::new(VolumeCreateCommand {
                nodes: vec![address],
                volume: self.params.volume_name().to_string(),
            })),
            2 => Some(Box::new(ImagePullCommand {
                nodes: vec![address],
                name: ETCD_CONTAINER.to_string(),
            })),
            3 => Some(Box::new(AddEtcdMemberCommand {
                node: self.node.clone(),
                params: etcd_builtin_params(&self.node, &self.params),
                extra: self.params.params.clone(),
            })),
            4 => Some(Box::new(WaitEtcdSyncCommand {
                endpoints: vec![address],
            })),
            5 => Some(mark_member_command(vec![address])),
            _ => None,
        }
    }
}

/// Drops members that are no longer part of the declared cluster.
pub struct EtcdRemoveMemberOp {
    names: Vec<String>,
    ids: Vec<u64>,
    step: usize,
}

impl EtcdRemoveMemberOp {
    pub fn new(members: &[(String, u64)]) -> Self {
        EtcdRemoveMemberOp {
            names: members.iter().map(|(name, _)| name.clone()).collect(),
            ids: members.iter().map(|(_, id)| *id).collect(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for EtcdRemoveMemberOp {
    fn name(&self) -> &'static str {
        "etcd-remove-member"
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
            0 => Some(Box::new(RemoveEtcdMemberCommand {
                ids: self.ids.clone(),
            })),
            _ => None,
        }
    }
}

/// Removes members on declared worker nodes and scrubs their state.
pub struct EtcdDestroyMemberOp {
    reachable: Vec<String>,
    ids: Vec<u64>,
    volume: String,
    step: usize,
}

impl EtcdDestroyMemberOp {
    pub fn new(reachable: &[&Node], ids: &[u64], params: &EtcdParams) -> Self {
        EtcdDestroyMemberOp {
            reachable: reachable.iter().map(|n| n.address.clone()).collect(),
            ids: ids.to_vec(),
            volume: params.volume_name().to_string(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for EtcdDestroyMemberOp {
    fn name(&self) -> &'static str {
        "etcd-destroy-member"
    }

    fn targets(&self) -> Vec<String> {
        self.reachable.clone()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(RemoveEtcdMemberCommand {
                ids: self.ids.clone(),
            })),
            1 => Some(Box::new(StopContainersCommand {
                nodes: self.reachable.clone(),
                name: ETCD_CONTAINER.to_string(),
            })),
            2 => Some(Box::new(VolumeRemoveCommand {
                nodes: self.reachable.clone(),
                volume: self.volume.clone(),
            })),
            3 => Some(Box::new(RemoveFileCommand {
                nodes: self.reachable.clone(),
                path: ETCD_ADDED_MEMBER_FILE.to_string(),
            })),
            _ => None,
        }
    }
}

/// Writes the join marker on members that lost it.
pub struct EtcdMarkMemberOp {
    nodes: Vec<String>,
    step: usize,
}

impl EtcdMarkMemberOp {
    pub fn new(nodes: &[&Node]) -> Self {
        EtcdMarkMemberOp {
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for EtcdMarkMemberOp {
    fn name(&self) -> &'static str {
        "etcd-mark-member"
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
            0 => Some(mark_member_command(self.nodes.clone())),
            _ => None,
        }
    }
}

/// Restarts one outdated member and waits for the cluster to settle.
pub struct EtcdRestartOp {
    node: Node,
    params: EtcdParams,
    step: usize,
}

impl EtcdRestartOp {
    pub fn new(node: &Node, params: &EtcdParams) -> Self {
        EtcdRestartOp {
            node: node.clone(),
            params: params.clone(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for EtcdRestartOp {
    fn name(&self) -> &'static str {
        "etcd-restart"
    }

    fn targets(&self) -> Vec<String> {
        vec![self.node.address.clone()]
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let address = self.node.address.clone();
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(ImagePullCommand {
                nodes: vec![address],
                name: ETCD_CONTAINER.to_string(),
            })),
            1 => Some(Box::new(StopContainersCommand {
                nodes: vec![address],
                name: ETCD_CONTAINER.to_string(),
            })),
            2 => Some(Box::new(RunEtcdCommand {
                nodes: vec![address],
                params: vec![etcd_builtin_params(&self.node, &self.params)],
                init_args: Vec::new(),
                extra: self.params.params.clone(),
            })),
            3 => Some(Box::new(WaitEtcdSyncCommand {
                endpoints: vec![self.node.address.clone()],
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(address: &str) -> Node {
        Node {
            address: address.to_string(),
            user: "op".to_string(),
            control_plane: true,
            ..Default::default()
        }
    }

    #[test]
    fn builtin_params_are_join_independent() {
        let node = cp("10.0.0.1");
        let params = EtcdParams::default();
        let generated = etcd_builtin_params(&node, &params);
        assert!(generated
            .extra_args
            .iter()
            .all(|arg| !arg.starts_with("--initial-cluster=")));
        assert!(generated
            .extra_args
            .contains(&"--name=10.0.0.1".to_string()));
        assert_eq!(generated.extra_binds[0].destination, ETCD_DATA_DIR);
    }

    #[test]
    fn boot_op_runs_full_sequence() {
        let n1 = cp("10.0.0.1");
        let n2 = cp("10.0.0.2");
        let mut op = EtcdBootOp::new(&[&n1, &n2], &EtcdParams::default());

        let names: Vec<String> = std::iter::from_fn(|| op.next_command())
            .map(|c| c.command().name)
            .collect();
        assert_eq!(
            names,
            vec![
                "image-pull",
                "volume-create",
                "run-container",
                "wait-etcd-sync",
                "mark-etcd-member",
            ]
        );
    }

    #[test]
    fn add_member_targets_one_node() {
        let node = cp("10.0.0.3");
        let mut op = EtcdAddMemberOp::new(&node, &EtcdParams::default());
        assert_eq!(op.targets(), vec!["10.0.0.3"]);

        let names: Vec<String> = std::iter::from_fn(|| op.next_command())
            .map(|c| c.command().name)
            .collect();
        assert_eq!(
            names,
            vec![
                "volume-remove",
                "volume-create",
                "image-pull",
                "add-etcd-member",
                "wait-etcd-sync",
                "mark-etcd-member",
            ]
        );
    }

    #[test]
    fn initial_cluster_args_name_every_member() {
        let args = initial_cluster_args(
            &[
                ("10.0.0.1".to_string(), "http://10.0.0.1:2380".to_string()),
                ("10.0.0.2".to_string(), "http://10.0.0.2:2380".to_string()),
            ],
            "new",
        );
        assert_eq!(
            args[0],
            "--initial-cluster=10.0.0.1=http://10.0.0.1:2380,10.0.0.2=http://10.0.0.2:2380"
        );
        assert_eq!(args[1], "--initial-cluster-state=new");
    }
}
