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

use crate::helmsman::agent::Agent;
use crate::helmsman::cluster::{Node, Reboot};
use crate::helmsman::logger::{log_info, log_warn};
use crate::helmsman::observability::metrics;
use crate::helmsman::op::{CommandSpec, Commander, OpContext, Operator, REBOOT_ANNOTATION};
use crate::helmsman::reboot::{RebootQueueEntry, RebootStatus};
use crate::helmsman::util::DynError;

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

const COMPONENT: &str = "reboot";

fn entry_nodes(entries: &[RebootQueueEntry]) -> Vec<String> {
    entries.iter().map(|e| e.node.clone()).collect()
}

/// Moves queued entries into draining: marks them, cordons their nodes, and
/// evicts every pod that may be evicted.
pub struct RebootDrainStartOp {
    api_server: Node,
    entries: Vec<RebootQueueEntry>,
    reboot: Reboot,
    retry_times: usize,
    retry_interval: Duration,
    step: usize,
}

impl RebootDrainStartOp {
    pub fn new(
        api_server: &Node,
        entries: &[RebootQueueEntry],
        reboot: &Reboot,
        retry_times: usize,
        retry_interval: Duration,
    ) -> Self {
        RebootDrainStartOp {
            api_server: api_server.clone(),
            entries: entries.to_vec(),
            reboot: reboot.clone(),
            retry_times,
            retry_interval,
            step: 0,
        }
    }
}

struct MarkEntriesCommand {
    entries: Vec<RebootQueueEntry>,
    status: RebootStatus,
}

#[async_trait]
impl Commander for MarkEntriesCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new(
            "update-reboot-queue",
            &entry_nodes(&self.entries).join(","),
            self.status.as_str(),
        )
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let storage = ctx.inf.storage();
        let now = Utc::now();
        for entry in &self.entries {
            let mut entry = entry.clone();
            entry.transition(self.status, now);
            storage
                .update_reboot_entry(ctx.inf.leader_key(), &entry)
                .await?;
        }
        Ok(())
    }
}

struct CordonCommand {
    api_server: Node,
    nodes: Vec<String>,
    unschedulable: bool,
}

#[async_trait]
impl Commander for CordonCommand {
    fn command(&self) -> CommandSpec {
        let name = if self.unschedulable { "cordon" } else { "uncordon" };
        CommandSpec::new(name, &self.nodes.join(","), "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let client = ctx.inf.kube_client(&self.api_server)?;
        for node in &self.nodes {
            let annotations: [(&str, Option<&str>); 1] = if self.unschedulable {
                [(REBOOT_ANNOTATION, Some("true"))]
            } else {
                [(REBOOT_ANNOTATION, None)]
            };
            client
                .set_unschedulable(node, self.unschedulable, &annotations)
                .await?;
        }
        Ok(())
    }
}

struct EvictPodsCommand {
    api_server: Node,
    nodes: Vec<String>,
    protected_namespaces: Vec<String>,
    retry_times: usize,
    retry_interval: Duration,
}

#[async_trait]
impl Commander for EvictPodsCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("evict-pods", &self.nodes.join(","), "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let client = ctx.inf.kube_client(&self.api_server)?;
        for node in &self.nodes {
            let pods = client.list_node_pods(node).await?;
            for pod in pods {
                if pod.is_daemonset_managed() || pod.is_mirror() {
                    continue;
                }
                let namespace = pod.namespace().to_string();
                if self.protected_namespaces.contains(&namespace) {
                    continue;
                }
                let name = pod.name().to_string();
                let mut attempt = 0;
                loop {
                    if ctx.cancel.is_cancelled() {
                        return Err(crate::helmsman::util::new_error("cancelled during drain"));
                    }
                    match client.evict_pod(&namespace, &name).await {
                        Ok(()) => break,
                        Err(err) if attempt < self.retry_times => {
                            attempt += 1;
                            log_warn(
                                COMPONENT,
                                "eviction retry",
                                &[
                                    ("pod", &format!("{namespace}/{name}")),
                                    ("error", &err.to_string()),
                                ],
                            );
                            tokio::time::sleep(self.retry_interval).await;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for RebootDrainStartOp {
    fn name(&self) -> &'static str {
        "reboot-drain-start"
    }

    fn targets(&self) -> Vec<String> {
        entry_nodes(&self.entries)
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(MarkEntriesCommand {
                entries: self.entries.clone(),
                status: RebootStatus::Draining,
            })),
            1 => Some(Box::new(CordonCommand {
                api_server: self.api_server.clone(),
                nodes: entry_nodes(&self.entries),
                unschedulable: true,
            })),
            2 => Some(Box::new(EvictPodsCommand {
                api_server: self.api_server.clone(),
                nodes: entry_nodes(&self.entries),
                protected_namespaces: self.reboot.protected_namespaces.clone(),
                retry_times: self.retry_times,
                retry_interval: self.retry_interval,
            })),
            _ => None,
        }
    }
}

/// Reboots drained nodes with the configured command.
pub struct RebootRebootOp {
    entries: Vec<RebootQueueEntry>,
    reboot: Reboot,
    step: usize,
}

impl RebootRebootOp {
    pub fn new(entries: &[RebootQueueEntry], reboot: &Reboot) -> Self {
        RebootRebootOp {
            entries: entries.to_vec(),
            reboot: reboot.clone(),
            step: 0,
        }
    }
}

struct RebootCommand {
    nodes: Vec<String>,
    reboot_command: Vec<String>,
    command_timeout: Duration,
}

#[async_trait]
impl Commander for RebootCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("reboot", &self.nodes.join(","), &self.reboot_command.join(" "))
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let cmdline = self.reboot_command.join(" ");
        for node in &self.nodes {
            let agent = ctx.inf.agent(node)?;
            // The host may cut the connection mid-command; that is what a
            // reboot looks like from here.
            match tokio::time::timeout(self.command_timeout, agent.run(&cmdline)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => log_info(
                    COMPONENT,
                    "reboot command ended with error",
                    &[("node", node.as_str()), ("error", &err.to_string())],
                ),
                Err(_) => log_warn(
                    COMPONENT,
                    "reboot command timed out",
                    &[("node", node.as_str())],
                ),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for RebootRebootOp {
    fn name(&self) -> &'static str {
        "reboot-reboot"
    }

    fn targets(&self) -> Vec<String> {
        entry_nodes(&self.entries)
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(MarkEntriesCommand {
                entries: self.entries.clone(),
                status: RebootStatus::Rebooting,
            })),
            1 => Some(Box::new(RebootCommand {
                nodes: entry_nodes(&self.entries),
                reboot_command: self.reboot.reboot_command.clone(),
                command_timeout: self.reboot.command_timeout,
            })),
            _ => None,
        }
    }
}

/// Marks entries whose drain exceeded the eviction timeout.
pub struct RebootDrainTimeoutOp {
    entries: Vec<RebootQueueEntry>,
    step: usize,
}

impl RebootDrainTimeoutOp {
    pub fn new(entries: &[RebootQueueEntry]) -> Self {
        RebootDrainTimeoutOp {
            entries: entries.to_vec(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for RebootDrainTimeoutOp {
    fn name(&self) -> &'static str {
        "reboot-drain-timeout"
    }

    fn targets(&self) -> Vec<String> {
        entry_nodes(&self.entries)
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(MarkEntriesCommand {
                entries: self.entries.clone(),
                status: RebootStatus::DrainTimedout,
            })),
            _ => None,
        }
    }
}

/// Removes finished and cancelled entries from the queue.
pub struct RebootDequeueOp {
    entries: Vec<RebootQueueEntry>,
    step: usize,
}

impl RebootDequeueOp {
    pub fn new(entries: &[RebootQueueEntry]) -> Self {
        RebootDequeueOp {
            entries: entries.to_vec(),
            step: 0,
        }
    }
}

struct DequeueCommand {
    entries: Vec<RebootQueueEntry>,
}

#[async_trait]
impl Commander for DequeueCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("dequeue-reboot-entries", &entry_nodes(&self.entries).join(","), "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let storage = ctx.inf.storage();
        for entry in &self.entries {
            storage
                .delete_reboot_entry(ctx.inf.leader_key(), entry.index)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for RebootDequeueOp {
    fn name(&self) -> &'static str {
        "reboot-dequeue"
    }

    fn targets(&self) -> Vec<String> {
        entry_nodes(&self.entries)
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(DequeueCommand {
                entries: self.entries.clone(),
            })),
            _ => None,
        }
    }
}

/// Clears the scheduling block from nodes the engine cordoned earlier.
pub struct RebootUncordonOp {
    api_server: Node,
    nodes: Vec<String>,
    step: usize,
}

impl RebootUncordonOp {
    pub fn new(api_server: &Node, nodes: Vec<String>) -> Self {
        RebootUncordonOp {
            api_server: api_server.clone(),
            nodes,
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for RebootUncordonOp {
    fn name(&self) -> &'static str {
        "reboot-uncordon"
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
            0 => Some(Box::new(CordonCommand {
                api_server: self.api_server.clone(),
                nodes: self.nodes.clone(),
                unschedulable: false,
            })),
            _ => None,
        }
    }
}

/// Refreshes the queue gauges after any queue mutation this tick.
pub struct RebootRecalcMetricsOp {
    step: usize,
}

impl RebootRecalcMetricsOp {
    pub fn new() -> Self {
        RebootRecalcMetricsOp { step: 0 }
    }
}

impl Default for RebootRecalcMetricsOp {
    fn default() -> Self {
        Self::new()
    }
}

struct RecalcMetricsCommand;

#[async_trait]
impl Commander for RecalcMetricsCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("recalc-reboot-metrics", "", "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let entries = ctx.inf.storage().reboot_queue_entries().await?;
        metrics::set_reboot_queue_gauges(&entries);
        Ok(())
    }
}

#[async_trait]
impl Operator for RebootRecalcMetricsOp {
    fn name(&self) -> &'static str {
        "reboot-recalc-metrics"
    }

    fn targets(&self) -> Vec<String> {
        Vec::new()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(RecalcMetricsCommand)),
            _ => None,
        }
    }
}
