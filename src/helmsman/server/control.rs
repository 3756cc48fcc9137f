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

use crate::helmsman::agent::{Agent, SshAgent};
use crate::helmsman::cluster::status::ClusterStatus;
use crate::helmsman::cluster::{Cluster, Node};
use crate::helmsman::config::Config;
use crate::helmsman::etcd::{EtcdFacade, HttpEtcd};
use crate::helmsman::infra::Infrastructure;
use crate::helmsman::k8s::{KubeClient, KubeTls};
use crate::helmsman::logger::{log_error, log_info, log_warn};
use crate::helmsman::observability::metrics;
use crate::helmsman::observer::aggregate::get_cluster_status;
use crate::helmsman::op::{Commander, OpContext, Operator, Phase};
use crate::helmsman::reboot::{compute_buckets, QueueObservation, RebootQueueEntry, RebootStatus};
use crate::helmsman::server::strategy::{decide_ops, DecideConfig};
use crate::helmsman::store::{KvStore, Record, Storage};
use crate::helmsman::util::{is_lost_leadership, DynError};

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "control";
const PER_HOST_TIMEOUT: Duration = Duration::from_secs(20);

pub type AgentFactory = Box<dyn Fn(&Node) -> Arc<dyn Agent> + Send + Sync>;
pub type EtcdFactory =
    Box<dyn Fn(&[String]) -> Result<Arc<dyn EtcdFacade>, DynError> + Send + Sync>;

/// The leader-elected control loop.
///
/// Exactly one controller per cluster makes decisions at a time; the rest
/// block in the campaign until the leadership changes hands.
pub struct Controller {
    storage: Storage,
    config: Config,
    kube_tls: Option<KubeTls>,
    agent_factory: AgentFactory,
    etcd_factory: EtcdFactory,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(
        storage: Storage,
        config: Config,
        kube_tls: Option<KubeTls>,
        cancel: CancellationToken,
    ) -> Self {
        Controller {
            storage,
            config,
            kube_tls,
            agent_factory: Box::new(|node: &Node| -> Arc<dyn Agent> {
                Arc::new(SshAgent::new(&node.user, &node.address))
            }),
            etcd_factory: Box::new(
                |addresses: &[String]| -> Result<Arc<dyn EtcdFacade>, DynError> {
                    Ok(Arc::new(HttpEtcd::new(addresses)?))
                },
            ),
            cancel,
        }
    }

    pub fn with_factories(mut self, agents: AgentFactory, etcd: EtcdFactory) -> Self {
        self.agent_factory = agents;
        self.etcd_factory = etcd;
        self
    }

    /// Campaigns, runs the decision loop, and campaigns again after losing
    /// the leadership. Returns only on cancellation or a fatal error.
    pub async fn run(&self) -> Result<(), DynError> {
        let hostname = hostname();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let leader_key = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.storage.kv().campaign(&hostname) => result?,
            };
            log_info(COMPONENT, "won the leadership", &[("leader_key", &leader_key)]);
            metrics::set_leader(true);

            let result = self.run_loop(&leader_key).await;
            metrics::set_leader(false);
            self.storage.kv().resign(&leader_key).await?;

            match result {
                Err(err) if is_lost_leadership(&err) => {
                    log_warn(COMPONENT, "lost the leadership", &[]);
                    continue;
                }
                other => return other,
            }
        }
    }

    async fn run_loop(&self, leader_key: &str) -> Result<(), DynError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let start = Instant::now();
            let had_ops = self.run_once(leader_key).await?;
            metrics::observe_tick(start.elapsed(), if had_ops { "ops" } else { "idle" });

            if !had_ops {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }
    }

    /// One tick: observe, decide, and execute. Returns whether operations
    /// ran; the caller sleeps when they did not.
    async fn run_once(&self, leader_key: &str) -> Result<bool, DynError> {
        let Some(cluster) = self.storage.get_cluster().await? else {
            log_info(COMPONENT, "no cluster is declared yet", &[]);
            return Ok(false);
        };
        if let Err(err) = cluster.validate() {
            log_error(
                COMPONENT,
                "declared cluster is invalid",
                &[("error", &err.to_string())],
            );
            return Ok(false);
        }
        let constraints = self.storage.get_constraints().await?;
        if let Err(err) = constraints.check(&cluster) {
            log_warn(
                COMPONENT,
                "cluster violates constraints",
                &[("error", &err.to_string())],
            );
        }

        let resources = self.storage.list_resources().await?;
        let config_version = self.storage.get_config_version().await?;

        let agents: HashMap<String, Arc<dyn Agent>> = cluster
            .nodes
            .iter()
            .map(|node| (node.address.clone(), (self.agent_factory)(node)))
            .collect();
        let cp_addresses: Vec<String> = cluster
            .nodes
            .iter()
            .filter(|n| n.control_plane)
            .map(|n| n.address.clone())
            .collect();
        let etcd = (self.etcd_factory)(&cp_addresses)?;

        let status = get_cluster_status(
            &cluster,
            &agents,
            &etcd,
            self.kube_tls.as_ref(),
            &resources,
            config_version,
            PER_HOST_TIMEOUT,
        )
        .await;

        let entries = self.storage.reboot_queue_entries().await?;
        let observation = self
            .queue_observation(&cluster, &status, &entries, &agents)
            .await;
        let reboot_args = compute_buckets(
            &entries,
            Utc::now(),
            cluster.reboot.eviction_timeout,
            &observation,
        );

        let decide_config = DecideConfig {
            max_concurrent_updates: self.config.max_concurrent_updates,
            drain_retry_times: self.config.drain_retry_times,
            drain_retry_interval: self.config.drain_retry_interval,
        };
        let (ops, phase) = decide_ops(
            &cluster,
            &status,
            &constraints,
            &resources,
            &reboot_args,
            &decide_config,
        );
        metrics::set_phase(phase);
        log_info(
            COMPONENT,
            "decided operations",
            &[("phase", phase.as_str()), ("count", &ops.len().to_string())],
        );

        if ops.is_empty() {
            return Ok(false);
        }

        let infra = Arc::new(Infrastructure::new(
            agents,
            self.kube_tls.clone(),
            Some(etcd),
            self.storage.clone(),
            leader_key,
        ));

        for op in ops {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            if !self.run_operator(op, &infra, phase, leader_key).await? {
                // The record has the failure; the next tick starts fresh.
                break;
            }
        }
        Ok(true)
    }

    /// Bucket inputs the queue manager cannot derive from timestamps alone.
    async fn queue_observation(
        &self,
        cluster: &Cluster,
        status: &ClusterStatus,
        entries: &[RebootQueueEntry],
        agents: &HashMap<String, Arc<dyn Agent>>,
    ) -> QueueObservation {
        let mut observation = QueueObservation::default();

        let api_server = cluster.nodes.iter().find(|n| {
            n.control_plane
                && status
                    .node_status(&n.address)
                    .map(|ns| ns.api_server.service.running && ns.api_server.is_healthy)
                    .unwrap_or(false)
        });
        let client = match (api_server, self.kube_tls.as_ref()) {
            (Some(node), Some(tls)) => KubeClient::new(
                &format!(
                    "https://{}:{}",
                    node.address,
                    crate::helmsman::infra::API_SERVER_PORT
                ),
                tls,
            )
            .ok(),
            _ => None,
        };

        for entry in entries {
            match entry.status {
                RebootStatus::Draining => {
                    let Some(client) = &client else { continue };
                    if let Ok(pods) = client.list_node_pods(&entry.node).await {
                        let remaining = pods.iter().any(|pod| {
                            !pod.is_daemonset_managed()
                                && !pod.is_mirror()
                                && !cluster
                                    .reboot
                                    .protected_namespaces
                                    .contains(&pod.namespace().to_string())
                        });
                        if !remaining {
                            observation.drained_nodes.insert(entry.node.clone());
                        }
                    }
                }
                RebootStatus::Rebooting => {
                    if self
                        .boot_check(cluster, &entry.node, status, agents)
                        .await
                    {
                        observation.booted_nodes.insert(entry.node.clone());
                    }
                }
                _ => {}
            }
        }
        observation
    }

    async fn boot_check(
        &self,
        cluster: &Cluster,
        node: &str,
        status: &ClusterStatus,
        agents: &HashMap<String, Arc<dyn Agent>>,
    ) -> bool {
        if cluster.reboot.boot_check_command.is_empty() {
            return false;
        }
        let Some(agent) = agents.get(node) else {
            return false;
        };
        let cmdline = cluster.reboot.boot_check_command.join(" ");
        let checked = matches!(
            tokio::time::timeout(cluster.reboot.command_timeout, agent.run(&cmdline)).await,
            Ok(Ok(_))
        );
        if !checked {
            return false;
        }
        status
            .kubernetes
            .nodes
            .iter()
            .any(|k| k.name() == node && k.is_ready())
    }

    /// Steps one operator through its commanders, recording progress.
    ///
    /// Returns `Ok(false)` when the operator failed and the tick must stop;
    /// leadership loss is the only error propagated.
    async fn run_operator(
        &self,
        mut op: Box<dyn Operator>,
        infra: &Arc<Infrastructure>,
        phase: Phase,
        leader_key: &str,
    ) -> Result<bool, DynError> {
        let id = self.storage.next_record_id().await?;
        let mut record = Record::new(id, op.name(), phase, op.targets(), leader_key);
        self.storage.register_record(leader_key, &record).await?;
        log_info(
            COMPONENT,
            "operation started",
            &[
                ("name", op.name()),
                ("record", &id.to_string()),
                ("targets", &record.targets.join(",")),
            ],
        );

        let ctx = OpContext::new(infra.clone(), self.cancel.clone());

        if let Err(err) = op.cleanup(&ctx).await {
            if is_lost_leadership(&err) {
                return Err(err);
            }
            record.set_error(&err);
            self.storage.update_record(leader_key, &record).await?;
            metrics::observe_record_status(record.status.as_str());
            log_error(
                COMPONENT,
                "operation cleanup failed",
                &[("name", op.name()), ("error", &err.to_string())],
            );
            return Ok(false);
        }

        while let Some(commander) = op.next_command() {
            record.set_command(commander.command());
            self.storage.update_record(leader_key, &record).await?;

            match commander.run(&ctx).await {
                Ok(()) => {}
                Err(err) => {
                    if is_lost_leadership(&err) {
                        return Err(err);
                    }
                    record.set_error(&err);
                    self.storage.update_record(leader_key, &record).await?;
                    metrics::observe_record_status(record.status.as_str());
                    log_error(
                        COMPONENT,
                        "operation failed",
                        &[
                            ("name", op.name()),
                            ("command", &record.command.name),
                            ("error", &err.to_string()),
                        ],
                    );
                    return Ok(false);
                }
            }
        }

        record.complete();
        self.storage.update_record(leader_key, &record).await?;
        metrics::observe_record_status(record.status.as_str());
        log_info(
            COMPONENT,
            "operation completed",
            &[("name", op.name()), ("record", &id.to_string())],
        );
        Ok(true)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .map(|name| name.trim().to_string())
                .ok()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "helmsman".to_string())
        })
}
