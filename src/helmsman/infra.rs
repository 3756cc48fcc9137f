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
use crate::helmsman::cluster::Node;
use crate::helmsman::engine::{ContainerEngine, Docker};
use crate::helmsman::etcd::EtcdFacade;
use crate::helmsman::k8s::{KubeClient, KubeTls};
use crate::helmsman::store::Storage;
use crate::helmsman::util::{new_error, DynError};

use std::collections::HashMap;
use std::sync::Arc;

pub const API_SERVER_PORT: u16 = 6443;

/// Shared handles for one tick: per-node shells, typed clients, and the
/// store scoped to the current leadership.
pub struct Infrastructure {
    agents: HashMap<String, Arc<dyn Agent>>,
    kube_tls: Option<KubeTls>,
    etcd: Option<Arc<dyn EtcdFacade>>,
    storage: Storage,
    leader_key: String,
}

impl Infrastructure {
    pub fn new(
        agents: HashMap<String, Arc<dyn Agent>>,
        kube_tls: Option<KubeTls>,
        etcd: Option<Arc<dyn EtcdFacade>>,
        storage: Storage,
        leader_key: &str,
    ) -> Self {
        Infrastructure {
            agents,
            kube_tls,
            etcd,
            storage,
            leader_key: leader_key.to_string(),
        }
    }

    pub fn agent(&self, address: &str) -> Result<Arc<dyn Agent>, DynError> {
        self.agents
            .get(address)
            .cloned()
            .ok_or_else(|| new_error(format!("no agent for node {address}")))
    }

    pub fn has_agent(&self, address: &str) -> bool {
        self.agents.contains_key(address)
    }

    pub fn engine(&self, address: &str) -> Result<Box<dyn ContainerEngine>, DynError> {
        Ok(Box::new(Docker::new(self.agent(address)?)))
    }

    pub fn kube_client(&self, node: &Node) -> Result<KubeClient, DynError> {
        let tls = self
            .kube_tls
            .as_ref()
            .ok_or_else(|| new_error("kubernetes credentials are not configured"))?;
        KubeClient::new(&format!("https://{}:{}", node.address, API_SERVER_PORT), tls)
    }

    pub fn etcd(&self) -> Result<Arc<dyn EtcdFacade>, DynError> {
        self.etcd
            .clone()
            .ok_or_else(|| new_error("etcd facade is not configured"))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn leader_key(&self) -> &str {
        &self.leader_key
    }
}
