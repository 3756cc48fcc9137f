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

use crate::helmsman::cluster::Node;
use crate::helmsman::k8s::ConfigMap;
use crate::helmsman::op::{
    CommandSpec, Commander, OpContext, Operator, CLUSTER_DNS_CONFIGMAP, SYSTEM_NAMESPACE,
};
use crate::helmsman::util::DynError;

use async_trait::async_trait;

/// Renders the CoreDNS configuration for the in-cluster resolver.
pub fn config_map(cluster_domain: &str, dns_servers: &[String]) -> ConfigMap {
    let mut corefile = format!(
        ".:1053 {{
    errors
    health
    kubernetes {cluster_domain} in-addr.arpa ip6.arpa {{
        pods verified
        fallthrough in-addr.arpa ip6.arpa
    }}
    prometheus :9153
"
    );
    if !dns_servers.is_empty() {
        corefile.push_str(&format!("    forward . {}\n", dns_servers.join(" ")));
    }
    corefile.push_str(
        "    cache 30
    loop
    reload
    loadbalance
}
",
    );
    ConfigMap::new(SYSTEM_NAMESPACE, CLUSTER_DNS_CONFIGMAP).with_entry("Corefile", corefile)
}

/// Shared create-or-update operator for the DNS ConfigMaps.
pub(crate) struct ApplyConfigMapOp {
    pub op_name: &'static str,
    pub api_server: Node,
    pub config_map: ConfigMap,
    pub create: bool,
    pub step: usize,
}

struct ApplyConfigMapCommand {
    api_server: Node,
    config_map: ConfigMap,
    create: bool,
}

#[async_trait]
impl Commander for ApplyConfigMapCommand {
    fn command(&self) -> CommandSpec {
        let name = if self.create {
            "create-configmap"
        } else {
            "update-configmap"
        };
        CommandSpec::new(
            name,
            self.config_map.metadata.name.as_deref().unwrap_or_default(),
            "",
        )
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let client = ctx.inf.kube_client(&self.api_server)?;
        if self.create {
            client.create_config_map(&self.config_map).await
        } else {
            client.update_config_map(&self.config_map).await
        }
    }
}

#[async_trait]
impl Operator for ApplyConfigMapOp {
    fn name(&self) -> &'static str {
        self.op_name
    }

    fn targets(&self) -> Vec<String> {
        vec![self
            .config_map
            .metadata
            .name
            .clone()
            .unwrap_or_default()]
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(ApplyConfigMapCommand {
                api_server: self.api_server.clone(),
                config_map: self.config_map.clone(),
                create: self.create,
            })),
            _ => None,
        }
    }
}

pub fn create_config_map_op(
    api_server: &Node,
    cluster_domain: &str,
    dns_servers: &[String],
) -> Box<dyn Operator> {
    Box::new(ApplyConfigMapOp {
        op_name: "create-cluster-dns-configmap",
        api_server: api_server.clone(),
        config_map: config_map(cluster_domain, dns_servers),
        create: true,
        step: 0,
    })
}

pub fn update_config_map_op(api_server: &Node, config_map: ConfigMap) -> Box<dyn Operator> {
    Box::new(ApplyConfigMapOp {
        op_name: "update-cluster-dns-configmap",
        api_server: api_server.clone(),
        config_map,
        create: false,
        step: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corefile_names_domain_and_forwarders() {
        let cm = config_map("cluster.local", &["8.8.8.8".to_string(), "1.1.1.1".to_string()]);
        let corefile = cm.data.get("Corefile").expect("Corefile entry");
        assert!(corefile.contains("kubernetes cluster.local in-addr.arpa ip6.arpa"));
        assert!(corefile.contains("forward . 8.8.8.8 1.1.1.1"));
    }

    #[test]
    fn corefile_omits_forward_without_servers() {
        let cm = config_map("cluster.local", &[]);
        let corefile = cm.data.get("Corefile").expect("Corefile entry");
        assert!(!corefile.contains("forward ."));
    }
}
