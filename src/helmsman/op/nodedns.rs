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
use crate::helmsman::op::clusterdns::ApplyConfigMapOp;
use crate::helmsman::op::{Operator, NODE_DNS_CONFIGMAP, SYSTEM_NAMESPACE};

/// Renders the unbound configuration for the per-node caching resolver.
///
/// Cluster names resolve through the cluster DNS service; everything else
/// goes straight to the upstream servers.
pub fn config_map(
    cluster_dns_ip: &str,
    cluster_domain: &str,
    dns_servers: &[String],
) -> ConfigMap {
    let mut conf = String::from(
        "server:
  interface: 0.0.0.0
  interface-automatic: yes
  access-control: 0.0.0.0/0 allow
  chroot: \"\"
  username: \"\"
  directory: \"/etc/unbound\"
  do-daemonize: no
  cache-max-negative-ttl: 30
",
    );
    conf.push_str(&format!(
        "stub-zone:
  name: \"{cluster_domain}\"
  stub-addr: {cluster_dns_ip}
"
    ));
    conf.push_str(&format!(
        "stub-zone:
  name: \"in-addr.arpa.\"
  stub-addr: {cluster_dns_ip}
"
    ));
    if !dns_servers.is_empty() {
        conf.push_str("forward-zone:\n  name: \".\"\n");
        for server in dns_servers {
            conf.push_str(&format!("  forward-addr: {server}\n"));
        }
    }
    ConfigMap::new(SYSTEM_NAMESPACE, NODE_DNS_CONFIGMAP).with_entry("unbound.conf", conf)
}

pub fn create_config_map_op(
    api_server: &Node,
    cluster_dns_ip: &str,
    cluster_domain: &str,
    dns_servers: &[String],
) -> Box<dyn Operator> {
    Box::new(ApplyConfigMapOp {
        op_name: "create-node-dns-configmap",
        api_server: api_server.clone(),
        config_map: config_map(cluster_dns_ip, cluster_domain, dns_servers),
        create: true,
        step: 0,
    })
}

pub fn update_config_map_op(api_server: &Node, config_map: ConfigMap) -> Box<dyn Operator> {
    Box::new(ApplyConfigMapOp {
        op_name: "update-node-dns-configmap",
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
    fn unbound_conf_stubs_cluster_zone() {
        let cm = config_map("10.68.0.10", "cluster.local", &["8.8.8.8".to_string()]);
        let conf = cm.data.get("unbound.conf").expect("unbound.conf entry");
        assert!(conf.contains("name: \"cluster.local\""));
        assert!(conf.contains("stub-addr: 10.68.0.10"));
        assert!(conf.contains("forward-addr: 8.8.8.8"));
    }
}
