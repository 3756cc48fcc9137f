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

use crate::helmsman::cluster::status::ResourceStatus;

use serde::{Deserialize, Serialize};

/// Annotation recording the applied revision of a managed resource.
pub const REVISION_ANNOTATION: &str = "cke.cybozu.com/revision";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Namespace,
    ServiceAccount,
    ConfigMap,
    Service,
    PodSecurityPolicy,
    NetworkPolicy,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    Deployment,
    DaemonSet,
    CronJob,
    PodDisruptionBudget,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Service => "Service",
            ResourceKind::PodSecurityPolicy => "PodSecurityPolicy",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::CronJob => "CronJob",
            ResourceKind::PodDisruptionBudget => "PodDisruptionBudget",
        }
    }
}

/// A resource the engine applies to the cluster, either shipped with the
/// engine (static) or supplied by the administrator (ranked).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub kind: ResourceKind,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub rank: u32,
    pub manifest: Vec<u8>,
    #[serde(default)]
    pub revision: u64,
}

impl ResourceDefinition {
    /// Key under which the apply status of this resource is tracked.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.kind.as_str(), self.name)
        } else {
            format!("{}/{}/{}", self.kind.as_str(), self.namespace, self.name)
        }
    }

    /// True when the tracked revision differs from this definition.
    pub fn need_update(&self, status: &ResourceStatus) -> bool {
        match status.annotations.get(REVISION_ANNOTATION) {
            Some(revision) => revision != &self.revision.to_string(),
            None => true,
        }
    }
}

/// Orders user resources for application: rank first, then key for a
/// deterministic order inside a rank.
pub fn sort_resources(resources: &mut [ResourceDefinition]) {
    resources.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.key().cmp(&b.key())));
}

fn manifest(value: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&value).expect("static manifest must serialize")
}

/// Resources shipped with the engine, applied before any user resource in
/// the declared order.
pub fn static_resources() -> Vec<ResourceDefinition> {
    vec![
        ResourceDefinition {
            kind: ResourceKind::ServiceAccount,
            namespace: "kube-system".to_string(),
            name: "cluster-dns".to_string(),
            rank: 0,
            revision: 1,
            manifest: manifest(serde_json::json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": {
                    "name": "cluster-dns",
                    "namespace": "kube-system",
                    "annotations": { (REVISION_ANNOTATION): "1" },
                },
            })),
        },
        ResourceDefinition {
            kind: ResourceKind::ClusterRoleBinding,
            namespace: String::new(),
            name: "system:cluster-dns".to_string(),
            rank: 0,
            revision: 1,
            manifest: manifest(serde_json::json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRoleBinding",
                "metadata": {
                    "name": "system:cluster-dns",
                    "annotations": { (REVISION_ANNOTATION): "1" },
                },
                "roleRef": {
                    "apiGroup": "rbac.authorization.k8s.io",
                    "kind": "ClusterRole",
                    "name": "system:kube-dns",
                },
                "subjects": [{
                    "kind": "ServiceAccount",
                    "name": "cluster-dns",
                    "namespace": "kube-system",
                }],
            })),
        },
        ResourceDefinition {
            kind: ResourceKind::Service,
            namespace: "kube-system".to_string(),
            name: "cluster-dns".to_string(),
            rank: 0,
            revision: 1,
            manifest: manifest(serde_json::json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {
                    "name": "cluster-dns",
                    "namespace": "kube-system",
                    "labels": { "k8s-app": "cluster-dns" },
                    "annotations": { (REVISION_ANNOTATION): "1" },
                },
                "spec": {
                    "selector": { "k8s-app": "cluster-dns" },
                    "ports": [
                        { "name": "dns", "port": 53, "protocol": "UDP" },
                        { "name": "dns-tcp", "port": 53, "protocol": "TCP" },
                    ],
                },
            })),
        },
        ResourceDefinition {
            kind: ResourceKind::Deployment,
            namespace: "kube-system".to_string(),
            name: "cluster-dns".to_string(),
            rank: 0,
            revision: 1,
            manifest: manifest(serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {
                    "name": "cluster-dns",
                    "namespace": "kube-system",
                    "annotations": { (REVISION_ANNOTATION): "1" },
                },
                "spec": {
                    "replicas": 2,
                    "selector": { "matchLabels": { "k8s-app": "cluster-dns" } },
                    "template": {
                        "metadata": { "labels": { "k8s-app": "cluster-dns" } },
                        "spec": {
                            "serviceAccountName": "cluster-dns",
                            "containers": [{
                                "name": "coredns",
                                "image": "quay.io/helmsman/coredns:1.11.1",
                                "args": ["-conf", "/etc/coredns/Corefile"],
                                "volumeMounts": [{
                                    "name": "config-volume",
                                    "mountPath": "/etc/coredns",
                                    "readOnly": true,
                                }],
                            }],
                            "volumes": [{
                                "name": "config-volume",
                                "configMap": { "name": "cluster-dns" },
                            }],
                        },
                    },
                },
            })),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn definition(rank: u32, kind: ResourceKind, name: &str) -> ResourceDefinition {
        ResourceDefinition {
            kind,
            namespace: "default".to_string(),
            name: name.to_string(),
            rank,
            manifest: b"{}".to_vec(),
            revision: 3,
        }
    }

    #[test]
    fn need_update_tracks_revision_annotation() {
        let res = definition(10, ResourceKind::ConfigMap, "settings");

        let missing = ResourceStatus::default();
        assert!(res.need_update(&missing));

        let mut annotations = HashMap::new();
        annotations.insert(REVISION_ANNOTATION.to_string(), "3".to_string());
        let current = ResourceStatus {
            annotations,
            ..Default::default()
        };
        assert!(!res.need_update(&current));

        let mut stale = current.clone();
        stale
            .annotations
            .insert(REVISION_ANNOTATION.to_string(), "2".to_string());
        assert!(res.need_update(&stale));
    }

    #[test]
    fn sort_orders_by_rank_then_key() {
        let mut resources = vec![
            definition(20, ResourceKind::Deployment, "b"),
            definition(10, ResourceKind::ConfigMap, "z"),
            definition(10, ResourceKind::ConfigMap, "a"),
        ];
        sort_resources(&mut resources);
        assert_eq!(resources[0].name, "a");
        assert_eq!(resources[1].name, "z");
        assert_eq!(resources[2].name, "b");
    }

    #[test]
    fn static_resources_parse_and_carry_revisions() {
        for res in static_resources() {
            let value: serde_json::Value =
                serde_json::from_slice(&res.manifest).expect("manifest is JSON");
            assert_eq!(
                value.pointer("/metadata/name").and_then(|v| v.as_str()),
                Some(res.name.as_str())
            );
            assert!(res.revision > 0);
        }
    }
}
