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

use crate::helmsman::k8s::{ConfigMap, EndpointSlice, Endpoints, Node, Pod, Service};
use crate::helmsman::util::{new_error, with_context, DynError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FIELD_MANAGER: &str = "helmsman";

/// TLS material for an authenticated API server connection.
#[derive(Clone)]
pub struct KubeTls {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// A thin typed facade over one API server.
#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

impl KubeClient {
    pub fn new(server: &str, tls: &KubeTls) -> Result<KubeClient, DynError> {
        let ca = reqwest::Certificate::from_pem(&tls.ca_pem)
            .map_err(|err| with_context(err, "invalid kubernetes CA certificate"))?;
        let identity = reqwest::Identity::from_pkcs8_pem(&tls.cert_pem, &tls.key_pem)
            .map_err(|err| with_context(err, "invalid kubernetes client certificate"))?;
        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| with_context(err, "failed to build kubernetes http client"))?;
        Ok(KubeClient {
            http,
            base: server.trim_end_matches('/').to_string(),
        })
    }

    pub fn server(&self) -> &str {
        &self.base
    }

    /// True when the API server answers its readiness probe.
    pub async fn is_ready(&self) -> bool {
        let url = format!("{}/readyz", self.base);
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, DynError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| with_context(err, format!("GET {path}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "GET", path).await?;
        let value = response
            .json::<T>()
            .await
            .map_err(|err| with_context(err, format!("decoding GET {path}")))?;
        Ok(Some(value))
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, DynError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| with_context(err, format!("GET {path}")))?;
        let response = check_status(response, "GET", path).await?;
        let list = response
            .json::<ListResponse<T>>()
            .await
            .map_err(|err| with_context(err, format!("decoding GET {path}")))?;
        Ok(list.items)
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), DynError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| with_context(err, format!("POST {path}")))?;
        check_status(response, "POST", path).await?;
        Ok(())
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), DynError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| with_context(err, format!("PUT {path}")))?;
        check_status(response, "PUT", path).await?;
        Ok(())
    }

    async fn merge_patch(&self, path: &str, body: &Value) -> Result<(), DynError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .patch(&url)
            .header("Content-Type", "application/strategic-merge-patch+json")
            .json(body)
            .send()
            .await
            .map_err(|err| with_context(err, format!("PATCH {path}")))?;
        check_status(response, "PATCH", path).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), DynError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|err| with_context(err, format!("DELETE {path}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "DELETE", path).await?;
        Ok(())
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, DynError> {
        self.list("/api/v1/nodes").await
    }

    pub async fn get_node(&self, name: &str) -> Result<Option<Node>, DynError> {
        self.get_optional(&format!("/api/v1/nodes/{name}")).await
    }

    pub async fn delete_node(&self, name: &str) -> Result<(), DynError> {
        self.delete(&format!("/api/v1/nodes/{name}")).await
    }

    /// Patches labels, annotations, and taints. Absent keys are left alone.
    pub async fn patch_node(&self, node: &Node) -> Result<(), DynError> {
        let name = node.name().to_string();
        let patch = serde_json::json!({
            "metadata": {
                "labels": node.metadata.labels,
                "annotations": node.metadata.annotations,
            },
            "spec": {
                "taints": node.spec.taints,
            },
        });
        self.merge_patch(&format!("/api/v1/nodes/{name}"), &patch).await
    }

    pub async fn set_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
        annotations: &[(&str, Option<&str>)],
    ) -> Result<(), DynError> {
        let mut annotation_patch = serde_json::Map::new();
        for (key, value) in annotations {
            match value {
                Some(v) => {
                    annotation_patch.insert((*key).to_string(), Value::String((*v).to_string()))
                }
                None => annotation_patch.insert((*key).to_string(), Value::Null),
            };
        }
        let patch = serde_json::json!({
            "metadata": { "annotations": annotation_patch },
            "spec": { "unschedulable": unschedulable },
        });
        self.merge_patch(&format!("/api/v1/nodes/{name}"), &patch).await
    }

    pub async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, DynError> {
        self.get_optional(&format!("/api/v1/namespaces/{namespace}/services/{name}"))
            .await
    }

    pub async fn create_service(&self, service: &Service) -> Result<(), DynError> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
        self.post(&format!("/api/v1/namespaces/{namespace}/services"), service)
            .await
    }

    pub async fn update_service(&self, service: &Service) -> Result<(), DynError> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
        let name = service.metadata.name.as_deref().unwrap_or_default();
        self.put(
            &format!("/api/v1/namespaces/{namespace}/services/{name}"),
            service,
        )
        .await
    }

    pub async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, DynError> {
        self.get_optional(&format!("/api/v1/namespaces/{namespace}/endpoints/{name}"))
            .await
    }

    pub async fn create_endpoints(&self, endpoints: &Endpoints) -> Result<(), DynError> {
        let namespace = endpoints.metadata.namespace.as_deref().unwrap_or("default");
        self.post(&format!("/api/v1/namespaces/{namespace}/endpoints"), endpoints)
            .await
    }

    pub async fn update_endpoints(&self, endpoints: &Endpoints) -> Result<(), DynError> {
        let namespace = endpoints.metadata.namespace.as_deref().unwrap_or("default");
        let name = endpoints.metadata.name.as_deref().unwrap_or_default();
        self.put(
            &format!("/api/v1/namespaces/{namespace}/endpoints/{name}"),
            endpoints,
        )
        .await
    }

    pub async fn get_endpoint_slice(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EndpointSlice>, DynError> {
        self.get_optional(&format!(
            "/apis/discovery.k8s.io/v1/namespaces/{namespace}/endpointslices/{name}"
        ))
        .await
    }

    pub async fn create_endpoint_slice(&self, slice: &EndpointSlice) -> Result<(), DynError> {
        let namespace = slice.metadata.namespace.as_deref().unwrap_or("default");
        self.post(
            &format!("/apis/discovery.k8s.io/v1/namespaces/{namespace}/endpointslices"),
            slice,
        )
        .await
    }

    pub async fn update_endpoint_slice(&self, slice: &EndpointSlice) -> Result<(), DynError> {
        let namespace = slice.metadata.namespace.as_deref().unwrap_or("default");
        let name = slice.metadata.name.as_deref().unwrap_or_default();
        self.put(
            &format!("/apis/discovery.k8s.io/v1/namespaces/{namespace}/endpointslices/{name}"),
            slice,
        )
        .await
    }

    pub async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, DynError> {
        self.get_optional(&format!("/api/v1/namespaces/{namespace}/configmaps/{name}"))
            .await
    }

    pub async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), DynError> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or("default");
        self.post(&format!("/api/v1/namespaces/{namespace}/configmaps"), config_map)
            .await
    }

    pub async fn update_config_map(&self, config_map: &ConfigMap) -> Result<(), DynError> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or("default");
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        self.put(
            &format!("/api/v1/namespaces/{namespace}/configmaps/{name}"),
            config_map,
        )
        .await
    }

    pub async fn list_node_pods(&self, node_name: &str) -> Result<Vec<Pod>, DynError> {
        self.list(&format!("/api/v1/pods?fieldSelector=spec.nodeName%3D{node_name}"))
            .await
    }

    pub async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), DynError> {
        let eviction = serde_json::json!({
            "apiVersion": "policy/v1",
            "kind": "Eviction",
            "metadata": { "name": name, "namespace": namespace },
        });
        self.post(
            &format!("/api/v1/namespaces/{namespace}/pods/{name}/eviction"),
            &eviction,
        )
        .await
    }

    /// Fetches the live object a manifest describes, if it exists.
    pub async fn get_object(&self, manifest: &[u8]) -> Result<Option<Value>, DynError> {
        let object: Value = serde_json::from_slice(manifest)
            .map_err(|err| with_context(err, "resource manifest is not valid JSON"))?;
        let path = object_path(&object)?;
        self.get_optional(&path).await
    }

    /// Applies a manifest through server-side apply with this engine as the
    /// field manager. `force` takes over fields held by other managers.
    pub async fn apply_resource(&self, manifest: &[u8], force: bool) -> Result<(), DynError> {
        let object: Value = serde_json::from_slice(manifest)
            .map_err(|err| with_context(err, "resource manifest is not valid JSON"))?;
        let path = object_path(&object)?;
        let url = format!(
            "{}{}?fieldManager={}&force={}",
            self.base, path, FIELD_MANAGER, force
        );
        let response = self
            .http
            .patch(&url)
            .header("Content-Type", "application/apply-patch+yaml")
            .body(manifest.to_vec())
            .send()
            .await
            .map_err(|err| with_context(err, format!("APPLY {path}")))?;
        check_status(response, "APPLY", &path).await?;
        Ok(())
    }
}

async fn check_status(
    response: reqwest::Response,
    method: &str,
    path: &str,
) -> Result<reqwest::Response, DynError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(new_error(format!("{method} {path} failed: {status}: {body}")))
}

/// Computes the request path for an arbitrary typed object.
fn object_path(object: &Value) -> Result<String, DynError> {
    let api_version = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| new_error("manifest lacks apiVersion"))?;
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| new_error("manifest lacks kind"))?;
    let name = object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| new_error("manifest lacks metadata.name"))?;
    let namespace = object.pointer("/metadata/namespace").and_then(Value::as_str);

    let prefix = if api_version == "v1" {
        "/api/v1".to_string()
    } else {
        format!("/apis/{api_version}")
    };
    let plural = plural_of(kind);
    Ok(match namespace {
        Some(namespace) => format!("{prefix}/namespaces/{namespace}/{plural}/{name}"),
        None => format!("{prefix}/{plural}/{name}"),
    })
}

fn plural_of(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s') {
        lower
    } else if lower.ends_with('y') {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_handles_core_and_group_kinds() {
        let service: Value = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "cke-etcd", "namespace": "kube-system"},
        });
        assert_eq!(
            object_path(&service).expect("path"),
            "/api/v1/namespaces/kube-system/services/cke-etcd"
        );

        let deployment: Value = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "cluster-dns", "namespace": "kube-system"},
        });
        assert_eq!(
            object_path(&deployment).expect("path"),
            "/apis/apps/v1/namespaces/kube-system/deployments/cluster-dns"
        );

        let crb: Value = serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {"name": "helmsman-node"},
        });
        assert_eq!(
            object_path(&crb).expect("path"),
            "/apis/rbac.authorization.k8s.io/v1/clusterrolebindings/helmsman-node"
        );
    }

    #[test]
    fn plural_of_covers_common_suffixes() {
        assert_eq!(plural_of("Endpoints"), "endpoints");
        assert_eq!(plural_of("NetworkPolicy"), "networkpolicies");
        assert_eq!(plural_of("ConfigMap"), "configmaps");
    }
}
