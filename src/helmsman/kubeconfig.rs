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

use crate::helmsman::op::RIVERS_LISTEN_PORT;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

/// Kubeconfig for components on managed nodes.
///
/// The server is the local rivers proxy, so a single API server outage
/// never cuts a node off from the control plane.
pub fn kubeconfig(cluster: &str, user: &str, ca: &str, client_crt: &str, client_key: &str) -> Value {
    render(
        cluster,
        user,
        ca,
        client_crt,
        client_key,
        &format!("https://localhost:{RIVERS_LISTEN_PORT}"),
    )
}

/// Kubeconfig for people and tooling outside the cluster.
pub fn user_kubeconfig(
    cluster: &str,
    user: &str,
    ca: &str,
    client_crt: &str,
    client_key: &str,
    server: &str,
) -> Value {
    render(cluster, user, ca, client_crt, client_key, server)
}

fn render(
    cluster: &str,
    user: &str,
    ca: &str,
    client_crt: &str,
    client_key: &str,
    server: &str,
) -> Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster,
            "cluster": {
                "server": server,
                "certificate-authority-data": BASE64.encode(ca),
            },
        }],
        "users": [{
            "name": user,
            "user": {
                "client-certificate-data": BASE64.encode(client_crt),
                "client-key-data": BASE64.encode(client_key),
            },
        }],
        "contexts": [{
            "name": "default",
            "context": { "cluster": cluster, "user": user },
        }],
        "current-context": "default",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_form_targets_the_rivers_proxy() {
        let config = kubeconfig("test", "admin", "CA", "CRT", "KEY");
        assert_eq!(
            config.pointer("/clusters/0/cluster/server").and_then(Value::as_str),
            Some("https://localhost:16443")
        );
        assert_eq!(
            config.pointer("/current-context").and_then(Value::as_str),
            Some("default")
        );
        assert_eq!(
            config
                .pointer("/clusters/0/cluster/certificate-authority-data")
                .and_then(Value::as_str),
            Some(BASE64.encode("CA").as_str())
        );
    }

    #[test]
    fn user_form_takes_the_given_server() {
        let config = user_kubeconfig(
            "test",
            "viewer",
            "CA",
            "CRT",
            "KEY",
            "https://kube.example.com:6443",
        );
        assert_eq!(
            config.pointer("/clusters/0/cluster/server").and_then(Value::as_str),
            Some("https://kube.example.com:6443")
        );
        assert_eq!(
            config.pointer("/contexts/0/context/user").and_then(Value::as_str),
            Some("viewer")
        );
    }
}
