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

use crate::helmsman::cluster::VaultConfig;
use crate::helmsman::k8s::KubeTls;
use crate::helmsman::logger::log_info;
use crate::helmsman::store::Storage;
use crate::helmsman::util::{new_error, with_context, DynError};

use serde_json::Value;
use std::time::Duration;

const COMPONENT: &str = "vault";
const TTL_100_YEAR: &str = "876000h";
const TTL_10_YEAR: &str = "87600h";
const APPROLE_PATH: &str = "approle/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const POLICY: &str = r#"
path "cke/*"
{
  capabilities = ["create", "read", "update", "delete", "list", "sudo"]
}
"#;

struct CaParams {
    vault_path: &'static str,
    common_name: &'static str,
    key: &'static str,
}

const CAS: [CaParams; 4] = [
    CaParams {
        vault_path: "cke/ca-server/",
        common_name: "server CA",
        key: "server",
    },
    CaParams {
        vault_path: "cke/ca-etcd-peer/",
        common_name: "etcd peer CA",
        key: "etcd-peer",
    },
    CaParams {
        vault_path: "cke/ca-etcd-client/",
        common_name: "etcd client CA",
        key: "etcd-client",
    },
    CaParams {
        vault_path: "cke/ca-kubernetes/",
        common_name: "kubernetes CA",
        key: "kubernetes",
    },
];

/// An authenticated Vault session.
pub struct VaultClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl VaultClient {
    pub fn with_token(endpoint: &str, token: &str) -> Result<VaultClient, DynError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| with_context(err, "failed to build vault http client"))?;
        Ok(VaultClient {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Logs in through the approle created by `init`.
    pub async fn connect(config: &VaultConfig) -> Result<VaultClient, DynError> {
        config.validate()?;
        let mut client = Self::with_token(&config.endpoint, "")?;
        let response = client
            .http
            .post(format!("{}/v1/auth/approle/login", client.endpoint))
            .json(&serde_json::json!({
                "role_id": config.role_id,
                "secret_id": config.secret_id,
            }))
            .send()
            .await
            .map_err(|err| with_context(err, "vault approle login"))?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| with_context(err, "decoding vault login response"))?;
        let token = body
            .pointer("/auth/client_token")
            .and_then(Value::as_str)
            .ok_or_else(|| new_error("vault login returned no token"))?;
        client.token = token.to_string();
        Ok(client)
    }

    async fn get(&self, path: &str) -> Result<Value, DynError> {
        let response = self
            .http
            .get(format!("{}/v1/{}", self.endpoint, path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|err| with_context(err, format!("GET {path}")))?;
        if !response.status().is_success() {
            return Err(new_error(format!("GET {path} returned {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|err| with_context(err, format!("decoding GET {path}")))
    }

    async fn write(&self, path: &str, body: Value) -> Result<Value, DynError> {
        let response = self
            .http
            .post(format!("{}/v1/{}", self.endpoint, path))
            .header("X-Vault-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|err| with_context(err, format!("POST {path}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(new_error(format!("POST {path} returned {status}: {text}")));
        }
        if response.content_length() == Some(0) {
            return Ok(Value::Null);
        }
        response.json().await.or(Ok(Value::Null))
    }

    /// One-time Vault preparation: approle auth, the engine policy and
    /// role, and one PKI backend per certificate authority.
    pub async fn init(&self, storage: &Storage) -> Result<VaultConfig, DynError> {
        let auths = self.get("sys/auth").await?;
        let approle_mounted = auths
            .as_object()
            .map(|map| map.keys().any(|key| key == APPROLE_PATH))
            .unwrap_or(false)
            || auths
                .pointer("/data")
                .and_then(Value::as_object)
                .map(|map| map.keys().any(|key| key == APPROLE_PATH))
                .unwrap_or(false);
        if !approle_mounted {
            self.write(
                "sys/auth/approle",
                serde_json::json!({ "type": "approle" }),
            )
            .await?;
        }

        self.write("sys/policy/cke", serde_json::json!({ "policy": POLICY }))
            .await?;
        self.write(
            "auth/approle/role/cke",
            serde_json::json!({ "policies": "cke", "period": "1h" }),
        )
        .await?;

        let role = self.get("auth/approle/role/cke/role-id").await?;
        let role_id = role
            .pointer("/data/role_id")
            .and_then(Value::as_str)
            .ok_or_else(|| new_error("no role_id exists"))?
            .to_string();
        let secret = self
            .write("auth/approle/role/cke/secret-id", serde_json::json!({}))
            .await?;
        let secret_id = secret
            .pointer("/data/secret_id")
            .and_then(Value::as_str)
            .ok_or_else(|| new_error("no secret_id exists"))?
            .to_string();

        let config = VaultConfig {
            endpoint: self.endpoint.clone(),
            role_id,
            secret_id,
        };
        storage.put_vault_config(&config).await?;

        for ca in &CAS {
            self.create_ca(storage, ca).await?;
        }
        Ok(config)
    }

    async fn create_ca(&self, storage: &Storage, ca: &CaParams) -> Result<(), DynError> {
        let mounts = self.get("sys/mounts").await?;
        let mounted = mounts
            .as_object()
            .map(|map| map.keys().any(|key| key == ca.vault_path))
            .unwrap_or(false)
            || mounts
                .pointer("/data")
                .and_then(Value::as_object)
                .map(|map| map.keys().any(|key| key == ca.vault_path))
                .unwrap_or(false);
        if !mounted {
            self.write(
                &format!("sys/mounts/{}", ca.vault_path.trim_end_matches('/')),
                serde_json::json!({
                    "type": "pki",
                    "config": {
                        "max_lease_ttl": TTL_100_YEAR,
                        "default_lease_ttl": TTL_10_YEAR,
                    },
                }),
            )
            .await?;
        }

        let generated = self
            .write(
                &format!("{}root/generate/internal", ca.vault_path),
                serde_json::json!({
                    "common_name": ca.common_name,
                    "ttl": TTL_100_YEAR,
                    "format": "pem",
                }),
            )
            .await?;
        let certificate = generated
            .pointer("/data/certificate")
            .and_then(Value::as_str)
            .ok_or_else(|| new_error("no certificate exists"))?;

        // Sanity-check the PEM before persisting it.
        let parsed = openssl::x509::X509::from_pem(certificate.as_bytes())
            .map_err(|err| with_context(err, format!("CA {} returned a bad PEM", ca.key)))?;
        log_info(
            COMPONENT,
            "generated CA certificate",
            &[
                ("key", ca.key),
                ("not_after", &parsed.not_after().to_string()),
            ],
        );

        storage.put_ca_certificate(ca.key, certificate).await
    }

    async fn ensure_issue_role(&self, vault_path: &str, role: &str) -> Result<(), DynError> {
        self.write(
            &format!("{vault_path}roles/{role}"),
            serde_json::json!({
                "ttl": TTL_10_YEAR,
                "max_ttl": TTL_10_YEAR,
                "allow_any_name": true,
                "client_flag": true,
            }),
        )
        .await?;
        Ok(())
    }

    /// Issues a client certificate pair from one of the engine CAs.
    pub async fn issue(
        &self,
        ca_key: &str,
        role: &str,
        common_name: &str,
    ) -> Result<(Vec<u8>, Vec<u8>), DynError> {
        let vault_path = CAS
            .iter()
            .find(|ca| ca.key == ca_key)
            .map(|ca| ca.vault_path)
            .ok_or_else(|| new_error(format!("unknown CA {ca_key}")))?;
        self.ensure_issue_role(vault_path, role).await?;

        let issued = self
            .write(
                &format!("{vault_path}issue/{role}"),
                serde_json::json!({ "common_name": common_name, "ttl": TTL_10_YEAR }),
            )
            .await?;
        let certificate = issued
            .pointer("/data/certificate")
            .and_then(Value::as_str)
            .ok_or_else(|| new_error("issue returned no certificate"))?;
        let private_key = issued
            .pointer("/data/private_key")
            .and_then(Value::as_str)
            .ok_or_else(|| new_error("issue returned no private key"))?;
        Ok((
            certificate.as_bytes().to_vec(),
            private_key.as_bytes().to_vec(),
        ))
    }

    /// Materializes the TLS bundle the engine uses against API servers.
    pub async fn kubernetes_tls(&self, storage: &Storage) -> Result<KubeTls, DynError> {
        let ca = storage
            .get_ca_certificate("kubernetes")
            .await?
            .ok_or_else(|| new_error("kubernetes CA is not stored; run vault init"))?;
        let (cert, key) = self.issue("kubernetes", "admin", "admin").await?;
        Ok(KubeTls {
            ca_pem: ca.into_bytes(),
            cert_pem: cert,
            key_pem: key,
        })
    }
}
