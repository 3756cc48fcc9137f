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

use helmsman::helmsman::config::Config;
use helmsman::helmsman::logger::{log_error, log_info, log_warn, set_log_format};
use helmsman::helmsman::security::VaultClient;
use helmsman::helmsman::server::{http, Controller};
use helmsman::helmsman::store::etcd::EtcdStore;
use helmsman::helmsman::store::Storage;
use helmsman::helmsman::util::DynError;

use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "main";

#[tokio::main]
async fn main() -> ExitCode {
    set_log_format(Config::log_format_from_env());
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log_error(COMPONENT, "fatal error", &[("error", &err.to_string())]);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), DynError> {
    let config = Config::from_env()?;
    log_info(
        COMPONENT,
        "starting",
        &[
            ("interval", &format!("{:?}", config.interval)),
            ("endpoints", &config.etcd_endpoints.join(",")),
        ],
    );

    let store = EtcdStore::new(&config.etcd_endpoints, config.session_ttl)?;
    let storage = Storage::new(Arc::new(store));

    if let Some((endpoint, token)) = Config::vault_init_from_env() {
        let vault = VaultClient::with_token(&endpoint, &token)?;
        vault.init(&storage).await?;
        log_info(COMPONENT, "vault initialized", &[("endpoint", endpoint.as_str())]);
    }

    // Credentials come from the CA provider when it has been initialized;
    // until then the engine still manages containers over ssh.
    let kube_tls = match storage.get_vault_config().await? {
        Some(vault_config) => match VaultClient::connect(&vault_config).await {
            Ok(vault) => match vault.kubernetes_tls(&storage).await {
                Ok(tls) => Some(tls),
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "kubernetes credentials unavailable",
                        &[("error", &err.to_string())],
                    );
                    None
                }
            },
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "vault login failed",
                    &[("error", &err.to_string())],
                );
                None
            }
        },
        None => {
            log_warn(COMPONENT, "vault is not configured", &[]);
            None
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log_info(COMPONENT, "shutdown requested", &[]);
                cancel.cancel();
            }
        });
    }

    let listener = {
        let storage = storage.clone();
        let cancel = cancel.clone();
        let listen_addr = config.listen_addr.clone();
        tokio::spawn(async move { http::serve(&listen_addr, storage, cancel).await })
    };

    let controller = Controller::new(storage, config, kube_tls, cancel.clone());
    let result = controller.run().await;

    cancel.cancel();
    match listener.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log_warn(
            COMPONENT,
            "health listener ended with error",
            &[("error", &err.to_string())],
        ),
        Err(err) => log_warn(
            COMPONENT,
            "health listener panicked",
            &[("error", &err.to_string())],
        ),
    }
    result
}
