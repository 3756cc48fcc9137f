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

pub mod images;

use crate::helmsman::agent::{is_skippable_error, Agent, AgentError};
use crate::helmsman::cluster::status::ServiceStatus;
use crate::helmsman::cluster::{Mount, ServiceParams};
use crate::helmsman::util::{with_context, DynError};

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub use images::{image_for, ETCD_IMAGE, KUBERNETES_IMAGE, TOOLS_IMAGE};

/// Label every managed container carries; its JSON value records the
/// parameters it was started with so a later tick can detect drift.
pub const CONTAINER_LABEL: &str = "com.cybozu.cke";

#[derive(Debug, Serialize, Deserialize, Default)]
struct ContainerLabel {
    builtin: ServiceParams,
    extra: ServiceParams,
}

/// Capability set the engine needs from a node's container runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pulls the image for the named container unless it is present.
    async fn pull_image(&self, name: &str) -> Result<(), DynError>;
    /// Runs the named container as a foreground process.
    async fn run(&self, name: &str, binds: &[Mount], command: &str) -> Result<(), DynError>;
    /// Runs the named container as a foreground process with stdin.
    async fn run_with_input(
        &self,
        name: &str,
        binds: &[Mount],
        command: &str,
        input: &str,
    ) -> Result<(), DynError>;
    /// Runs the named container as a system service.
    ///
    /// `init_args` are appended between the builtin and extra arguments but
    /// kept out of the recorded label: they only matter the moment the
    /// container joins (e.g. an initial cluster roster) and must not count
    /// as drift afterwards.
    async fn run_system(
        &self,
        name: &str,
        opts: &[String],
        params: &ServiceParams,
        init_args: &[String],
        extra: &ServiceParams,
    ) -> Result<(), DynError>;
    /// Returns whether the named container exists.
    async fn exists(&self, name: &str) -> Result<bool, DynError>;
    async fn stop(&self, name: &str) -> Result<(), DynError>;
    async fn kill(&self, name: &str) -> Result<(), DynError>;
    async fn remove(&self, name: &str) -> Result<(), DynError>;
    /// Returns statuses for the named containers; absent ones are omitted.
    async fn inspect(&self, names: &[&str]) -> Result<HashMap<String, ServiceStatus>, DynError>;
    async fn volume_create(&self, name: &str) -> Result<(), DynError>;
    async fn volume_remove(&self, name: &str) -> Result<(), DynError>;
    async fn volume_exists(&self, name: &str) -> Result<bool, DynError>;
}

/// The docker implementation used on managed nodes.
pub struct Docker {
    agent: Arc<dyn Agent>,
}

impl Docker {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Docker { agent }
    }

    async fn get_id(&self, name: &str) -> Result<String, DynError> {
        let cmdline =
            format!("docker ps -a --no-trunc --filter name=^/{name}$ --format {{{{.ID}}}}");
        let output = self.agent.run(&cmdline).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Materializes data in a uniquely named file on the node.
    async fn put_data(&self, data: &str) -> Result<String, DynError> {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let file_name = format!("/tmp/{}", hex::encode(raw));
        self.agent
            .run_with_input(&format!("tee {file_name}"), data)
            .await?;
        Ok(file_name)
    }
}

fn bind_args(binds: &[Mount]) -> impl Iterator<Item = String> + '_ {
    binds.iter().map(|m| {
        let mode = if m.read_only { "ro" } else { "rw" };
        format!("--volume={}:{}:{}", m.source, m.destination, mode)
    })
}

#[async_trait]
impl ContainerEngine for Docker {
    async fn pull_image(&self, name: &str) -> Result<(), DynError> {
        let image = image_for(name);
        let output = self
            .agent
            .run("docker image list --format '{{.Repository}}:{{.Tag}}'")
            .await?;
        let listed = String::from_utf8_lossy(&output.stdout);
        if listed.lines().any(|line| line == image) {
            return Ok(());
        }
        self.agent.run(&format!("docker image pull {image}")).await?;
        Ok(())
    }

    async fn run(&self, name: &str, binds: &[Mount], command: &str) -> Result<(), DynError> {
        let mut args = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--network=host".to_string(),
            "--uts=host".to_string(),
        ];
        args.extend(bind_args(binds));
        args.push(image_for(name).to_string());
        args.push(command.to_string());
        self.agent.run(&args.join(" ")).await?;
        Ok(())
    }

    async fn run_with_input(
        &self,
        name: &str,
        binds: &[Mount],
        command: &str,
        input: &str,
    ) -> Result<(), DynError> {
        let mut args = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--network=host".to_string(),
            "--uts=host".to_string(),
        ];
        args.extend(bind_args(binds));
        args.push(image_for(name).to_string());
        args.push(command.to_string());
        self.agent.run_with_input(&args.join(" "), input).await
    }

    async fn run_system(
        &self,
        name: &str,
        opts: &[String],
        params: &ServiceParams,
        init_args: &[String],
        extra: &ServiceParams,
    ) -> Result<(), DynError> {
        let id = self.get_id(name).await?;
        if !id.is_empty() {
            self.agent.run(&format!("docker rm {name}")).await?;
        }

        let mut args = vec![
            "docker".to_string(),
            "run".to_string(),
            "-d".to_string(),
            format!("--name={name}"),
            "--read-only".to_string(),
            "--network=host".to_string(),
            "--uts=host".to_string(),
            "--restart=unless-stopped".to_string(),
        ];
        args.extend(opts.iter().cloned());
        args.extend(bind_args(&params.extra_binds));
        args.extend(bind_args(&extra.extra_binds));
        for (key, value) in params.extra_env.iter().chain(extra.extra_env.iter()) {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        let label = ContainerLabel {
            builtin: params.clone(),
            extra: extra.clone(),
        };
        let data = serde_json::to_string(&label)
            .map_err(|err| with_context(err, "encoding container label"))?;
        let label_file = self.put_data(&format!("{CONTAINER_LABEL}={data}")).await?;
        args.push(format!("--label-file={label_file}"));

        args.push(image_for(name).to_string());
        args.extend(params.extra_args.iter().cloned());
        args.extend(init_args.iter().cloned());
        args.extend(extra.extra_args.iter().cloned());

        self.agent.run(&args.join(" ")).await?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, DynError> {
        Ok(!self.get_id(name).await?.is_empty())
    }

    async fn stop(&self, name: &str) -> Result<(), DynError> {
        self.agent
            .run(&format!("docker container stop {name}"))
            .await?;
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), DynError> {
        self.agent
            .run(&format!("docker container kill {name}"))
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), DynError> {
        self.agent
            .run(&format!("docker container rm {name}"))
            .await?;
        Ok(())
    }

    async fn inspect(&self, names: &[&str]) -> Result<HashMap<String, ServiceStatus>, DynError> {
        let cmdline = format!("docker container inspect {}", names.join(" "));
        let stdout = match self.agent.run(&cmdline).await {
            Ok(output) => output.stdout,
            // Inspecting a removed container exits 1; the remaining
            // containers are still reported on stdout.
            Err(err) if is_skippable_error(&err) => err
                .downcast_ref::<AgentError>()
                .map(|agent_err| agent_err.stdout.clone())
                .unwrap_or_default(),
            Err(err) => return Err(err),
        };

        let containers: Vec<DockerContainer> = serde_json::from_slice(&stdout)
            .map_err(|err| with_context(err, "decoding docker inspect output"))?;

        let mut statuses = HashMap::new();
        for container in containers {
            let name = container.name.trim_start_matches('/').to_string();
            let label: ContainerLabel = match container.config.labels.get(CONTAINER_LABEL) {
                Some(raw) => serde_json::from_str(raw)
                    .map_err(|err| with_context(err, format!("decoding label of {name}")))?,
                None => ContainerLabel::default(),
            };
            statuses.insert(
                name,
                ServiceStatus {
                    running: container.state.running,
                    image: container.config.image,
                    builtin_params: label.builtin,
                    extra_params: label.extra,
                },
            );
        }
        Ok(statuses)
    }

    async fn volume_create(&self, name: &str) -> Result<(), DynError> {
        self.agent
            .run(&format!("docker volume create {name}"))
            .await?;
        Ok(())
    }

    async fn volume_remove(&self, name: &str) -> Result<(), DynError> {
        self.agent
            .run(&format!("docker volume remove {name}"))
            .await?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, DynError> {
        let output = self.agent.run("docker volume list -q").await?;
        let listed = String::from_utf8_lossy(&output.stdout);
        Ok(listed.lines().any(|line| line == name))
    }
}

#[derive(Debug, Deserialize)]
struct DockerContainer {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: DockerContainerState,
    #[serde(rename = "Config")]
    config: DockerContainerConfig,
}

#[derive(Debug, Deserialize)]
struct DockerContainerState {
    #[serde(rename = "Running")]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct DockerContainerConfig {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helmsman::test_support::RecordingAgent;

    #[tokio::test]
    async fn inspect_recovers_label_params() {
        let label = serde_json::json!({
            "builtin": {"extra_args": ["--listen=0.0.0.0"]},
            "extra": {"extra_args": ["--log-level=debug"]},
        })
        .to_string();
        let inspect_output = serde_json::json!([{
            "Name": "/rivers",
            "State": {"Running": true},
            "Config": {
                "Image": TOOLS_IMAGE,
                "Labels": { (CONTAINER_LABEL): label },
            },
        }])
        .to_string();

        let agent = Arc::new(RecordingAgent::new());
        agent.respond_with(&inspect_output);
        let docker = Docker::new(agent);

        let statuses = docker.inspect(&["rivers"]).await.expect("inspect");
        let rivers = statuses.get("rivers").expect("rivers status");
        assert!(rivers.running);
        assert_eq!(rivers.image, TOOLS_IMAGE);
        assert_eq!(rivers.builtin_params.extra_args, vec!["--listen=0.0.0.0"]);
        assert_eq!(rivers.extra_params.extra_args, vec!["--log-level=debug"]);
    }

    #[tokio::test]
    async fn inspect_tolerates_missing_containers() {
        let agent = Arc::new(RecordingAgent::new());
        agent.fail_with(1, "Error: No such container: etcd\n", "[]");
        let docker = Docker::new(agent);

        let statuses = docker.inspect(&["etcd"]).await.expect("skippable inspect");
        assert!(statuses.is_empty());
    }

    #[tokio::test]
    async fn run_system_places_label_and_args() {
        let agent = Arc::new(RecordingAgent::new());
        // get_id, tee label file, docker run
        agent.respond_with("");
        let docker = Docker::new(agent.clone());

        let params = ServiceParams {
            extra_args: vec!["--flag=1".to_string()],
            ..Default::default()
        };
        let extra = ServiceParams::default();
        docker
            .run_system("etcd", &[], &params, &[], &extra)
            .await
            .expect("run system");

        let commands = agent.commands();
        let run_line = commands.last().expect("docker run issued");
        assert!(run_line.contains("--name=etcd"));
        assert!(run_line.contains("--label-file=/tmp/"));
        assert!(run_line.ends_with("--flag=1"));
    }
}
