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

use crate::helmsman::cluster::{Node, ServiceParams};
use crate::helmsman::op::commands::{
    ImagePullCommand, MakeDirsCommand, RunContainerCommand, StopContainersCommand,
};
use crate::helmsman::op::{Commander, OpContext, Operator};
use crate::helmsman::util::DynError;

use async_trait::async_trait;

const RIVERS_LOG_DIR: &str = "/var/log/rivers";

/// Builtin parameters for a rivers proxy fronting `upstreams`.
pub fn rivers_params(
    upstreams: &[&Node],
    upstream_port: u16,
    listen_port: u16,
) -> ServiceParams {
    let upstreams: Vec<String> = upstreams
        .iter()
        .map(|n| format!("{}:{}", n.address, upstream_port))
        .collect();
    ServiceParams {
        extra_args: vec![
            "rivers".to_string(),
            format!("--upstreams={}", upstreams.join(",")),
            format!("--listen=127.0.0.1:{listen_port}"),
        ],
        ..Default::default()
    }
}

pub struct RiversBootOp {
    name: &'static str,
    container: &'static str,
    nodes: Vec<String>,
    params: ServiceParams,
    extra: ServiceParams,
    step: usize,
}

impl RiversBootOp {
    pub fn new(
        nodes: &[&Node],
        upstreams: &[&Node],
        extra: &ServiceParams,
        container: &'static str,
        upstream_port: u16,
        listen_port: u16,
    ) -> Self {
        let name = if container == crate::helmsman::op::RIVERS_CONTAINER {
            "rivers-bootstrap"
        } else {
            "etcd-rivers-bootstrap"
        };
        RiversBootOp {
            name,
            container,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: rivers_params(upstreams, upstream_port, listen_port),
            extra: extra.clone(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for RiversBootOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn targets(&self) -> Vec<String> {
        self.nodes.clone()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(MakeDirsCommand {
                nodes: self.nodes.clone(),
                dirs: vec![RIVERS_LOG_DIR.to_string()],
            })),
            1 => Some(Box::new(ImagePullCommand {
                nodes: self.nodes.clone(),
                name: self.container.to_string(),
            })),
            2 => Some(Box::new(RunContainerCommand::new(
                self.nodes.clone(),
                self.container,
                self.params.clone(),
                self.extra.clone(),
            ))),
            _ => None,
        }
    }
}

pub struct RiversRestartOp {
    name: &'static str,
    container: &'static str,
    nodes: Vec<String>,
    params: ServiceParams,
    extra: ServiceParams,
    step: usize,
}

impl RiversRestartOp {
    pub fn new(
        nodes: &[&Node],
        upstreams: &[&Node],
        extra: &ServiceParams,
        container: &'static str,
        upstream_port: u16,
        listen_port: u16,
    ) -> Self {
        let name = if container == crate::helmsman::op::RIVERS_CONTAINER {
            "rivers-restart"
        } else {
            "etcd-rivers-restart"
        };
        RiversRestartOp {
            name,
            container,
            nodes: nodes.iter().map(|n| n.address.clone()).collect(),
            params: rivers_params(upstreams, upstream_port, listen_port),
            extra: extra.clone(),
            step: 0,
        }
    }
}

#[async_trait]
impl Operator for RiversRestartOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn targets(&self) -> Vec<String> {
        self.nodes.clone()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(ImagePullCommand {
                nodes: self.nodes.clone(),
                name: self.container.to_string(),
            })),
            1 => Some(Box::new(StopContainersCommand {
                nodes: self.nodes.clone(),
                name: self.container.to_string(),
            })),
            2 => Some(Box::new(RunContainerCommand::new(
                self.nodes.clone(),
                self.container,
                self.params.clone(),
                self.extra.clone(),
            ))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: &str) -> Node {
        Node {
            address: address.to_string(),
            user: "op".to_string(),
            control_plane: true,
            ..Default::default()
        }
    }

    #[test]
    fn params_list_all_upstreams() {
        let cp1 = node("10.0.0.1");
        let cp2 = node("10.0.0.2");
        let params = rivers_params(&[&cp1, &cp2], 6443, 16443);
        assert!(params
            .extra_args
            .contains(&"--upstreams=10.0.0.1:6443,10.0.0.2:6443".to_string()));
        assert!(params
            .extra_args
            .contains(&"--listen=127.0.0.1:16443".to_string()));
    }

    #[test]
    fn boot_op_emits_dirs_pull_run() {
        let worker = node("10.0.0.5");
        let cp = node("10.0.0.1");
        let mut op = RiversBootOp::new(
            &[&worker],
            &[&cp],
            &ServiceParams::default(),
            crate::helmsman::op::RIVERS_CONTAINER,
            6443,
            16443,
        );
        assert_eq!(op.name(), "rivers-bootstrap");

        let names: Vec<String> = std::iter::from_fn(|| op.next_command())
            .map(|c| c.command().name)
            .collect();
        assert_eq!(names, vec!["make-dirs", "image-pull", "run-container"]);
        assert!(op.next_command().is_none());
    }
}
