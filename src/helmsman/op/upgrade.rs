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
use crate::helmsman::op::commands::ImagePullCommand;
use crate::helmsman::op::{CommandSpec, Commander, OpContext, Operator, RIVERS_CONTAINER};
use crate::helmsman::util::DynError;

use async_trait::async_trait;

/// Migrates node-side state to the current configuration version.
///
/// Runs before anything else and only when every control plane node is
/// reachable, so a partially upgraded cluster cannot linger unnoticed.
pub struct UpgradeOp {
    nodes: Vec<String>,
    step: usize,
}

impl UpgradeOp {
    pub fn new(cp: &[&Node]) -> Self {
        UpgradeOp {
            nodes: cp.iter().map(|n| n.address.clone()).collect(),
            step: 0,
        }
    }
}

struct UpdateConfigVersionCommand;

#[async_trait]
impl Commander for UpdateConfigVersionCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("update-config-version", "", "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        ctx.inf
            .storage()
            .set_config_version(ctx.inf.leader_key())
            .await
    }
}

#[async_trait]
impl Operator for UpgradeOp {
    fn name(&self) -> &'static str {
        "upgrade"
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
                name: RIVERS_CONTAINER.to_string(),
            })),
            1 => Some(Box::new(UpdateConfigVersionCommand)),
            _ => None,
        }
    }
}
