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

use crate::helmsman::cluster::resource::ResourceDefinition;
use crate::helmsman::cluster::Node;
use crate::helmsman::op::{CommandSpec, Commander, OpContext, Operator};
use crate::helmsman::util::DynError;

use async_trait::async_trait;

/// Applies one declared resource through server-side apply.
pub struct ResourceApplyOp {
    api_server: Node,
    resource: ResourceDefinition,
    force: bool,
    step: usize,
}

impl ResourceApplyOp {
    /// `force` is set on the first apply of a resource that predates
    /// server-side apply, taking ownership of its fields.
    pub fn new(api_server: &Node, resource: ResourceDefinition, force: bool) -> Self {
        ResourceApplyOp {
            api_server: api_server.clone(),
            resource,
            force,
            step: 0,
        }
    }
}

struct ApplyResourceCommand {
    api_server: Node,
    resource: ResourceDefinition,
    force: bool,
}

#[async_trait]
impl Commander for ApplyResourceCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("apply-resource", &self.resource.key(), "")
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let client = ctx.inf.kube_client(&self.api_server)?;
        client
            .apply_resource(&self.resource.manifest, self.force)
            .await
    }
}

#[async_trait]
impl Operator for ResourceApplyOp {
    fn name(&self) -> &'static str {
        "resource-apply"
    }

    fn targets(&self) -> Vec<String> {
        vec![self.resource.key()]
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        let step = self.step;
        self.step += 1;
        match step {
            0 => Some(Box::new(ApplyResourceCommand {
                api_server: self.api_server.clone(),
                resource: self.resource.clone(),
                force: self.force,
            })),
            _ => None,
        }
    }
}

/// Emits no commands; it exists so a tick waiting on an incomplete resource
/// still reports its phase.
pub struct NopOp;

#[async_trait]
impl Operator for NopOp {
    fn name(&self) -> &'static str {
        "nop"
    }

    fn targets(&self) -> Vec<String> {
        Vec::new()
    }

    async fn cleanup(&mut self, _ctx: &OpContext) -> Result<(), DynError> {
        Ok(())
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        None
    }
}
