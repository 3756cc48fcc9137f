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

use crate::helmsman::agent::{is_skippable_error, Agent};
use crate::helmsman::cluster::ServiceParams;
use crate::helmsman::engine::ContainerEngine;
use crate::helmsman::op::{targets_of, CommandSpec, Commander, OpContext};
use crate::helmsman::util::{with_context, DynError};

use async_trait::async_trait;
use futures_util::future::join_all;

/// Runs one closure-produced future per node and surfaces the first failure.
async fn for_each_node<'a, F, Fut>(nodes: &'a [String], f: F) -> Result<(), DynError>
where
    F: Fn(&'a str) -> Fut,
    Fut: std::future::Future<Output = Result<(), DynError>>,
{
    let results = join_all(nodes.iter().map(|node| {
        let fut = f(node.as_str());
        async move { (node, fut.await) }
    }))
    .await;
    for (node, result) in results {
        result.map_err(|err| with_context(err, format!("on {node}")))?;
    }
    Ok(())
}

pub struct MakeDirsCommand {
    pub nodes: Vec<String>,
    pub dirs: Vec<String>,
}

#[async_trait]
impl Commander for MakeDirsCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("make-dirs", &targets_of(&self.nodes), &self.dirs.join(" "))
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let dirs = self.dirs.join(" ");
        for_each_node(&self.nodes, |node| {
            let dirs = dirs.clone();
            async move {
                let agent = ctx.inf.agent(node)?;
                agent.run(&format!("mkdir -p {dirs}")).await?;
                Ok(())
            }
        })
        .await
    }
}

pub struct ImagePullCommand {
    pub nodes: Vec<String>,
    pub name: String,
}

#[async_trait]
impl Commander for ImagePullCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("image-pull", &targets_of(&self.nodes), &self.name)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for_each_node(&self.nodes, |node| async move {
            ctx.inf.engine(node)?.pull_image(&self.name).await
        })
        .await
    }
}

pub struct VolumeCreateCommand {
    pub nodes: Vec<String>,
    pub volume: String,
}

#[async_trait]
impl Commander for VolumeCreateCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("volume-create", &targets_of(&self.nodes), &self.volume)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for_each_node(&self.nodes, |node| async move {
            ctx.inf.engine(node)?.volume_create(&self.volume).await
        })
        .await
    }
}

pub struct VolumeRemoveCommand {
    pub nodes: Vec<String>,
    pub volume: String,
}

#[async_trait]
impl Commander for VolumeRemoveCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("volume-remove", &targets_of(&self.nodes), &self.volume)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for_each_node(&self.nodes, |node| async move {
            let engine = ctx.inf.engine(node)?;
            if engine.volume_exists(&self.volume).await? {
                engine.volume_remove(&self.volume).await?;
            }
            Ok(())
        })
        .await
    }
}

pub struct RunContainerCommand {
    pub nodes: Vec<String>,
    pub name: String,
    pub opts: Vec<String>,
    pub params: ServiceParams,
    pub init_args: Vec<String>,
    pub extra: ServiceParams,
}

impl RunContainerCommand {
    pub fn new(nodes: Vec<String>, name: &str, params: ServiceParams, extra: ServiceParams) -> Self {
        RunContainerCommand {
            nodes,
            name: name.to_string(),
            opts: Vec::new(),
            params,
            init_args: Vec::new(),
            extra,
        }
    }
}

#[async_trait]
impl Commander for RunContainerCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("run-container", &targets_of(&self.nodes), &self.name)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for_each_node(&self.nodes, |node| async move {
            ctx.inf
                .engine(node)?
                .run_system(&self.name, &self.opts, &self.params, &self.init_args, &self.extra)
                .await
        })
        .await
    }
}

/// Stops and removes a container, succeeding when it is already gone.
pub struct StopContainersCommand {
    pub nodes: Vec<String>,
    pub name: String,
}

#[async_trait]
impl Commander for StopContainersCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("stop-containers", &targets_of(&self.nodes), &self.name)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for_each_node(&self.nodes, |node| async move {
            let engine = ctx.inf.engine(node)?;
            if !engine.exists(&self.name).await? {
                return Ok(());
            }
            if let Err(err) = engine.stop(&self.name).await {
                if !is_skippable_error(&err) {
                    return Err(err);
                }
            }
            match engine.remove(&self.name).await {
                Ok(()) => Ok(()),
                Err(err) if is_skippable_error(&err) => Ok(()),
                Err(err) => Err(err),
            }
        })
        .await
    }
}

pub struct KillContainersCommand {
    pub nodes: Vec<String>,
    pub name: String,
}

#[async_trait]
impl Commander for KillContainersCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("kill-containers", &targets_of(&self.nodes), &self.name)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for_each_node(&self.nodes, |node| async move {
            let engine = ctx.inf.engine(node)?;
            if !engine.exists(&self.name).await? {
                return Ok(());
            }
            match engine.kill(&self.name).await {
                Ok(()) => Ok(()),
                Err(err) if is_skippable_error(&err) => Ok(()),
                Err(err) => Err(err),
            }
        })
        .await
    }
}

pub struct MakeFileCommand {
    pub node: String,
    pub path: String,
    pub content: String,
}

#[async_trait]
impl Commander for MakeFileCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("make-file", &self.node, &self.path)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        let agent = ctx.inf.agent(&self.node)?;
        let dir = match self.path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir,
            _ => "/",
        };
        agent.run(&format!("mkdir -p {dir}")).await?;
        agent
            .run_with_input(&format!("tee {}", self.path), &self.content)
            .await
    }
}

pub struct RemoveFileCommand {
    pub nodes: Vec<String>,
    pub path: String,
}

#[async_trait]
impl Commander for RemoveFileCommand {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("remove-file", &targets_of(&self.nodes), &self.path)
    }

    async fn run(&self, ctx: &OpContext) -> Result<(), DynError> {
        for_each_node(&self.nodes, |node| async move {
            let agent = ctx.inf.agent(node)?;
            agent.run(&format!("rm -f {}", self.path)).await?;
            Ok(())
        })
        .await
    }
}
