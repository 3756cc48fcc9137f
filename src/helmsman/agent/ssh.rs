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

use crate::helmsman::agent::{Agent, AgentError, AgentOutput};
use crate::helmsman::util::{with_context, DynError};

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// An `Agent` backed by the system ssh client in batch mode.
pub struct SshAgent {
    user: String,
    address: String,
}

impl SshAgent {
    pub fn new(user: &str, address: &str) -> Self {
        SshAgent {
            user: user.to_string(),
            address: address.to_string(),
        }
    }

    fn command(&self, cmdline: &str) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg(format!("{}@{}", self.user, self.address))
            .arg("--")
            .arg(cmdline);
        command
    }
}

#[async_trait]
impl Agent for SshAgent {
    async fn run(&self, cmdline: &str) -> Result<AgentOutput, DynError> {
        let output = self
            .command(cmdline)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| with_context(err, format!("spawning ssh to {}", self.address)))?;

        if !output.status.success() {
            return Err(Box::new(AgentError {
                cmdline: cmdline.to_string(),
                exit_status: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            }));
        }
        Ok(AgentOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn run_with_input(&self, cmdline: &str, input: &str) -> Result<(), DynError> {
        let mut child = self
            .command(cmdline)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| with_context(err, format!("spawning ssh to {}", self.address)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|err| with_context(err, "writing remote stdin"))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| with_context(err, format!("waiting for ssh to {}", self.address)))?;
        if !output.status.success() {
            return Err(Box::new(AgentError {
                cmdline: cmdline.to_string(),
                exit_status: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            }));
        }
        Ok(())
    }
}
