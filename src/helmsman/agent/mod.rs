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

pub mod ssh;

use crate::helmsman::util::DynError;

use async_trait::async_trait;
use std::error::Error;
use std::fmt;

pub use ssh::SshAgent;

/// Output of a completed remote command.
#[derive(Clone, Debug, Default)]
pub struct AgentOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A remote command that exited non-zero or failed to run.
#[derive(Debug)]
pub struct AgentError {
    pub cmdline: String,
    pub exit_status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote command failed: cmdline: {}, status: {}, stdout: {}, stderr: {}",
            self.cmdline,
            self.exit_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr),
        )
    }
}

impl Error for AgentError {}

/// Shell access to one node.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Runs a command line and returns its output.
    async fn run(&self, cmdline: &str) -> Result<AgentOutput, DynError>;

    /// Runs a command line feeding `input` on stdin.
    async fn run_with_input(&self, cmdline: &str, input: &str) -> Result<(), DynError>;
}

/// Classifies a failure as ignorable.
///
/// A remote `docker` invocation that exits 1 complaining only about a
/// missing container means the desired state already holds.
pub fn is_skippable_error(err: &DynError) -> bool {
    let Some(agent_err) = err.downcast_ref::<AgentError>() else {
        return false;
    };
    if agent_err.exit_status != Some(1) {
        return false;
    }
    String::from_utf8_lossy(&agent_err.stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(|line| line.starts_with("Error: No such container: "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helmsman::util::new_error;

    fn agent_error(status: Option<i32>, stderr: &str) -> DynError {
        Box::new(AgentError {
            cmdline: "docker container inspect etcd".to_string(),
            exit_status: status,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        })
    }

    #[test]
    fn missing_container_is_skippable() {
        let err = agent_error(Some(1), "Error: No such container: etcd\n");
        assert!(is_skippable_error(&err));

        let err = agent_error(Some(1), "\nError: No such container: etcd\n\n");
        assert!(is_skippable_error(&err));
    }

    #[test]
    fn other_failures_are_not_skippable() {
        let err = agent_error(Some(1), "permission denied\n");
        assert!(!is_skippable_error(&err));

        let err = agent_error(Some(2), "Error: No such container: etcd\n");
        assert!(!is_skippable_error(&err));

        let err = agent_error(None, "Error: No such container: etcd\n");
        assert!(!is_skippable_error(&err));

        assert!(!is_skippable_error(&new_error("connect timeout")));
    }
}
