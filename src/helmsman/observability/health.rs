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

use crate::helmsman::store::Storage;

use serde::Serialize;

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            message.truncate(ERROR_MAX_LEN);
        }
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

/// Probes the process's own dependencies, not the managed cluster: a
/// degraded report means this controller cannot do its job.
pub async fn check(storage: &Storage) -> HealthReport {
    let mut components = Vec::new();

    match storage.get_cluster().await {
        Ok(_) => components.push(ComponentHealth::healthy("store")),
        Err(err) => components.push(ComponentHealth::unhealthy("store", err)),
    }

    let status = if components.iter().all(|c| c.healthy) {
        HealthStatus::Ready
    } else {
        HealthStatus::Degraded
    };
    HealthReport { status, components }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helmsman::store::memory::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn report_is_ready_with_reachable_store() {
        let storage = Storage::new(Arc::new(MemoryStore::new()));
        let report = check(&storage).await;
        assert_eq!(report.status, HealthStatus::Ready);
        assert!(report.components.iter().all(|c| c.healthy));
    }
}
