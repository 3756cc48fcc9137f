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

use crate::helmsman::util::{new_error, with_context, DynError};

use std::env;
use std::time::Duration;

const ENV_INTERVAL: &str = "HELMSMAN_INTERVAL";
const ENV_SESSION_TTL: &str = "HELMSMAN_SESSION_TTL";
const ENV_MAX_CONCURRENT_UPDATES: &str = "HELMSMAN_MAX_CONCURRENT_UPDATES";
const ENV_DRAIN_RETRY_TIMES: &str = "HELMSMAN_DRAIN_RETRY_TIMES";
const ENV_DRAIN_RETRY_INTERVAL: &str = "HELMSMAN_DRAIN_RETRY_INTERVAL";
const ENV_ETCD_ENDPOINTS: &str = "HELMSMAN_ETCD_ENDPOINTS";
const ENV_LISTEN_ADDR: &str = "HELMSMAN_LISTEN_ADDR";
const ENV_LOG_FORMAT: &str = "HELMSMAN_LOG_FORMAT";
const ENV_VAULT_ENDPOINT: &str = "HELMSMAN_VAULT_ENDPOINT";
const ENV_VAULT_TOKEN: &str = "HELMSMAN_VAULT_TOKEN";

/// Engine configuration resolved from the environment.
///
/// Every knob has a default suitable for a small production cluster; the
/// environment only needs to name the store endpoints.
#[derive(Clone, Debug)]
pub struct Config {
    /// Cadence of the decision loop.
    pub interval: Duration,
    /// TTL of the leader-election lease.
    pub session_ttl: Duration,
    /// Upper bound on the width of a single operation's target set.
    pub max_concurrent_updates: usize,
    /// Retries for a single pod eviction during node drain.
    pub drain_retry_times: usize,
    /// Pause between eviction retries.
    pub drain_retry_interval: Duration,
    /// Endpoints of the backing key-value store.
    pub etcd_endpoints: Vec<String>,
    /// Bind address for the health and metrics listener.
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interval: Duration::from_secs(60),
            session_ttl: Duration::from_secs(60),
            max_concurrent_updates: 10,
            drain_retry_times: 5,
            drain_retry_interval: Duration::from_secs(10),
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            listen_addr: "0.0.0.0:10180".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, DynError> {
        let mut config = Config::default();

        if let Some(value) = env_value(ENV_INTERVAL) {
            config.interval = parse_duration(ENV_INTERVAL, &value)?;
        }
        if let Some(value) = env_value(ENV_SESSION_TTL) {
            config.session_ttl = parse_duration(ENV_SESSION_TTL, &value)?;
        }
        if let Some(value) = env_value(ENV_MAX_CONCURRENT_UPDATES) {
            config.max_concurrent_updates = parse_count(ENV_MAX_CONCURRENT_UPDATES, &value)?;
        }
        if let Some(value) = env_value(ENV_DRAIN_RETRY_TIMES) {
            config.drain_retry_times = parse_count(ENV_DRAIN_RETRY_TIMES, &value)?;
        }
        if let Some(value) = env_value(ENV_DRAIN_RETRY_INTERVAL) {
            config.drain_retry_interval = parse_duration(ENV_DRAIN_RETRY_INTERVAL, &value)?;
        }
        if let Some(value) = env_value(ENV_ETCD_ENDPOINTS) {
            config.etcd_endpoints = value
                .split(',')
                .map(|ep| ep.trim().to_string())
                .filter(|ep| !ep.is_empty())
                .collect();
            if config.etcd_endpoints.is_empty() {
                return Err(new_error(format!("{} must name at least one endpoint", ENV_ETCD_ENDPOINTS)));
            }
        }
        if let Some(value) = env_value(ENV_LISTEN_ADDR) {
            config.listen_addr = value;
        }

        Ok(config)
    }

    pub fn log_format_from_env() -> crate::helmsman::logger::LogFormat {
        match env_value(ENV_LOG_FORMAT).as_deref() {
            Some("json") => crate::helmsman::logger::LogFormat::Json,
            _ => crate::helmsman::logger::LogFormat::Text,
        }
    }

    /// One-time CA bootstrap: endpoint and root token, both set only for
    /// the run that prepares the certificate backend.
    pub fn vault_init_from_env() -> Option<(String, String)> {
        match (env_value(ENV_VAULT_ENDPOINT), env_value(ENV_VAULT_TOKEN)) {
            (Some(endpoint), Some(token)) => Some((endpoint, token)),
            _ => None,
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_duration(name: &str, value: &str) -> Result<Duration, DynError> {
    humantime::parse_duration(value)
        .map_err(|err| with_context(err, format!("invalid duration in {name}")))
}

fn parse_count(name: &str, value: &str) -> Result<usize, DynError> {
    let count: usize = value
        .parse()
        .map_err(|err| with_context(err, format!("invalid count in {name}")))?;
    if count == 0 {
        return Err(new_error(format!("{name} must be positive")));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing_accepts_humantime() {
        assert_eq!(
            parse_duration("X", "90s").expect("parse"),
            Duration::from_secs(90)
        );
        assert_eq!(
            parse_duration("X", "2m 30s").expect("parse"),
            Duration::from_secs(150)
        );
        assert!(parse_duration("X", "soon").is_err());
    }

    #[test]
    fn zero_widths_are_rejected() {
        assert!(parse_count("X", "0").is_err());
        assert_eq!(parse_count("X", "3").expect("parse"), 3);
    }
}
