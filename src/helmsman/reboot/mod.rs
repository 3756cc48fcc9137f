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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebootStatus {
    Queued,
    Draining,
    DrainTimedout,
    Rebooting,
    Cancelled,
}

impl RebootStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebootStatus::Queued => "queued",
            RebootStatus::Draining => "draining",
            RebootStatus::DrainTimedout => "drain-timedout",
            RebootStatus::Rebooting => "rebooting",
            RebootStatus::Cancelled => "cancelled",
        }
    }

    pub fn all() -> &'static [RebootStatus] {
        &[
            RebootStatus::Queued,
            RebootStatus::Draining,
            RebootStatus::DrainTimedout,
            RebootStatus::Rebooting,
            RebootStatus::Cancelled,
        ]
    }

    /// Whether an operator may still withdraw the entry. Once the reboot
    /// command has run there is nothing left to call off.
    pub fn is_cancellable(&self) -> bool {
        !matches!(self, RebootStatus::Rebooting | RebootStatus::Cancelled)
    }
}

/// One node waiting in the reboot queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebootQueueEntry {
    pub index: i64,
    pub node: String,
    pub status: RebootStatus,
    #[serde(default)]
    pub drain_started_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
}

impl RebootQueueEntry {
    pub fn new(index: i64, node: &str, now: DateTime<Utc>) -> Self {
        RebootQueueEntry {
            index,
            node: node.to_string(),
            status: RebootStatus::Queued,
            drain_started_at: None,
            last_transition_at: now,
        }
    }

    /// Moves the entry to `status`, stamping the drain start when entering
    /// the draining state.
    pub fn transition(&mut self, status: RebootStatus, now: DateTime<Utc>) {
        if status == RebootStatus::Draining {
            self.drain_started_at = Some(now);
        }
        self.status = status;
        self.last_transition_at = now;
    }
}

/// The queue buckets the decision engine consumes each tick.
#[derive(Clone, Debug, Default)]
pub struct RebootArgs {
    pub rq_entries: Vec<RebootQueueEntry>,
    pub newly_drained: Vec<RebootQueueEntry>,
    pub drain_completed: Vec<RebootQueueEntry>,
    pub drain_timedout: Vec<RebootQueueEntry>,
    pub reboot_dequeued: Vec<RebootQueueEntry>,
}

/// Node-level observations the bucket computation needs from this tick.
#[derive(Clone, Debug, Default)]
pub struct QueueObservation {
    /// Nodes whose eviction set is empty.
    pub drained_nodes: HashSet<String>,
    /// Rebooting nodes whose boot check passed and that are Ready again.
    pub booted_nodes: HashSet<String>,
}

/// Buckets queue entries by state and age.
///
/// Entries keep their FIFO order inside each bucket; `entries` must already
/// be sorted by index.
pub fn compute_buckets(
    entries: &[RebootQueueEntry],
    now: DateTime<Utc>,
    eviction_timeout: Duration,
    observation: &QueueObservation,
) -> RebootArgs {
    let mut args = RebootArgs {
        rq_entries: entries.to_vec(),
        ..Default::default()
    };

    for entry in entries {
        match entry.status {
            RebootStatus::Queued => args.newly_drained.push(entry.clone()),
            RebootStatus::Draining => {
                if observation.drained_nodes.contains(&entry.node) {
                    args.drain_completed.push(entry.clone());
                    continue;
                }
                let deadline = entry
                    .drain_started_at
                    .unwrap_or(entry.last_transition_at)
                    + chrono::Duration::from_std(eviction_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                if now >= deadline {
                    args.drain_timedout.push(entry.clone());
                }
            }
            RebootStatus::Rebooting => {
                if observation.booted_nodes.contains(&entry.node) {
                    args.reboot_dequeued.push(entry.clone());
                }
            }
            RebootStatus::Cancelled => args.reboot_dequeued.push(entry.clone()),
            RebootStatus::DrainTimedout => {}
        }
    }

    args
}

/// True while the queue is actively draining or rebooting the node.
pub fn reboot_processing(entries: &[RebootQueueEntry], node: &str) -> bool {
    entries.iter().any(|entry| {
        matches!(
            entry.status,
            RebootStatus::Draining | RebootStatus::Rebooting
        ) && entry.node == node
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: i64, node: &str, status: RebootStatus) -> RebootQueueEntry {
        let mut e = RebootQueueEntry::new(index, node, Utc::now());
        e.status = status;
        e
    }

    #[test]
    fn queued_entries_become_newly_drained_in_order() {
        let entries = vec![
            entry(1, "10.0.0.4", RebootStatus::Queued),
            entry(2, "10.0.0.5", RebootStatus::Queued),
        ];
        let args = compute_buckets(
            &entries,
            Utc::now(),
            Duration::from_secs(600),
            &QueueObservation::default(),
        );
        let nodes: Vec<_> = args.newly_drained.iter().map(|e| e.node.as_str()).collect();
        assert_eq!(nodes, vec!["10.0.0.4", "10.0.0.5"]);
        assert!(args.drain_completed.is_empty());
    }

    #[test]
    fn draining_entries_complete_or_time_out() {
        let now = Utc::now();
        let mut done = entry(1, "10.0.0.4", RebootStatus::Queued);
        done.transition(RebootStatus::Draining, now - chrono::Duration::seconds(30));
        let mut late = entry(2, "10.0.0.5", RebootStatus::Queued);
        late.transition(RebootStatus::Draining, now - chrono::Duration::seconds(700));

        let mut observation = QueueObservation::default();
        observation.drained_nodes.insert("10.0.0.4".to_string());

        let args = compute_buckets(
            &[done, late],
            now,
            Duration::from_secs(600),
            &observation,
        );
        assert_eq!(args.drain_completed.len(), 1);
        assert_eq!(args.drain_completed[0].node, "10.0.0.4");
        assert_eq!(args.drain_timedout.len(), 1);
        assert_eq!(args.drain_timedout[0].node, "10.0.0.5");
    }

    #[test]
    fn rebooted_and_cancelled_entries_are_dequeued() {
        let now = Utc::now();
        let rebooting = entry(1, "10.0.0.4", RebootStatus::Rebooting);
        let still_down = entry(2, "10.0.0.5", RebootStatus::Rebooting);
        let cancelled = entry(3, "10.0.0.6", RebootStatus::Cancelled);

        let mut observation = QueueObservation::default();
        observation.booted_nodes.insert("10.0.0.4".to_string());

        let args = compute_buckets(
            &[rebooting, still_down, cancelled],
            now,
            Duration::from_secs(600),
            &observation,
        );
        let nodes: Vec<_> = args.reboot_dequeued.iter().map(|e| e.node.as_str()).collect();
        assert_eq!(nodes, vec!["10.0.0.4", "10.0.0.6"]);
    }

    #[test]
    fn cancellation_stops_before_the_reboot_command() {
        assert!(RebootStatus::Queued.is_cancellable());
        assert!(RebootStatus::Draining.is_cancellable());
        assert!(RebootStatus::DrainTimedout.is_cancellable());
        assert!(!RebootStatus::Rebooting.is_cancellable());
        assert!(!RebootStatus::Cancelled.is_cancellable());
    }

    #[test]
    fn processing_covers_draining_and_rebooting_only() {
        let entries = vec![
            entry(1, "10.0.0.4", RebootStatus::Draining),
            entry(2, "10.0.0.5", RebootStatus::Queued),
        ];
        assert!(reboot_processing(&entries, "10.0.0.4"));
        assert!(!reboot_processing(&entries, "10.0.0.5"));
        assert!(!reboot_processing(&entries, "10.0.0.6"));
    }
}
