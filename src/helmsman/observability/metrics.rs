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

use crate::helmsman::op::Phase;
use crate::helmsman::reboot::{RebootQueueEntry, RebootStatus};

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static LEADER: OnceLock<IntGauge> = OnceLock::new();
static OPERATION_PHASE: OnceLock<IntGaugeVec> = OnceLock::new();
static NODE_REACHABLE: OnceLock<IntGaugeVec> = OnceLock::new();
static OPERATION_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TICK_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static REBOOT_QUEUE_ENTRIES: OnceLock<IntGauge> = OnceLock::new();
static REBOOT_QUEUE_ITEMS: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("helmsman".to_string()), None)
            .expect("failed to initialise helmsman metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register helmsman metric collector");
    collector
}

fn leader() -> &'static IntGauge {
    LEADER.get_or_init(|| {
        let gauge = IntGauge::new("leader", "Whether this process holds the leadership")
            .expect("failed to build leader gauge");
        register_collector(gauge)
    })
}

fn operation_phase() -> &'static IntGaugeVec {
    OPERATION_PHASE.get_or_init(|| {
        let opts = Opts::new(
            "operation_phase",
            "The phase the last decision produced, one-hot by phase label",
        );
        let gauge = IntGaugeVec::new(opts, &["phase"]).expect("failed to build phase gauge");
        register_collector(gauge)
    })
}

fn node_reachable() -> &'static IntGaugeVec {
    NODE_REACHABLE.get_or_init(|| {
        let opts = Opts::new("node_reachable", "Whether ssh reached the node this tick");
        let gauge = IntGaugeVec::new(opts, &["address"]).expect("failed to build node gauge");
        register_collector(gauge)
    })
}

fn operation_records_total() -> &'static IntCounterVec {
    OPERATION_RECORDS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "operation_records_total",
            "Operation records by terminal status",
        );
        let counter =
            IntCounterVec::new(opts, &["status"]).expect("failed to build records counter");
        register_collector(counter)
    })
}

fn tick_duration() -> &'static HistogramVec {
    TICK_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new("tick_duration_seconds", "Wall time of one controller tick");
        let histogram =
            HistogramVec::new(opts, &["result"]).expect("failed to build tick histogram");
        register_collector(histogram)
    })
}

fn reboot_queue_entries() -> &'static IntGauge {
    REBOOT_QUEUE_ENTRIES.get_or_init(|| {
        let gauge = IntGauge::new("reboot_queue_entries", "Total entries in the reboot queue")
            .expect("failed to build reboot queue gauge");
        register_collector(gauge)
    })
}

fn reboot_queue_items() -> &'static IntGaugeVec {
    REBOOT_QUEUE_ITEMS.get_or_init(|| {
        let opts = Opts::new("reboot_queue_items", "Reboot queue entries by status");
        let gauge = IntGaugeVec::new(opts, &["status"]).expect("failed to build reboot item gauge");
        register_collector(gauge)
    })
}

pub fn set_leader(is_leader: bool) {
    leader().set(if is_leader { 1 } else { 0 });
}

pub fn set_phase(phase: Phase) {
    for candidate in Phase::all() {
        let value = if *candidate == phase { 1 } else { 0 };
        operation_phase()
            .with_label_values(&[candidate.as_str()])
            .set(value);
    }
}

pub fn set_node_reachable(address: &str, reachable: bool) {
    node_reachable()
        .with_label_values(&[address])
        .set(if reachable { 1 } else { 0 });
}

pub fn observe_record_status(status: &str) {
    operation_records_total().with_label_values(&[status]).inc();
}

pub fn observe_tick(duration: Duration, result: &str) {
    tick_duration()
        .with_label_values(&[result])
        .observe(duration.as_secs_f64());
}

pub fn set_reboot_queue_gauges(entries: &[RebootQueueEntry]) {
    reboot_queue_entries().set(entries.len() as i64);
    for status in RebootStatus::all() {
        let count = entries.iter().filter(|e| e.status == *status).count();
        reboot_queue_items()
            .with_label_values(&[status.as_str()])
            .set(count as i64);
    }
}

/// Renders the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let families = registry().gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buffer).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn reboot_gauges_count_by_status() {
        let mut queued = RebootQueueEntry::new(1, "10.0.0.4", Utc::now());
        queued.status = RebootStatus::Queued;
        let mut draining = RebootQueueEntry::new(2, "10.0.0.5", Utc::now());
        draining.status = RebootStatus::Draining;

        set_reboot_queue_gauges(&[queued, draining]);
        let rendered = gather();
        assert!(rendered.contains("helmsman_reboot_queue_entries 2"));
        assert!(rendered.contains("status=\"draining\"} 1"));
    }

    #[test]
    fn phase_gauge_is_one_hot() {
        set_phase(Phase::Rivers);
        let rendered = gather();
        assert!(rendered.contains("phase=\"rivers\"} 1"));
        assert!(rendered.contains("phase=\"completed\"} 0"));
    }
}
