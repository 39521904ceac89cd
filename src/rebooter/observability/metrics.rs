/*
 * Copyright (C) 2024 The AMT Rebooter Authors
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

use std::error::Error;
use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RECOVERY_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static POWER_ACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WATCH_RESTARTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RECOVERY_LOOPS_ACTIVE: OnceLock<IntGauge> = OnceLock::new();

/// State machine transitions that were acted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryTransition {
    Scheduled,
    Cancelled,
    AttemptFailed,
    AttemptSkipped,
    Exhausted,
    NodeDeleted,
}

impl RecoveryTransition {
    fn as_label(self) -> &'static str {
        match self {
            RecoveryTransition::Scheduled => "scheduled",
            RecoveryTransition::Cancelled => "cancelled",
            RecoveryTransition::AttemptFailed => "attempt_failed",
            RecoveryTransition::AttemptSkipped => "attempt_skipped",
            RecoveryTransition::Exhausted => "exhausted",
            RecoveryTransition::NodeDeleted => "node_deleted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerAction {
    Status,
    Cycle,
}

impl PowerAction {
    fn as_label(self) -> &'static str {
        match self {
            PowerAction::Status => "status",
            PowerAction::Cycle => "cycle",
        }
    }
}

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("amt_rebooter".to_string()), None)
            .expect("failed to initialise amt-rebooter metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register amt-rebooter metric collector");
    collector
}

fn recovery_transitions_total() -> &'static IntCounterVec {
    RECOVERY_TRANSITIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "recovery_transitions_total",
            "Recovery state machine transitions grouped by node and transition",
        );
        let counter = IntCounterVec::new(opts, &["node", "transition"])
            .expect("failed to build recovery transition counter");
        register_collector(counter)
    })
}

fn power_actions_total() -> &'static IntCounterVec {
    POWER_ACTIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "power_actions_total",
            "Out-of-band power requests grouped by node, action, and result",
        );
        let counter = IntCounterVec::new(opts, &["node", "action", "result"])
            .expect("failed to build power action counter");
        register_collector(counter)
    })
}

fn watch_restarts_total() -> &'static IntCounterVec {
    WATCH_RESTARTS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "watch_restarts_total",
            "Node watch restarts grouped by cause",
        );
        let counter = IntCounterVec::new(opts, &["cause"])
            .expect("failed to build watch restart counter");
        register_collector(counter)
    })
}

fn recovery_loops_active() -> &'static IntGauge {
    RECOVERY_LOOPS_ACTIVE.get_or_init(|| {
        let gauge = IntGauge::new(
            "recovery_loops_active",
            "Per-node recovery loops currently running",
        )
        .expect("failed to build recovery loop gauge");
        register_collector(gauge)
    })
}

pub fn record_transition(node: &str, transition: RecoveryTransition) {
    recovery_transitions_total()
        .with_label_values(&[node, transition.as_label()])
        .inc();
}

pub fn record_power_action(node: &str, action: PowerAction, success: bool) {
    let result = if success { "success" } else { "failure" };
    power_actions_total()
        .with_label_values(&[node, action.as_label(), result])
        .inc();
}

pub fn record_watch_restart(cause: &str) {
    watch_restarts_total().with_label_values(&[cause]).inc();
}

pub fn set_active_loops(count: usize) {
    recovery_loops_active().set(i64::try_from(count).unwrap_or(i64::MAX));
}

/// Encodes every registered series in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_and_power_actions_are_exported() {
        record_transition("metrics-node", RecoveryTransition::Scheduled);
        record_power_action("metrics-node", PowerAction::Cycle, false);
        set_active_loops(3);

        let body = gather().expect("metrics encoded");
        let text = String::from_utf8(body).expect("utf8");
        assert!(text.contains("amt_rebooter_recovery_transitions_total"));
        assert!(text.contains("transition=\"scheduled\""));
        assert!(text.contains("amt_rebooter_power_actions_total"));
        assert!(text.contains("action=\"cycle\""));
        assert!(text.contains("result=\"failure\""));
        assert!(text.contains("amt_rebooter_recovery_loops_active"));
    }
}
