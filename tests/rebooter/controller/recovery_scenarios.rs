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

use amt_rebooter::rebooter::amt::{PowerError, PowerState};
use amt_rebooter::rebooter::controller::recovery::RecoveryPolicy;
use amt_rebooter::rebooter::controller::schedule::{
    record_failed_attempt, StoreError, REBOOT_AT_ANNOTATION, REBOOT_ATTEMPTS_ANNOTATION,
};
use amt_rebooter::rebooter::controller::watch::NodeWatcher;
use amt_rebooter::rebooter::controller::worker::RecoveryWorker;
use amt_rebooter::rebooter::k8s::node::{WatchEvent, WatchEventType};
use amt_rebooter::rebooter::observability::health::WatchHealth;
use amt_rebooter::rebooter::scheduler::{JobResult, Scheduler};
use amt_rebooter::rebooter::test_support::{node_with_readiness, Harness, RegistryWrite};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NODE: &str = "worker-1";
const NOW: i64 = 1_700_000_000;

fn harness() -> Harness {
    Harness::new(&[NODE], RecoveryPolicy::default())
}

fn pending(harness: &Harness, attempts: u32, reboot_at: i64) {
    let reboot_at = reboot_at.to_string();
    let attempts = attempts.to_string();
    harness.registry.insert_with_annotations(
        node_with_readiness(NODE, false),
        &[
            (REBOOT_AT_ANNOTATION, reboot_at.as_str()),
            (REBOOT_ATTEMPTS_ANNOTATION, attempts.as_str()),
        ],
    );
}

fn recovery_state(harness: &Harness) -> Option<(i64, u32)> {
    let annotations = harness.registry.annotations(NODE);
    assert_consistent(&annotations);
    let at = annotations.get(REBOOT_AT_ANNOTATION)?.parse().expect("reboot-at");
    let count = annotations
        .get(REBOOT_ATTEMPTS_ANNOTATION)?
        .parse()
        .expect("reboot-attempts");
    Some((at, count))
}

fn assert_consistent(annotations: &HashMap<String, String>) {
    assert_eq!(
        annotations.contains_key(REBOOT_AT_ANNOTATION),
        annotations.contains_key(REBOOT_ATTEMPTS_ANNOTATION),
        "recovery annotations must be set and cleared together: {annotations:?}"
    );
}

fn transport_failure() -> Result<(), PowerError> {
    Err(PowerError::Transport("connection refused".to_string()))
}

#[tokio::test]
async fn scenario_not_ready_node_is_scheduled_after_initial_timeout() {
    let harness = harness();
    harness.registry.insert(node_with_readiness(NODE, false));
    let observed = harness.registry.node(NODE).expect("node stored");
    let mut watcher = NodeWatcher::new(harness.context.clone(), Scheduler::global(), WatchHealth::new());

    watcher
        .handle_event(WatchEvent::new(WatchEventType::Added, observed))
        .await;

    assert_eq!(recovery_state(&harness), Some((NOW + 300, 0)));
    assert!(watcher.has_loop(NODE));
    assert_eq!(harness.power.status_calls(), 0);
    watcher.shutdown_loops().await;
}

#[tokio::test]
async fn stale_offline_event_does_not_reset_recovery_in_progress() {
    let harness = harness();
    harness.registry.insert(node_with_readiness(NODE, false));
    let stale = harness.registry.node(NODE).expect("node stored");
    pending(&harness, 3, NOW + 1500);
    let writes_before = harness.registry.writes().len();
    let mut watcher = NodeWatcher::new(harness.context.clone(), Scheduler::global(), WatchHealth::new());

    watcher
        .handle_event(WatchEvent::new(WatchEventType::Modified, stale))
        .await;

    assert_eq!(recovery_state(&harness), Some((NOW + 1500, 3)));
    assert_eq!(harness.registry.writes().len(), writes_before);
    assert!(watcher.has_loop(NODE), "loop follows the stored state");
    watcher.shutdown_loops().await;
}

#[tokio::test]
async fn scenario_failed_cycle_increments_attempts_with_backoff() {
    let harness = harness();
    pending(&harness, 2, NOW - 60);
    harness.power.push_cycle(transport_failure());
    let worker = RecoveryWorker::new(NODE, harness.context.clone());

    assert_eq!(worker.tick(&CancellationToken::new()).await, JobResult::Continue);

    assert_eq!(harness.power.cycle_calls(), 1);
    assert_eq!(recovery_state(&harness), Some((NOW + 300 + 300 * 3, 3)));
}

#[tokio::test]
async fn scenario_last_failure_exhausts_the_budget() {
    let harness = harness();
    pending(&harness, 4, NOW - 60);
    harness.power.push_cycle(transport_failure());
    let worker = RecoveryWorker::new(NODE, harness.context.clone());
    let live = CancellationToken::new();

    assert_eq!(worker.tick(&live).await, JobResult::Continue);
    assert_eq!(recovery_state(&harness), Some((NOW + 300 + 300 * 5, 5)));
    let writes = harness.registry.writes().len();

    for _ in 0..5 {
        harness.clock.advance(Duration::from_secs(3600));
        assert_eq!(worker.tick(&live).await, JobResult::Continue);
    }
    assert_eq!(harness.power.status_calls(), 1);
    assert_eq!(harness.power.cycle_calls(), 1);
    assert_eq!(harness.registry.writes().len(), writes);
    assert_eq!(recovery_state(&harness).map(|(_, count)| count), Some(5));

    harness.registry.set_ready(NODE, true);
    assert_eq!(worker.tick(&live).await, JobResult::Stop);
    assert_eq!(recovery_state(&harness), None);
}

#[tokio::test]
async fn scenario_node_ready_before_attempt_clears_without_power_action() {
    let harness = harness();
    pending(&harness, 1, NOW - 60);
    harness.registry.set_ready(NODE, true);
    let worker = RecoveryWorker::new(NODE, harness.context.clone());

    assert_eq!(worker.tick(&CancellationToken::new()).await, JobResult::Stop);

    assert_eq!(recovery_state(&harness), None);
    assert_eq!(harness.power.status_calls(), 0);
    assert_eq!(harness.power.cycle_calls(), 0);
}

#[tokio::test]
async fn scenario_successful_cycle_deletes_node_and_stops_writing() {
    let harness = harness();
    pending(&harness, 0, NOW - 1);
    let worker = RecoveryWorker::new(NODE, harness.context.clone());
    let live = CancellationToken::new();

    assert_eq!(worker.tick(&live).await, JobResult::Stop);
    assert!(harness.registry.node(NODE).is_none());
    assert_eq!(
        harness.registry.writes_for(NODE),
        vec![RegistryWrite::Delete {
            node: NODE.to_string()
        }]
    );

    assert_eq!(worker.tick(&live).await, JobResult::Stop);
    assert_eq!(harness.registry.writes_for(NODE).len(), 1);
    assert_eq!(harness.power.cycle_calls(), 1);
}

#[tokio::test]
async fn cancelled_loop_never_starts_a_power_action() {
    let harness = harness();
    pending(&harness, 0, NOW - 1);
    let worker = RecoveryWorker::new(NODE, harness.context.clone());
    let cancelled = CancellationToken::new();
    cancelled.cancel();

    assert_eq!(worker.tick(&cancelled).await, JobResult::Stop);
    assert_eq!(harness.power.status_calls(), 0);
    assert!(harness.registry.node(NODE).is_some());
}

#[tokio::test]
async fn unexpected_power_state_and_missing_credentials_do_not_count() {
    let harness = harness();
    pending(&harness, 1, NOW - 1);
    let worker = RecoveryWorker::new(NODE, harness.context.clone());
    let live = CancellationToken::new();

    harness.power.push_status(Ok(PowerState::new("8")));
    assert_eq!(worker.tick(&live).await, JobResult::Continue);
    harness.credentials.remove(NODE);
    assert_eq!(worker.tick(&live).await, JobResult::Continue);

    assert_eq!(harness.power.cycle_calls(), 0);
    assert_eq!(recovery_state(&harness), Some((NOW - 1, 1)));
    assert!(harness.registry.writes().is_empty());
}

#[tokio::test]
async fn contended_failure_record_retries_then_gives_up() {
    let harness = harness();
    let policy = RecoveryPolicy::default();
    pending(&harness, 1, NOW - 1);

    harness.registry.conflict_next_patches(2);
    let state = record_failed_attempt(
        harness.context.store.as_ref(),
        harness.context.clock.as_ref(),
        NODE,
        &policy,
    )
    .await
    .expect("third write lands")
    .expect("state present");
    assert_eq!(state.attempt_count, 2);
    assert_eq!(recovery_state(&harness), Some((NOW + 900, 2)));

    harness.registry.conflict_next_patches(3);
    let err = record_failed_attempt(
        harness.context.store.as_ref(),
        harness.context.clock.as_ref(),
        NODE,
        &policy,
    )
    .await
    .expect_err("every write conflicts");
    assert!(matches!(err, StoreError::Contended { attempts: 3 }));
    assert_eq!(recovery_state(&harness), Some((NOW + 900, 2)));
}

/// Drives one node through a fixed pseudo-random mix of readiness flips,
/// failures and clock jumps, checking the persisted state after every step.
#[tokio::test]
async fn recovery_state_invariants_hold_across_mixed_sequences() {
    let policy = RecoveryPolicy {
        max_attempts: 3,
        ..RecoveryPolicy::default()
    };
    let max_attempts = policy.max_attempts;
    let harness = Harness::new(&[NODE], policy);
    let mut watcher = NodeWatcher::new(harness.context.clone(), Scheduler::global(), WatchHealth::new());
    let worker = RecoveryWorker::new(NODE, harness.context.clone());
    let live = CancellationToken::new();
    harness.registry.insert(node_with_readiness(NODE, true));

    let mut seed: u64 = 0x5eed_1234;
    let mut last: Option<(i64, u32)> = None;
    for _ in 0..200 {
        seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let ready = (seed >> 33) % 10 < 2;
        harness.registry.set_ready(NODE, ready);
        if (seed >> 40) % 2 == 0 {
            harness.power.push_cycle(transport_failure());
        }
        harness.clock.advance(Duration::from_secs((seed >> 20) % 2000));

        if let Some(node) = harness.registry.node(NODE) {
            watcher
                .handle_event(WatchEvent::new(WatchEventType::Modified, node))
                .await;
        }
        let result = worker.tick(&live).await;

        if harness.registry.node(NODE).is_none() {
            assert_eq!(result, JobResult::Stop);
            break;
        }
        let current = recovery_state(&harness);
        if ready {
            assert_eq!(current, None, "ready observation must clear state");
        }
        if let Some((at, count)) = current {
            assert!(count <= max_attempts);
            if let Some((previous_at, previous_count)) = last {
                assert!(count >= previous_count);
                assert!(at >= previous_at);
            }
        }
        last = current;
    }
    watcher.shutdown_loops().await;
}

#[test]
fn backoff_is_non_decreasing_in_attempt_count() {
    let policy = RecoveryPolicy::default();
    let delays: Vec<Duration> = (0..=policy.max_attempts)
        .map(|attempt| policy.backoff_delay(attempt))
        .collect();
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(delays[3], Duration::from_secs(1200));
}
