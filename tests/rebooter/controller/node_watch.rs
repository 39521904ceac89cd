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

use amt_rebooter::rebooter::controller::recovery::RecoveryPolicy;
use amt_rebooter::rebooter::controller::schedule::{
    REBOOT_AT_ANNOTATION, REBOOT_ATTEMPTS_ANNOTATION,
};
use amt_rebooter::rebooter::controller::watch::NodeWatcher;
use amt_rebooter::rebooter::k8s::node::{WatchEvent, WatchEventType};
use amt_rebooter::rebooter::observability::health::WatchHealth;
use amt_rebooter::rebooter::scheduler::Scheduler;
use amt_rebooter::rebooter::test_support::{node_with_readiness, Harness};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn policy() -> RecoveryPolicy {
    RecoveryPolicy {
        poll_interval: Duration::from_millis(20),
        ..RecoveryPolicy::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

struct RunningWatcher {
    health: Arc<WatchHealth>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningWatcher {
    fn start(harness: &Harness) -> Self {
        let health = WatchHealth::new();
        let shutdown = CancellationToken::new();
        let mut watcher = NodeWatcher::new(harness.context.clone(), Scheduler::global(), health.clone());
        let token = shutdown.clone();
        let task = tokio::spawn(async move { watcher.run(token).await });
        Self {
            health,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("watcher stops")
            .expect("watcher task");
    }
}

#[tokio::test]
async fn ready_event_clears_state_and_retires_loop() {
    let harness = Harness::new(&["worker-1"], policy());
    let mut watcher = NodeWatcher::new(harness.context.clone(), Scheduler::global(), WatchHealth::new());
    harness.registry.insert(node_with_readiness("worker-1", false));

    let offline = harness.registry.node("worker-1").expect("node");
    watcher
        .handle_event(WatchEvent::new(WatchEventType::Added, offline))
        .await;
    assert!(watcher.has_loop("worker-1"));

    harness.registry.set_ready("worker-1", true);
    let online = harness.registry.node("worker-1").expect("node");
    watcher
        .handle_event(WatchEvent::new(WatchEventType::Modified, online))
        .await;

    assert!(!watcher.has_loop("worker-1"));
    assert!(harness.registry.annotations("worker-1").is_empty());
    assert_eq!(harness.power.status_calls(), 0);
}

#[tokio::test]
async fn repeated_not_ready_events_do_not_reschedule() {
    let harness = Harness::new(&["worker-1"], policy());
    let mut watcher = NodeWatcher::new(harness.context.clone(), Scheduler::global(), WatchHealth::new());
    harness.registry.insert(node_with_readiness("worker-1", false));

    let node = harness.registry.node("worker-1").expect("node");
    watcher
        .handle_event(WatchEvent::new(WatchEventType::Added, node))
        .await;
    let scheduled = harness.registry.annotations("worker-1");

    harness.clock.advance(Duration::from_secs(60));
    let node = harness.registry.node("worker-1").expect("node");
    watcher
        .handle_event(WatchEvent::new(WatchEventType::Modified, node))
        .await;

    assert_eq!(harness.registry.annotations("worker-1"), scheduled);
    assert_eq!(harness.registry.writes().len(), 1);
    assert_eq!(watcher.active_loops(), 1);
    watcher.shutdown_loops().await;
}

#[tokio::test]
async fn deleted_event_retires_loop() {
    let harness = Harness::new(&["worker-1"], policy());
    let mut watcher = NodeWatcher::new(harness.context.clone(), Scheduler::global(), WatchHealth::new());
    harness.registry.insert(node_with_readiness("worker-1", false));
    let node = harness.registry.node("worker-1").expect("node");

    watcher
        .handle_event(WatchEvent::new(WatchEventType::Added, node.clone()))
        .await;
    assert_eq!(watcher.active_loops(), 1);

    watcher
        .handle_event(WatchEvent::new(WatchEventType::Deleted, node))
        .await;
    assert_eq!(watcher.active_loops(), 0);
}

#[tokio::test]
async fn restart_resumes_pending_recovery_from_annotations() {
    let harness = Harness::new(&["worker-1", "worker-2"], policy());
    let due = (harness.now().timestamp() - 5).to_string();
    harness.registry.insert_with_annotations(
        node_with_readiness("worker-1", false),
        &[(REBOOT_AT_ANNOTATION, due.as_str()), (REBOOT_ATTEMPTS_ANNOTATION, "1")],
    );
    harness.registry.insert(node_with_readiness("worker-2", true));

    let running = RunningWatcher::start(&harness);
    assert!(eventually(|| harness.registry.node("worker-1").is_none()).await);
    assert_eq!(harness.power.cycle_calls(), 1);
    assert!(harness.registry.node("worker-2").is_some());
    assert!(harness.registry.writes_for("worker-2").is_empty());
    running.stop().await;
}

#[tokio::test]
async fn live_events_schedule_and_cancel_recovery() {
    let harness = Harness::new(&["worker-1"], policy());
    harness.registry.insert(node_with_readiness("worker-1", true));
    let running = RunningWatcher::start(&harness);
    assert!(eventually(|| running.health.report().watch_connected).await);

    harness.registry.set_ready("worker-1", false);
    assert!(eventually(|| {
        harness
            .registry
            .annotations("worker-1")
            .contains_key(REBOOT_AT_ANNOTATION)
    })
    .await);
    assert!(eventually(|| running.health.report().active_loops == 1).await);

    harness.registry.set_ready("worker-1", true);
    assert!(eventually(|| harness.registry.annotations("worker-1").is_empty()).await);
    assert!(eventually(|| running.health.report().active_loops == 0).await);
    assert_eq!(harness.power.status_calls(), 0);
    running.stop().await;
}

#[tokio::test]
async fn expired_watch_relists_with_fresh_version() {
    let harness = Harness::new(&["worker-1"], policy());
    harness.registry.insert(node_with_readiness("worker-1", false));
    harness.registry.fail_next_watch(410);

    let running = RunningWatcher::start(&harness);
    assert!(eventually(|| harness.registry.watch_opens().len() >= 2).await);

    let opens = harness.registry.watch_opens();
    let version = |index: usize| -> u64 {
        opens[index]
            .as_deref()
            .and_then(|v| v.parse().ok())
            .expect("resource version")
    };
    // The relist saw the schedule written by the first pass.
    assert!(version(1) > version(0));
    assert!(eventually(|| running.health.report().watch_connected).await);
    running.stop().await;
}

#[tokio::test]
async fn closed_watch_window_reopens() {
    let harness = Harness::new(&[], policy());
    let running = RunningWatcher::start(&harness);
    assert!(eventually(|| harness.registry.watch_opens().len() == 1).await);

    harness.registry.close_watches();
    assert!(eventually(|| harness.registry.watch_opens().len() == 2).await);
    running.stop().await;
}

#[tokio::test]
async fn failed_watch_reports_degraded_then_recovers() {
    let harness = Harness::new(&[], policy());
    harness.registry.fail_next_watch(500);

    let running = RunningWatcher::start(&harness);
    assert!(eventually(|| running.health.report().error.is_some()).await);
    assert!(!running.health.report().is_ready());

    assert!(eventually(|| running.health.report().is_ready()).await);
    assert_eq!(harness.registry.watch_opens().len(), 2);
    running.stop().await;
}
