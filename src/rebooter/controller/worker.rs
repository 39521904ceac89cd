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

//! One polling loop per node that is pending a reboot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::readiness::node_is_ready;
use super::recovery::{decide, execute_attempt, AttemptOutcome, Transition};
use super::schedule::{
    clear_recovery, record_failed_attempt, RecoveryRecord, RecoveryState,
};
use super::RecoveryContext;
use crate::rebooter::k8s::node::Node;
use crate::rebooter::logger::{log_debug, log_error, log_info, log_warn};
use crate::rebooter::observability::metrics::{self, RecoveryTransition};
use crate::rebooter::observability::tracing::with_span;
use crate::rebooter::scheduler::{JobResult, ScheduledTaskHandle, Scheduler};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "recovery";

/// Per-node recovery loop.
///
/// Every tick re-reads the live node and acts on what it finds; the only
/// in-memory state is bookkeeping that keeps a loop from repeating side
/// effects (a pending delete after a successful cycle) or log lines.
pub struct RecoveryWorker {
    node: String,
    context: Arc<RecoveryContext>,
    awaiting_delete: AtomicBool,
    exhausted_reported: AtomicBool,
    last_skip: Mutex<Option<String>>,
}

impl RecoveryWorker {
    pub fn new(node: impl Into<String>, context: Arc<RecoveryContext>) -> Arc<Self> {
        Arc::new(Self {
            node: node.into(),
            context,
            awaiting_delete: AtomicBool::new(false),
            exhausted_reported: AtomicBool::new(false),
            last_skip: Mutex::new(None),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Starts the loop on the shared scheduler. The returned handle stops it
    /// before its next tick when cancelled.
    pub fn spawn(self: &Arc<Self>, scheduler: &Scheduler) -> ScheduledTaskHandle {
        let worker = Arc::clone(self);
        scheduler.spawn_loop(
            "node-recovery",
            self.context.policy.poll_interval,
            move |ctx| {
                let worker = worker.clone();
                Box::pin(async move {
                    let cancellation = ctx.cancellation_token();
                    let span = format!("tick {}", worker.node);
                    with_span(COMPONENT, span, worker.tick(&cancellation)).await
                })
            },
        )
    }

    /// Runs one evaluation of the node. Returns [`JobResult::Stop`] once the
    /// loop has nothing left to do. A cancelled loop never starts a power
    /// action.
    pub async fn tick(&self, cancellation: &CancellationToken) -> JobResult {
        let node = match self.context.registry.get_node(&self.node).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                log_info(
                    COMPONENT,
                    "Node no longer exists; stopping recovery loop",
                    &[("node", self.node.as_str())],
                );
                return JobResult::Stop;
            }
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to read node; retrying next tick",
                    &[("node", self.node.as_str()), ("error", error.as_str())],
                );
                return JobResult::Continue;
            }
        };

        if self.awaiting_delete.load(Ordering::SeqCst) {
            return self.delete_node().await;
        }

        let ready = node_is_ready(&node);
        let record = RecoveryRecord::from_annotations(&node.metadata.annotations);
        let state = match &record {
            RecoveryRecord::Malformed(malformed) if !ready => {
                return self.repair(&node, malformed.reason.as_str(), malformed.attempt_count).await;
            }
            RecoveryRecord::Malformed(_) => None,
            RecoveryRecord::Absent => None,
            RecoveryRecord::Scheduled(state) => Some(*state),
        };
        // A ready node with unreadable annotations still gets them cleared.
        let present = !record.is_absent();

        let now = self.context.now();
        match decide(ready, state.as_ref(), now, &self.context.policy) {
            Transition::Cancel => self.cancel().await,
            Transition::None if ready && present => self.cancel().await,
            Transition::None | Transition::Schedule { .. } => {
                log_debug(
                    COMPONENT,
                    "Recovery state no longer present; stopping recovery loop",
                    &[("node", self.node.as_str())],
                );
                JobResult::Stop
            }
            Transition::Wait { .. } => JobResult::Continue,
            Transition::Exhausted { attempts } => {
                if !self.exhausted_reported.swap(true, Ordering::SeqCst) {
                    let attempts = attempts.to_string();
                    log_warn(
                        COMPONENT,
                        "Power cycle budget exhausted; waiting for the node to recover or an operator reset",
                        &[("node", self.node.as_str()), ("attempts", attempts.as_str())],
                    );
                    metrics::record_transition(&self.node, RecoveryTransition::Exhausted);
                }
                JobResult::Continue
            }
            Transition::Attempt { attempt } => {
                if cancellation.is_cancelled() {
                    return JobResult::Stop;
                }
                let attempt_label = attempt.to_string();
                log_info(
                    COMPONENT,
                    "Power cycle attempt due",
                    &[("node", self.node.as_str()), ("attempt", attempt_label.as_str())],
                );
                let outcome = execute_attempt(
                    &self.node,
                    self.context.credentials.as_ref(),
                    self.context.power.as_ref(),
                )
                .await;
                self.apply_outcome(outcome).await
            }
        }
    }

    async fn apply_outcome(&self, outcome: AttemptOutcome) -> JobResult {
        match outcome {
            AttemptOutcome::PowerCycled => {
                self.clear_skip();
                log_info(
                    COMPONENT,
                    "Power cycle accepted; deleting node so it can re-register",
                    &[("node", self.node.as_str())],
                );
                self.awaiting_delete.store(true, Ordering::SeqCst);
                self.delete_node().await
            }
            AttemptOutcome::TransientFailure(reason) => {
                self.clear_skip();
                match record_failed_attempt(
                    self.context.store.as_ref(),
                    self.context.clock.as_ref(),
                    &self.node,
                    &self.context.policy,
                )
                .await
                {
                    Ok(Some(state)) => {
                        let attempts = state.attempt_count.to_string();
                        let next = state.next_attempt_at.to_rfc3339();
                        log_warn(
                            COMPONENT,
                            "Power cycle attempt failed; backing off",
                            &[
                                ("node", self.node.as_str()),
                                ("attempts", attempts.as_str()),
                                ("next_attempt_at", next.as_str()),
                                ("error", reason.as_str()),
                            ],
                        );
                        metrics::record_transition(&self.node, RecoveryTransition::AttemptFailed);
                    }
                    Ok(None) => {
                        log_debug(
                            COMPONENT,
                            "Recovery state vanished before the failure could be recorded",
                            &[("node", self.node.as_str())],
                        );
                    }
                    Err(err) => {
                        let error = err.to_string();
                        log_error(
                            COMPONENT,
                            "Failed to record failed power cycle attempt",
                            &[
                                ("node", self.node.as_str()),
                                ("error", error.as_str()),
                                ("attempt_error", reason.as_str()),
                            ],
                        );
                    }
                }
                JobResult::Continue
            }
            AttemptOutcome::SkippedDueToState(state) => {
                let reason = format!("power state {state}");
                self.report_skip(
                    "Machine is not reporting powered on; skipping power cycle",
                    reason,
                );
                JobResult::Continue
            }
            AttemptOutcome::ConfigurationError(err) => {
                self.report_skip(
                    "No usable management controller credentials; skipping power cycle",
                    err.to_string(),
                );
                JobResult::Continue
            }
        }
    }

    async fn delete_node(&self) -> JobResult {
        match self.context.registry.delete_node(&self.node).await {
            Ok(()) => {
                log_info(
                    COMPONENT,
                    "Deleted node after power cycle",
                    &[("node", self.node.as_str())],
                );
                metrics::record_transition(&self.node, RecoveryTransition::NodeDeleted);
                JobResult::Stop
            }
            Err(err) => {
                let error = err.to_string();
                log_error(
                    COMPONENT,
                    "Failed to delete power cycled node; retrying next tick",
                    &[("node", self.node.as_str()), ("error", error.as_str())],
                );
                JobResult::Continue
            }
        }
    }

    async fn cancel(&self) -> JobResult {
        match clear_recovery(self.context.store.as_ref(), &self.node).await {
            Ok(()) => {
                log_info(
                    COMPONENT,
                    "Node is ready again; recovery cancelled",
                    &[("node", self.node.as_str())],
                );
                metrics::record_transition(&self.node, RecoveryTransition::Cancelled);
                JobResult::Stop
            }
            Err(err) if err.is_not_found() => JobResult::Stop,
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to clear recovery state; retrying next tick",
                    &[("node", self.node.as_str()), ("error", error.as_str())],
                );
                JobResult::Continue
            }
        }
    }

    /// Rewrites unreadable recovery annotations as a fresh schedule.
    async fn repair(&self, node: &Node, reason: &str, attempt_count: Option<u32>) -> JobResult {
        let policy = &self.context.policy;
        let attempts = attempt_count.unwrap_or(0).min(policy.max_attempts);
        let state = RecoveryState::new(
            super::schedule::add_duration(self.context.now(), policy.initial_timeout),
            attempts,
        );
        let count = attempts.to_string();
        log_warn(
            COMPONENT,
            "Recovery annotations are malformed; rescheduling",
            &[
                ("node", self.node.as_str()),
                ("reason", reason),
                ("attempts", count.as_str()),
            ],
        );
        let guard = node.metadata.resource_version.as_deref();
        if let Err(err) = self.context.store.set(&self.node, state, guard).await {
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Failed to rewrite recovery annotations; retrying next tick",
                &[("node", self.node.as_str()), ("error", error.as_str())],
            );
        }
        JobResult::Continue
    }

    /// Logs a skipped attempt at warn level the first time a reason shows up
    /// and at debug level while it repeats.
    fn report_skip(&self, message: &str, reason: String) {
        metrics::record_transition(&self.node, RecoveryTransition::AttemptSkipped);
        let mut last = self
            .last_skip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let metadata = [("node", self.node.as_str()), ("reason", reason.as_str())];
        if last.as_deref() == Some(reason.as_str()) {
            log_debug(COMPONENT, message, &metadata);
        } else {
            log_warn(COMPONENT, message, &metadata);
            *last = Some(reason);
        }
    }

    fn clear_skip(&self) {
        *self
            .last_skip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebooter::amt::{PowerError, PowerState};
    use crate::rebooter::controller::recovery::RecoveryPolicy;
    use crate::rebooter::controller::schedule::{
        REBOOT_ATTEMPTS_ANNOTATION, REBOOT_AT_ANNOTATION,
    };
    use crate::rebooter::inventory::CredentialError;
    use crate::rebooter::logger::{take_test_logs, test_log_lock, LogLevel};
    use crate::rebooter::test_support::{node_with_readiness, Harness, RegistryWrite};
    use std::time::Duration;

    fn live() -> CancellationToken {
        CancellationToken::new()
    }

    fn due_node(harness: &Harness, name: &str, attempts: u32) {
        let due = harness.now().timestamp().to_string();
        let count = attempts.to_string();
        harness.registry.insert_with_annotations(
            node_with_readiness(name, false),
            &[
                (REBOOT_AT_ANNOTATION, due.as_str()),
                (REBOOT_ATTEMPTS_ANNOTATION, count.as_str()),
            ],
        );
    }

    #[tokio::test]
    async fn failed_delete_is_retried_without_a_second_cycle() {
        let harness = Harness::new(&["worker-1"], RecoveryPolicy::default());
        due_node(&harness, "worker-1", 0);
        harness.registry.fail_next_deletes(1);
        let worker = RecoveryWorker::new("worker-1", harness.context.clone());
        let ctx = live();

        assert_eq!(worker.tick(&ctx).await, JobResult::Continue);
        assert_eq!(harness.power.cycle_calls(), 1);
        assert!(harness.registry.node("worker-1").is_some());

        assert_eq!(worker.tick(&ctx).await, JobResult::Stop);
        assert_eq!(harness.power.cycle_calls(), 1);
        assert!(harness.registry.node("worker-1").is_none());
        assert_eq!(
            harness.registry.writes_for("worker-1"),
            vec![RegistryWrite::Delete {
                node: "worker-1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn skipped_attempts_leave_state_untouched() {
        let _guard = test_log_lock().lock().await;
        let harness = Harness::new(&[], RecoveryPolicy::default());
        due_node(&harness, "worker-1", 1);
        let before = harness.registry.annotations("worker-1");
        let worker = RecoveryWorker::new("worker-1", harness.context.clone());
        let ctx = live();
        let _ = take_test_logs();

        assert_eq!(worker.tick(&ctx).await, JobResult::Continue);
        assert_eq!(worker.tick(&ctx).await, JobResult::Continue);
        assert_eq!(harness.power.status_calls(), 0);

        harness.credentials.set(
            "worker-1",
            Err(CredentialError::Incomplete {
                node: "worker-1".to_string(),
                missing: vec!["password"],
            }),
        );
        assert_eq!(worker.tick(&ctx).await, JobResult::Continue);

        harness.credentials.set(
            "worker-1",
            Ok(crate::rebooter::amt::BmcEndpoint::new("10.0.0.1", "admin", "pw")),
        );
        harness.power.push_status(Ok(PowerState::new("8")));
        assert_eq!(worker.tick(&ctx).await, JobResult::Continue);
        assert_eq!(harness.power.cycle_calls(), 0);

        assert_eq!(harness.registry.annotations("worker-1"), before);
        assert!(harness.registry.writes_for("worker-1").is_empty());

        let warnings = take_test_logs()
            .into_iter()
            .filter(|(level, line)| {
                *level == LogLevel::Warn
                    && line.contains("skipping power cycle")
                    && line.contains("node=worker-1")
            })
            .count();
        assert_eq!(warnings, 3, "repeated reasons are only warned once");
    }

    #[tokio::test]
    async fn status_query_failures_count_as_attempts() {
        let harness = Harness::new(&["worker-1"], RecoveryPolicy::default());
        due_node(&harness, "worker-1", 0);
        harness
            .power
            .push_status(Err(PowerError::Timeout(Duration::from_secs(10))));
        let worker = RecoveryWorker::new("worker-1", harness.context.clone());

        assert_eq!(worker.tick(&live()).await, JobResult::Continue);
        assert_eq!(harness.power.cycle_calls(), 0);
        assert_eq!(
            harness
                .registry
                .annotations("worker-1")
                .get(REBOOT_ATTEMPTS_ANNOTATION)
                .map(String::as_str),
            Some("1")
        );
    }

    #[tokio::test]
    async fn malformed_annotations_are_rescheduled() {
        let harness = Harness::new(&["worker-1"], RecoveryPolicy::default());
        harness.registry.insert_with_annotations(
            node_with_readiness("worker-1", false),
            &[
                (REBOOT_AT_ANNOTATION, "yesterday"),
                (REBOOT_ATTEMPTS_ANNOTATION, "2"),
            ],
        );
        let worker = RecoveryWorker::new("worker-1", harness.context.clone());

        assert_eq!(worker.tick(&live()).await, JobResult::Continue);
        assert_eq!(harness.power.cycle_calls(), 0);
        let record =
            RecoveryRecord::from_annotations(&harness.registry.annotations("worker-1"));
        let expected_at = harness.now() + chrono::Duration::seconds(300);
        assert_eq!(
            record,
            RecoveryRecord::Scheduled(RecoveryState::new(expected_at, 2))
        );
    }

    #[tokio::test]
    async fn ready_node_with_malformed_state_is_cleared() {
        let harness = Harness::new(&["worker-1"], RecoveryPolicy::default());
        harness.registry.insert_with_annotations(
            node_with_readiness("worker-1", true),
            &[(REBOOT_ATTEMPTS_ANNOTATION, "x")],
        );
        let worker = RecoveryWorker::new("worker-1", harness.context.clone());

        assert_eq!(worker.tick(&live()).await, JobResult::Stop);
        assert!(harness.registry.annotations("worker-1").is_empty());
    }

    #[tokio::test]
    async fn read_failures_keep_the_loop_alive() {
        let harness = Harness::new(&["worker-1"], RecoveryPolicy::default());
        due_node(&harness, "worker-1", 0);
        harness.registry.fail_next_gets(1);
        let worker = RecoveryWorker::new("worker-1", harness.context.clone());

        assert_eq!(worker.tick(&live()).await, JobResult::Continue);
        assert_eq!(harness.power.status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_stops_after_cancellation() {
        let policy = RecoveryPolicy {
            poll_interval: Duration::from_secs(1),
            ..RecoveryPolicy::default()
        };
        let harness = Harness::new(&["worker-1"], policy);
        let future = (harness.now() + chrono::Duration::seconds(600)).timestamp().to_string();
        harness.registry.insert_with_annotations(
            node_with_readiness("worker-1", false),
            &[(REBOOT_AT_ANNOTATION, future.as_str())],
        );
        let worker = RecoveryWorker::new("worker-1", harness.context.clone());
        let handle = worker.spawn(&Scheduler::global());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!handle.is_finished());
        handle.cancel();
        handle.join().await.expect("loop exits");

        harness.clock.advance(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.power.cycle_calls(), 0);
    }
}
