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

//! Watch-driven readiness edge handling.

use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::readiness::node_is_ready;
use super::recovery::{decide, Transition};
use super::schedule::{clear_recovery, schedule_recovery, RecoveryRecord};
use super::worker::RecoveryWorker;
use super::RecoveryContext;
use crate::rebooter::k8s::node::{Node, WatchEvent, WatchEventType};
use crate::rebooter::k8s::RegistryError;
use crate::rebooter::logger::{log_debug, log_info, log_warn};
use crate::rebooter::observability::health::WatchHealth;
use crate::rebooter::observability::metrics::{self, RecoveryTransition};
use crate::rebooter::observability::tracing::with_span;
use crate::rebooter::scheduler::{ScheduledTaskHandle, Scheduler};

const COMPONENT: &str = "watcher";
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Applies readiness edges from the node watch and owns the recovery loops.
///
/// Events are handled one at a time in arrival order. The loop registry is
/// only touched from here, so at most one loop runs per node.
pub struct NodeWatcher {
    context: Arc<RecoveryContext>,
    scheduler: Scheduler,
    loops: HashMap<String, ScheduledTaskHandle>,
    health: Arc<WatchHealth>,
}

impl NodeWatcher {
    pub fn new(context: Arc<RecoveryContext>, scheduler: Scheduler, health: Arc<WatchHealth>) -> Self {
        Self {
            context,
            scheduler,
            loops: HashMap::new(),
            health,
        }
    }

    pub fn active_loops(&self) -> usize {
        self.loops.len()
    }

    pub fn has_loop(&self, node: &str) -> bool {
        self.loops.contains_key(node)
    }

    pub async fn handle_event(&mut self, event: WatchEvent<Node>) {
        let Some(name) = event.object.name().map(str::to_string) else {
            log_debug(COMPONENT, "Ignoring watch event for unnamed node", &[]);
            return;
        };

        match event.event_type {
            WatchEventType::Bookmark => {}
            WatchEventType::Deleted => {
                if self.retire(&name) {
                    log_info(
                        COMPONENT,
                        "Node deleted; stopped recovery loop",
                        &[("node", name.as_str())],
                    );
                }
            }
            WatchEventType::Added | WatchEventType::Modified => {
                self.apply_readiness(&name, &event.object).await;
            }
        }
        self.publish_loop_count();
    }

    async fn apply_readiness(&mut self, name: &str, node: &Node) {
        let ready = node_is_ready(node);
        let record = RecoveryRecord::from_annotations(&node.metadata.annotations);
        let now = self.context.now();

        match decide(ready, record.state(), now, &self.context.policy) {
            Transition::Cancel => self.cancel_recovery(name).await,
            Transition::None if !record.is_absent() => self.cancel_recovery(name).await,
            Transition::None => {
                self.retire(name);
            }
            Transition::Schedule { delay } if record.is_absent() => {
                match schedule_recovery(
                    self.context.store.as_ref(),
                    self.context.clock.as_ref(),
                    name,
                    delay,
                    node.metadata.resource_version.as_deref(),
                )
                .await
                {
                    Ok(state) => {
                        let due = state.next_attempt_at.to_rfc3339();
                        log_info(
                            COMPONENT,
                            "Node went offline; power cycle scheduled",
                            &[("node", name), ("next_attempt_at", due.as_str())],
                        );
                        metrics::record_transition(name, RecoveryTransition::Scheduled);
                        self.ensure_loop(name);
                    }
                    // Someone wrote the node after this event; the loop
                    // works from the current annotations.
                    Err(err) if err.is_conflict() => {
                        log_debug(
                            COMPONENT,
                            "Node changed since offline event; not rescheduling",
                            &[("node", name)],
                        );
                        self.ensure_loop(name);
                    }
                    Err(err) => {
                        let error = err.to_string();
                        log_warn(
                            COMPONENT,
                            "Failed to schedule recovery for offline node",
                            &[("node", name), ("error", error.as_str())],
                        );
                    }
                }
            }
            // Malformed records are repaired by the loop itself.
            Transition::Schedule { .. }
            | Transition::Wait { .. }
            | Transition::Attempt { .. }
            | Transition::Exhausted { .. } => self.ensure_loop(name),
        }
    }

    async fn cancel_recovery(&mut self, name: &str) {
        self.retire(name);
        match clear_recovery(self.context.store.as_ref(), name).await {
            Ok(()) => {
                log_info(
                    COMPONENT,
                    "Node came back online; recovery cancelled",
                    &[("node", name)],
                );
                metrics::record_transition(name, RecoveryTransition::Cancelled);
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to clear recovery state for ready node",
                    &[("node", name), ("error", error.as_str())],
                );
            }
        }
    }

    /// Starts a loop for `name` unless one is already running.
    fn ensure_loop(&mut self, name: &str) {
        if let Some(handle) = self.loops.get(name) {
            if !handle.is_finished() {
                return;
            }
        }
        let worker = RecoveryWorker::new(name, self.context.clone());
        let handle = worker.spawn(&self.scheduler);
        log_debug(COMPONENT, "Started recovery loop", &[("node", name)]);
        self.loops.insert(name.to_string(), handle);
    }

    /// Cancels the loop for `name`. An in-flight power action completes.
    fn retire(&mut self, name: &str) -> bool {
        match self.loops.remove(name) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    fn prune(&mut self, present: &HashSet<String>) {
        let stale: Vec<String> = self
            .loops
            .keys()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.retire(&name);
        }
    }

    fn publish_loop_count(&mut self) {
        self.loops.retain(|_, handle| !handle.is_finished());
        let count = self.loops.len();
        metrics::set_active_loops(count);
        self.health.set_active_loops(count);
    }

    /// Lists nodes and processes them as `ADDED` events so loops resume after
    /// a restart. Returns the list's resource version.
    async fn resync(&mut self) -> Result<Option<String>, RegistryError> {
        let list = self.context.registry.list_nodes().await?;
        let present: HashSet<String> = list
            .items
            .iter()
            .filter_map(|node| node.name().map(str::to_string))
            .collect();
        self.prune(&present);
        for node in list.items {
            let span = format!("resync {}", node.name().unwrap_or_default());
            with_span(
                COMPONENT,
                span,
                self.handle_event(WatchEvent::new(WatchEventType::Added, node)),
            )
            .await;
        }
        self.publish_loop_count();
        Ok(list.metadata.resource_version)
    }

    /// Lists then watches nodes until `shutdown` fires, reconnecting with
    /// capped exponential backoff. A closed watch window or an expired
    /// resource version triggers a fresh list.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
        let mut resource_version: Option<String> = None;
        let mut listed = false;

        while !shutdown.is_cancelled() {
            if !listed {
                match self.resync().await {
                    Ok(version) => {
                        resource_version = version;
                        listed = true;
                    }
                    Err(err) => {
                        self.connection_lost("list_failed", &err);
                        if !self.pause(&shutdown, &mut backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let mut stream = match self.context.registry.watch_nodes(resource_version.clone()).await {
                Ok(stream) => stream,
                Err(RegistryError::Gone(_)) => {
                    metrics::record_watch_restart("expired");
                    listed = false;
                    continue;
                }
                Err(err) => {
                    self.connection_lost("watch_failed", &err);
                    if !self.pause(&shutdown, &mut backoff).await {
                        break;
                    }
                    continue;
                }
            };
            self.health.mark_connected();

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                        if let Some(version) = event.object.metadata.resource_version.clone() {
                            resource_version = Some(version);
                        }
                        let span = format!(
                            "{:?} {}",
                            event.event_type,
                            event.object.name().unwrap_or_default()
                        );
                        with_span(COMPONENT, span, self.handle_event(event)).await;
                    }
                    Some(Err(RegistryError::Gone(_))) => {
                        log_debug(COMPONENT, "Watch resource version expired; relisting", &[]);
                        metrics::record_watch_restart("expired");
                        listed = false;
                        break;
                    }
                    Some(Err(err)) => {
                        self.connection_lost("stream_failed", &err);
                        self.pause(&shutdown, &mut backoff).await;
                        break;
                    }
                    None => {
                        // Each watch window ends with a full relist so
                        // missed edges are repaired.
                        metrics::record_watch_restart("window_closed");
                        listed = false;
                        break;
                    }
                }
            }
        }

        self.shutdown_loops().await;
    }

    fn connection_lost(&self, cause: &str, err: &RegistryError) {
        let error = err.to_string();
        log_warn(
            COMPONENT,
            "Node watch interrupted; reconnecting",
            &[("cause", cause), ("error", error.as_str())],
        );
        metrics::record_watch_restart(cause);
        self.health.mark_disconnected(error);
    }

    /// Sleeps for the current backoff and doubles it. Returns `false` when
    /// shutdown was requested instead.
    async fn pause(&self, shutdown: &CancellationToken, backoff: &mut Duration) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = sleep(*backoff) => {}
        }
        let next = *backoff * 2;
        *backoff = if next > Duration::from_millis(BACKOFF_MAX_MS) {
            Duration::from_millis(BACKOFF_MAX_MS)
        } else {
            next
        };
        true
    }

    /// Cancels every loop and waits for in-flight ticks to finish.
    pub async fn shutdown_loops(&mut self) {
        let handles: Vec<(String, ScheduledTaskHandle)> = self.loops.drain().collect();
        for (_, handle) in &handles {
            handle.cancel();
        }
        for (name, handle) in handles {
            if let Err(err) = handle.join().await {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Recovery loop ended abnormally",
                    &[("node", name.as_str()), ("error", error.as_str())],
                );
            }
        }
        self.publish_loop_count();
        self.health.mark_disconnected("shutting down");
    }
}
