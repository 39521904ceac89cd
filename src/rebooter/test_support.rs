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

//! In-process fakes for the controller's collaborators, shared by unit and
//! integration tests.

use chrono::{DateTime, Utc};
use futures_util::stream;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::rebooter::amt::{BmcEndpoint, PowerController, PowerError, PowerFuture, PowerState};
use crate::rebooter::controller::recovery::RecoveryPolicy;
use crate::rebooter::controller::{Clock, RecoveryContext};
use crate::rebooter::inventory::{CredentialError, CredentialProvider};
use crate::rebooter::k8s::node::{
    ListMeta, Node, NodeCondition, NodeList, WatchEvent, WatchEventType,
};
use crate::rebooter::k8s::{
    AnnotationPatch, NodeEventStream, NodeRegistry, RegistryError, RegistryFuture,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A mutation the in-memory registry accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryWrite {
    Patch { node: String, patch: AnnotationPatch },
    Delete { node: String },
}

impl RegistryWrite {
    pub fn node(&self) -> &str {
        match self {
            RegistryWrite::Patch { node, .. } | RegistryWrite::Delete { node } => node,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    nodes: BTreeMap<String, Node>,
    version: u64,
    writes: Vec<RegistryWrite>,
    failing_gets: u32,
    failing_deletes: u32,
    conflicting_patches: u32,
    watch_failures: VecDeque<u16>,
    watch_opens: Vec<Option<String>>,
}

impl RegistryState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Node registry with API-server-like resource versions. Guarded patches
/// fail with a conflict when the node changed since it was read.
pub struct InMemoryNodeRegistry {
    state: Mutex<RegistryState>,
    events: broadcast::Sender<WatchEvent<Node>>,
    closer: Mutex<CancellationToken>,
}

impl Default for InMemoryNodeRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(RegistryState::default()),
            events,
            closer: Mutex::new(CancellationToken::new()),
        }
    }
}

impl InMemoryNodeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates or replaces a node, keeping the stored name.
    pub fn insert(&self, mut node: Node) {
        let mut state = lock(&self.state);
        let name = node.name().unwrap_or_default().to_string();
        let existed = state.nodes.contains_key(&name);
        node.metadata.resource_version = Some(state.next_version());
        state.nodes.insert(name, node.clone());
        let event_type = if existed {
            WatchEventType::Modified
        } else {
            WatchEventType::Added
        };
        let _ = self.events.send(WatchEvent::new(event_type, node));
    }

    pub fn insert_with_annotations(&self, mut node: Node, annotations: &[(&str, &str)]) {
        for (key, value) in annotations {
            node.metadata
                .annotations
                .insert(key.to_string(), value.to_string());
        }
        self.insert(node);
    }

    /// Replaces the node's conditions as a kubelet status update would.
    pub fn set_conditions(&self, name: &str, conditions: Option<Vec<NodeCondition>>) {
        let current = lock(&self.state).nodes.get(name).cloned();
        if let Some(mut node) = current {
            node.status.get_or_insert_with(Default::default).conditions = conditions;
            self.insert(node);
        }
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        let status = if ready { "True" } else { "Unknown" };
        self.set_conditions(name, Some(vec![NodeCondition::new("Ready", status)]));
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        lock(&self.state).nodes.get(name).cloned()
    }

    pub fn annotations(&self, name: &str) -> HashMap<String, String> {
        self.node(name)
            .map(|node| node.metadata.annotations)
            .unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<RegistryWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn writes_for(&self, name: &str) -> Vec<RegistryWrite> {
        self.writes()
            .into_iter()
            .filter(|write| write.node() == name)
            .collect()
    }

    pub fn watch_opens(&self) -> Vec<Option<String>> {
        lock(&self.state).watch_opens.clone()
    }

    pub fn fail_next_gets(&self, count: u32) {
        lock(&self.state).failing_gets = count;
    }

    pub fn fail_next_deletes(&self, count: u32) {
        lock(&self.state).failing_deletes = count;
    }

    /// Makes the next `count` guarded patches lose a race with another writer.
    pub fn conflict_next_patches(&self, count: u32) {
        lock(&self.state).conflicting_patches = count;
    }

    /// Queues an error status for the next watch request.
    pub fn fail_next_watch(&self, status: u16) {
        lock(&self.state).watch_failures.push_back(status);
    }

    /// Ends every open watch stream, as the server does when a window expires.
    pub fn close_watches(&self) {
        let mut closer = lock(&self.closer);
        closer.cancel();
        *closer = CancellationToken::new();
    }

    fn get_sync(&self, name: &str) -> Result<Option<Node>, RegistryError> {
        let mut state = lock(&self.state);
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(RegistryError::from_status(503, "injected read failure"));
        }
        Ok(state.nodes.get(name).cloned())
    }

    fn patch_sync(&self, name: &str, patch: &AnnotationPatch) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        let Some(current) = state.nodes.get(name).cloned() else {
            return Err(RegistryError::from_status(
                404,
                format!("nodes \"{name}\" not found"),
            ));
        };
        if let Some(expected) = patch.resource_version() {
            if state.conflicting_patches > 0 {
                state.conflicting_patches -= 1;
                let mut node = current;
                node.metadata.resource_version = Some(state.next_version());
                state.nodes.insert(name.to_string(), node);
                return Err(RegistryError::from_status(409, "injected conflict"));
            }
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(RegistryError::from_status(
                    409,
                    "the object has been modified",
                ));
            }
        }

        let mut node = current;
        patch.apply_to(&mut node.metadata.annotations);
        node.metadata.resource_version = Some(state.next_version());
        state.nodes.insert(name.to_string(), node.clone());
        state.writes.push(RegistryWrite::Patch {
            node: name.to_string(),
            patch: patch.clone(),
        });
        drop(state);
        let _ = self
            .events
            .send(WatchEvent::new(WatchEventType::Modified, node));
        Ok(())
    }

    fn delete_sync(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(RegistryError::from_status(503, "injected delete failure"));
        }
        let removed = state.nodes.remove(name);
        if removed.is_some() {
            state.writes.push(RegistryWrite::Delete {
                node: name.to_string(),
            });
        }
        drop(state);
        if let Some(node) = removed {
            let _ = self
                .events
                .send(WatchEvent::new(WatchEventType::Deleted, node));
        }
        Ok(())
    }

    fn list_sync(&self) -> NodeList {
        let state = lock(&self.state);
        NodeList {
            metadata: ListMeta {
                resource_version: Some(state.version.to_string()),
            },
            items: state.nodes.values().cloned().collect(),
        }
    }

    fn watch_sync(&self, resource_version: Option<String>) -> Result<NodeEventStream, RegistryError> {
        let mut state = lock(&self.state);
        state.watch_opens.push(resource_version);
        if let Some(status) = state.watch_failures.pop_front() {
            return Err(RegistryError::from_status(status, "injected watch failure"));
        }
        let receiver = self.events.subscribe();
        drop(state);
        let closed = lock(&self.closer).clone();
        let events = stream::unfold((receiver, closed), |(mut receiver, closed)| async move {
            loop {
                let received = tokio::select! {
                    _ = closed.cancelled() => return None,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(event) => return Some((Ok(event), (receiver, closed))),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(events))
    }
}

impl NodeRegistry for InMemoryNodeRegistry {
    fn get_node<'a>(&'a self, name: &'a str) -> RegistryFuture<'a, Option<Node>> {
        Box::pin(async move { self.get_sync(name) })
    }

    fn list_nodes(&self) -> RegistryFuture<'_, NodeList> {
        Box::pin(async move { Ok(self.list_sync()) })
    }

    fn watch_nodes(&self, resource_version: Option<String>) -> RegistryFuture<'_, NodeEventStream> {
        Box::pin(async move { self.watch_sync(resource_version) })
    }

    fn patch_annotations<'a>(
        &'a self,
        name: &'a str,
        patch: &'a AnnotationPatch,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(async move { self.patch_sync(name, patch) })
    }

    fn delete_node<'a>(&'a self, name: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(async move { self.delete_sync(name) })
    }
}

/// Power controller returning queued results. Once a queue is empty the
/// machine reports powered on and accepts power cycles.
#[derive(Default)]
pub struct ScriptedPowerController {
    statuses: Mutex<VecDeque<Result<PowerState, PowerError>>>,
    cycles: Mutex<VecDeque<Result<(), PowerError>>>,
    status_calls: AtomicUsize,
    cycle_calls: AtomicUsize,
    cycle_delay: Mutex<Option<Duration>>,
}

impl ScriptedPowerController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_status(&self, result: Result<PowerState, PowerError>) {
        lock(&self.statuses).push_back(result);
    }

    pub fn push_cycle(&self, result: Result<(), PowerError>) {
        lock(&self.cycles).push_back(result);
    }

    /// Makes every power cycle take `delay` before answering.
    pub fn delay_cycles(&self, delay: Duration) {
        *lock(&self.cycle_delay) = Some(delay);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cycle_calls(&self) -> usize {
        self.cycle_calls.load(Ordering::SeqCst)
    }
}

impl PowerController for ScriptedPowerController {
    fn power_status<'a>(&'a self, _endpoint: &'a BmcEndpoint) -> PowerFuture<'a, PowerState> {
        Box::pin(async move {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.statuses)
                .pop_front()
                .unwrap_or_else(|| Ok(PowerState::new("2")))
        })
    }

    fn power_cycle<'a>(&'a self, _endpoint: &'a BmcEndpoint) -> PowerFuture<'a, ()> {
        Box::pin(async move {
            self.cycle_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *lock(&self.cycle_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let result = lock(&self.cycles).pop_front();
            result.unwrap_or(Ok(()))
        })
    }
}

/// Credential provider with a fixed, editable table.
#[derive(Default)]
pub struct StaticCredentials {
    entries: Mutex<HashMap<String, Result<BmcEndpoint, CredentialError>>>,
}

impl StaticCredentials {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a complete endpoint for every listed node.
    pub fn for_nodes(nodes: &[&str]) -> Arc<Self> {
        let credentials = Self::default();
        for (index, node) in nodes.iter().enumerate() {
            credentials.set(
                node,
                Ok(BmcEndpoint::new(format!("10.0.0.{}", index + 10), "admin", "secret")),
            );
        }
        Arc::new(credentials)
    }

    pub fn set(&self, node: &str, entry: Result<BmcEndpoint, CredentialError>) {
        lock(&self.entries).insert(node.to_string(), entry);
    }

    pub fn remove(&self, node: &str) {
        lock(&self.entries).remove(node);
    }
}

impl CredentialProvider for StaticCredentials {
    fn lookup(&self, node: &str) -> Result<BmcEndpoint, CredentialError> {
        lock(&self.entries)
            .get(node)
            .cloned()
            .unwrap_or_else(|| {
                Err(CredentialError::NotConfigured {
                    node: node.to_string(),
                })
            })
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn at_epoch_seconds(seconds: i64) -> Arc<Self> {
        Self::new(DateTime::from_timestamp(seconds, 0).unwrap_or_default())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now = crate::rebooter::controller::schedule::add_duration(*now, by);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *lock(&self.now) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// Fakes wired into a [`RecoveryContext`].
pub struct Harness {
    pub registry: Arc<InMemoryNodeRegistry>,
    pub power: Arc<ScriptedPowerController>,
    pub credentials: Arc<StaticCredentials>,
    pub clock: Arc<ManualClock>,
    pub context: Arc<RecoveryContext>,
}

impl Harness {
    pub fn new(nodes: &[&str], policy: RecoveryPolicy) -> Self {
        let registry = InMemoryNodeRegistry::new();
        let power = ScriptedPowerController::new();
        let credentials = StaticCredentials::for_nodes(nodes);
        let clock = ManualClock::at_epoch_seconds(1_700_000_000);
        let context = Arc::new(RecoveryContext::new(
            registry.clone(),
            power.clone(),
            credentials.clone(),
            policy,
            clock.clone(),
        ));
        Self {
            registry,
            power,
            credentials,
            clock,
            context,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// A node reporting a single `Ready` condition.
pub fn node_with_readiness(name: &str, ready: bool) -> Node {
    let status = if ready { "True" } else { "Unknown" };
    Node::new(name, Some(vec![NodeCondition::new("Ready", status)]))
}
