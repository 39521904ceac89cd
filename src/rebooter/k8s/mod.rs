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

//! Control-plane access for Node objects.
//!
//! [`NodeRegistry`] is the seam between the recovery controller and the
//! cluster API. The production implementation is [`client::KubeClient`];
//! tests use the in-memory registry from `test_support`.

pub mod client;
pub mod node;
pub mod watch_stream;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::fmt;

use node::{Node, NodeList, WatchEvent};

pub type RegistryFuture<'a, T> = BoxFuture<'a, Result<T, RegistryError>>;
pub type NodeEventStream = BoxStream<'static, Result<WatchEvent<Node>, RegistryError>>;

/// Watch, patch and delete primitives against cluster Node objects.
///
/// Implementations are stateless per call and shared across every recovery
/// loop behind an `Arc`.
pub trait NodeRegistry: Send + Sync {
    /// Fetches the live node. `Ok(None)` means the node does not exist.
    fn get_node<'a>(&'a self, name: &'a str) -> RegistryFuture<'a, Option<Node>>;

    fn list_nodes(&self) -> RegistryFuture<'_, NodeList>;

    /// Opens a watch starting after `resource_version`. The stream ends when
    /// the server closes the watch window.
    fn watch_nodes(&self, resource_version: Option<String>) -> RegistryFuture<'_, NodeEventStream>;

    fn patch_annotations<'a>(
        &'a self,
        name: &'a str,
        patch: &'a AnnotationPatch,
    ) -> RegistryFuture<'a, ()>;

    /// Deletes the node. Deleting a node that is already gone succeeds.
    fn delete_node<'a>(&'a self, name: &'a str) -> RegistryFuture<'a, ()>;
}

/// A single atomic change to a node's annotations.
///
/// When guarded by a resource version the write only lands if the object has
/// not changed since it was read; otherwise it is last-writer-wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationPatch {
    set: BTreeMap<String, String>,
    remove: BTreeSet<String>,
    resource_version: Option<String>,
}

impl AnnotationPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.remove.remove(&key);
        self.set.insert(key, value.into());
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.set.remove(&key);
        self.remove.insert(key);
        self
    }

    pub fn guarded_by(mut self, resource_version: Option<&str>) -> Self {
        self.resource_version = resource_version.map(str::to_string);
        self
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    /// Renders the patch as a JSON merge patch body. Removals become `null`.
    pub fn to_merge_patch(&self) -> Value {
        let mut annotations = Map::new();
        for (key, value) in &self.set {
            annotations.insert(key.clone(), Value::String(value.clone()));
        }
        for key in &self.remove {
            annotations.insert(key.clone(), Value::Null);
        }

        let mut metadata = Map::new();
        metadata.insert("annotations".to_string(), Value::Object(annotations));
        if let Some(version) = &self.resource_version {
            metadata.insert("resourceVersion".to_string(), Value::String(version.clone()));
        }

        let mut body = Map::new();
        body.insert("metadata".to_string(), Value::Object(metadata));
        Value::Object(body)
    }

    /// Applies the patch to an in-memory annotation map.
    pub fn apply_to(&self, annotations: &mut HashMap<String, String>) {
        for key in &self.remove {
            annotations.remove(key);
        }
        for (key, value) in &self.set {
            annotations.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Debug)]
pub enum RegistryError {
    /// The target object does not exist.
    NotFound(String),
    /// An optimistic-concurrency precondition failed.
    Conflict(String),
    /// The requested resource version is too old to resume a watch from.
    Gone(String),
    /// Any other non-success response.
    Status { status: u16, message: String },
    Transport(Box<dyn Error + Send + Sync>),
    Decode(String),
}

impl RegistryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict(_))
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => RegistryError::NotFound(message),
            409 | 422 => RegistryError::Conflict(message),
            410 => RegistryError::Gone(message),
            _ => RegistryError::Status { status, message },
        }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound(message) => write!(f, "node not found: {message}"),
            RegistryError::Conflict(message) => write!(f, "write conflict: {message}"),
            RegistryError::Gone(message) => write!(f, "resource version expired: {message}"),
            RegistryError::Status { status, message } => {
                write!(f, "control plane returned {status}: {message}")
            }
            RegistryError::Transport(err) => write!(f, "control plane unreachable: {err}"),
            RegistryError::Decode(message) => write!(f, "malformed control plane response: {message}"),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RegistryError::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_sets_and_nulls_annotations() {
        let patch = AnnotationPatch::new()
            .set("example.com/a", "1")
            .remove("example.com/b")
            .guarded_by(Some("17"));

        assert_eq!(
            patch.to_merge_patch(),
            json!({
                "metadata": {
                    "annotations": {"example.com/a": "1", "example.com/b": null},
                    "resourceVersion": "17"
                }
            })
        );
    }

    #[test]
    fn later_operations_override_earlier_ones_for_the_same_key() {
        let patch = AnnotationPatch::new().set("k", "v").remove("k");
        let mut annotations = HashMap::from([("k".to_string(), "old".to_string())]);
        patch.apply_to(&mut annotations);
        assert!(annotations.is_empty());
        assert!(!patch.is_empty());
        assert!(AnnotationPatch::new().is_empty());
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(RegistryError::from_status(409, "").is_conflict());
        assert!(RegistryError::from_status(422, "").is_conflict());
        assert!(matches!(RegistryError::from_status(410, ""), RegistryError::Gone(_)));
        assert!(matches!(RegistryError::from_status(404, ""), RegistryError::NotFound(_)));
        assert!(matches!(
            RegistryError::from_status(503, "busy"),
            RegistryError::Status { status: 503, .. }
        ));
    }
}
