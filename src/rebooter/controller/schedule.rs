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

//! Persisted recovery state.
//!
//! A node's recovery schedule lives in two annotations on the node object so
//! that any controller replica, including one started after a crash, sees the
//! same state.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::recovery::RecoveryPolicy;
use super::Clock;
use crate::rebooter::k8s::{AnnotationPatch, NodeRegistry, RegistryError};

pub const REBOOT_AT_ANNOTATION: &str = "me.danielhall.amt-rebooter/reboot-at";
pub const REBOOT_ATTEMPTS_ANNOTATION: &str = "me.danielhall.amt-rebooter/reboot-attempts";

/// Guarded read-increment-write cycles attempted before giving up on a
/// contended node.
const MAX_CONFLICT_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryState {
    pub next_attempt_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl RecoveryState {
    /// Timestamps are persisted with whole-second precision; sub-second
    /// values round up so an attempt never becomes due early.
    pub fn new(next_attempt_at: DateTime<Utc>, attempt_count: u32) -> Self {
        let seconds = if next_attempt_at.timestamp_subsec_nanos() > 0 {
            next_attempt_at.timestamp().saturating_add(1)
        } else {
            next_attempt_at.timestamp()
        };
        Self {
            next_attempt_at: DateTime::from_timestamp(seconds, 0).unwrap_or(next_attempt_at),
            attempt_count,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_attempt_at
    }

    pub fn to_patch(&self) -> AnnotationPatch {
        AnnotationPatch::new()
            .set(
                REBOOT_AT_ANNOTATION,
                self.next_attempt_at.timestamp().to_string(),
            )
            .set(REBOOT_ATTEMPTS_ANNOTATION, self.attempt_count.to_string())
    }

    pub fn clear_patch() -> AnnotationPatch {
        AnnotationPatch::new()
            .remove(REBOOT_AT_ANNOTATION)
            .remove(REBOOT_ATTEMPTS_ANNOTATION)
    }
}

/// Recovery annotations that cannot be interpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedState {
    pub reason: String,
    /// The attempt count, when it was still readable.
    pub attempt_count: Option<u32>,
}

/// What a node's annotations say about its recovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryRecord {
    Absent,
    Scheduled(RecoveryState),
    Malformed(MalformedState),
}

impl RecoveryRecord {
    pub fn from_annotations(annotations: &HashMap<String, String>) -> Self {
        let reboot_at = annotations.get(REBOOT_AT_ANNOTATION).map(|v| v.trim());
        let attempts = annotations
            .get(REBOOT_ATTEMPTS_ANNOTATION)
            .map(|v| v.trim());

        let attempt_count = match attempts {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u32>()
                .map(Some)
                .map_err(|_| format!("attempt count '{raw}' is not a non-negative integer")),
        };

        match (reboot_at, attempt_count) {
            (None, Ok(None)) => RecoveryRecord::Absent,
            (None, Ok(Some(count))) => RecoveryRecord::Malformed(MalformedState {
                reason: "attempt count present without a reboot time".to_string(),
                attempt_count: Some(count),
            }),
            (_, Err(reason)) => RecoveryRecord::Malformed(MalformedState {
                reason,
                attempt_count: None,
            }),
            (Some(raw), Ok(count)) => match parse_timestamp(raw) {
                Some(next_attempt_at) => RecoveryRecord::Scheduled(RecoveryState::new(
                    next_attempt_at,
                    count.unwrap_or(0),
                )),
                None => RecoveryRecord::Malformed(MalformedState {
                    reason: format!("reboot time '{raw}' is not a unix timestamp"),
                    attempt_count: count,
                }),
            },
        }
    }

    pub fn state(&self) -> Option<&RecoveryState> {
        match self {
            RecoveryRecord::Scheduled(state) => Some(state),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, RecoveryRecord::Absent)
    }
}

/// Accepts integer or fractional epoch seconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(seconds) = raw.parse::<i64>() {
        return DateTime::from_timestamp(seconds, 0);
    }
    let value = raw.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 || value > i64::MAX as f64 {
        return None;
    }
    let seconds = value.trunc();
    let nanos = ((value - seconds) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(seconds as i64, nanos)
}

/// Recovery record together with the object version it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecovery {
    pub record: RecoveryRecord,
    pub resource_version: Option<String>,
}

#[derive(Debug)]
pub enum StoreError {
    Registry(RegistryError),
    /// Every guarded write lost a race with another writer.
    Contended { attempts: u32 },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Registry(RegistryError::NotFound(_)))
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Registry(err) => err.is_conflict(),
            StoreError::Contended { .. } => true,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Registry(err) => write!(f, "{err}"),
            StoreError::Contended { attempts } => {
                write!(f, "recovery state changed concurrently {attempts} times in a row")
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Registry(err) => Some(err),
            StoreError::Contended { .. } => None,
        }
    }
}

impl From<RegistryError> for StoreError {
    fn from(err: RegistryError) -> Self {
        StoreError::Registry(err)
    }
}

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, StoreError>>;

/// Read and write access to a node's recovery state.
pub trait ScheduleStore: Send + Sync {
    /// `Ok(None)` when the node no longer exists.
    fn get<'a>(&'a self, node: &'a str) -> StoreFuture<'a, Option<StoredRecovery>>;

    /// Writes both fields in one patch. With `guard` set the write only
    /// succeeds if the node is still at that resource version.
    fn set<'a>(
        &'a self,
        node: &'a str,
        state: RecoveryState,
        guard: Option<&'a str>,
    ) -> StoreFuture<'a, ()>;

    fn clear<'a>(&'a self, node: &'a str) -> StoreFuture<'a, ()>;
}

/// [`ScheduleStore`] backed by node annotations.
pub struct AnnotationScheduleStore {
    registry: Arc<dyn NodeRegistry>,
}

impl AnnotationScheduleStore {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self { registry }
    }
}

impl ScheduleStore for AnnotationScheduleStore {
    fn get<'a>(&'a self, node: &'a str) -> StoreFuture<'a, Option<StoredRecovery>> {
        Box::pin(async move {
            let Some(object) = self.registry.get_node(node).await? else {
                return Ok(None);
            };
            Ok(Some(StoredRecovery {
                record: RecoveryRecord::from_annotations(&object.metadata.annotations),
                resource_version: object.metadata.resource_version,
            }))
        })
    }

    fn set<'a>(
        &'a self,
        node: &'a str,
        state: RecoveryState,
        guard: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let patch = state.to_patch().guarded_by(guard);
            self.registry.patch_annotations(node, &patch).await?;
            Ok(())
        })
    }

    fn clear<'a>(&'a self, node: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let patch = RecoveryState::clear_patch();
            self.registry.patch_annotations(node, &patch).await?;
            Ok(())
        })
    }
}

/// Starts a fresh recovery: due after `delay`, no attempts yet.
///
/// `observed_version` is the resource version the caller saw the node
/// without recovery state. The write fails with a conflict if the node has
/// changed since, so a stale observation never resets a running recovery.
pub async fn schedule_recovery(
    store: &dyn ScheduleStore,
    clock: &dyn Clock,
    node: &str,
    delay: Duration,
    observed_version: Option<&str>,
) -> Result<RecoveryState, StoreError> {
    let state = RecoveryState::new(add_duration(clock.now(), delay), 0);
    store.set(node, state, observed_version).await?;
    Ok(state)
}

pub async fn clear_recovery(store: &dyn ScheduleStore, node: &str) -> Result<(), StoreError> {
    store.clear(node).await
}

/// Counts one failed attempt and pushes the next attempt out by the backoff
/// for the new count.
///
/// Reads the current state and writes the increment guarded by the read
/// version, retrying on conflict. Returns `Ok(None)` when the node or its
/// recovery state disappeared in the meantime, in which case nothing is
/// written.
pub async fn record_failed_attempt(
    store: &dyn ScheduleStore,
    clock: &dyn Clock,
    node: &str,
    policy: &RecoveryPolicy,
) -> Result<Option<RecoveryState>, StoreError> {
    for _ in 0..MAX_CONFLICT_RETRIES {
        let Some(stored) = store.get(node).await? else {
            return Ok(None);
        };
        let (previous_count, previous_at) = match &stored.record {
            RecoveryRecord::Absent => return Ok(None),
            RecoveryRecord::Scheduled(state) => (state.attempt_count, Some(state.next_attempt_at)),
            RecoveryRecord::Malformed(malformed) => (malformed.attempt_count.unwrap_or(0), None),
        };

        let attempt_count = previous_count.saturating_add(1).min(policy.max_attempts);
        let computed = add_duration(clock.now(), policy.backoff_delay(attempt_count));
        let next_attempt_at = previous_at.map_or(computed, |previous| computed.max(previous));
        let state = RecoveryState::new(next_attempt_at, attempt_count);

        match store
            .set(node, state, stored.resource_version.as_deref())
            .await
        {
            Ok(()) => return Ok(Some(state)),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::Contended {
        attempts: MAX_CONFLICT_RETRIES,
    })
}

pub(crate) fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
