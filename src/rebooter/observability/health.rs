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

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::rebooter::util::truncate_message;

/// Liveness signals published by the node watcher and read by `/readyz`.
#[derive(Default)]
pub struct WatchHealth {
    connected: AtomicBool,
    active_loops: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

impl WatchHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn mark_disconnected(&self, error: impl ToString) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(truncate_message(&error.to_string()));
        }
    }

    pub fn set_active_loops(&self, count: usize) {
        self.active_loops.store(count, Ordering::SeqCst);
    }

    pub fn report(&self) -> HealthReport {
        let connected = self.connected.load(Ordering::SeqCst);
        HealthReport {
            status: if connected {
                HealthStatus::Ready
            } else {
                HealthStatus::Degraded
            },
            watch_connected: connected,
            active_loops: self.active_loops.load(Ordering::SeqCst),
            error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(rename = "watchConnected")]
    pub watch_connected: bool,
    #[serde(rename = "activeLoops")]
    pub active_loops: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_tracks_watch_connectivity() {
        let health = WatchHealth::new();
        assert!(!health.report().is_ready());

        health.mark_connected();
        health.set_active_loops(2);
        let report = health.report();
        assert!(report.is_ready());
        assert_eq!(report.active_loops, 2);
        assert!(report.error.is_none());

        health.mark_disconnected("watch stream closed");
        let report = health.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.error.as_deref(), Some("watch stream closed"));
    }
}
