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

//! Node recovery controller.
//!
//! The [`watch::NodeWatcher`] turns readiness edges into persisted recovery
//! schedules and owns one [`worker::RecoveryWorker`] per node that is pending
//! a reboot. Workers decide what to do from the live node object alone, using
//! the pure state machine in [`recovery`].

pub mod readiness;
pub mod recovery;
pub mod schedule;
pub mod watch;
pub mod worker;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::rebooter::amt::PowerController;
use crate::rebooter::inventory::CredentialProvider;
use crate::rebooter::k8s::NodeRegistry;
use recovery::RecoveryPolicy;
use schedule::{AnnotationScheduleStore, ScheduleStore};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Collaborators shared by the watcher and every recovery loop.
#[derive(Clone)]
pub struct RecoveryContext {
    pub registry: Arc<dyn NodeRegistry>,
    pub store: Arc<dyn ScheduleStore>,
    pub power: Arc<dyn PowerController>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub policy: RecoveryPolicy,
    pub clock: Arc<dyn Clock>,
}

impl RecoveryContext {
    /// Builds a context whose schedule store writes node annotations through
    /// `registry`.
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        power: Arc<dyn PowerController>,
        credentials: Arc<dyn CredentialProvider>,
        policy: RecoveryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(AnnotationScheduleStore::new(registry.clone()));
        Self {
            registry,
            store,
            power,
            credentials,
            policy,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
