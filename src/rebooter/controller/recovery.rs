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

//! The per-node recovery state machine.
//!
//! [`decide`] and [`phase`] are pure: given a readiness verdict, the persisted
//! [`RecoveryState`] and the current time they say what should happen next.
//! Side effects live in the worker.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use super::schedule::RecoveryState;
use crate::rebooter::amt::{PowerController, PowerState};
use crate::rebooter::inventory::{CredentialError, CredentialProvider};
use crate::rebooter::logger::{log_info, log_warn};
use crate::rebooter::observability::metrics::{self, PowerAction};

/// Tunables for scheduling and retrying power cycles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// How long a node may stay not ready before the first power cycle.
    pub initial_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_per_attempt: Duration,
    pub poll_interval: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(300),
            max_attempts: 5,
            backoff_base: Duration::from_secs(300),
            backoff_per_attempt: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RecoveryPolicy {
    /// Delay before the next attempt once `attempt_count` attempts have
    /// failed: `backoff_base + backoff_per_attempt * attempt_count`.
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        self.backoff_base
            .saturating_add(self.backoff_per_attempt.saturating_mul(attempt_count))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryPhase {
    Healthy,
    /// Not ready with an attempt due now.
    PendingReboot,
    /// Not ready, next attempt still in the future.
    BackoffWait,
    /// Attempt budget spent; waits for readiness or an operator reset.
    Exhausted,
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecoveryPhase::Healthy => "Healthy",
            RecoveryPhase::PendingReboot => "PendingReboot",
            RecoveryPhase::BackoffWait => "BackoffWait",
            RecoveryPhase::Exhausted => "Exhausted",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do: ready and no recovery scheduled.
    None,
    /// Not ready and nothing scheduled yet.
    Schedule { delay: Duration },
    /// Ready again; drop the recovery state.
    Cancel,
    Wait { until: DateTime<Utc> },
    /// Power cycle now. `attempt` is 1-based.
    Attempt { attempt: u32 },
    Exhausted { attempts: u32 },
}

pub fn phase(
    ready: bool,
    state: Option<&RecoveryState>,
    now: DateTime<Utc>,
    policy: &RecoveryPolicy,
) -> RecoveryPhase {
    match (ready, state) {
        (true, _) | (false, None) => RecoveryPhase::Healthy,
        (false, Some(state)) if state.attempt_count >= policy.max_attempts => {
            RecoveryPhase::Exhausted
        }
        (false, Some(state)) if !state.is_due(now) => RecoveryPhase::BackoffWait,
        (false, Some(_)) => RecoveryPhase::PendingReboot,
    }
}

pub fn decide(
    ready: bool,
    state: Option<&RecoveryState>,
    now: DateTime<Utc>,
    policy: &RecoveryPolicy,
) -> Transition {
    match (ready, state) {
        (true, None) => Transition::None,
        (true, Some(_)) => Transition::Cancel,
        (false, None) => Transition::Schedule {
            delay: policy.initial_timeout,
        },
        (false, Some(state)) => match phase(ready, Some(state), now, policy) {
            RecoveryPhase::Exhausted => Transition::Exhausted {
                attempts: state.attempt_count,
            },
            RecoveryPhase::BackoffWait => Transition::Wait {
                until: state.next_attempt_at,
            },
            RecoveryPhase::PendingReboot | RecoveryPhase::Healthy => Transition::Attempt {
                attempt: state.attempt_count + 1,
            },
        },
    }
}

/// Result of one power cycle attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The device accepted the power cycle request.
    PowerCycled,
    /// The device could not be reached or refused the request. Counted.
    TransientFailure(String),
    /// The machine was not in the powered-on state. Not counted.
    SkippedDueToState(PowerState),
    /// No usable credentials. Not counted.
    ConfigurationError(CredentialError),
}

impl AttemptOutcome {
    pub fn counts_as_attempt(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::PowerCycled | AttemptOutcome::TransientFailure(_)
        )
    }
}

/// Looks up the node's management endpoint, confirms the machine reports
/// powered on and requests a power cycle.
pub async fn execute_attempt(
    node: &str,
    credentials: &dyn CredentialProvider,
    power: &dyn PowerController,
) -> AttemptOutcome {
    let endpoint = match credentials.lookup(node) {
        Ok(endpoint) => endpoint,
        Err(err) => return AttemptOutcome::ConfigurationError(err),
    };
    let address = endpoint.address.clone();

    let state = match power.power_status(&endpoint).await {
        Ok(state) => {
            metrics::record_power_action(node, PowerAction::Status, true);
            state
        }
        Err(err) => {
            metrics::record_power_action(node, PowerAction::Status, false);
            return AttemptOutcome::TransientFailure(format!("power status query failed: {err}"));
        }
    };
    if !state.is_powered_on() {
        return AttemptOutcome::SkippedDueToState(state);
    }

    log_info(
        "recovery",
        "Requesting power cycle",
        &[("node", node), ("address", address.as_str())],
    );
    match power.power_cycle(&endpoint).await {
        Ok(()) => {
            metrics::record_power_action(node, PowerAction::Cycle, true);
            AttemptOutcome::PowerCycled
        }
        Err(err) => {
            metrics::record_power_action(node, PowerAction::Cycle, false);
            let message = err.to_string();
            log_warn(
                "recovery",
                "Power cycle request failed",
                &[("node", node), ("address", address.as_str()), ("error", message.as_str())],
            );
            AttemptOutcome::TransientFailure(format!("power cycle failed: {message}"))
        }
    }
}
