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

//! Cancellable fixed-interval loops on the tokio runtime.
//!
//! Each loop is its own task so a slow job never delays another loop. A job
//! returns [`JobResult::Stop`] to end its loop; a panic ends only that loop.

use crate::rebooter::logger::log_error;
use futures_util::future::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    Stop,
    Continue,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(u64);

/// Per-run view of the loop handed to the job.
#[derive(Clone)]
pub struct ScheduleContext {
    task_id: TaskId,
    label: &'static str,
    iteration: u64,
    cancellation: CancellationToken,
}

impl ScheduleContext {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Zero for the first run of the loop.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

#[derive(Clone)]
pub struct Scheduler {
    next_id: Arc<AtomicU64>,
}

type JobFn = dyn Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static;

/// Owner's side of a running loop.
pub struct ScheduledTaskHandle {
    cancellation: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn global() -> Scheduler {
        static INSTANCE: OnceLock<Scheduler> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Scheduler {
                next_id: Arc::new(AtomicU64::new(1)),
            })
            .clone()
    }

    /// Runs `job` immediately and then once per `interval` until it returns
    /// [`JobResult::Stop`] or the handle is cancelled. A slow run pushes the
    /// following runs back instead of bursting to catch up.
    pub fn spawn_loop<F>(&self, label: &'static str, interval: Duration, job: F) -> ScheduledTaskHandle
    where
        F: Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static,
    {
        let job = Arc::new(job) as Arc<JobFn>;
        let task_id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancellation = CancellationToken::new();
        let period = interval.max(Duration::from_millis(1));

        let token = cancellation.clone();
        let join = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut iteration = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let ctx = ScheduleContext {
                    task_id,
                    label,
                    iteration,
                    cancellation: token.clone(),
                };
                if run_job(&job, ctx).await == JobResult::Stop {
                    break;
                }
                iteration += 1;
            }
        });

        ScheduledTaskHandle {
            cancellation,
            join: Mutex::new(Some(join)),
        }
    }
}

async fn run_job(job: &Arc<JobFn>, ctx: ScheduleContext) -> JobResult {
    let (task_id, label) = (ctx.task_id, ctx.label);
    AssertUnwindSafe((**job)(ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            let task = task_id.0.to_string();
            log_error(
                "scheduler",
                "Loop panicked; stopping it",
                &[("task_id", task.as_str()), ("label", label)],
            );
            JobResult::Stop
        })
}

impl ScheduledTaskHandle {
    /// Requests a cooperative stop; a run already in progress completes.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join_slot()
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Waits for the loop task to exit. Only the first call waits.
    pub async fn join(&self) -> Result<(), JoinError> {
        let handle = self.join_slot().take();
        match handle {
            Some(handle) => handle.await,
            None => Ok(()),
        }
    }

    fn join_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
