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

use std::error::Error;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use super::node_registry;
use crate::rebooter::amt::wsman::WsmanClient;
use crate::rebooter::cli::args::{GlobalArgs, RunArgs};
use crate::rebooter::controller::watch::NodeWatcher;
use crate::rebooter::controller::{RecoveryContext, SystemClock};
use crate::rebooter::inventory::FileCredentialProvider;
use crate::rebooter::logger::{log_info, log_warn};
use crate::rebooter::observability::health::WatchHealth;
use crate::rebooter::observability::tracing;
use crate::rebooter::scheduler::Scheduler;
use crate::rebooter::server;
use crate::rebooter::util::with_context;

pub(super) async fn handle_run(
    global: &GlobalArgs,
    args: &RunArgs,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing::init();
    let policy = args.policy.policy();
    let registry = node_registry(global)?;
    let power = Arc::new(WsmanClient::new(
        args.bmc.bmc_timeout,
        args.bmc.bmc_insecure_skip_tls_verify,
    )?);

    let credentials = FileCredentialProvider::new(global.inventory_path());
    let inventory_path = credentials.path().display().to_string();
    match credentials.load() {
        Ok(inventory) => {
            let nodes = inventory.nodes.len().to_string();
            log_info(
                "run",
                "Loaded node inventory",
                &[("path", inventory_path.as_str()), ("nodes", nodes.as_str())],
            );
        }
        // Lookups happen per attempt, so a missing file is only fatal for the
        // nodes that need a power cycle.
        Err(err) => {
            let error = err.to_string();
            log_warn(
                "run",
                "Node inventory is not readable yet",
                &[("path", inventory_path.as_str()), ("error", error.as_str())],
            );
        }
    }

    let initial_timeout = humantime::format_duration(policy.initial_timeout).to_string();
    let max_attempts = policy.max_attempts.to_string();
    let backoff_base = humantime::format_duration(policy.backoff_base).to_string();
    let backoff_step = humantime::format_duration(policy.backoff_per_attempt).to_string();
    let poll_interval = humantime::format_duration(policy.poll_interval).to_string();
    log_info(
        "run",
        "Starting node recovery controller",
        &[
            ("initial_timeout", initial_timeout.as_str()),
            ("max_attempts", max_attempts.as_str()),
            ("backoff_base", backoff_base.as_str()),
            ("backoff_per_attempt", backoff_step.as_str()),
            ("poll_interval", poll_interval.as_str()),
        ],
    );

    let context = Arc::new(RecoveryContext::new(
        registry,
        power,
        Arc::new(credentials),
        policy,
        Arc::new(SystemClock),
    ));
    let health = WatchHealth::new();
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let server_task = args.metrics_addr.map(|addr| {
        let health = health.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server::serve(addr, health, shutdown).await })
    });

    let mut watcher = NodeWatcher::new(context, Scheduler::global(), health);
    watcher.run(shutdown.clone()).await;
    log_info("run", "Node recovery controller stopped", &[]);

    if let Some(task) = server_task {
        shutdown.cancel();
        task.await
            .map_err(|e| with_context(e, "Metrics server task failed"))??;
    }
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| with_context(e, "Failed to install SIGTERM handler"))?;
    let mut interrupt = signal(SignalKind::interrupt())
        .map_err(|e| with_context(e, "Failed to install SIGINT handler"))?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = shutdown.cancelled() => return,
        };
        log_info("run", "Shutdown requested", &[("signal", name)]);
        shutdown.cancel();
    });
    Ok(())
}
