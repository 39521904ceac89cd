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

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::rebooter::config::Config;
use crate::rebooter::controller::recovery::RecoveryPolicy;
use crate::rebooter::k8s::client::ApiSettings;
use crate::rebooter::logger::{LogFormat, LogLevel};

/// Power cycles unreachable cluster nodes through Intel AMT.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct AmtRebooter {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the recovery controller
    Run(RunArgs),

    /// Show the recovery state of one or all nodes
    Status(StatusArgs),

    /// Clear a node's recovery state, resetting its attempt budget
    Reset(ResetArgs),

    /// Query a node's power state through its management controller
    PowerStatus(PowerStatusArgs),
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Log output format (text or json)
    #[arg(long, global = true, env = "AMT_REBOOTER_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Minimum log level (debug, info, warn, error)
    #[arg(long, global = true, env = "AMT_REBOOTER_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Node inventory file (defaults to $AMT_REBOOTER_INVENTORY or /etc/amt-rebooter/nodes.yaml)
    #[arg(long, global = true)]
    pub inventory: Option<PathBuf>,

    #[command(flatten)]
    pub api: ApiArgs,
}

impl GlobalArgs {
    pub fn inventory_path(&self) -> PathBuf {
        match self.inventory.as_ref() {
            Some(path) => Config::normalize_path(&path.to_string_lossy()),
            None => Config::Inventory.get_path(),
        }
    }
}

#[derive(Args)]
pub struct ApiArgs {
    /// Kubernetes API server URL (defaults to the in-cluster service)
    #[arg(long, global = true, env = "AMT_REBOOTER_API_SERVER")]
    pub server: Option<String>,

    /// Bearer token for the API server
    #[arg(long, global = true, env = "AMT_REBOOTER_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File holding the bearer token, re-read on every request
    #[arg(long, global = true)]
    pub token_file: Option<PathBuf>,

    /// PEM bundle used to verify the API server certificate
    #[arg(long, global = true)]
    pub certificate_authority: Option<PathBuf>,

    /// Skip API server certificate verification
    #[arg(long, global = true)]
    pub insecure_skip_tls_verify: bool,
}

impl ApiArgs {
    pub fn settings(&self) -> ApiSettings {
        ApiSettings {
            server: self.server.clone(),
            token: self.token.clone(),
            token_file: self.token_file.clone(),
            ca_file: self.certificate_authority.clone(),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        }
    }
}

#[derive(Args, Clone)]
pub struct PolicyArgs {
    /// How long a node may stay not ready before the first power cycle
    #[arg(long, env = "AMT_REBOOTER_INITIAL_TIMEOUT", default_value = "5m", value_parser = humantime::parse_duration)]
    pub initial_timeout: Duration,

    /// Power cycles attempted before giving up on a node
    #[arg(long, env = "AMT_REBOOTER_MAX_ATTEMPTS", default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Fixed part of the delay after a failed attempt
    #[arg(long, env = "AMT_REBOOTER_BACKOFF_BASE", default_value = "5m", value_parser = humantime::parse_duration)]
    pub backoff_base: Duration,

    /// Delay added per failed attempt
    #[arg(long, env = "AMT_REBOOTER_BACKOFF_PER_ATTEMPT", default_value = "5m", value_parser = humantime::parse_duration)]
    pub backoff_per_attempt: Duration,

    /// How often each pending node is re-evaluated
    #[arg(long, env = "AMT_REBOOTER_POLL_INTERVAL", default_value = "1s", value_parser = parse_interval)]
    pub poll_interval: Duration,
}

impl PolicyArgs {
    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            initial_timeout: self.initial_timeout,
            max_attempts: self.max_attempts,
            backoff_base: self.backoff_base,
            backoff_per_attempt: self.backoff_per_attempt,
            poll_interval: self.poll_interval,
        }
    }
}

fn parse_interval(value: &str) -> Result<Duration, String> {
    let interval = humantime::parse_duration(value).map_err(|err| err.to_string())?;
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(interval)
}

#[derive(Args, Clone)]
pub struct BmcArgs {
    /// Timeout for each request to a management controller
    #[arg(long, env = "AMT_REBOOTER_BMC_TIMEOUT", default_value = "30s", value_parser = parse_interval)]
    pub bmc_timeout: Duration,

    /// Accept self-signed management controller certificates
    #[arg(long, env = "AMT_REBOOTER_BMC_INSECURE_SKIP_TLS_VERIFY")]
    pub bmc_insecure_skip_tls_verify: bool,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub policy: PolicyArgs,

    #[command(flatten)]
    pub bmc: BmcArgs,

    /// Serve /metrics, /healthz and /readyz on this address
    #[arg(long, env = "AMT_REBOOTER_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Only show this node
    #[arg()]
    pub node: Option<String>,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(Args)]
pub struct ResetArgs {
    /// The node whose recovery state should be cleared
    #[arg()]
    pub node: String,
}

#[derive(Args)]
pub struct PowerStatusArgs {
    /// The node to query
    #[arg()]
    pub node: String,

    #[command(flatten)]
    pub bmc: BmcArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        AmtRebooter::command().debug_assert();
    }

    #[test]
    fn run_parses_humantime_tunables() {
        let cli = AmtRebooter::try_parse_from([
            "amt-rebooter",
            "run",
            "--initial-timeout",
            "10m",
            "--max-attempts",
            "3",
            "--backoff-per-attempt",
            "90s",
            "--metrics-addr",
            "0.0.0.0:9100",
        ])
        .expect("parse");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let policy = args.policy.policy();
        assert_eq!(policy.initial_timeout, Duration::from_secs(600));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_per_attempt, Duration::from_secs(90));
        assert_eq!(args.metrics_addr, Some("0.0.0.0:9100".parse().expect("addr")));
    }

    #[test]
    fn zero_attempts_and_zero_interval_are_rejected() {
        assert!(AmtRebooter::try_parse_from(["amt-rebooter", "run", "--max-attempts", "0"]).is_err());
        assert!(AmtRebooter::try_parse_from(["amt-rebooter", "run", "--poll-interval", "0s"]).is_err());
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = AmtRebooter::try_parse_from([
            "amt-rebooter",
            "reset",
            "worker-1",
            "--log-format",
            "json",
            "--server",
            "https://10.0.0.1:6443",
        ])
        .expect("parse");
        assert_eq!(cli.global.log_format, LogFormat::Json);
        assert_eq!(cli.global.api.settings().server.as_deref(), Some("https://10.0.0.1:6443"));
        assert!(matches!(cli.command, Commands::Reset(ResetArgs { ref node }) if node == "worker-1"));
    }
}
