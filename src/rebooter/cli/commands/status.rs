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

use chrono::{DateTime, SecondsFormat, Utc};
use std::error::Error;

use crate::rebooter::cli::args::StatusArgs;
use crate::rebooter::cli::Terminal;
use crate::rebooter::controller::readiness::node_is_ready;
use crate::rebooter::controller::recovery::{phase, RecoveryPolicy};
use crate::rebooter::controller::schedule::RecoveryRecord;
use crate::rebooter::k8s::node::Node;
use crate::rebooter::k8s::NodeRegistry;
use crate::rebooter::util::{new_error, with_context};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StatusRow {
    pub node: String,
    pub ready: bool,
    pub phase: String,
    pub attempts: String,
    pub next_attempt: String,
}

pub(super) async fn handle_status(
    registry: &dyn NodeRegistry,
    args: &StatusArgs,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let nodes = match args.node.as_deref() {
        Some(name) => {
            let node = registry
                .get_node(name)
                .await
                .map_err(|e| with_context(e, format!("Failed to read node '{name}'")))?;
            vec![node.ok_or_else(|| new_error(format!("Node '{name}' not found")))?]
        }
        None => {
            registry
                .list_nodes()
                .await
                .map_err(|e| with_context(e, "Failed to list nodes"))?
                .items
        }
    };

    let rows = status_rows(&nodes, Utc::now(), &args.policy.policy());
    Terminal::stdout_lines(format_table(&rows));
    Ok(())
}

pub(crate) fn status_rows(nodes: &[Node], now: DateTime<Utc>, policy: &RecoveryPolicy) -> Vec<StatusRow> {
    let mut rows: Vec<StatusRow> = nodes
        .iter()
        .filter_map(|node| {
            let name = node.name()?.to_string();
            let ready = node_is_ready(node);
            let record = RecoveryRecord::from_annotations(&node.metadata.annotations);
            let row = match &record {
                RecoveryRecord::Malformed(malformed) => StatusRow {
                    node: name,
                    ready,
                    phase: "Malformed".to_string(),
                    attempts: malformed
                        .attempt_count
                        .map(|count| count.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    next_attempt: "-".to_string(),
                },
                RecoveryRecord::Absent | RecoveryRecord::Scheduled(_) => {
                    let state = record.state();
                    StatusRow {
                        node: name,
                        ready,
                        phase: phase(ready, state, now, policy).to_string(),
                        attempts: state
                            .map(|state| state.attempt_count.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        next_attempt: state
                            .map(|state| {
                                state
                                    .next_attempt_at
                                    .to_rfc3339_opts(SecondsFormat::Secs, true)
                            })
                            .unwrap_or_else(|| "-".to_string()),
                    }
                }
            };
            Some(row)
        })
        .collect();
    rows.sort_by(|a, b| a.node.cmp(&b.node));
    rows
}

pub(crate) fn format_table(rows: &[StatusRow]) -> Vec<String> {
    const HEADERS: [&str; 5] = ["NODE", "READY", "PHASE", "ATTEMPTS", "NEXT ATTEMPT"];
    let cells: Vec<[String; 5]> = rows
        .iter()
        .map(|row| {
            [
                row.node.clone(),
                if row.ready { "True" } else { "False" }.to_string(),
                row.phase.clone(),
                row.attempts.clone(),
                row.next_attempt.clone(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let render = |values: [&str; 5]| {
        let mut line = String::new();
        for (index, value) in values.iter().enumerate() {
            if index + 1 == values.len() {
                line.push_str(value);
            } else {
                line.push_str(&format!("{value:<width$}   ", width = widths[index]));
            }
        }
        line
    };

    let mut lines = Vec::with_capacity(cells.len() + 1);
    lines.push(render(HEADERS));
    for row in &cells {
        lines.push(render([
            row[0].as_str(),
            row[1].as_str(),
            row[2].as_str(),
            row[3].as_str(),
            row[4].as_str(),
        ]));
    }
    lines
}
