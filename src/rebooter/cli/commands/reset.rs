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

use crate::rebooter::cli::args::ResetArgs;
use crate::rebooter::cli::Terminal;
use crate::rebooter::controller::schedule::{
    clear_recovery, AnnotationScheduleStore, RecoveryRecord, ScheduleStore,
};
use crate::rebooter::k8s::NodeRegistry;
use crate::rebooter::logger::log_info;
use crate::rebooter::util::{new_error, with_context};

pub(super) async fn handle_reset(
    registry: Arc<dyn NodeRegistry>,
    args: &ResetArgs,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let store = AnnotationScheduleStore::new(registry);
    let had_state = reset_node(&store, &args.node).await?;
    if had_state {
        Terminal::stdout(format_args!("Cleared recovery state for node {}", args.node));
    } else {
        Terminal::stdout(format_args!("Node {} has no recovery state", args.node));
    }
    Ok(())
}

/// Removes both recovery annotations. Returns whether any state was present.
pub(crate) async fn reset_node(
    store: &dyn ScheduleStore,
    node: &str,
) -> Result<bool, Box<dyn Error + Send + Sync>> {
    let stored = store
        .get(node)
        .await
        .map_err(|e| with_context(e, format!("Failed to read node '{node}'")))?
        .ok_or_else(|| new_error(format!("Node '{node}' not found")))?;

    let had_state = !matches!(stored.record, RecoveryRecord::Absent);
    clear_recovery(store, node)
        .await
        .map_err(|e| with_context(e, format!("Failed to clear recovery state for '{node}'")))?;
    if had_state {
        log_info("reset", "Cleared recovery state", &[("node", node)]);
    }
    Ok(had_state)
}
