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

use crate::rebooter::amt::wsman::WsmanClient;
use crate::rebooter::amt::PowerController;
use crate::rebooter::cli::args::{GlobalArgs, PowerStatusArgs};
use crate::rebooter::cli::Terminal;
use crate::rebooter::inventory::{CredentialProvider, FileCredentialProvider};
use crate::rebooter::util::with_context;

/// Queries a node's management controller directly, bypassing the cluster.
pub(super) async fn handle_power_status(
    global: &GlobalArgs,
    args: &PowerStatusArgs,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let credentials = FileCredentialProvider::new(global.inventory_path());
    let endpoint = credentials.lookup(&args.node)?;
    let client = WsmanClient::new(args.bmc.bmc_timeout, args.bmc.bmc_insecure_skip_tls_verify)?;
    let state = client.power_status(&endpoint).await.map_err(|e| {
        with_context(e, format!("Failed to query power state of '{}'", args.node))
    })?;

    let description = if state.is_powered_on() {
        "powered on"
    } else {
        "not powered on"
    };
    Terminal::stdout(format_args!(
        "{}: power state {} ({description}) via {}",
        args.node,
        state,
        endpoint.url()
    ));
    Ok(())
}
