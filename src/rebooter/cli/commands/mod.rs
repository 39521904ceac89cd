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

mod power;
mod reset;
mod run;
mod status;

use std::error::Error;
use std::sync::Arc;

use super::args::{Commands, GlobalArgs};
use crate::rebooter::k8s::client::KubeClient;
use crate::rebooter::k8s::NodeRegistry;

pub async fn run(
    global: &GlobalArgs,
    command: &Commands,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    match command {
        Commands::Run(args) => run::handle_run(global, args).await,
        Commands::Status(args) => {
            let registry = node_registry(global)?;
            status::handle_status(registry.as_ref(), args).await
        }
        Commands::Reset(args) => {
            let registry = node_registry(global)?;
            reset::handle_reset(registry, args).await
        }
        Commands::PowerStatus(args) => power::handle_power_status(global, args).await,
    }
}

fn node_registry(global: &GlobalArgs) -> Result<Arc<dyn NodeRegistry>, Box<dyn Error + Send + Sync>> {
    let client = KubeClient::from_settings(&global.api.settings())?;
    Ok(Arc::new(client))
}
