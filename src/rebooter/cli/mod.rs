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

pub mod args;
pub mod commands;
mod terminal;

use clap::Parser;
use std::error::Error;

pub use args::AmtRebooter;
pub use terminal::Terminal;

use crate::rebooter::logger;

/// Parses the process arguments and runs the selected command.
pub async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = AmtRebooter::parse();
    logger::set_log_format(cli.global.log_format);
    logger::set_min_level(cli.global.log_level);
    commands::run(&cli.global, &cli.command).await
}
