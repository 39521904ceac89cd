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

use amt_rebooter::rebooter::cli;
use amt_rebooter::rebooter::logger::log_error;

#[tokio::main]
async fn main() {
    if let Err(error) = cli::run().await {
        let message = error.to_string();
        log_error("main", "amt-rebooter exited with an error", &[("error", &message)]);
        std::process::exit(1);
    }
}
