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

use std::env;
use std::path::{Component, PathBuf};

/// File system locations the controller reads at runtime.
#[derive(Debug, Clone, Copy)]
pub enum Config {
    /// Node name to management controller inventory.
    Inventory,
    /// Directory holding the pod's service account token and CA bundle.
    ServiceAccount,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Inventory => "AMT_REBOOTER_INVENTORY",
            Config::ServiceAccount => "AMT_REBOOTER_SERVICE_ACCOUNT_DIR",
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            Config::Inventory => "/etc/amt-rebooter/nodes.yaml",
            Config::ServiceAccount => "/var/run/secrets/kubernetes.io/serviceaccount",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Expands `~`, anchors relative paths at the working directory and
    /// collapses `.` and `..` components.
    pub fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dot_segments() {
        assert_eq!(
            Config::normalize_path("/etc/amt-rebooter/../amt-rebooter/./nodes.yaml"),
            PathBuf::from("/etc/amt-rebooter/nodes.yaml")
        );
    }

    #[test]
    fn defaults_apply_without_environment() {
        if env::var(Config::ServiceAccount.env_var()).is_err() {
            assert_eq!(
                Config::ServiceAccount.get_path(),
                PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount")
            );
        }
        assert_eq!(Config::Inventory.env_var(), "AMT_REBOOTER_INVENTORY");
    }
}
