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

//! Static mapping from node name to management controller credentials.
//!
//! ```yaml
//! nodes:
//!   worker-1:
//!     address: 10.0.0.21
//!     username: admin
//!     password: secret
//!     tls: true
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::rebooter::amt::{BmcCredentials, BmcEndpoint};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    #[serde(default)]
    pub nodes: BTreeMap<String, InventoryEntry>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryEntry {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    NotConfigured { node: String },
    Incomplete { node: String, missing: Vec<&'static str> },
    Unreadable { path: PathBuf, message: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::NotConfigured { node } => {
                write!(f, "no management controller configured for node '{node}'")
            }
            CredentialError::Incomplete { node, missing } => write!(
                f,
                "management controller entry for node '{node}' is missing {}",
                missing.join(", ")
            ),
            CredentialError::Unreadable { path, message } => {
                write!(f, "failed to read inventory '{}': {message}", path.display())
            }
        }
    }
}

impl Error for CredentialError {}

/// Resolves a node's management endpoint. Consulted once per power cycle.
pub trait CredentialProvider: Send + Sync {
    fn lookup(&self, node: &str) -> Result<BmcEndpoint, CredentialError>;
}

impl Inventory {
    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    pub fn endpoint(&self, node: &str) -> Result<BmcEndpoint, CredentialError> {
        let entry = self
            .nodes
            .get(node)
            .ok_or_else(|| CredentialError::NotConfigured {
                node: node.to_string(),
            })?;
        entry.to_endpoint(node)
    }
}

impl InventoryEntry {
    fn to_endpoint(&self, node: &str) -> Result<BmcEndpoint, CredentialError> {
        let field = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let address = field(&self.address);
        let username = field(&self.username);
        // Passwords are taken verbatim; only absence counts as missing.
        let password = self.password.clone().filter(|value| !value.is_empty());

        let mut missing = Vec::new();
        if address.is_none() {
            missing.push("address");
        }
        if username.is_none() {
            missing.push("username");
        }
        if password.is_none() {
            missing.push("password");
        }

        match (address, username, password) {
            (Some(address), Some(username), Some(password)) => Ok(BmcEndpoint {
                address,
                port: self.port,
                tls: self.tls,
                credentials: BmcCredentials { username, password },
            }),
            _ => Err(CredentialError::Incomplete {
                node: node.to_string(),
                missing,
            }),
        }
    }
}

/// Reads the inventory file on every lookup so edits apply without a restart.
#[derive(Debug, Clone)]
pub struct FileCredentialProvider {
    path: PathBuf,
}

impl FileCredentialProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Inventory, CredentialError> {
        let unreadable = |message: String| CredentialError::Unreadable {
            path: self.path.clone(),
            message,
        };
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(unreadable("file does not exist".to_string()))
            }
            Err(err) => return Err(unreadable(err.to_string())),
        };
        Inventory::parse(&contents).map_err(|err| unreadable(err.to_string()))
    }
}

impl CredentialProvider for FileCredentialProvider {
    fn lookup(&self, node: &str) -> Result<BmcEndpoint, CredentialError> {
        self.load()?.endpoint(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_inventory(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn resolves_complete_entries() {
        let file = write_inventory(
            "nodes:\n  worker-1:\n    address: 10.0.0.21\n    username: admin\n    password: s3cret\n    tls: true\n",
        );
        let provider = FileCredentialProvider::new(file.path());
        let endpoint = provider.lookup("worker-1").expect("endpoint");
        assert_eq!(endpoint.address, "10.0.0.21");
        assert!(endpoint.tls);
        assert_eq!(endpoint.credentials.password, "s3cret");
        assert_eq!(endpoint.effective_port(), 16993);
    }

    #[test]
    fn json_inventories_are_accepted() {
        let inventory = Inventory::parse(
            r#"{"nodes": {"worker-2": {"address": "10.0.0.22", "username": "admin", "password": "pw", "port": 16992}}}"#,
        )
        .expect("json");
        assert_eq!(inventory.endpoint("worker-2").expect("endpoint").port, Some(16992));
    }

    #[test]
    fn missing_and_incomplete_entries_are_distinguished() {
        let file = write_inventory("nodes:\n  worker-1:\n    address: 10.0.0.21\n    password: \"\"\n");
        let provider = FileCredentialProvider::new(file.path());

        assert_eq!(
            provider.lookup("worker-9"),
            Err(CredentialError::NotConfigured {
                node: "worker-9".to_string()
            })
        );
        assert_eq!(
            provider.lookup("worker-1"),
            Err(CredentialError::Incomplete {
                node: "worker-1".to_string(),
                missing: vec!["username", "password"],
            })
        );
    }

    #[test]
    fn edits_are_visible_on_the_next_lookup() {
        let mut file = write_inventory("nodes: {}\n");
        let provider = FileCredentialProvider::new(file.path());
        assert!(matches!(
            provider.lookup("worker-1"),
            Err(CredentialError::NotConfigured { .. })
        ));

        file.as_file_mut().set_len(0).expect("truncate");
        std::fs::write(
            file.path(),
            "nodes:\n  worker-1: {address: a, username: u, password: p}\n",
        )
        .expect("rewrite");
        assert!(provider.lookup("worker-1").is_ok());
    }

    #[test]
    fn unreadable_files_are_reported() {
        let provider = FileCredentialProvider::new("/nonexistent/amt-rebooter/nodes.yaml");
        assert!(matches!(
            provider.lookup("worker-1"),
            Err(CredentialError::Unreadable { .. })
        ));

        let file = write_inventory("nodes: [not, a, map]\n");
        let provider = FileCredentialProvider::new(file.path());
        assert!(matches!(
            provider.lookup("worker-1"),
            Err(CredentialError::Unreadable { .. })
        ));
    }
}
