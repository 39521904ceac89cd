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

//! Out-of-band power management for Intel AMT equipped machines.

pub mod digest;
pub mod wsman;

use futures_util::future::BoxFuture;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// AMT power state code reported for a machine that is switched on.
pub const POWERED_ON: &str = "2";
/// Plain HTTP WS-Management port.
pub const AMT_HTTP_PORT: u16 = 16992;
/// TLS WS-Management port.
pub const AMT_TLS_PORT: u16 = 16993;

#[derive(Clone, PartialEq, Eq)]
pub struct BmcCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BmcCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmcCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connection parameters for one machine's management controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BmcEndpoint {
    pub address: String,
    pub port: Option<u16>,
    pub tls: bool,
    pub credentials: BmcCredentials,
}

impl BmcEndpoint {
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port: None,
            tls: false,
            credentials: BmcCredentials {
                username: username.into(),
                password: password.into(),
            },
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls { AMT_TLS_PORT } else { AMT_HTTP_PORT })
    }

    /// WS-Management endpoint URL.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let host = if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };
        format!("{scheme}://{host}:{}/wsman", self.effective_port())
    }
}

/// Raw power state code as reported by the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowerState(String);

impl PowerState {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn is_powered_on(&self) -> bool {
        self.0 == POWERED_ON
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub enum PowerError {
    /// The request could not be delivered or no response arrived.
    Transport(String),
    Timeout(Duration),
    /// Credentials were rejected.
    Unauthorized,
    /// The device answered with a non-success HTTP status.
    Http { status: u16, body: String },
    /// The response body did not contain the expected fields.
    Protocol(String),
    /// The device processed the request but refused the state change.
    Rejected { return_value: String },
}

impl fmt::Display for PowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerError::Transport(message) => write!(f, "transport error: {message}"),
            PowerError::Timeout(after) => {
                write!(f, "no response after {}", humantime::format_duration(*after))
            }
            PowerError::Unauthorized => f.write_str("credentials rejected"),
            PowerError::Http { status, body } => write!(f, "HTTP {status}: {body}"),
            PowerError::Protocol(message) => write!(f, "unexpected response: {message}"),
            PowerError::Rejected { return_value } => {
                write!(f, "power state change refused (ReturnValue {return_value})")
            }
        }
    }
}

impl Error for PowerError {}

pub type PowerFuture<'a, T> = BoxFuture<'a, Result<T, PowerError>>;

/// Power operations against a machine's management controller.
pub trait PowerController: Send + Sync {
    fn power_status<'a>(&'a self, endpoint: &'a BmcEndpoint) -> PowerFuture<'a, PowerState>;

    /// Requests a power cycle. `Ok` means the device accepted the request.
    fn power_cycle<'a>(&'a self, endpoint: &'a BmcEndpoint) -> PowerFuture<'a, ()>;
}
