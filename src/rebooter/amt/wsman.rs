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

//! Minimal WS-Management client for the AMT power management service.

use rand::RngCore;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, StatusCode};
use std::error::Error;
use std::time::Duration;

use super::digest::{new_cnonce, DigestChallenge};
use super::{BmcEndpoint, PowerController, PowerError, PowerFuture, PowerState};
use crate::rebooter::util::{truncate_message, with_context};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const WSMAN_PATH: &str = "/wsman";
const CIM_SCHEMA: &str = "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2";
const ACTION_GET: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Get";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
const POWER_SERVICE_NAME: &str = "Intel(r) AMT Power Management Service";
/// `PowerState` value for "Power Cycle (Off - Soft)".
const POWER_CYCLE_OFF_SOFT: &str = "5";

/// Issues WS-Man requests over HTTP(S) with digest authentication.
///
/// The client keeps no per-device state; every call negotiates its own
/// digest challenge.
pub struct WsmanClient {
    client: Client,
    timeout: Duration,
}

impl WsmanClient {
    pub fn new(
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = Client::builder()
            .timeout(timeout)
            .http1_only()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| with_context(e, "Failed to construct WS-Management HTTP client"))?;
        Ok(Self { client, timeout })
    }

    async fn post(&self, endpoint: &BmcEndpoint, body: String) -> Result<String, PowerError> {
        let url = endpoint.url();
        let first = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(body.clone())
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let response = if first.status() == StatusCode::UNAUTHORIZED {
            let challenge = first
                .headers()
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(DigestChallenge::parse)
                .ok_or_else(|| {
                    PowerError::Protocol("device did not offer digest authentication".to_string())
                })?;
            let authorization = challenge.authorization(
                &endpoint.credentials,
                "POST",
                WSMAN_PATH,
                1,
                &new_cnonce(),
            )?;
            self.client
                .post(&url)
                .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                .header(AUTHORIZATION, authorization)
                .body(body)
                .send()
                .await
                .map_err(|err| self.transport_error(err))?
        } else {
            first
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(PowerError::Unauthorized);
        }
        let text = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;
        if !status.is_success() {
            return Err(PowerError::Http {
                status: status.as_u16(),
                body: truncate_message(text.trim()),
            });
        }
        Ok(text)
    }

    fn transport_error(&self, err: reqwest::Error) -> PowerError {
        if err.is_timeout() {
            PowerError::Timeout(self.timeout)
        } else {
            PowerError::Transport(err.to_string())
        }
    }

    async fn query_power_state(&self, endpoint: &BmcEndpoint) -> Result<PowerState, PowerError> {
        let response = self.post(endpoint, power_status_request(endpoint)).await?;
        extract_element(&response, "PowerState")
            .map(PowerState::new)
            .ok_or_else(|| PowerError::Protocol("response carried no PowerState".to_string()))
    }

    async fn request_power_cycle(&self, endpoint: &BmcEndpoint) -> Result<(), PowerError> {
        let response = self.post(endpoint, power_cycle_request(endpoint)).await?;
        let return_value = extract_element(&response, "ReturnValue")
            .ok_or_else(|| PowerError::Protocol("response carried no ReturnValue".to_string()))?;
        if return_value.trim() == "0" {
            Ok(())
        } else {
            Err(PowerError::Rejected { return_value })
        }
    }
}

impl PowerController for WsmanClient {
    fn power_status<'a>(&'a self, endpoint: &'a BmcEndpoint) -> PowerFuture<'a, PowerState> {
        Box::pin(self.query_power_state(endpoint))
    }

    fn power_cycle<'a>(&'a self, endpoint: &'a BmcEndpoint) -> PowerFuture<'a, ()> {
        Box::pin(self.request_power_cycle(endpoint))
    }
}

fn message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "uuid:{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn envelope(endpoint: &BmcEndpoint, action: &str, resource: &str, selectors: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:wsman="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd">
<s:Header>
<wsa:Action s:mustUnderstand="true">{action}</wsa:Action>
<wsa:To s:mustUnderstand="true">{to}</wsa:To>
<wsman:ResourceURI s:mustUnderstand="true">{resource}</wsman:ResourceURI>
<wsa:MessageID s:mustUnderstand="true">{message_id}</wsa:MessageID>
<wsa:ReplyTo><wsa:Address>{ANONYMOUS}</wsa:Address></wsa:ReplyTo>
<wsman:OperationTimeout>PT60S</wsman:OperationTimeout>{selectors}
</s:Header>
<s:Body>{body}</s:Body>
</s:Envelope>"#,
        to = endpoint.url(),
        message_id = message_id(),
    )
}

pub(crate) fn power_status_request(endpoint: &BmcEndpoint) -> String {
    envelope(
        endpoint,
        ACTION_GET,
        &format!("{CIM_SCHEMA}/CIM_AssociatedPowerManagementService"),
        "",
        "",
    )
}

pub(crate) fn power_cycle_request(endpoint: &BmcEndpoint) -> String {
    let service = format!("{CIM_SCHEMA}/CIM_PowerManagementService");
    let selectors = format!(
        r#"
<wsman:SelectorSet>
<wsman:Selector Name="CreationClassName">CIM_PowerManagementService</wsman:Selector>
<wsman:Selector Name="Name">{POWER_SERVICE_NAME}</wsman:Selector>
<wsman:Selector Name="SystemCreationClassName">CIM_ComputerSystem</wsman:Selector>
<wsman:Selector Name="SystemName">Intel(r) AMT</wsman:Selector>
</wsman:SelectorSet>"#
    );
    let body = format!(
        r#"
<p:RequestPowerStateChange_INPUT xmlns:p="{service}">
<p:PowerState>{POWER_CYCLE_OFF_SOFT}</p:PowerState>
<p:ManagedElement>
<wsa:Address>{ANONYMOUS}</wsa:Address>
<wsa:ReferenceParameters>
<wsman:ResourceURI>{CIM_SCHEMA}/CIM_ComputerSystem</wsman:ResourceURI>
<wsman:SelectorSet>
<wsman:Selector Name="CreationClassName">CIM_ComputerSystem</wsman:Selector>
<wsman:Selector Name="Name">ManagedSystem</wsman:Selector>
</wsman:SelectorSet>
</wsa:ReferenceParameters>
</p:ManagedElement>
</p:RequestPowerStateChange_INPUT>
"#
    );
    envelope(
        endpoint,
        &format!("{service}/RequestPowerStateChange"),
        &service,
        &selectors,
        &body,
    )
}

/// Returns the text of the first element whose local name is `name`,
/// ignoring any namespace prefix.
pub(crate) fn extract_element(xml: &str, name: &str) -> Option<String> {
    let mut rest = xml;
    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let tag_end = rest.find('>')?;
        let tag = &rest[..tag_end];
        if tag.starts_with('/') || tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        let tag_name = tag
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default();
        let local = tag_name.rsplit(':').next().unwrap_or(tag_name);
        if local != name {
            continue;
        }
        if tag.ends_with('/') {
            return Some(String::new());
        }
        let content = &rest[tag_end + 1..];
        let close = format!("</{tag_name}>");
        let end = content.find(&close)?;
        return Some(content[..end].trim().to_string());
    }
    None
}
