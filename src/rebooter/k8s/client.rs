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

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::tls::Certificate;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use super::node::{Node, NodeList};
use super::watch_stream::decode_stream;
use super::{AnnotationPatch, NodeEventStream, NodeRegistry, RegistryError, RegistryFuture};
use crate::rebooter::config::Config;
use crate::rebooter::util::with_context;

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Server-side watch window; a fresh list follows each window.
const WATCH_TIMEOUT_SECONDS: u64 = 290;
const WATCH_REQUEST_SLACK: Duration = Duration::from_secs(30);

/// How the controller reaches the Kubernetes API.
#[derive(Clone, Debug, Default)]
pub struct ApiSettings {
    /// API server URL. Defaults to the in-cluster service address.
    pub server: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
}

#[derive(Clone, Debug)]
enum TokenSource {
    None,
    Static(String),
    /// Projected service account tokens rotate, so the file is re-read per request.
    File(PathBuf),
}

/// Minimal REST client for the core/v1 Node API.
pub struct KubeClient {
    client: Client,
    base_url: Url,
    token: TokenSource,
}

#[derive(Deserialize, Default)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

impl KubeClient {
    pub fn from_settings(settings: &ApiSettings) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let service_account = Config::ServiceAccount.get_path();
        let server = match settings.server.as_deref().map(str::trim) {
            Some(server) if !server.is_empty() => server.to_string(),
            _ => in_cluster_server()?,
        };
        let base_url = Url::parse(&server)
            .map_err(|e| with_context(e, format!("Invalid API server URL '{server}'")))?;

        let token = if let Some(token) = settings
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
        {
            TokenSource::Static(token.to_string())
        } else if let Some(path) = settings.token_file.clone() {
            TokenSource::File(path)
        } else if service_account.join("token").exists() {
            TokenSource::File(service_account.join("token"))
        } else {
            TokenSource::None
        };

        let mut builder = Client::builder().http1_only();
        let ca_file = settings
            .ca_file
            .clone()
            .or_else(|| Some(service_account.join("ca.crt")).filter(|path| path.exists()));
        if let Some(path) = ca_file {
            let pem = fs::read(&path).map_err(|e| {
                with_context(e, format!("Failed to read CA bundle '{}'", path.display()))
            })?;
            let certificate = Certificate::from_pem(&pem).map_err(|e| {
                with_context(e, format!("Failed to parse CA bundle '{}'", path.display()))
            })?;
            builder = builder.add_root_certificate(certificate);
        }
        if settings.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| with_context(e, "Failed to construct Kubernetes HTTP client"))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn url_from_segments(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        {
            let mut parts = url.path_segments_mut().map_err(|_| {
                RegistryError::Decode("API server URL cannot carry a path".to_string())
            })?;
            parts.pop_if_empty();
            for segment in segments {
                if !segment.is_empty() {
                    parts.push(segment);
                }
            }
        }
        Ok(url)
    }

    fn node_url(&self, name: Option<&str>) -> Result<Url, RegistryError> {
        match name {
            Some(name) => self.url_from_segments(&["api", "v1", "nodes", name]),
            None => self.url_from_segments(&["api", "v1", "nodes"]),
        }
    }

    fn apply_auth(&self, request: RequestBuilder) -> Result<RequestBuilder, RegistryError> {
        match &self.token {
            TokenSource::None => Ok(request),
            TokenSource::Static(token) => Ok(request.bearer_auth(token)),
            TokenSource::File(path) => {
                let token = fs::read_to_string(path).map_err(|err| {
                    RegistryError::Transport(with_context(
                        err,
                        format!("Failed to read API token '{}'", path.display()),
                    ))
                })?;
                Ok(request.bearer_auth(token.trim()))
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RegistryError> {
        let request = self.apply_auth(request.header(ACCEPT, "application/json"))?;
        let response = request
            .send()
            .await
            .map_err(|err| RegistryError::Transport(Box::new(err)))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }

    async fn send_json<T>(&self, request: RequestBuilder) -> Result<T, RegistryError>
    where
        T: DeserializeOwned,
    {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| RegistryError::Decode(err.to_string()))
    }

    async fn fetch_node(&self, name: &str) -> Result<Option<Node>, RegistryError> {
        let request = self.client.get(self.node_url(Some(name))?).timeout(REQUEST_TIMEOUT);
        match self.send_json(request).await {
            Ok(node) => Ok(Some(node)),
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn fetch_nodes(&self) -> Result<NodeList, RegistryError> {
        let request = self.client.get(self.node_url(None)?).timeout(REQUEST_TIMEOUT);
        self.send_json(request).await
    }

    async fn open_watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<NodeEventStream, RegistryError> {
        let mut query: Vec<(&str, String)> = vec![
            ("watch", "true".to_string()),
            ("allowWatchBookmarks", "true".to_string()),
            ("timeoutSeconds", WATCH_TIMEOUT_SECONDS.to_string()),
        ];
        if let Some(version) = resource_version {
            query.push(("resourceVersion", version));
        }
        let request = self
            .client
            .get(self.node_url(None)?)
            .query(&query)
            .timeout(Duration::from_secs(WATCH_TIMEOUT_SECONDS) + WATCH_REQUEST_SLACK);
        let response = self.send(request).await?;
        Ok(decode_stream(Box::pin(response.bytes_stream())))
    }

    async fn send_patch(&self, name: &str, patch: &AnnotationPatch) -> Result<(), RegistryError> {
        let body = serde_json::to_vec(&patch.to_merge_patch())
            .map_err(|err| RegistryError::Decode(err.to_string()))?;
        let request = self
            .client
            .patch(self.node_url(Some(name))?)
            .header(CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
            .body(body)
            .timeout(REQUEST_TIMEOUT);
        self.send(request).await.map(|_| ())
    }

    async fn send_delete(&self, name: &str) -> Result<(), RegistryError> {
        let request = self.client.delete(self.node_url(Some(name))?).timeout(REQUEST_TIMEOUT);
        match self.send(request).await {
            Ok(_) | Err(RegistryError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl NodeRegistry for KubeClient {
    fn get_node<'a>(&'a self, name: &'a str) -> RegistryFuture<'a, Option<Node>> {
        Box::pin(self.fetch_node(name))
    }

    fn list_nodes(&self) -> RegistryFuture<'_, NodeList> {
        Box::pin(self.fetch_nodes())
    }

    fn watch_nodes(&self, resource_version: Option<String>) -> RegistryFuture<'_, NodeEventStream> {
        Box::pin(self.open_watch(resource_version))
    }

    fn patch_annotations<'a>(
        &'a self,
        name: &'a str,
        patch: &'a AnnotationPatch,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(self.send_patch(name, patch))
    }

    fn delete_node<'a>(&'a self, name: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(self.send_delete(name))
    }
}

async fn error_from_response(response: Response) -> RegistryError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiStatus>(&text)
        .ok()
        .map(|status| status.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text
            }
        });
    RegistryError::from_status(status.as_u16(), message)
}

fn in_cluster_server() -> Result<String, Box<dyn Error + Send + Sync>> {
    let host = env::var(SERVICE_HOST_ENV).map_err(|_| {
        with_context(
            format!("{SERVICE_HOST_ENV} is not set"),
            "No API server configured and not running in a cluster",
        )
    })?;
    let port = env::var(SERVICE_PORT_ENV).unwrap_or_else(|_| "443".to_string());
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host
    };
    Ok(format!("https://{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &str) -> KubeClient {
        KubeClient::from_settings(&ApiSettings {
            server: Some(server.to_string()),
            token: Some("secret".to_string()),
            ..Default::default()
        })
        .expect("client")
    }

    #[test]
    fn node_urls_are_built_from_segments() {
        let client = client_for("https://10.0.0.1:6443");
        assert_eq!(
            client.node_url(Some("worker-1")).expect("url").as_str(),
            "https://10.0.0.1:6443/api/v1/nodes/worker-1"
        );

        let prefixed = client_for("https://proxy.example.com/k8s/");
        assert_eq!(
            prefixed.node_url(None).expect("url").as_str(),
            "https://proxy.example.com/k8s/api/v1/nodes"
        );
    }

    #[test]
    fn invalid_server_urls_are_rejected() {
        let err = KubeClient::from_settings(&ApiSettings {
            server: Some("not a url".to_string()),
            ..Default::default()
        })
        .err()
        .expect("invalid url");
        assert!(err.to_string().contains("Invalid API server URL"));
    }
}
