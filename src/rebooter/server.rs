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

//! HTTP endpoints for Prometheus scraping and kubelet probes.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::rebooter::logger::log_info;
use crate::rebooter::observability::health::WatchHealth;
use crate::rebooter::observability::metrics;
use crate::rebooter::util::with_context;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn router(health: Arc<WatchHealth>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .with_state(health)
}

async fn metrics_handler() -> Response {
    match metrics::gather() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

/// The process is alive as long as it answers; watch state is reported but
/// never fails the probe.
async fn liveness(State(health): State<Arc<WatchHealth>>) -> Response {
    (StatusCode::OK, Json(health.report())).into_response()
}

async fn readiness(State(health): State<Arc<WatchHealth>>) -> Response {
    let report = health.report();
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// Serves the observability endpoints on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    health: Arc<WatchHealth>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind metrics listener on {addr}")))?;
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| addr.to_string());
    log_info("server", "Serving metrics and health endpoints", &[("addr", local.as_str())]);

    axum::serve(listener, router(health))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| with_context(e, "Metrics server failed"))
}
