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

//! Correlation ids for log lines.
//!
//! A recovery tick or a watch event runs under [`with_span`]. The ids of the
//! innermost span are kept in a task-local so the logger can stamp every line
//! it writes with `trace_id` and `span_id`.

use rand::{rngs::OsRng, RngCore};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

const TRACE_ID_BYTES: usize = 16;
const SPAN_ID_BYTES: usize = 8;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    /// A new span under `parent`, or the root of a new trace.
    fn child_of(parent: Option<&TraceContext>) -> Self {
        let trace_id = match parent {
            Some(parent) => parent.trace_id.clone(),
            None => Arc::from(random_hex(TRACE_ID_BYTES)),
        };
        Self {
            trace_id,
            span_id: Arc::from(random_hex(SPAN_ID_BYTES)),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

task_local! {
    static CURRENT: TraceContext;
}

pub fn init() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // An embedding binary may have installed its own subscriber already.
        let _ = tracing::subscriber::set_global_default(Registry::default());
    });
}

pub fn current_context() -> Option<TraceContext> {
    CURRENT.try_with(TraceContext::clone).ok()
}

/// Runs `fut` under a new span. Inside another span the trace id is kept.
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let context = TraceContext::child_of(current_context().as_ref());
    let name = span_name.into();
    let span = tracing::info_span!(
        "amt_rebooter",
        component,
        span = name.as_str(),
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );
    CURRENT.scope(context, fut.instrument(span)).await
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nested_spans_share_trace_id() {
        init();
        assert!(current_context().is_none());
        let (outer, inner) = with_span("test", "outer", async {
            let outer = current_context().expect("outer context");
            let inner = with_span("test", "inner", async {
                current_context().expect("inner context")
            })
            .await;
            (outer, inner)
        })
        .await;

        assert_eq!(outer.trace_id(), inner.trace_id());
        assert_ne!(outer.span_id(), inner.span_id());
        assert_eq!(outer.trace_id().len(), 32);
        assert_eq!(inner.span_id().len(), 16);
        assert!(current_context().is_none());
    }

    #[tokio::test]
    async fn sibling_roots_start_separate_traces() {
        let first = with_span("test", "a", async { current_context() }).await;
        let second = with_span("test", "b", async { current_context() }).await;
        let (first, second) = (first.expect("first"), second.expect("second"));
        assert_ne!(first.trace_id(), second.trace_id());
    }
}
