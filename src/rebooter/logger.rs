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

//! Line-oriented structured logger.
//!
//! Every record carries the timestamp, level, component and message plus
//! free-form `key=value` metadata. Records emitted inside an
//! [`observability::tracing::with_span`](crate::rebooter::observability::tracing::with_span)
//! scope also carry the active `trace_id` / `span_id`, which ties together all
//! lines produced by a single recovery tick.

use crate::rebooter::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
#[cfg(not(test))]
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "amt-rebooter";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unsupported log format '{other}' (expected text or json)")),
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Records below `level` are discarded.
pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }

    fn enabled(self) -> bool {
        self as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unsupported log level '{other}'")),
        }
    }
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace()
                || matches!(
                    c,
                    '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',' | '\n' | '\r' | '\t'
                )
        });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

/// Fixed fields first, then span ids, then caller metadata in order.
fn record_fields(
    level: LogLevel,
    component: &str,
    message: &str,
    metadata: &[(&str, &str)],
) -> Vec<(String, String)> {
    let mut fields = vec![
        (
            "ts".to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        ("level".to_string(), level.as_str().to_string()),
        ("service".to_string(), SERVICE_NAME.to_string()),
        ("component".to_string(), component.to_string()),
        ("pid".to_string(), std::process::id().to_string()),
        ("msg".to_string(), message.to_string()),
    ];
    if let Some(ctx) = tracing::current_context() {
        fields.push(("trace_id".to_string(), ctx.trace_id().to_string()));
        fields.push(("span_id".to_string(), ctx.span_id().to_string()));
    }
    fields.extend(
        metadata
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| ((*key).to_string(), (*value).to_string())),
    );
    fields
}

fn render(format: LogFormat, fields: Vec<(String, String)>) -> String {
    match format {
        LogFormat::Text => fields
            .iter()
            .map(|(key, value)| format!("{key}={}", encode_field_value(value)))
            .collect::<Vec<_>>()
            .join(" "),
        LogFormat::Json => {
            let payload: serde_json::Map<String, Value> = fields
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect();
            Value::Object(payload).to_string()
        }
    }
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    if !level.enabled() {
        return;
    }
    let fields = record_fields(level, component, message, metadata);
    write_line(level, &render(current_log_format(), fields));
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let write_result = if level.is_stderr() {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{}", line)
    } else {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)
    };

    if let Err(error) = write_result {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "amt-rebooter: failed to write log line: {} (line: {})",
            error, line
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    let _ = level.is_stderr();
    let store = test_log_store();
    let mut guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Drains captured log lines. Only available to unit tests.
#[cfg(test)]
pub(crate) fn take_test_logs() -> Vec<(LogLevel, String)> {
    let store = test_log_store();
    let mut guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.drain(..).collect()
}

/// Serializes unit tests that assert on the captured log store.
#[cfg(test)]
pub(crate) fn test_log_lock() -> &'static tokio::sync::Mutex<()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebooter::observability::tracing;

    #[tokio::test]
    async fn text_logs_include_trace_ids() {
        let _lock = test_log_lock().lock().await;
        tracing::init();
        set_log_format(LogFormat::Text);
        take_test_logs();
        tracing::with_span("test.component", "text-log", async {
            log_info("unit", "testing", &[("node", "worker 1")]);
        })
        .await;

        let logs = take_test_logs();
        let line = logs
            .iter()
            .map(|(_, line)| line)
            .find(|line| line.contains("msg=testing"))
            .expect("line captured");
        assert!(
            line.contains("trace_id=") && line.contains("span_id="),
            "trace metadata missing: {line}"
        );
        assert!(line.contains("node=\"worker 1\""), "metadata not quoted: {line}");
        assert!(line.contains("service=amt-rebooter"));
    }

    #[tokio::test]
    async fn json_logs_include_trace_ids() {
        let _lock = test_log_lock().lock().await;
        tracing::init();
        set_log_format(LogFormat::Json);
        take_test_logs();
        tracing::with_span("test.component", "json-log", async {
            log_warn("unit", "testing-json", &[("key", "value")]);
        })
        .await;
        set_log_format(LogFormat::Text);

        let logs = take_test_logs();
        let payload: Value = logs
            .iter()
            .filter_map(|(_, line)| serde_json::from_str::<Value>(line).ok())
            .find(|payload| payload.get("msg").and_then(|v| v.as_str()) == Some("testing-json"))
            .expect("json line captured");
        assert_eq!(payload.get("component").and_then(|v| v.as_str()), Some("unit"));
        assert_eq!(payload.get("key").and_then(|v| v.as_str()), Some("value"));
        assert!(payload.get("trace_id").is_some());
    }

    #[tokio::test]
    async fn debug_records_are_filtered_by_default() {
        let _lock = test_log_lock().lock().await;
        set_log_format(LogFormat::Text);
        take_test_logs();
        log_debug("unit", "hidden-debug", &[]);
        let logs = take_test_logs();
        assert!(logs.iter().all(|(_, line)| !line.contains("hidden-debug")));
    }

    #[test]
    fn formats_and_levels_parse() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!(LogLevel::Error > LogLevel::Debug);
    }
}
