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

use std::error::Error;
use std::fmt;

/// Upper bound applied to error text surfaced in health reports and log fields.
const MESSAGE_MAX_LEN: usize = 240;

#[derive(Debug)]
struct ContextError {
    context: String,
    source: Box<dyn Error + Send + Sync>,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for MessageError {}

/// Wraps `error` with a human readable description of the failing operation.
pub fn with_context<E>(error: E, context: impl Into<String>) -> Box<dyn Error + Send + Sync>
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    Box::new(ContextError {
        context: context.into(),
        source: error.into(),
    })
}

pub fn new_error(message: impl Into<String>) -> Box<dyn Error + Send + Sync> {
    Box::new(MessageError(message.into()))
}

/// Shortens `message` on a character boundary so it fits log fields and reports.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MESSAGE_MAX_LEN {
        return message.to_string();
    }
    let mut end = MESSAGE_MAX_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_prefixed_and_source_preserved() {
        let err = with_context(new_error("connection refused"), "Failed to list nodes");
        assert_eq!(err.to_string(), "Failed to list nodes: connection refused");
        assert!(err.source().is_some());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(200);
        let truncated = truncate_message(&long);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= MESSAGE_MAX_LEN + 3);
        assert_eq!(truncate_message("short"), "short");
    }
}
