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

//! Incremental decoding of newline-delimited Kubernetes watch responses.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::error::Error;

use super::node::{Node, WatchEvent};
use super::{NodeEventStream, RegistryError};

/// Accumulates response chunks and yields complete lines.
#[derive(Default)]
pub struct WatchLineBuffer {
    buffer: BytesMut,
}

impl WatchLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete, non-blank line without its terminator.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            let pos = self.buffer.iter().position(|b| *b == b'\n')?;
            let line = self.buffer.split_to(pos + 1);
            let mut line = line[..line.len() - 1].to_vec();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(line);
        }
    }

    /// Drains a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return None;
        }
        let rest = self.buffer.split().to_vec();
        Some(rest)
    }
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: Value,
}

#[derive(Deserialize, Default)]
struct ApiStatus {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

/// Decodes a single watch line. `ERROR` events carry a `Status` object and
/// are surfaced as errors; a 410 status becomes [`RegistryError::Gone`].
pub fn decode_watch_line(line: &[u8]) -> Result<WatchEvent<Node>, RegistryError> {
    let text = std::str::from_utf8(line)
        .map_err(|err| RegistryError::Decode(format!("watch line is not UTF-8: {err}")))?
        .trim();
    let raw: RawWatchEvent = serde_json::from_str(text)
        .map_err(|err| RegistryError::Decode(format!("invalid watch event: {err}")))?;

    if raw.event_type.eq_ignore_ascii_case("ERROR") {
        let status: ApiStatus = serde_json::from_value(raw.object).unwrap_or_default();
        return Err(RegistryError::from_status(status.code, status.message));
    }

    let event = serde_json::json!({"type": raw.event_type, "object": raw.object});
    serde_json::from_value(event)
        .map_err(|err| RegistryError::Decode(format!("invalid node watch event: {err}")))
}

struct DecoderState<S> {
    chunks: S,
    lines: WatchLineBuffer,
    finished: bool,
}

/// Turns a byte stream into a stream of node watch events. The stream ends
/// after the first transport error or when the body is exhausted.
pub fn decode_stream<S, E>(chunks: S) -> NodeEventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Error + Send + Sync + 'static,
{
    let state = DecoderState {
        chunks,
        lines: WatchLineBuffer::default(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.lines.next_line() {
                return Some((decode_watch_line(&line), state));
            }
            if state.finished {
                let line = state.lines.finish()?;
                return Some((decode_watch_line(&line), state));
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => state.lines.push(&chunk),
                Some(Err(err)) => {
                    state.finished = true;
                    state.lines = WatchLineBuffer::default();
                    return Some((Err(RegistryError::Transport(Box::new(err))), state));
                }
                None => state.finished = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebooter::k8s::node::WatchEventType;
    use std::io;

    #[test]
    fn line_buffer_handles_split_chunks_and_crlf() {
        let mut buffer = WatchLineBuffer::default();
        buffer.push(b"{\"a\":1}\r\n\n{\"b\"");
        assert_eq!(buffer.next_line().as_deref(), Some(&b"{\"a\":1}"[..]));
        assert!(buffer.next_line().is_none());
        buffer.push(b":2}");
        assert!(buffer.next_line().is_none());
        assert_eq!(buffer.finish().as_deref(), Some(&b"{\"b\":2}"[..]));
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn error_events_map_to_registry_errors() {
        let line = br#"{"type":"ERROR","object":{"kind":"Status","code":410,"message":"too old resource version"}}"#;
        let err = decode_watch_line(line).expect_err("error event");
        assert!(matches!(err, RegistryError::Gone(message) if message.contains("too old")));
    }

    #[tokio::test]
    async fn decodes_events_across_chunk_boundaries() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"name\":\"a\"}}}\n{\"type\":\"MOD")),
            Ok(Bytes::from_static(b"IFIED\",\"object\":{\"metadata\":{\"name\":\"b\"}}}")),
        ];
        let events: Vec<_> = decode_stream(stream::iter(chunks)).collect().await;

        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().expect("first event");
        assert_eq!(first.event_type, WatchEventType::Added);
        assert_eq!(first.object.name(), Some("a"));
        let second = events[1].as_ref().expect("second event");
        assert_eq!(second.event_type, WatchEventType::Modified);
        assert_eq!(second.object.name(), Some("b"));
    }

    #[tokio::test]
    async fn transport_errors_terminate_the_stream() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"name\":\"a\"}}}\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"{\"type\":\"ADDED\",\"object\":{}}\n")),
        ];
        let events: Vec<_> = decode_stream(stream::iter(chunks)).collect().await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(RegistryError::Transport(_))));
    }
}
