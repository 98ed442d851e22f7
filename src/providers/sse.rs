//! Frame decoding for streamed model responses
//!
//! Two line-oriented framings are understood:
//!
//! - OpenAI-style server-sent events: `data: {json}` lines carrying
//!   `choices[0].delta.content` or a top-level `usage` object, terminated by
//!   `data: [DONE]`.
//! - The data-stream protocol: `0:"text"` deltas, `e:{..}` / `d:{..}` finish
//!   events carrying `usage`, and `3:"message"` errors.
//!
//! Malformed frames are skipped and logged; only transport errors and
//! explicit provider error frames end a stream early.

use super::base::{ChatStream, StreamEvent, TokenUsage};
use crate::error::ChatflowError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

/// One decoded line of a response stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text fragment to append
    ContentDelta(String),
    /// Token usage report
    Usage(TokenUsage),
    /// Final text fragment carried together with the usage report
    ContentWithUsage(String, TokenUsage),
    /// Explicit end of stream
    Done,
    /// The provider reported an error inside the stream
    ProviderError(String),
    /// Blank line, comment, SSE metadata, or a delta without text
    KeepAlive,
    /// Anything that could not be decoded
    Unrecognized(String),
}

/// Splits a byte stream into complete lines
///
/// Partial lines are carried over between calls to [`SseLineBuffer::feed`].
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed
    ///
    /// # Examples
    ///
    /// ```
    /// use chatflow::providers::sse::SseLineBuffer;
    ///
    /// let mut buffer = SseLineBuffer::new();
    /// assert!(buffer.feed(b"data: hel").is_empty());
    /// assert_eq!(buffer.feed(b"lo\n"), vec!["data: hello".to_string()]);
    /// ```
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Return the trailing partial line, if any
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Decode a single line into a [`Frame`]
///
/// # Examples
///
/// ```
/// use chatflow::providers::sse::{parse_frame, Frame};
///
/// let frame = parse_frame(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#);
/// assert_eq!(frame, Frame::ContentDelta("Hi".to_string()));
/// assert_eq!(parse_frame("data: [DONE]"), Frame::Done);
/// assert_eq!(parse_frame(r#"0:"Hi""#), Frame::ContentDelta("Hi".to_string()));
/// ```
pub fn parse_frame(line: &str) -> Frame {
    let line = line.trim_end();
    if line.trim().is_empty() || line.starts_with(':') {
        return Frame::KeepAlive;
    }

    if let Some(data) = line.strip_prefix("data:") {
        return parse_sse_data(data.trim_start());
    }

    if line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:") {
        return Frame::KeepAlive;
    }

    match line.split_once(':') {
        Some((code, payload)) if !code.is_empty() && code.len() <= 2 => {
            parse_data_stream_part(code, payload)
        }
        _ => Frame::Unrecognized(format!("unknown line: {}", truncate(line))),
    }
}

fn parse_sse_data(data: &str) -> Frame {
    if data == "[DONE]" {
        return Frame::Done;
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Frame::Unrecognized(format!("invalid JSON ({}): {}", e, truncate(data))),
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Frame::ProviderError(message);
    }

    let content = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let usage = value.get("usage").and_then(usage_from_json);
    match (content, usage) {
        (Some(content), Some(usage)) => {
            return Frame::ContentWithUsage(content.to_string(), usage)
        }
        (Some(content), None) => return Frame::ContentDelta(content.to_string()),
        (None, Some(usage)) => return Frame::Usage(usage),
        (None, None) => {}
    }

    if value.get("choices").is_some() {
        return Frame::KeepAlive;
    }

    Frame::Unrecognized(format!("unexpected payload: {}", truncate(data)))
}

fn parse_data_stream_part(code: &str, payload: &str) -> Frame {
    match code {
        "0" => match serde_json::from_str::<String>(payload) {
            Ok(text) if text.is_empty() => Frame::KeepAlive,
            Ok(text) => Frame::ContentDelta(text),
            Err(e) => Frame::Unrecognized(format!("invalid text part ({}): {}", e, truncate(payload))),
        },
        "3" => match serde_json::from_str::<String>(payload) {
            Ok(message) => Frame::ProviderError(message),
            Err(_) => Frame::ProviderError(payload.to_string()),
        },
        "e" | "d" => match serde_json::from_str::<Value>(payload) {
            Ok(value) => value
                .get("usage")
                .and_then(usage_from_json)
                .map(Frame::Usage)
                .unwrap_or(Frame::KeepAlive),
            Err(e) => Frame::Unrecognized(format!("invalid finish part ({}): {}", e, truncate(payload))),
        },
        _ => Frame::KeepAlive,
    }
}

/// Read usage from either `prompt_tokens`/`completion_tokens` or the camelCase form
fn usage_from_json(usage: &Value) -> Option<TokenUsage> {
    let field = |snake: &str, camel: &str| {
        usage
            .get(snake)
            .or_else(|| usage.get(camel))
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
    };
    let prompt = field("prompt_tokens", "promptTokens");
    let completion = field("completion_tokens", "completionTokens");
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    Some(TokenUsage::new(
        prompt.unwrap_or_default(),
        completion.unwrap_or_default(),
    ))
}

fn truncate(s: &str) -> String {
    const MAX: usize = 120;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(MAX).collect::<String>())
    }
}

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    lines: SseLineBuffer,
    pending: VecDeque<crate::error::Result<StreamEvent>>,
    finished: bool,
}

impl<S> DecodeState<S> {
    fn push_line(&mut self, line: &str) {
        if self.finished {
            return;
        }
        match parse_frame(line) {
            Frame::ContentDelta(text) => self.pending.push_back(Ok(StreamEvent::Delta(text))),
            Frame::Usage(usage) => self.pending.push_back(Ok(StreamEvent::Usage(usage))),
            Frame::ContentWithUsage(text, usage) => {
                self.pending.push_back(Ok(StreamEvent::Delta(text)));
                self.pending.push_back(Ok(StreamEvent::Usage(usage)));
            }
            Frame::Done => {
                self.finished = true;
                self.pending.push_back(Ok(StreamEvent::Done));
            }
            Frame::ProviderError(message) => {
                self.finished = true;
                self.pending
                    .push_back(Err(ChatflowError::Transport(message).into()));
            }
            Frame::KeepAlive => {}
            Frame::Unrecognized(reason) => {
                tracing::warn!("Skipping malformed stream frame: {}", reason);
            }
        }
    }
}

/// Turn a raw response body into a [`ChatStream`]
///
/// A body that ends without an explicit terminal frame is treated as a
/// clean end of stream.
pub fn decode_event_stream<S, E>(bytes: S) -> ChatStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        lines: SseLineBuffer::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for line in state.lines.feed(&chunk) {
                        state.push_line(&line);
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state
                        .pending
                        .push_back(Err(ChatflowError::Transport(e.to_string()).into()));
                }
                None => {
                    if let Some(line) = state.lines.flush() {
                        state.push_line(&line);
                    }
                    if !state.finished {
                        state.finished = true;
                        state.pending.push_back(Ok(StreamEvent::Done));
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        let owned: Vec<Result<Bytes, std::io::Error>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    async fn collect(stream: ChatStream) -> Vec<crate::error::Result<StreamEvent>> {
        stream.collect().await
    }

    #[test]
    fn test_line_buffer_handles_split_lines_and_crlf() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.feed(b"data: a").is_empty());
        assert_eq!(buffer.feed(b"bc\r\ndata: d\n"), vec!["data: abc", "data: d"]);
        assert_eq!(buffer.flush(), None);
        buffer.feed(b"tail");
        assert_eq!(buffer.flush(), Some("tail".to_string()));
    }

    #[test]
    fn test_line_buffer_keeps_multibyte_chars_split_across_chunks() {
        let mut buffer = SseLineBuffer::new();
        let text = "0:\"héllo\"\n".as_bytes();
        let (first, second) = text.split_at(4);
        assert!(buffer.feed(first).is_empty());
        assert_eq!(buffer.feed(second), vec!["0:\"héllo\""]);
    }

    #[test]
    fn test_parse_openai_usage_frame() {
        let frame = parse_frame(
            r#"data: {"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#,
        );
        assert_eq!(frame, Frame::Usage(TokenUsage::new(9, 3)));
    }

    #[tokio::test]
    async fn test_decode_keeps_usage_sent_with_last_delta() {
        let stream = decode_event_stream(body(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Bye\"}}],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":1}}\n\n",
            "data: [DONE]\n\n",
        ]));
        let events: Vec<StreamEvent> = collect(stream)
            .await
            .into_iter()
            .map(|e| e.expect("event"))
            .collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Bye".to_string()),
                StreamEvent::Usage(TokenUsage::new(4, 1)),
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn test_parse_role_only_delta_is_keepalive() {
        let frame = parse_frame(r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#);
        assert_eq!(frame, Frame::KeepAlive);
    }

    #[test]
    fn test_parse_openai_error_payload() {
        let frame = parse_frame(r#"data: {"error":{"message":"overloaded"}}"#);
        assert_eq!(frame, Frame::ProviderError("overloaded".to_string()));
    }

    #[test]
    fn test_parse_data_stream_text_unescapes_newlines() {
        assert_eq!(
            parse_frame(r#"0:"line one\nline two""#),
            Frame::ContentDelta("line one\nline two".to_string())
        );
    }

    #[test]
    fn test_parse_data_stream_finish_usage() {
        let frame =
            parse_frame(r#"d:{"finishReason":"stop","usage":{"promptTokens":5,"completionTokens":7}}"#);
        assert_eq!(frame, Frame::Usage(TokenUsage::new(5, 7)));
    }

    #[test]
    fn test_parse_malformed_json_is_unrecognized() {
        assert!(matches!(
            parse_frame("data: {not json"),
            Frame::Unrecognized(_)
        ));
        assert!(matches!(
            parse_frame("something odd"),
            Frame::Unrecognized(_)
        ));
    }

    #[test]
    fn test_parse_metadata_lines_are_keepalive() {
        assert_eq!(parse_frame(""), Frame::KeepAlive);
        assert_eq!(parse_frame(": ping"), Frame::KeepAlive);
        assert_eq!(parse_frame("event: message"), Frame::KeepAlive);
    }

    #[tokio::test]
    async fn test_decode_skips_bad_frames_and_keeps_order() {
        let stream = decode_event_stream(body(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {broken\n\n",
            "data: {\"choices\":[{\"delta\":{\"con",
            "tent\":\"lo\"}}]}\n\ndata: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]));

        let events: Vec<StreamEvent> = collect(stream)
            .await
            .into_iter()
            .map(|e| e.expect("event"))
            .collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hel".to_string()),
                StreamEvent::Delta("lo".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_body_without_terminator_completes() {
        let stream = decode_event_stream(body(&["0:\"a\"\n0:\"b\""]));
        let events: Vec<StreamEvent> = collect(stream)
            .await
            .into_iter()
            .map(|e| e.expect("event"))
            .collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("a".to_string()),
                StreamEvent::Delta("b".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_transport_error_ends_stream() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"0:\"partial\"\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"0:\"never\"\n")),
        ];
        let events = collect(decode_event_stream(futures::stream::iter(chunks))).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(StreamEvent::Delta(_))));
        let err = events[1].as_ref().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatflowError>(),
            Some(ChatflowError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_provider_error_frame_is_transport_error() {
        let events = collect(decode_event_stream(body(&["0:\"x\"\n3:\"rate limited\"\n"]))).await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_err());
    }
}
