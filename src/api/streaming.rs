// SSE translation of the vendor's streamed chat completion
//
// The vendor is always called in streaming mode. Its event stream is either
// folded into one `chat.completion` object or relayed to the caller line by line.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;

use super::copilot::UpstreamError;
use crate::proxy::usage::UsageTracker;
use crate::proxy::{estimate_tokens, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Streaming,
    Done,
    Error,
}

/// Classification of one SSE line
#[derive(Debug, PartialEq)]
pub enum SseLine<'a> {
    Data(&'a str),
    Done,
    /// Comments, keep-alives, `event:` fields, blank separators
    Other,
}

pub fn classify_line(line: &str) -> SseLine<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.strip_prefix("data:") {
        Some(data) => {
            let data = data.trim();
            if data == "[DONE]" {
                SseLine::Done
            } else if data.is_empty() {
                SseLine::Other
            } else {
                SseLine::Data(data)
            }
        }
        None => SseLine::Other,
    }
}

/// Splits an arbitrary byte stream into newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete lines (terminator included) found after appending `chunk`
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(Bytes::from(line));
        }
        lines
    }

    /// Trailing bytes not followed by a newline
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(&mut self.buffer)))
        }
    }
}

fn usage_from_chunk(chunk: &Value) -> Option<(u64, u64, u64)> {
    let usage = chunk.get("usage")?.as_object()?;
    let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
    Some((
        field("prompt_tokens"),
        field("completion_tokens"),
        field("total_tokens"),
    ))
}

fn delta_content(chunk: &Value) -> Option<&str> {
    chunk
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

/// Records usage for one completion once the response is finished or dropped.
pub struct UsageRecorder {
    tracker: Arc<UsageTracker>,
    user_id: u64,
    model: String,
    input_estimate: u64,
    output_bytes: usize,
    vendor_usage: Option<TokenUsage>,
    recorded: bool,
}

impl UsageRecorder {
    pub fn new(tracker: Arc<UsageTracker>, user_id: u64, model: &str, request_bytes: usize) -> Self {
        Self {
            tracker,
            user_id,
            model: model.to_string(),
            input_estimate: estimate_tokens(request_bytes),
            output_bytes: 0,
            vendor_usage: None,
            recorded: false,
        }
    }

    fn observe(&mut self, chunk: &Value) {
        if let Some(content) = delta_content(chunk) {
            self.output_bytes += content.len();
        }
        if let Some((prompt, completion, _)) = usage_from_chunk(chunk) {
            self.vendor_usage = Some(TokenUsage {
                input: prompt,
                output: completion,
            });
        }
    }

    pub fn usage(&self) -> TokenUsage {
        self.vendor_usage.unwrap_or(TokenUsage {
            input: self.input_estimate,
            output: estimate_tokens(self.output_bytes),
        })
    }

    pub fn finish(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        self.tracker.record(self.user_id, &self.model, self.usage());
    }
}

impl Drop for UsageRecorder {
    fn drop(&mut self) {
        self.record();
    }
}

/// Accumulates `choices[0].delta.content` and any vendor `usage` object.
#[derive(Debug)]
pub struct ChatAggregator {
    content: String,
    usage: Option<(u64, u64, u64)>,
    state: StreamState,
}

impl Default for ChatAggregator {
    fn default() -> Self {
        Self {
            content: String::new(),
            usage: None,
            state: StreamState::Streaming,
        }
    }
}

impl ChatAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Feed one line; returns the parsed chunk when the line carried data.
    pub fn feed_line(&mut self, line: &str) -> Option<Value> {
        if self.state != StreamState::Streaming {
            return None;
        }

        match classify_line(line) {
            SseLine::Done => {
                self.state = StreamState::Done;
                None
            }
            SseLine::Other => None,
            SseLine::Data(data) => match serde_json::from_str::<Value>(data) {
                Ok(chunk) => {
                    if let Some(content) = delta_content(&chunk) {
                        self.content.push_str(content);
                    }
                    if let Some(usage) = usage_from_chunk(&chunk) {
                        self.usage = Some(usage);
                    }
                    Some(chunk)
                }
                Err(e) => {
                    tracing::debug!("Skipping undecodable SSE chunk: {}", e);
                    None
                }
            },
        }
    }

    pub fn fail(&mut self) {
        self.state = StreamState::Error;
    }

    /// OpenAI `chat.completion` object for the accumulated content
    pub fn into_completion(self, model: &str, created: i64) -> Value {
        let (prompt, completion, total) = self.usage.unwrap_or((0, 0, 0));
        let id = format!(
            "chatcmpl-{}{:06}",
            created,
            rand::rng().random_range(0..1_000_000u32)
        );

        json!({
            "id": id,
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": self.content
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": prompt,
                "completion_tokens": completion,
                "total_tokens": total
            }
        })
    }
}

/// Drain the vendor stream and build one aggregated completion.
pub async fn aggregate<S, E>(
    upstream: S,
    model: &str,
    mut recorder: UsageRecorder,
) -> Result<Value, UpstreamError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<UpstreamError>,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut decoder = LineDecoder::new();
    let mut aggregator = ChatAggregator::new();

    'read: while let Some(chunk) = upstream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                aggregator.fail();
                let err: UpstreamError = e.into();
                tracing::warn!("Copilot stream failed while aggregating: {}", err);
                return Err(err);
            }
        };

        for line in decoder.push(&bytes) {
            let text = String::from_utf8_lossy(&line);
            if let Some(chunk) = aggregator.feed_line(&text) {
                recorder.observe(&chunk);
            }
            if aggregator.state() == StreamState::Done {
                break 'read;
            }
        }
    }

    if aggregator.state() == StreamState::Streaming {
        if let Some(rest) = decoder.finish() {
            let text = String::from_utf8_lossy(&rest);
            if let Some(chunk) = aggregator.feed_line(&text) {
                recorder.observe(&chunk);
            }
        }
        if aggregator.state() == StreamState::Streaming {
            tracing::warn!("Copilot stream ended without [DONE]");
        }
    }

    recorder.finish();
    Ok(aggregator.into_completion(model, chrono::Utc::now().timestamp()))
}

/// Relay every vendor line verbatim, one body frame per line.
///
/// Ends when the vendor closes the stream; a transport error ends it early
/// without a synthetic `[DONE]`.
pub fn passthrough<S, E>(
    upstream: S,
    mut recorder: UsageRecorder,
) -> impl Stream<Item = Result<Bytes, std::io::Error>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    async_stream::stream! {
        let mut upstream = Box::pin(upstream);
        let mut decoder = LineDecoder::new();
        let mut state = StreamState::Streaming;

        while let Some(chunk) = upstream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("Copilot stream interrupted: {}", e);
                    state = StreamState::Error;
                    break;
                }
            };

            for line in decoder.push(&bytes) {
                match classify_line(&String::from_utf8_lossy(&line)) {
                    SseLine::Data(data) => {
                        if let Ok(chunk) = serde_json::from_str::<Value>(data) {
                            recorder.observe(&chunk);
                        }
                    }
                    SseLine::Done => state = StreamState::Done,
                    SseLine::Other => {}
                }
                yield Ok(line);
            }
        }

        if state != StreamState::Error {
            if let Some(rest) = decoder.finish() {
                yield Ok(rest);
            }
        }

        tracing::debug!("Copilot passthrough stream finished in state {:?}", state);
        recorder.finish();
    }
}

/// Wrap a relayed stream in an SSE response.
pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
