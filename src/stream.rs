//! Streaming parser and passthrough.
//!
//! The upstream body is forwarded to the client byte-for-byte; a side
//! framer incrementally splits the same bytes into SSE/NDJSON events and
//! feeds parsed chunks into a bounded tap for the accounting merger. A
//! full tap drops chunks for the merge only, never for the client.
//!
//! DoS bounds (chunk count, buffered bytes, lines per pass) abort the
//! stream with a typed error.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::dispatch::UpstreamByteStream;
use crate::pricing::UsageTokens;
use crate::providers::TargetProtocol;

/// Hard cap on parsed chunks per stream.
pub const MAX_STREAM_CHUNKS: usize = 1000;
/// Hard cap on bytes buffered while waiting for a line break.
pub const MAX_BUFFERED_BYTES: usize = 10 * 1024 * 1024;
/// Hard cap on lines processed in one framer pass.
pub const MAX_LINES_PER_PASS: usize = 10_000;

/// Capacity of the accounting tap.
pub const TAP_CAPACITY: usize = 256;

/// Typed DoS-bound violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBound {
    TooManyChunks,
    BufferOverflow,
    TooManyLines,
}

impl std::fmt::Display for StreamBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooManyChunks => write!(f, "stream exceeded {} chunks", MAX_STREAM_CHUNKS),
            Self::BufferOverflow => {
                write!(f, "stream buffered more than {} bytes", MAX_BUFFERED_BYTES)
            }
            Self::TooManyLines => {
                write!(f, "stream produced more than {} lines in one pass", MAX_LINES_PER_PASS)
            }
        }
    }
}

/// Whether a response should be treated as a stream: declared by
/// Content-Type, or recognizable from the first body bytes.
pub fn is_stream_response(content_type: Option<&str>, first_bytes: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("text/event-stream") || ct.contains("application/x-ndjson") {
            return true;
        }
    }
    let head = &first_bytes[..first_bytes.len().min(64)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start();
    trimmed.starts_with("event:") || trimmed.starts_with("data:")
}

// ─────────────────────────────────────────────────────────────────────────────
// Framing
// ─────────────────────────────────────────────────────────────────────────────

/// Incremental SSE/NDJSON framer.
///
/// Bytes accumulate in a buffer split on `\n`; the trailing partial line is
/// held for the next push. `data:` lines accumulate into the in-progress
/// event, a blank line completes it; bare JSON lines (NDJSON) complete
/// immediately. `data: [DONE]` is dropped, unparseable events are counted
/// in `skipped_chunks` without aborting.
#[derive(Default)]
pub struct EventFramer {
    buf: Vec<u8>,
    event_data: Vec<String>,
    pub chunks_emitted: usize,
    pub skipped_chunks: u64,
}

impl EventFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns the JSON chunks it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<serde_json::Value>, StreamBound> {
        if self.buf.len() + chunk.len() > MAX_BUFFERED_BYTES {
            return Err(StreamBound::BufferOverflow);
        }
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut lines = 0usize;
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            lines += 1;
            if lines > MAX_LINES_PER_PASS {
                return Err(StreamBound::TooManyLines);
            }
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            self.consume_line(line, &mut out)?;
        }
        Ok(out)
    }

    /// Flush the held partial line at end of stream.
    pub fn finish(&mut self) -> Result<Vec<serde_json::Value>, StreamBound> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let tail = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&tail).to_string();
            self.consume_line(line.trim_end_matches(['\r', '\n']), &mut out)?;
        }
        if !self.event_data.is_empty() {
            self.complete_event(&mut out)?;
        }
        Ok(out)
    }

    fn consume_line(
        &mut self,
        line: &str,
        out: &mut Vec<serde_json::Value>,
    ) -> Result<(), StreamBound> {
        if line.is_empty() {
            if !self.event_data.is_empty() {
                self.complete_event(out)?;
            }
            return Ok(());
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.event_data.push(data.trim_start().to_string());
            return Ok(());
        }
        // event names, ids, and comments carry no payload
        if line.starts_with("event:") || line.starts_with("id:") || line.starts_with(':') {
            return Ok(());
        }
        // NDJSON: a bare JSON document per line
        if line.starts_with('{') || line.starts_with('[') {
            self.emit(line, out)?;
        }
        Ok(())
    }

    fn complete_event(&mut self, out: &mut Vec<serde_json::Value>) -> Result<(), StreamBound> {
        let payload = self.event_data.join("\n");
        self.event_data.clear();
        if payload.trim() == "[DONE]" {
            return Ok(());
        }
        self.emit(&payload, out)
    }

    fn emit(&mut self, payload: &str, out: &mut Vec<serde_json::Value>) -> Result<(), StreamBound> {
        if self.chunks_emitted >= MAX_STREAM_CHUNKS {
            return Err(StreamBound::TooManyChunks);
        }
        match serde_json::from_str(payload) {
            Ok(value) => {
                self.chunks_emitted += 1;
                out.push(value);
            }
            Err(_) => {
                self.skipped_chunks += 1;
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Passthrough with accounting tap
// ─────────────────────────────────────────────────────────────────────────────

/// Forward the upstream byte stream unchanged, enforcing the idle timeout
/// and the DoS bounds, while feeding parsed chunks into the bounded tap.
///
/// The tap is best-effort: `try_send`, full means the merger loses that
/// chunk. The client passthrough never waits on it.
pub fn forward_with_tap(
    upstream: UpstreamByteStream,
    idle_timeout: Duration,
    tap: mpsc::Sender<serde_json::Value>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut upstream = upstream;
        let mut framer = EventFramer::new();
        loop {
            let next = match tokio::time::timeout(idle_timeout, upstream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    yield Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("stream idle for more than {} ms", idle_timeout.as_millis()),
                    ));
                    break;
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    match framer.push(&chunk) {
                        Ok(values) => {
                            for value in values {
                                if tap.try_send(value).is_err() {
                                    // merger is behind; drop for accounting only
                                }
                            }
                        }
                        Err(bound) => {
                            tracing::warn!(bound = %bound, "Aborting stream at safety bound");
                            yield Err(std::io::Error::other(bound.to_string()));
                            break;
                        }
                    }
                    yield Ok(chunk);
                }
                Some(Err(e)) => {
                    yield Err(std::io::Error::other(e.to_string()));
                    break;
                }
                None => {
                    if let Ok(values) = framer.finish() {
                        for value in values {
                            let _ = tap.try_send(value);
                        }
                    }
                    if framer.skipped_chunks > 0 {
                        tracing::debug!(
                            skipped = framer.skipped_chunks,
                            "Stream contained unparseable chunks"
                        );
                    }
                    break;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunk merge
// ─────────────────────────────────────────────────────────────────────────────

/// The merged logical response the accounting path needs.
#[derive(Debug, Clone, Default)]
pub struct MergedResponse {
    pub text: String,
    pub usage: UsageTokens,
    /// Cache-write tokens whose tier the upstream did not name; the
    /// recorder folds them into the resolved tier
    pub cache_creation_unattributed: u64,
    pub model: Option<String>,
}

/// One upstream chunk, typed by protocol family.
#[derive(Debug)]
pub enum UpstreamEnvelope {
    Anthropic(AnthropicChunk),
    OpenaiChat(OpenaiChatChunk),
    OpenaiResponses(OpenaiResponsesChunk),
    Gemini(GeminiChunk),
}

#[derive(Debug, Default, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation: Option<AnthropicCacheCreation>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnthropicCacheCreation {
    #[serde(default)]
    pub ephemeral_5m_input_tokens: Option<u64>,
    #[serde(default)]
    pub ephemeral_1h_input_tokens: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnthropicChunk {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub delta: Option<serde_json::Value>,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenaiChatChunk {
    #[serde(default)]
    pub choices: Vec<serde_json::Value>,
    #[serde(default)]
    pub usage: Option<serde_json::Value>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenaiResponsesChunk {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    // non-streaming shape
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub usage: Option<serde_json::Value>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiChunk {
    #[serde(default)]
    pub candidates: Vec<serde_json::Value>,
    #[serde(rename = "usageMetadata", default)]
    pub usage_metadata: Option<serde_json::Value>,
    #[serde(rename = "modelVersion", default)]
    pub model_version: Option<String>,
}

fn u64_at(value: &serde_json::Value, key: &str) -> Option<u64> {
    value.get(key).and_then(|v| v.as_u64())
}

impl UpstreamEnvelope {
    /// Type a raw chunk by the protocol family it came from. Chunks that
    /// fail to match the family's shape degrade to an empty envelope so a
    /// malformed chunk never aborts the merge.
    pub fn parse(protocol: TargetProtocol, value: &serde_json::Value) -> Self {
        match protocol {
            TargetProtocol::Anthropic => Self::Anthropic(
                serde_json::from_value(value.clone()).unwrap_or_default(),
            ),
            TargetProtocol::OpenaiChat => Self::OpenaiChat(
                serde_json::from_value(value.clone()).unwrap_or_default(),
            ),
            TargetProtocol::OpenaiResponses => Self::OpenaiResponses(
                serde_json::from_value(value.clone()).unwrap_or_default(),
            ),
            TargetProtocol::Gemini => Self::Gemini(
                serde_json::from_value(value.clone()).unwrap_or_default(),
            ),
        }
    }

    /// Fold this chunk into the accumulating merge: text concatenates,
    /// the last non-null usage wins.
    pub fn merge_into(self, acc: &mut MergedResponse) {
        match self {
            Self::Anthropic(chunk) => merge_anthropic(chunk, acc),
            Self::OpenaiChat(chunk) => merge_openai_chat(chunk, acc),
            Self::OpenaiResponses(chunk) => merge_openai_responses(chunk, acc),
            Self::Gemini(chunk) => merge_gemini(chunk, acc),
        }
    }
}

fn apply_anthropic_usage(usage: &AnthropicUsage, acc: &mut MergedResponse) {
    if let Some(v) = usage.input_tokens {
        acc.usage.input = v;
    }
    if let Some(v) = usage.output_tokens {
        acc.usage.output = v;
    }
    if let Some(v) = usage.cache_read_input_tokens {
        acc.usage.cache_read = v;
    }
    if let Some(cc) = &usage.cache_creation {
        if let Some(v) = cc.ephemeral_5m_input_tokens {
            acc.usage.cache_creation_5m = v;
        }
        if let Some(v) = cc.ephemeral_1h_input_tokens {
            acc.usage.cache_creation_1h = v;
        }
    } else if let Some(v) = usage.cache_creation_input_tokens {
        acc.cache_creation_unattributed = v;
    }
}

fn merge_anthropic(chunk: AnthropicChunk, acc: &mut MergedResponse) {
    match chunk.event_type.as_deref() {
        Some("message_start") => {
            if let Some(message) = &chunk.message {
                if let Some(model) = message.get("model").and_then(|v| v.as_str()) {
                    acc.model = Some(model.to_string());
                }
                if let Some(usage) = message.get("usage") {
                    if let Ok(usage) = serde_json::from_value::<AnthropicUsage>(usage.clone()) {
                        apply_anthropic_usage(&usage, acc);
                    }
                }
            }
        }
        Some("content_block_delta") => {
            if let Some(delta) = &chunk.delta {
                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                    acc.text.push_str(text);
                }
            }
        }
        Some("message_delta") => {
            if let Some(usage) = &chunk.usage {
                apply_anthropic_usage(usage, acc);
            }
        }
        // non-streaming body: a complete message
        _ => {
            if let Some(model) = chunk.model {
                acc.model = Some(model);
            }
            if let Some(content) = &chunk.content {
                if let Some(blocks) = content.as_array() {
                    for block in blocks {
                        if block.get("type").and_then(|v| v.as_str()) == Some("text") {
                            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                                acc.text.push_str(text);
                            }
                        }
                    }
                }
            }
            if let Some(usage) = &chunk.usage {
                apply_anthropic_usage(usage, acc);
            }
        }
    }
}

fn merge_openai_chat(chunk: OpenaiChatChunk, acc: &mut MergedResponse) {
    if let Some(model) = chunk.model {
        acc.model = Some(model);
    }
    for choice in &chunk.choices {
        // streaming delta or full message, whichever is present
        if let Some(text) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
        {
            acc.text.push_str(text);
        }
        if let Some(text) = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
        {
            acc.text.push_str(text);
        }
    }
    if let Some(usage) = &chunk.usage {
        if !usage.is_null() {
            let prompt = u64_at(usage, "prompt_tokens").unwrap_or(0);
            let cached = usage
                .get("prompt_tokens_details")
                .and_then(|d| u64_at(d, "cached_tokens"))
                .unwrap_or(0);
            acc.usage.input = prompt.saturating_sub(cached);
            acc.usage.cache_read = cached;
            acc.usage.output = u64_at(usage, "completion_tokens").unwrap_or(0);
        }
    }
}

fn apply_responses_usage(usage: &serde_json::Value, acc: &mut MergedResponse) {
    if usage.is_null() {
        return;
    }
    let input = u64_at(usage, "input_tokens").unwrap_or(0);
    let cached = usage
        .get("input_tokens_details")
        .and_then(|d| u64_at(d, "cached_tokens"))
        .unwrap_or(0);
    acc.usage.input = input.saturating_sub(cached);
    acc.usage.cache_read = cached;
    acc.usage.output = u64_at(usage, "output_tokens").unwrap_or(0);
}

fn merge_openai_responses(chunk: OpenaiResponsesChunk, acc: &mut MergedResponse) {
    if let Some(model) = chunk.model {
        acc.model = Some(model);
    }
    match chunk.event_type.as_deref() {
        Some("response.output_text.delta") => {
            if let Some(delta) = &chunk.delta {
                acc.text.push_str(delta);
            }
        }
        Some("response.completed") => {
            if let Some(response) = &chunk.response {
                if let Some(model) = response.get("model").and_then(|v| v.as_str()) {
                    acc.model = Some(model.to_string());
                }
                if let Some(usage) = response.get("usage") {
                    apply_responses_usage(usage, acc);
                }
            }
        }
        _ => {
            // non-streaming response object
            if let Some(output) = chunk.output.as_ref().and_then(|o| o.as_array()) {
                for item in output {
                    if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
                        for part in parts {
                            if part.get("type").and_then(|v| v.as_str()) == Some("output_text") {
                                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                                    acc.text.push_str(text);
                                }
                            }
                        }
                    }
                }
            }
            if let Some(usage) = &chunk.usage {
                apply_responses_usage(usage, acc);
            }
        }
    }
}

fn merge_gemini(chunk: GeminiChunk, acc: &mut MergedResponse) {
    if let Some(model) = chunk.model_version {
        acc.model = Some(model);
    }
    for candidate in &chunk.candidates {
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    acc.text.push_str(text);
                }
            }
        }
    }
    if let Some(usage) = &chunk.usage_metadata {
        if !usage.is_null() {
            let prompt = u64_at(usage, "promptTokenCount").unwrap_or(0);
            let cached = u64_at(usage, "cachedContentTokenCount").unwrap_or(0);
            acc.usage.input = prompt.saturating_sub(cached);
            acc.usage.cache_read = cached;
            acc.usage.output = u64_at(usage, "candidatesTokenCount").unwrap_or(0);
        }
    }
}

/// Merge a sequence of parsed chunks into the logical response.
pub fn merge_chunks<I>(protocol: TargetProtocol, chunks: I) -> MergedResponse
where
    I: IntoIterator<Item = serde_json::Value>,
{
    let mut acc = MergedResponse::default();
    for value in chunks {
        UpstreamEnvelope::parse(protocol, &value).merge_into(&mut acc);
    }
    acc
}

/// Drain the accounting tap and merge everything it saw.
pub async fn collect_merge(
    protocol: TargetProtocol,
    mut rx: mpsc::Receiver<serde_json::Value>,
) -> MergedResponse {
    let mut acc = MergedResponse::default();
    while let Some(value) = rx.recv().await {
        UpstreamEnvelope::parse(protocol, &value).merge_into(&mut acc);
    }
    acc
}
