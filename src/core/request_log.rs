//! Per-request structured records for offline inspection.
//!
//! Every terminated caller request (success or exhaustion) emits exactly one
//! [`RequestLogRecord`] onto a bounded in-memory ring. The ring is the
//! contract consumed by the operator log surface; credentials and request
//! bodies never enter it. Token counts are parsed opportunistically from the
//! upstream response when it happens to carry them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Capacity of the in-memory ring of recent records.
pub const REQUEST_LOG_CAPACITY: usize = 500;

/// Placeholder stored instead of a body for streamed responses.
pub const STREAMED_BODY_MARKER: &str = "<streamed>";

/// One record per terminated caller request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub endpoint: String,
    pub model_requested: Option<String>,
    pub model_effective: Option<String>,
    pub provider_name: Option<String>,
    pub is_streaming: bool,
    pub status_code: Option<u16>,
    pub latency_ms: Option<u64>,
    /// Wall time from request start to the first non-empty body byte;
    /// recorded for streamed responses only.
    pub first_token_ms: Option<u64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub tokens_total: Option<i64>,
    /// Always false: the gateway never translates between protocol shapes.
    pub translated: bool,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Default for RequestLogRecord {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            endpoint: String::new(),
            model_requested: None,
            model_effective: None,
            provider_name: None,
            is_streaming: false,
            status_code: None,
            latency_ms: None,
            first_token_ms: None,
            tokens_in: None,
            tokens_out: None,
            tokens_total: None,
            translated: false,
            response_body: None,
            created_at: Utc::now(),
        }
    }
}

/// Bounded ring of recent request records. Single mutex; tail push is O(1),
/// reads copy under the lock.
pub struct RequestLogRing {
    inner: Mutex<VecDeque<RequestLogRecord>>,
    capacity: usize,
}

impl RequestLogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: RequestLogRecord) {
        let mut ring = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Most recent records, newest last, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<RequestLogRecord> {
        let ring = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestLogRing {
    fn default() -> Self {
        Self::new(REQUEST_LOG_CAPACITY)
    }
}

/// Token counts extracted from an upstream response payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub tokens_total: Option<i64>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.tokens_in.is_none() && self.tokens_out.is_none() && self.tokens_total.is_none()
    }

    pub fn apply_to(&self, record: &mut RequestLogRecord) {
        record.tokens_in = self.tokens_in;
        record.tokens_out = self.tokens_out;
        record.tokens_total = self.tokens_total;
    }
}

/// Parse token usage from a response payload, accepting both the OpenAI
/// `usage` object (with Anthropic's input/output field variants) and the
/// Gemini `usageMetadata` object.
pub fn extract_usage(payload: &Value) -> TokenUsage {
    let mut usage = TokenUsage::default();

    if let Some(obj) = payload.get("usage").and_then(Value::as_object) {
        usage.tokens_in = int_field(obj, "prompt_tokens").or_else(|| int_field(obj, "input_tokens"));
        usage.tokens_out =
            int_field(obj, "completion_tokens").or_else(|| int_field(obj, "output_tokens"));
        usage.tokens_total = int_field(obj, "total_tokens");
    }

    if let Some(meta) = payload
        .get("usageMetadata")
        .or_else(|| payload.get("usage_metadata"))
        .and_then(Value::as_object)
    {
        usage.tokens_in = usage.tokens_in.or_else(|| int_field(meta, "promptTokenCount"));
        usage.tokens_out = usage
            .tokens_out
            .or_else(|| int_field(meta, "candidatesTokenCount"));
        usage.tokens_total = usage
            .tokens_total
            .or_else(|| int_field(meta, "totalTokenCount"));
    }

    usage
}

fn int_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

/// Incremental usage extraction for SSE streams.
///
/// Feeds raw body chunks, reassembles `data:` lines across chunk boundaries
/// and remembers the usage from the last frame that carried one. Memory is
/// bounded by the longest single SSE line, never by the stream length.
#[derive(Debug, Default)]
pub struct UsageSniffer {
    line_buffer: String,
    latest: TokenUsage,
}

// Pathological streams without newlines must not grow the buffer forever.
const MAX_SSE_LINE_BYTES: usize = 256 * 1024;

impl UsageSniffer {
    pub fn feed(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for ch in text.chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut self.line_buffer);
                self.inspect_line(line.trim_end_matches('\r'));
            } else if self.line_buffer.len() < MAX_SSE_LINE_BYTES {
                self.line_buffer.push(ch);
            }
        }
    }

    /// Final usage after the stream ends. Inspects any unterminated tail
    /// line first (a non-SSE JSON body arrives here as one "line").
    pub fn finish(mut self) -> TokenUsage {
        let tail = std::mem::take(&mut self.line_buffer);
        self.inspect_line(tail.trim());
        self.latest
    }

    fn inspect_line(&mut self, line: &str) {
        let payload = match line.strip_prefix("data:") {
            Some(rest) => rest.trim(),
            None => line.trim(),
        };
        if payload.is_empty() || payload == "[DONE]" || !payload.starts_with('{') {
            return;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        let usage = extract_usage(&parsed);
        if !usage.is_empty() {
            self.latest = usage;
        }
    }
}
