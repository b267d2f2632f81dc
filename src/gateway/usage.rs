//! Token usage extraction from upstream response bodies.
//!
//! Bytes are fed in as they are relayed; nothing here can fail the response. A body that
//! never reports usage, or reports it in an unrecognized shape, yields `None`.

use bytes::BytesMut;
use serde::Deserialize;

const SSE_USAGE_TRACKER_MAX_BUFFER_BYTES: usize = 512 * 1024;
const SSE_USAGE_TRACKER_TAIL_BYTES: usize = 128 * 1024;

/// Usage reported by the upstream for one exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageCandidate {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ObservedUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/// One parsed JSON payload: a whole response body or a single SSE `data` field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ParsedPayload {
    model: Option<String>,
    usage: Option<ObservedUsage>,
}

#[derive(Deserialize)]
struct UsageEnvelope {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
    /// Responses API events (`response.completed`) nest the envelope.
    #[serde(default)]
    response: Option<NestedEnvelope>,
}

#[derive(Deserialize)]
struct NestedEnvelope {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

/// Token counts as sent; any field may be missing. Unknown fields are ignored.
#[derive(Deserialize)]
struct RawUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

/// The vendor naming a usage object follows.
enum UsageShape {
    /// Chat/completions/embeddings: `prompt_tokens` and `completion_tokens`.
    Chat {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: Option<u64>,
    },
    /// Responses API: `input_tokens` and `output_tokens`.
    Responses {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: Option<u64>,
    },
}

impl RawUsage {
    /// `None` when no token count is present at all.
    fn shape(self) -> Option<UsageShape> {
        if self.prompt_tokens.is_some() || self.completion_tokens.is_some() {
            return Some(UsageShape::Chat {
                prompt_tokens: self.prompt_tokens.unwrap_or(0),
                completion_tokens: self.completion_tokens.unwrap_or(0),
                total_tokens: self.total_tokens,
            });
        }
        if self.input_tokens.is_some() || self.output_tokens.is_some() {
            return Some(UsageShape::Responses {
                input_tokens: self.input_tokens.unwrap_or(0),
                output_tokens: self.output_tokens.unwrap_or(0),
                total_tokens: self.total_tokens,
            });
        }
        self.total_tokens.map(|total| UsageShape::Chat {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: Some(total),
        })
    }
}

impl From<UsageShape> for ObservedUsage {
    fn from(shape: UsageShape) -> Self {
        let (prompt_tokens, completion_tokens, total_tokens) = match shape {
            UsageShape::Chat {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            } => (prompt_tokens, completion_tokens, total_tokens),
            UsageShape::Responses {
                input_tokens,
                output_tokens,
                total_tokens,
            } => (input_tokens, output_tokens, total_tokens),
        };
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens
                .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens)),
        }
    }
}

fn parse_usage_value(value: serde_json::Value) -> Option<ObservedUsage> {
    serde_json::from_value::<RawUsage>(value)
        .ok()?
        .shape()
        .map(ObservedUsage::from)
}

fn parse_payload(bytes: &[u8]) -> Option<ParsedPayload> {
    let envelope = serde_json::from_slice::<UsageEnvelope>(bytes).ok()?;

    let (nested_model, nested_usage) = match envelope.response {
        Some(nested) => (nested.model, nested.usage),
        None => (None, None),
    };

    let usage = envelope
        .usage
        .and_then(parse_usage_value)
        .or_else(|| nested_usage.and_then(parse_usage_value));
    let model = envelope
        .model
        .or(nested_model)
        .filter(|model| !model.trim().is_empty());

    Some(ParsedPayload { model, usage })
}

/// Usage of a complete, non-streaming JSON body.
pub fn extract_usage_from_slice(bytes: &[u8], request_model: Option<&str>) -> Option<UsageCandidate> {
    let parsed = parse_payload(bytes)?;
    let usage = parsed.usage?;
    let model = parsed.model.or_else(|| request_model.map(str::to_string))?;
    Some(candidate(model, usage))
}

fn candidate(model: String, usage: ObservedUsage) -> UsageCandidate {
    UsageCandidate {
        model,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

/// Follows an event stream and keeps the last usage-bearing event before `[DONE]`.
#[derive(Debug, Default)]
pub struct SseUsageTracker {
    buffer: BytesMut,
    last_model: Option<String>,
    observed: Option<(Option<String>, ObservedUsage)>,
    done: bool,
}

impl SseUsageTracker {
    pub fn ingest(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some((pos, delimiter_len)) = event_boundary(self.buffer.as_ref()) {
            let event_bytes = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            self.ingest_event(event_bytes.as_ref());
            if self.done {
                self.buffer.clear();
                return;
            }
        }

        if self.buffer.len() > SSE_USAGE_TRACKER_MAX_BUFFER_BYTES {
            let keep_from = self
                .buffer
                .len()
                .saturating_sub(SSE_USAGE_TRACKER_TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
    }

    fn ingest_event(&mut self, event: &[u8]) {
        let Some(data) = event_data(event) else {
            return;
        };
        if data == b"[DONE]" {
            self.done = true;
            return;
        }
        if !data.starts_with(b"{") {
            return;
        }
        let Some(parsed) = parse_payload(&data) else {
            return;
        };

        if let Some(usage) = parsed.usage {
            let model = parsed.model.clone().or_else(|| self.last_model.clone());
            self.observed = Some((model, usage));
        }
        if parsed.model.is_some() {
            self.last_model = parsed.model;
        }
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consumes the tracker. A trailing event without its blank-line terminator is still
    /// considered.
    pub fn finish(mut self, request_model: Option<&str>) -> Option<UsageCandidate> {
        if !self.done && !self.buffer.is_empty() {
            let rest = self.buffer.split();
            self.ingest_event(rest.as_ref());
        }
        let (model, usage) = self.observed?;
        let model = model.or_else(|| request_model.map(str::to_string))?;
        Some(candidate(model, usage))
    }
}

/// Buffers a JSON body up to a cap and parses it once the body ends.
#[derive(Debug)]
pub struct JsonUsageTracker {
    buffer: BytesMut,
    max_bytes: usize,
    overflowed: bool,
}

impl JsonUsageTracker {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_bytes,
            overflowed: false,
        }
    }

    pub fn ingest(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.buffer.len().saturating_add(chunk.len()) > self.max_bytes {
            self.overflowed = true;
            self.buffer = BytesMut::new();
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn finish(self, request_model: Option<&str>) -> Option<UsageCandidate> {
        if self.overflowed {
            return None;
        }
        extract_usage_from_slice(self.buffer.as_ref(), request_model)
    }
}

/// Per-response usage extraction, chosen from the upstream status and content type.
#[derive(Debug)]
pub enum UsageTap {
    Sse(SseUsageTracker),
    Json(JsonUsageTracker),
    Disabled,
}

impl UsageTap {
    pub fn for_response(status: u16, content_type: Option<&str>, usage_max_body_bytes: usize) -> Self {
        if !(200..300).contains(&status) {
            return Self::Disabled;
        }
        let is_event_stream = content_type
            .and_then(|value| value.split(';').next())
            .map(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
            .unwrap_or(false);
        if is_event_stream {
            Self::Sse(SseUsageTracker::default())
        } else {
            Self::Json(JsonUsageTracker::new(usage_max_body_bytes))
        }
    }

    pub fn ingest(&mut self, chunk: &[u8]) {
        match self {
            Self::Sse(tracker) => tracker.ingest(chunk),
            Self::Json(tracker) => tracker.ingest(chunk),
            Self::Disabled => {}
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Sse(_))
    }

    /// True once further bytes cannot change the outcome.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Sse(tracker) => tracker.is_done(),
            Self::Json(tracker) => tracker.overflowed(),
            Self::Disabled => true,
        }
    }

    pub fn finish(self, request_model: Option<&str>) -> Option<UsageCandidate> {
        match self {
            Self::Sse(tracker) => tracker.finish(request_model),
            Self::Json(tracker) => tracker.finish(request_model),
            Self::Disabled => None,
        }
    }
}

/// Start and length of the first blank-line event terminator, `\n\n` or `\r\n\r\n`.
fn event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(offset) = buf[from..].iter().position(|b| *b == b'\n') {
        let lf = from + offset;
        let after = &buf[lf + 1..];
        if after.starts_with(b"\n") {
            return Some((lf, 2));
        }
        if lf > 0 && buf[lf - 1] == b'\r' && after.starts_with(b"\r\n") {
            return Some((lf - 1, 4));
        }
        from = lf + 1;
    }
    None
}

/// The event's `data:` lines joined with `\n`; `None` for events without data.
fn event_data(event: &[u8]) -> Option<Vec<u8>> {
    let lines: Vec<&[u8]> = event
        .split(|b| *b == b'\n')
        .filter_map(|line| line.strip_prefix(b"data:"))
        .map(<[u8]>::trim_ascii)
        .filter(|data| !data.is_empty())
        .collect();
    (!lines.is_empty()).then(|| lines.join(&b'\n'))
}
