//! Streaming usage opt-in for outbound request bodies.

use serde_json::{Map, Value};

use super::StreamUsagePolicy;

/// Outcome of [`augment_stream_usage`]. Only `Injected` and `Forced` modify the body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamUsageAugment {
    NotStreaming,
    AlreadyRequested,
    Injected,
    Forced,
    ClientOptedOut,
    /// `stream_options` is present but not an object; left for the upstream to reject.
    Malformed,
}

impl StreamUsageAugment {
    pub fn modified(self) -> bool {
        matches!(self, Self::Injected | Self::Forced)
    }
}

/// Requests a trailing usage chunk for streaming bodies.
///
/// Applying it to its own output is a no-op.
pub fn augment_stream_usage(body: &mut Value, policy: StreamUsagePolicy) -> StreamUsageAugment {
    let Some(obj) = body.as_object_mut() else {
        return StreamUsageAugment::NotStreaming;
    };
    if !obj.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        return StreamUsageAugment::NotStreaming;
    }

    let stream_options = obj
        .entry("stream_options".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if stream_options.is_null() {
        *stream_options = Value::Object(Map::new());
    }
    let Some(stream_options) = stream_options.as_object_mut() else {
        return StreamUsageAugment::Malformed;
    };

    match stream_options.get("include_usage").and_then(Value::as_bool) {
        Some(true) => StreamUsageAugment::AlreadyRequested,
        Some(false) if policy == StreamUsagePolicy::HonorClient => {
            StreamUsageAugment::ClientOptedOut
        }
        Some(false) => {
            stream_options.insert("include_usage".to_string(), Value::Bool(true));
            StreamUsageAugment::Forced
        }
        None => {
            stream_options.insert("include_usage".to_string(), Value::Bool(true));
            StreamUsageAugment::Injected
        }
    }
}

/// Endpoints that report usage in their completion event without opting in.
pub fn reports_usage_without_opt_in(path: &str) -> bool {
    let path = path.trim_start_matches('/');
    let path = path.strip_prefix("v1/").unwrap_or(path);
    path == "responses" || path.starts_with("responses/")
}
