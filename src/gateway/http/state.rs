use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;

use super::forward::handle_proxy;
use crate::gateway::{
    GatewayError, IdentityResolver, MeteringRecorder, ProxyConfig, StreamUsagePolicy,
    UpstreamClient,
};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// Shared, read-only state handed to every request.
#[derive(Clone)]
pub struct GatewayHttpState {
    pub(super) upstream: Arc<UpstreamClient>,
    pub(super) identity: Arc<dyn IdentityResolver>,
    pub(super) recorder: MeteringRecorder,
    pub(super) stream_usage_policy: StreamUsagePolicy,
    pub(super) max_body_bytes: usize,
    pub(super) usage_max_body_bytes: usize,
    pub(super) disconnect_drain_timeout: Duration,
}

impl GatewayHttpState {
    pub fn new(
        config: &ProxyConfig,
        identity: Arc<dyn IdentityResolver>,
        recorder: MeteringRecorder,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            upstream: Arc::new(UpstreamClient::new(config)?),
            identity,
            recorder,
            stream_usage_policy: config.stream_usage_policy,
            max_body_bytes: config.max_body_bytes,
            usage_max_body_bytes: config.usage_max_body_bytes,
            disconnect_drain_timeout: config.disconnect_drain_timeout,
        })
    }

    pub fn with_upstream(mut self, upstream: UpstreamClient) -> Self {
        self.upstream = Arc::new(upstream);
        self
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/*path", any(handle_proxy))
        .fallback(not_found)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn not_found(req: Request<Body>) -> Response {
    let request_id =
        extract_header(req.headers(), "x-request-id").unwrap_or_else(generate_request_id);
    let mut response = openai_error(
        StatusCode::NOT_FOUND,
        "invalid_request_error",
        Some("not_found"),
        format!("no route for {}", req.uri().path()),
    )
    .into_response();
    insert_request_id(response.headers_mut(), &request_id);
    response
}

#[derive(Debug, Serialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

/// `{"error": {"message", "type", "code"}}`
#[derive(Debug, Serialize)]
pub struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

pub(super) fn openai_error(
    status: StatusCode,
    kind: &'static str,
    code: Option<&'static str>,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<OpenAiErrorResponse>) {
    (
        status,
        Json(OpenAiErrorResponse {
            error: OpenAiErrorDetail {
                message: message.to_string(),
                kind,
                code,
            },
        }),
    )
}

pub(super) fn gateway_error_response(err: &GatewayError) -> Response {
    let (status, kind, code) = match err {
        GatewayError::Unauthorized { .. } => (
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            Some("invalid_api_key"),
        ),
        GatewayError::KeyStore { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "api_error",
            Some("key_store_unavailable"),
        ),
        GatewayError::InvalidRequest { .. } => {
            (StatusCode::BAD_REQUEST, "invalid_request_error", None)
        }
        GatewayError::PayloadTooLarge { .. } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_request_error",
            Some("payload_too_large"),
        ),
        GatewayError::UpstreamUnreachable { .. } => (
            StatusCode::BAD_GATEWAY,
            "api_error",
            Some("upstream_unreachable"),
        ),
        GatewayError::UpstreamTimeout { .. } => (
            StatusCode::GATEWAY_TIMEOUT,
            "api_error",
            Some("upstream_timeout"),
        ),
        GatewayError::Config { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            Some("proxy_misconfigured"),
        ),
    };
    let message = match err {
        // Never echo key-store internals to callers.
        GatewayError::KeyStore { .. } => "key store unavailable".to_string(),
        other => other.to_string(),
    };
    openai_error(status, kind, code, message).into_response()
}

pub(super) fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// The token of an `Authorization: Bearer <token>` header. The scheme is matched
/// case-insensitively.
pub(super) fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim();
    let (scheme, token) = auth.split_once(|c: char| c.is_ascii_whitespace())?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub(super) fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("req-{ts_ms}-{seq}")
}

pub(super) fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let value = match HeaderValue::from_str(request_id) {
        Ok(value) => value,
        Err(_) => return,
    };
    headers.insert("x-request-id", value);
}
