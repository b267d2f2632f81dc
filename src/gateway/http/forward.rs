use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{Request, header};
use axum::response::Response;
use bytes::Bytes;
use http_body_util::LengthLimitError;
use serde_json::Value;
use tracing::Instrument;

use super::relay::{MeteringContext, relay_body};
use super::state::{
    GatewayHttpState, extract_bearer, extract_header, gateway_error_response, generate_request_id,
    insert_request_id,
};
use crate::gateway::augment::{augment_stream_usage, reports_usage_without_opt_in};
use crate::gateway::upstream::sanitize_response_headers;
use crate::gateway::{GatewayError, UsageTap};

pub(super) async fn handle_proxy(
    State(state): State<GatewayHttpState>,
    req: Request<Body>,
) -> Response {
    let request_id =
        extract_header(req.headers(), "x-request-id").unwrap_or_else(generate_request_id);
    let span = tracing::info_span!(
        "proxy",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
        label = tracing::field::Empty,
        status = tracing::field::Empty,
    );

    let mut response = match forward(state, req, &request_id).instrument(span.clone()).await {
        Ok(response) => response,
        Err(err) => {
            span.in_scope(|| match &err {
                GatewayError::Unauthorized { .. } | GatewayError::PayloadTooLarge { .. } => {
                    tracing::info!(error = %err, "request rejected");
                }
                _ => tracing::warn!(error = %err, "request failed"),
            });
            gateway_error_response(&err)
        }
    };
    span.record("status", response.status().as_u16());
    insert_request_id(response.headers_mut(), &request_id);
    response
}

async fn forward(
    state: GatewayHttpState,
    req: Request<Body>,
    request_id: &str,
) -> Result<Response, GatewayError> {
    let (parts, incoming_body) = req.into_parts();

    let token = extract_bearer(&parts.headers).ok_or(GatewayError::Unauthorized {
        reason: "missing bearer token",
    })?;
    let label = state
        .identity
        .resolve_identity(&token)
        .await?
        .ok_or(GatewayError::Unauthorized {
            reason: "invalid or revoked api key",
        })?;
    tracing::Span::current().record("label", label.as_str());

    let max_body_bytes = state.max_body_bytes;
    let declared_len = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if declared_len.is_some_and(|len| len > max_body_bytes as u64) {
        return Err(GatewayError::PayloadTooLarge {
            max_bytes: max_body_bytes,
        });
    }
    let body = to_bytes(incoming_body, max_body_bytes)
        .await
        .map_err(|err| map_body_error(err, max_body_bytes))?;

    let path = parts.uri.path();
    let mut parsed_json = parse_json_object(&body);
    let request_model = parsed_json
        .as_ref()
        .and_then(|value| value.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut outbound_body = body;
    let mut body_rewritten = false;
    if let Some(json) = parsed_json.as_mut().filter(|_| !reports_usage_without_opt_in(path)) {
        let outcome = augment_stream_usage(json, state.stream_usage_policy);
        tracing::debug!(outcome = ?outcome, "stream usage opt-in");
        if outcome.modified() {
            let serialized = serde_json::to_vec(&*json).map_err(|err| GatewayError::InvalidRequest {
                reason: format!("failed to serialize request body: {err}"),
            })?;
            outbound_body = Bytes::from(serialized);
            body_rewritten = true;
        }
    }

    let url = state.upstream.upstream_url(path, parts.uri.query())?;
    let headers = state.upstream.outbound_headers(&parts.headers, body_rewritten);
    let upstream = state
        .upstream
        .send(parts.method.clone(), url, headers, outbound_body)
        .await?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    sanitize_response_headers(&mut response_headers);
    let content_type = response_headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let tap = UsageTap::for_response(status.as_u16(), content_type, state.usage_max_body_bytes);
    tracing::debug!(
        status = status.as_u16(),
        streaming = tap.is_streaming(),
        "upstream responded"
    );

    let metering = MeteringContext {
        recorder: state.recorder.clone(),
        request_id: request_id.to_string(),
        label,
        request_model,
    };
    let body = relay_body(
        upstream.bytes_stream(),
        tap,
        metering,
        state.disconnect_drain_timeout,
    );

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// The body as a JSON object, or `None` when it is anything else. Such bodies are forwarded
/// untouched.
fn parse_json_object(body: &Bytes) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

fn map_body_error(err: axum::Error, max_bytes: usize) -> GatewayError {
    let too_large = std::error::Error::source(&err)
        .map(|source| source.is::<LengthLimitError>())
        .unwrap_or(false);
    if too_large {
        GatewayError::PayloadTooLarge { max_bytes }
    } else {
        GatewayError::InvalidRequest {
            reason: format!("failed to read request body: {err}"),
        }
    }
}
