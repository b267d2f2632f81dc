use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use metering_proxy::gateway::{GatewayHttpState, router};
use metering_proxy::utils::test_support::{MemoryStore, should_skip_httpmock};
use metering_proxy::{MeteringRecorder, PricingTable, ProxyConfig};
use serde_json::{Value, json};
use tower::util::ServiceExt;

fn pricing() -> Arc<PricingTable> {
    Arc::new(
        PricingTable::with_override_json_str(r#"{"m": {"input": 0.005, "output": 0.015}}"#)
            .unwrap(),
    )
}

fn build_app(
    upstream_base: &str,
    store: Arc<MemoryStore>,
    configure: impl FnOnce(ProxyConfig) -> ProxyConfig,
) -> Router {
    let config = ProxyConfig::new("sk-upstream")
        .unwrap()
        .with_upstream_base(upstream_base)
        .unwrap();
    let config = configure(config);
    let recorder = MeteringRecorder::new(pricing(), store.clone());
    let state = GatewayHttpState::new(&config, store, recorder).unwrap();
    router(state)
}

fn chat_request(token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn forwards_with_upstream_credential_and_records_usage() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let request_body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
    let response_body = json!({
        "id": "chatcmpl-1",
        "model": "m",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    });
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-upstream")
            .json_body(request_body.clone());
        then.status(200)
            .header("content-type", "application/json")
            .header("x-upstream-trace", "abc")
            .body(response_body.to_string());
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/v1"), store.clone(), |config| config);

    let response = app
        .oneshot(chat_request(Some("tok-a"), &request_body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-upstream-trace")
            .and_then(|value| value.to_str().ok()),
        Some("abc")
    );
    assert!(response.headers().get("x-request-id").is_some());

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, response_body.to_string().as_bytes());
    mock.assert();

    let rows = store.wait_for_rows(1).await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.label, "team-a");
    assert_eq!(row.model, "m");
    assert_eq!((row.prompt_tokens, row.completion_tokens, row.total_tokens), (10, 5, 15));
    let cost = row.cost_usd.unwrap();
    assert!((cost - 0.000125).abs() < 1e-12, "cost={cost}");
}

#[tokio::test]
async fn unknown_and_revoked_tokens_never_reach_upstream() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.any_request();
        then.status(200).body("{}");
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    store.revoke("tok-a");
    let app = build_app(&upstream.url("/v1"), store.clone(), |config| config);
    let body = json!({"model": "m", "messages": []});

    for token in [None, Some("tok-a"), Some("tok-unknown")] {
        let response = app
            .clone()
            .oneshot(chat_request(token, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "token={token:?}");
        assert!(response.headers().get("x-request-id").is_some());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error["error"]["code"], json!("invalid_api_key"));
    }

    mock.assert_calls(0);
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn upstream_rate_limit_is_relayed_verbatim_without_metering() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let error_body = r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"},"usage":{"prompt_tokens":10,"completion_tokens":5}}"#;
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(429)
            .header("content-type", "application/json")
            .header("retry-after", "7")
            .body(error_body);
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/v1"), store.clone(), |config| config);

    let response = app
        .oneshot(chat_request(Some("tok-a"), &json!({"model": "m", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok()),
        Some("7")
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, error_body.as_bytes());
    mock.assert();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn api_version_is_appended_only_when_absent() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let configured = upstream.mock(|when, then| {
        when.method(GET)
            .path("/openai/models")
            .query_param("api-version", "2024-06-01")
            .query_param("limit", "2");
        then.status(200).header("content-type", "application/json").body(r#"{"data":[]}"#);
    });
    let client_supplied = upstream.mock(|when, then| {
        when.method(GET)
            .path("/openai/models")
            .query_param("api-version", "client-pinned");
        then.status(200).header("content-type", "application/json").body(r#"{"data":[]}"#);
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/openai"), store, |config| {
        config.with_api_version(Some("2024-06-01".to_string()))
    });

    for uri in ["/v1/models?limit=2", "/v1/models?api-version=client-pinned"] {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("authorization", "Bearer tok-a")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "uri={uri}");
    }

    configured.assert();
    client_supplied.assert();
}

#[tokio::test]
async fn non_json_bodies_are_forwarded_untouched() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let raw = "--boundary\r\ncontent-disposition: form-data; name=\"purpose\"\r\n\r\nfine-tune\r\n--boundary--\r\n";
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/files")
            .header("content-type", "multipart/form-data; boundary=boundary")
            .body(raw);
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"file-1"}"#);
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/v1"), store.clone(), |config| config);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/files")
        .header("authorization", "Bearer tok-a")
        .header("content-type", "multipart/form-data; boundary=boundary")
        .body(Body::from(raw))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    to_bytes(response.into_body(), usize::MAX).await.unwrap();
    mock.assert();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn oversized_body_is_rejected_before_forwarding() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.any_request();
        then.status(200).body("{}");
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/v1"), store, |config| config.with_max_body_bytes(16));

    let response = app
        .oneshot(chat_request(
            Some("tok-a"),
            &json!({"model": "m", "messages": [{"role": "user", "content": "this is long"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    mock.assert_calls(0);
}

#[tokio::test]
async fn dot_segments_are_rejected_before_forwarding() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.any_request();
        then.status(200).body("{}");
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/openai/v1"), store, |config| config);

    for uri in ["/v1/../../admin/keys", "/v1/%2e%2e/admin/keys"] {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("authorization", "Bearer tok-a")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri={uri}");
    }
    mock.assert_calls(0);
}

#[tokio::test]
async fn bearer_scheme_is_case_insensitive() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(GET)
            .path("/v1/models")
            .header("authorization", "Bearer sk-upstream");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"object":"list","data":[]}"#);
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/v1"), store, |config| config);

    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", "BEARER tok-a")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert();
}

#[tokio::test]
async fn unreachable_upstream_maps_to_bad_gateway() {
    let port = {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0));
        match listener {
            Ok(listener) => listener.local_addr().unwrap().port(),
            Err(_) => return,
        }
    };

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&format!("http://127.0.0.1:{port}/v1"), store.clone(), |config| config);

    let response = app
        .oneshot(chat_request(Some("tok-a"), &json!({"model": "m", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let error: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(error["error"]["code"], json!("upstream_unreachable"));
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn slow_upstream_maps_to_gateway_timeout() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .delay(Duration::from_secs(3))
            .body("{}");
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/v1"), store, |config| {
        config.with_timeouts(Duration::from_secs(1), Duration::from_millis(200))
    });

    let response = app
        .oneshot(chat_request(Some("tok-a"), &json!({"model": "m", "messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let error: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(error["error"]["code"], json!("upstream_timeout"));
}

#[tokio::test]
async fn client_request_id_is_echoed() {
    if should_skip_httpmock() {
        return;
    }

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("x-request-id", "client-req-9");
        then.status(200).header("content-type", "application/json").body("{}");
    });

    let store = Arc::new(MemoryStore::with_key("tok-a", "team-a"));
    let app = build_app(&upstream.url("/v1"), store, |config| config);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer tok-a")
        .header("x-request-id", "client-req-9")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"m"}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok()),
        Some("client-req-9")
    );
}

#[tokio::test]
async fn health_needs_no_token() {
    let store = Arc::new(MemoryStore::default());
    let app = build_app("http://127.0.0.1:9/v1", store, |config| config);

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!({"status": "ok"}));

    let request = Request::builder()
        .method("GET")
        .uri("/admin")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get("x-request-id").is_some());
}
