use axum::http::{HeaderMap, HeaderValue, header};
use bytes::Bytes;

use super::{GatewayError, ProxyConfig};

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The single upstream every authenticated request is forwarded to.
#[derive(Clone)]
pub struct UpstreamClient {
    base_url: reqwest::Url,
    authorization: HeaderValue,
    api_version: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("base_url", &self.base_url.as_str())
            .field("authorization", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, GatewayError> {
        // No whole-request timeout: long streams must not be cut off.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|err| GatewayError::Config {
                message: format!("upstream http client error: {err}"),
            })?;

        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {}", config.upstream_api_key())).map_err(
                |_| GatewayError::Config {
                    message: "upstream api key is not a valid header value".to_string(),
                },
            )?;
        authorization.set_sensitive(true);

        Ok(Self {
            base_url: config.upstream_base().clone(),
            authorization,
            api_version: config.api_version().map(str::to_string),
            client,
        })
    }

    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    /// `/v1/<rest>` maps to `<base>/<rest>`; the query passes through, plus `api-version`
    /// when configured and absent.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Result<reqwest::Url, GatewayError> {
        let rest = path.trim_start_matches('/');
        let rest = rest.strip_prefix("v1/").unwrap_or(rest);
        let rest = if rest == "v1" { "" } else { rest };
        if rest.split(['/', '\\']).any(is_dot_segment) {
            return Err(GatewayError::InvalidRequest {
                reason: format!("dot segments are not allowed in {path}"),
            });
        }

        let joined = join_base_url(self.base_url.as_str(), rest);
        let mut url = reqwest::Url::parse(&joined).map_err(|err| GatewayError::InvalidRequest {
            reason: format!("invalid upstream path {path}: {err}"),
        })?;
        url.set_query(query.filter(|query| !query.is_empty()));

        if let Some(api_version) = self.api_version.as_deref() {
            let present = url.query_pairs().any(|(key, _)| key == "api-version");
            if !present {
                url.query_pairs_mut().append_pair("api-version", api_version);
            }
        }
        Ok(url)
    }

    /// Inbound headers minus caller credentials and hop-by-hop headers, plus the shared
    /// upstream credential.
    pub fn outbound_headers(&self, inbound: &HeaderMap, body_rewritten: bool) -> HeaderMap {
        let mut headers = inbound.clone();
        sanitize_request_headers(&mut headers);
        headers.insert(header::AUTHORIZATION, self.authorization.clone());
        if body_rewritten {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        headers
    }

    pub async fn send(
        &self,
        method: reqwest::Method,
        url: reqwest::Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut req = self.client.request(method, url).headers(headers);
        if !body.is_empty() {
            req = req.body(body);
        }
        req.send().await.map_err(map_send_error)
    }
}

fn map_send_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::UpstreamTimeout {
            message: err.to_string(),
        }
    } else {
        GatewayError::UpstreamUnreachable {
            message: err.to_string(),
        }
    }
}

/// `.` and `..`, including percent-encoded spellings the URL parser would resolve.
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

fn join_base_url(base_url: &str, rest: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if rest.is_empty() {
        return base.to_string();
    }
    let mut out = String::with_capacity(base.len() + 1 + rest.len());
    out.push_str(base);
    out.push('/');
    out.push_str(rest);
    out
}

pub fn sanitize_request_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// The body is re-framed by the server, so `content-length` goes too.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
