use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_UPSTREAM_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_USAGE_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do with a streaming request whose body explicitly sets
/// `stream_options.include_usage = false`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StreamUsagePolicy {
    /// Leave the client's choice alone; such streams go unmetered.
    #[default]
    HonorClient,
    /// Override the client's choice to `true`.
    Force,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing upstream api key (set UPSTREAM_API_KEY)")]
    MissingUpstreamKey,
    #[error("invalid upstream base url {url}: {reason}")]
    InvalidUpstreamBase { url: String, reason: String },
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Immutable proxy settings, validated once at startup.
#[derive(Clone)]
pub struct ProxyConfig {
    upstream_base: reqwest::Url,
    upstream_api_key: String,
    api_version: Option<String>,
    pub stream_usage_policy: StreamUsagePolicy,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_body_bytes: usize,
    pub usage_max_body_bytes: usize,
    pub disconnect_drain_timeout: Duration,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("upstream_base", &self.upstream_base.as_str())
            .field("upstream_api_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("stream_usage_policy", &self.stream_usage_policy)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("usage_max_body_bytes", &self.usage_max_body_bytes)
            .field("disconnect_drain_timeout", &self.disconnect_drain_timeout)
            .finish()
    }
}

impl ProxyConfig {
    pub fn new(upstream_api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let upstream_api_key = upstream_api_key.into().trim().to_string();
        if upstream_api_key.is_empty() {
            return Err(ConfigError::MissingUpstreamKey);
        }
        Ok(Self {
            upstream_base: normalize_upstream_base(DEFAULT_UPSTREAM_BASE)?,
            upstream_api_key,
            api_version: None,
            stream_usage_policy: StreamUsagePolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            usage_max_body_bytes: DEFAULT_USAGE_MAX_BODY_BYTES,
            disconnect_drain_timeout: DEFAULT_DISCONNECT_DRAIN_TIMEOUT,
        })
    }

    pub fn with_upstream_base(mut self, base: &str) -> Result<Self, ConfigError> {
        self.upstream_base = normalize_upstream_base(base)?;
        Ok(self)
    }

    pub fn with_api_version(mut self, api_version: Option<String>) -> Self {
        self.api_version = api_version
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    pub fn with_stream_usage_policy(mut self, policy: StreamUsagePolicy) -> Self {
        self.stream_usage_policy = policy;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn with_usage_max_body_bytes(mut self, usage_max_body_bytes: usize) -> Self {
        self.usage_max_body_bytes = usage_max_body_bytes;
        self
    }

    pub fn with_disconnect_drain_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_drain_timeout = timeout;
        self
    }

    pub fn upstream_base(&self) -> &reqwest::Url {
        &self.upstream_base
    }

    pub fn upstream_api_key(&self) -> &str {
        &self.upstream_api_key
    }

    pub fn api_version(&self) -> Option<&str> {
        self.api_version.as_deref()
    }
}

/// Parses `raw` and drops any query, fragment and trailing `/`.
pub fn normalize_upstream_base(raw: &str) -> Result<reqwest::Url, ConfigError> {
    let trimmed = raw.trim();
    let mut url = reqwest::Url::parse(trimmed).map_err(|err| ConfigError::InvalidUpstreamBase {
        url: trimmed.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUpstreamBase {
            url: trimmed.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    url.set_query(None);
    url.set_fragment(None);
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);
    Ok(url)
}
