//! Proxying and metering pipeline.

pub mod augment;
pub mod config;
pub mod costing;
pub mod http;
pub mod logging;
pub mod recorder;
pub mod store_types;
pub mod upstream;
pub mod usage;

#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

use async_trait::async_trait;
use thiserror::Error;

pub use augment::{StreamUsageAugment, augment_stream_usage};
pub use config::{ConfigError, ProxyConfig, StreamUsagePolicy};
pub use costing::{PricingEntry, PricingTable, PricingTableError};
pub use http::{GatewayHttpState, router};
pub use recorder::MeteringRecorder;
pub use store_types::{IssuedKey, UsageRecord};
pub use upstream::UpstreamClient;
pub use usage::{UsageCandidate, UsageTap};

#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: &'static str },
    #[error("key store unavailable: {message}")]
    KeyStore { message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("request body exceeds {max_bytes} bytes")]
    PayloadTooLarge { max_bytes: usize },
    #[error("upstream unreachable: {message}")]
    UpstreamUnreachable { message: String },
    #[error("upstream timed out: {message}")]
    UpstreamTimeout { message: String },
    #[error("invalid upstream configuration: {message}")]
    Config { message: String },
}

/// Resolves an issued bearer token to the caller's label.
///
/// `Ok(None)` means the token is unknown or revoked.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, token: &str) -> Result<Option<String>, GatewayError>;
}

/// Append-only destination for usage rows.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append_usage(
        &self,
        record: &UsageRecord,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}
