//! Metering reverse proxy for OpenAI-compatible completion APIs.
//!
//! Callers authenticate with proxy-issued bearer tokens; requests are forwarded to one
//! upstream with a shared credential, and every successful exchange that reports token
//! usage is priced and appended to a usage ledger.

mod error;

pub mod env;
pub mod gateway;
pub mod utils;

pub use error::{Error, Result};
pub use gateway::{
    GatewayError, IdentityResolver, IssuedKey, MeteringRecorder, PricingEntry, PricingTable,
    ProxyConfig, StreamUsagePolicy, UpstreamClient, UsageCandidate, UsageRecord, UsageSink,
};

#[cfg(feature = "store-sqlite")]
pub use gateway::SqliteStore;
