use thiserror::Error;

use crate::gateway::{ConfigError, GatewayError, PricingTableError};

#[cfg(feature = "store-sqlite")]
use crate::gateway::SqliteStoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("pricing error: {0}")]
    Pricing(#[from] PricingTableError),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[cfg(feature = "store-sqlite")]
    #[error("store error: {0}")]
    Store(#[from] SqliteStoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
