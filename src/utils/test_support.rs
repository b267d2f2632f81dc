//! Helpers shared by unit and integration tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::{GatewayError, IdentityResolver, UsageRecord, UsageSink};

/// Returns `true` (and says so on stderr) when the sandbox forbids listening on localhost,
/// which mock upstream servers need.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
            true
        }
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

/// In-memory key table and usage ledger.
#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, String>>,
    rows: Mutex<Vec<UsageRecord>>,
    fail_appends: bool,
}

impl MemoryStore {
    pub fn with_key(token: &str, label: &str) -> Self {
        let store = Self::default();
        store.insert_key(token, label);
        store
    }

    /// A store whose usage appends always fail.
    pub fn failing_appends(mut self) -> Self {
        self.fail_appends = true;
        self
    }

    pub fn insert_key(&self, token: &str, label: &str) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(token.to_string(), label.to_string());
        }
    }

    pub fn revoke(&self, token: &str) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.remove(token);
        }
    }

    pub fn rows(&self) -> Vec<UsageRecord> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Polls until at least `expected` rows exist or two seconds pass.
    pub async fn wait_for_rows(&self, expected: usize) -> Vec<UsageRecord> {
        for _ in 0..200 {
            let rows = self.rows();
            if rows.len() >= expected {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.rows()
    }
}

#[async_trait]
impl IdentityResolver for MemoryStore {
    async fn resolve_identity(&self, token: &str) -> Result<Option<String>, GatewayError> {
        let keys = self.keys.lock().map_err(|_| GatewayError::KeyStore {
            message: "key table poisoned".to_string(),
        })?;
        Ok(keys.get(token).cloned())
    }
}

#[async_trait]
impl UsageSink for MemoryStore {
    async fn append_usage(
        &self,
        record: &UsageRecord,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fail_appends {
            return Err("usage store unavailable".into());
        }
        self.rows
            .lock()
            .map_err(|_| "usage ledger poisoned")?
            .push(record.clone());
        Ok(())
    }
}
