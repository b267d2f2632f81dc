use serde::{Deserialize, Serialize};

/// A proxy-issued credential. Owned by the key administration layer; the proxy only reads it.
#[derive(Clone, Serialize, Deserialize)]
pub struct IssuedKey {
    pub token: String,
    pub label: String,
    pub active: bool,
}

impl std::fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedKey")
            .field("token", &"<redacted>")
            .field("label", &self.label)
            .field("active", &self.active)
            .finish()
    }
}

impl IssuedKey {
    pub fn new(token: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            label: label.into(),
            active: true,
        }
    }
}

/// One metered exchange. Written once, never updated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub label: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// `None` when the model has no pricing entry.
    pub cost_usd: Option<f64>,
    pub timestamp_ms: u64,
}
