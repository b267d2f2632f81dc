use std::collections::HashMap;

use thiserror::Error;

/// Per-1K-token USD rates for one model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PricingEntry {
    pub input_rate_per_1k: f64,
    pub output_rate_per_1k: f64,
}

impl PricingEntry {
    pub const fn new(input_rate_per_1k: f64, output_rate_per_1k: f64) -> Self {
        Self {
            input_rate_per_1k,
            output_rate_per_1k,
        }
    }

    pub fn cost_usd(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.input_rate_per_1k
            + completion_tokens as f64 / 1000.0 * self.output_rate_per_1k
    }
}

const DEFAULT_PRICING: &[(&str, PricingEntry)] = &[
    ("gpt-4o", PricingEntry::new(0.005, 0.015)),
    ("gpt-4o-mini", PricingEntry::new(0.00015, 0.0006)),
    ("gpt-3.5-turbo", PricingEntry::new(0.0015, 0.002)),
];

#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    models: HashMap<String, PricingEntry>,
}

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("invalid pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid pricing entry for model {model}: expected object")]
    InvalidModelEntry { model: String },
    #[error("invalid pricing entry for model {model}: missing both input/output rate")]
    MissingRates { model: String },
    #[error("invalid pricing entry for model {model}: invalid rate value for {field}")]
    InvalidRateValue { model: String, field: &'static str },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PricingTable {
    pub fn with_defaults() -> Self {
        let models = DEFAULT_PRICING
            .iter()
            .map(|(model, entry)| ((*model).to_string(), *entry))
            .collect();
        Self { models }
    }

    /// Built-in defaults with `raw` merged on top. Entries in `raw` win.
    pub fn with_override_json_str(raw: &str) -> Result<Self, PricingTableError> {
        let overrides = Self::from_override_json_str(raw)?;
        Ok(Self::with_defaults().merged(overrides))
    }

    pub fn from_override_json_str(raw: &str) -> Result<Self, PricingTableError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_override_json_value(&value)
    }

    pub fn from_override_json_value(value: &serde_json::Value) -> Result<Self, PricingTableError> {
        let Some(root) = value.as_object() else {
            return Err(PricingTableError::InvalidRoot);
        };

        let mut models = HashMap::new();
        for (model, entry) in root {
            let Some(obj) = entry.as_object() else {
                return Err(PricingTableError::InvalidModelEntry {
                    model: model.clone(),
                });
            };

            let input = parse_rate_per_1k(obj, "input", "input_cost_per_1k_tokens", "input_cost_per_token")
                .map(|rate| validate_rate(rate, model, "input"))
                .transpose()?;
            let output = parse_rate_per_1k(
                obj,
                "output",
                "output_cost_per_1k_tokens",
                "output_cost_per_token",
            )
            .map(|rate| validate_rate(rate, model, "output"))
            .transpose()?;

            if input.is_none() && output.is_none() {
                return Err(PricingTableError::MissingRates {
                    model: model.clone(),
                });
            }

            models.insert(
                model.clone(),
                PricingEntry::new(input.unwrap_or(0.0), output.unwrap_or(0.0)),
            );
        }

        Ok(Self { models })
    }

    pub fn merged(mut self, overrides: PricingTable) -> Self {
        self.models.extend(overrides.models);
        self
    }

    pub fn resolve(&self, model: &str) -> Option<&PricingEntry> {
        self.models.get(model)
    }

    /// `None` when `model` has no entry.
    pub fn cost_usd(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<f64> {
        self.resolve(model)
            .map(|entry| entry.cost_usd(prompt_tokens, completion_tokens))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

fn parse_rate_per_1k(
    obj: &serde_json::Map<String, serde_json::Value>,
    short_key: &'static str,
    per_1k_key: &'static str,
    per_token_key: &'static str,
) -> Option<serde_json::Value> {
    if let Some(value) = obj.get(short_key).or_else(|| obj.get(per_1k_key)) {
        return Some(value.clone());
    }
    let per_token = obj.get(per_token_key)?;
    match per_token.as_f64() {
        Some(rate) => serde_json::Number::from_f64(rate * 1000.0).map(serde_json::Value::Number),
        None => Some(per_token.clone()),
    }
}

fn validate_rate(
    value: serde_json::Value,
    model: &str,
    field: &'static str,
) -> Result<f64, PricingTableError> {
    match value.as_f64() {
        Some(rate) if rate.is_finite() && rate >= 0.0 => Ok(rate),
        _ => Err(PricingTableError::InvalidRateValue {
            model: model.to_string(),
            field,
        }),
    }
}
