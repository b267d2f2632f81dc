use std::sync::Arc;

use super::{Clock, PricingTable, SystemClock, UsageCandidate, UsageRecord, UsageSink};

/// Prices extracted usage and appends it to the usage sink.
#[derive(Clone)]
pub struct MeteringRecorder {
    pricing: Arc<PricingTable>,
    sink: Arc<dyn UsageSink>,
    clock: Arc<dyn Clock>,
}

impl MeteringRecorder {
    pub fn new(pricing: Arc<PricingTable>, sink: Arc<dyn UsageSink>) -> Self {
        Self {
            pricing,
            sink,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn build_record(&self, request_id: &str, label: &str, usage: UsageCandidate) -> UsageRecord {
        let cost_usd =
            self.pricing
                .cost_usd(&usage.model, usage.prompt_tokens, usage.completion_tokens);
        UsageRecord {
            request_id: request_id.to_string(),
            label: label.to_string(),
            model: usage.model,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cost_usd,
            timestamp_ms: self.clock.now_epoch_millis(),
        }
    }

    /// Appends at most one row. Store failures are logged and swallowed.
    ///
    /// Returns the row when it was written.
    pub async fn record(
        &self,
        request_id: &str,
        label: &str,
        usage: Option<UsageCandidate>,
    ) -> Option<UsageRecord> {
        let Some(usage) = usage else {
            tracing::debug!(request_id, label, "no usage reported; skipping metering");
            return None;
        };

        let record = self.build_record(request_id, label, usage);
        if record.cost_usd.is_none() {
            tracing::warn!(
                request_id,
                model = %record.model,
                "no pricing for model; recording usage without cost"
            );
        }

        match self.sink.append_usage(&record).await {
            Ok(()) => {
                tracing::info!(
                    target: "metering.recorded",
                    request_id = %record.request_id,
                    label = %record.label,
                    model = %record.model,
                    prompt_tokens = record.prompt_tokens,
                    completion_tokens = record.completion_tokens,
                    total_tokens = record.total_tokens,
                    cost_usd = ?record.cost_usd,
                    "usage recorded"
                );
                Some(record)
            }
            Err(err) => {
                tracing::warn!(
                    request_id,
                    label,
                    error = %err,
                    "failed to record usage"
                );
                None
            }
        }
    }
}
