use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{ModelId, ModelPricing, PricingTable};

/// Raw token counts as reported by the remote API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Cost snapshot for one completed request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

impl UsageRecord {
    pub fn compute(input_tokens: u64, output_tokens: u64, pricing: &ModelPricing) -> Self {
        let input_cost = input_tokens as f64 / 1000.0 * pricing.input_per_1k;
        let output_cost = output_tokens as f64 / 1000.0 * pricing.output_per_1k;
        Self {
            input_tokens,
            output_tokens,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }
}

/// Cumulative counters, persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub request_count: u64,
}

impl SessionStats {
    pub fn add(&mut self, record: &UsageRecord) {
        self.total_input_tokens += record.input_tokens;
        self.total_output_tokens += record.output_tokens;
        self.total_cost += record.total_cost;
        self.request_count += 1;
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }
}

/// Prices requests for the active model and keeps the running totals.
#[derive(Debug, Clone)]
pub struct UsageAccountant {
    model: ModelId,
    pricing: PricingTable,
    stats: SessionStats,
}

impl UsageAccountant {
    /// `stats` is whatever was loaded at session start; pass
    /// `SessionStats::default()` for a fresh run.
    pub fn new(model: ModelId, pricing: PricingTable, stats: SessionStats) -> Self {
        Self {
            model,
            pricing,
            stats,
        }
    }

    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub fn pricing(&self) -> Result<&ModelPricing, ConfigError> {
        self.pricing
            .get(&self.model)
            .ok_or_else(|| ConfigError::MissingPricing(self.model.to_string()))
    }

    pub fn compute_usage(&self, input_tokens: u64, output_tokens: u64) -> Result<UsageRecord, ConfigError> {
        let pricing = self.pricing()?;
        Ok(UsageRecord::compute(input_tokens, output_tokens, pricing))
    }

    pub fn add_usage(&mut self, record: &UsageRecord) {
        self.stats.add(record);
    }

    pub fn reset(&mut self) {
        self.stats = SessionStats::default();
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

/// `$0.0330` style, always four decimals.
pub fn format_cost(cost: f64) -> String {
    format!("${cost:.4}")
}
