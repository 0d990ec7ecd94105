use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::CostConfig;

/// Token and cost estimate for one provider request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
}

/// Cumulative usage since start (or since the last reset).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    pub average_tokens_per_request: f64,
    pub average_cost_per_request: f64,
}

#[derive(Debug, Default)]
struct UsageTotals {
    requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    cost: f64,
}

/// Estimates per-request token counts and accumulates running totals.
///
/// Input tokens come from content length at a fixed characters-per-token
/// ratio; output tokens are a fixed per-analysis estimate.
pub struct CostEstimator {
    config: CostConfig,
    totals: Mutex<UsageTotals>,
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::new(CostConfig::default())
    }
}

impl CostEstimator {
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            totals: Mutex::new(UsageTotals::default()),
        }
    }

    /// Estimate a single-entry request of `content_chars` characters.
    pub fn estimate(&self, content_chars: usize) -> CostEstimate {
        self.estimate_request(content_chars, 1)
    }

    /// Estimate one combined request analysing `entries` entries with
    /// `content_chars` characters in total.
    pub fn estimate_request(&self, content_chars: usize, entries: usize) -> CostEstimate {
        let ratio = if self.config.chars_per_token > 0.0 {
            self.config.chars_per_token
        } else {
            1.0
        };
        let input_tokens = (content_chars as f64 / ratio).ceil() as u64;
        let output_tokens = self.config.output_tokens_per_request * entries.max(1) as u64;
        let estimated_cost = input_tokens as f64 * self.config.input_cost_per_million
            / 1_000_000.0
            + output_tokens as f64 * self.config.output_cost_per_million / 1_000_000.0;

        CostEstimate {
            input_tokens,
            output_tokens,
            estimated_cost,
        }
    }

    /// Add a request to the running totals.
    pub fn record(&self, estimate: &CostEstimate) {
        match self.totals.lock() {
            Ok(mut totals) => {
                totals.requests += 1;
                totals.input_tokens += estimate.input_tokens;
                totals.output_tokens += estimate.output_tokens;
                totals.cost += estimate.estimated_cost;
            }
            Err(e) => {
                tracing::warn!("cost totals mutex poisoned: {}", e);
            }
        }
    }

    pub fn metrics(&self) -> UsageMetrics {
        let totals = match self.totals.lock() {
            Ok(t) => t,
            Err(_) => return UsageMetrics::default(),
        };

        let (avg_tokens, avg_cost) = if totals.requests == 0 {
            (0.0, 0.0)
        } else {
            let n = totals.requests as f64;
            (
                (totals.input_tokens + totals.output_tokens) as f64 / n,
                totals.cost / n,
            )
        };

        UsageMetrics {
            total_requests: totals.requests,
            total_input_tokens: totals.input_tokens,
            total_output_tokens: totals.output_tokens,
            total_cost: totals.cost,
            average_tokens_per_request: avg_tokens,
            average_cost_per_request: avg_cost,
        }
    }

    pub fn reset(&self) {
        if let Ok(mut totals) = self.totals.lock() {
            *totals = UsageTotals::default();
        }
    }
}
