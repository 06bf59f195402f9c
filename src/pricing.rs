//! Model price table rows and cost computation.
//!
//! All arithmetic is done in nanodollars (1 USD = 1e9) on integers to keep
//! the committed counters exact; floats appear only in the stored per-Mtok
//! prices and the provider's cost multiplier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Nanodollars per USD.
pub const NANOS_PER_USD: u64 = 1_000_000_000;

/// Input-side token count above which 1M-context tier pricing kicks in.
pub const LONG_CONTEXT_THRESHOLD: u64 = 200_000;

/// Multiplier for input tokens beyond the long-context threshold.
const LONG_CONTEXT_INPUT_FACTOR: f64 = 2.0;
/// Multiplier for output tokens of a long-context request.
const LONG_CONTEXT_OUTPUT_FACTOR: f64 = 1.5;

/// Price row for one model, in USD per million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub input_usd_per_mtok: f64,
    pub output_usd_per_mtok: f64,
    pub cache_write_5m_usd_per_mtok: f64,
    pub cache_write_1h_usd_per_mtok: f64,
    pub cache_read_usd_per_mtok: f64,
    /// Whether the model has a 1M-context pricing tier
    #[serde(default)]
    pub supports_1m_context: bool,
    pub updated_at: DateTime<Utc>,
}

/// Token usage attributed from a merged upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTokens {
    pub input: u64,
    pub output: u64,
    pub cache_creation_5m: u64,
    pub cache_creation_1h: u64,
    pub cache_read: u64,
}

impl UsageTokens {
    /// Input-side context size: everything the model read.
    pub fn context_used(&self) -> u64 {
        self.input + self.cache_creation_5m + self.cache_creation_1h + self.cache_read
    }

    pub fn has_usage(&self) -> bool {
        self.input > 0
            || self.output > 0
            || self.cache_creation_5m > 0
            || self.cache_creation_1h > 0
            || self.cache_read > 0
    }
}

/// USD-per-Mtok to nanodollars-per-token.
fn nanos_per_token(usd_per_mtok: f64) -> u64 {
    if usd_per_mtok <= 0.0 {
        return 0;
    }
    (usd_per_mtok * 1_000.0).round() as u64
}

/// Outcome of a cost computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostBreakdown {
    pub cost_nanos: u64,
    /// Whether long-context tier pricing was applied
    pub context_1m_applied: bool,
}

/// Compute the request cost in nanodollars.
///
/// ```text
/// cost = (in * priceIn + out * priceOut
///       + c5m * priceCacheWrite5m + c1h * priceCacheWrite1h
///       + cr * priceCacheRead) * costMultiplier
/// ```
///
/// When the input-side context exceeds [`LONG_CONTEXT_THRESHOLD`] and the
/// model has a 1M tier, the input portion beyond the threshold is billed at
/// 2x and all output at 1.5x.
pub fn compute_cost(price: &ModelPrice, usage: &UsageTokens, cost_multiplier: f64) -> CostBreakdown {
    if !usage.has_usage() {
        return CostBreakdown {
            cost_nanos: 0,
            context_1m_applied: false,
        };
    }

    let in_rate = nanos_per_token(price.input_usd_per_mtok);
    let out_rate = nanos_per_token(price.output_usd_per_mtok);
    let c5m_rate = nanos_per_token(price.cache_write_5m_usd_per_mtok);
    let c1h_rate = nanos_per_token(price.cache_write_1h_usd_per_mtok);
    let cr_rate = nanos_per_token(price.cache_read_usd_per_mtok);

    let long_context =
        price.supports_1m_context && usage.context_used() > LONG_CONTEXT_THRESHOLD;

    let mut cost: u64 = 0;

    if long_context {
        let base_input = usage.input.min(LONG_CONTEXT_THRESHOLD);
        let over_input = usage.input - base_input;
        cost += base_input.saturating_mul(in_rate);
        cost += (over_input as f64 * in_rate as f64 * LONG_CONTEXT_INPUT_FACTOR).round() as u64;
        cost += (usage.output as f64 * out_rate as f64 * LONG_CONTEXT_OUTPUT_FACTOR).round() as u64;
    } else {
        cost += usage.input.saturating_mul(in_rate);
        cost += usage.output.saturating_mul(out_rate);
    }

    cost += usage.cache_creation_5m.saturating_mul(c5m_rate);
    cost += usage.cache_creation_1h.saturating_mul(c1h_rate);
    cost += usage.cache_read.saturating_mul(cr_rate);

    let multiplied = (cost as f64 * cost_multiplier).round();
    CostBreakdown {
        cost_nanos: if multiplied <= 0.0 { 0 } else { multiplied as u64 },
        context_1m_applied: long_context,
    }
}

/// Convert nanodollars to a display USD value.
pub fn nanos_to_usd(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_USD as f64
}

/// Convert a configured USD limit to nanodollars.
pub fn usd_to_nanos(usd: f64) -> u64 {
    if usd <= 0.0 {
        return 0;
    }
    (usd * NANOS_PER_USD as f64).round() as u64
}

#[cfg(test)]
pub(crate) fn test_price(model: &str) -> ModelPrice {
    // Sonnet-style pricing: $3/$15 per Mtok, 5m write 1.25x, 1h write 2x, read 0.1x
    ModelPrice {
        model: model.to_string(),
        input_usd_per_mtok: 3.0,
        output_usd_per_mtok: 15.0,
        cache_write_5m_usd_per_mtok: 3.75,
        cache_write_1h_usd_per_mtok: 6.0,
        cache_read_usd_per_mtok: 0.3,
        supports_1m_context: false,
        updated_at: Utc::now(),
    }
}
