// crates/core/src/pricing.rs
//! Cost estimation from token counters.
//!
//! Prices are a fixed per-model-family table (USD per million tokens). The
//! index never stores costs; they are derived at query time so a price
//! change never requires a reindex.

use serde::Serialize;

/// Prices per million tokens for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_read_per_million: f64,
    pub cache_create_per_million: f64,
}

const OPUS: ModelPricing = ModelPricing {
    input_per_million: 15.0,
    output_per_million: 75.0,
    cache_read_per_million: 1.5,
    cache_create_per_million: 18.75,
};

const SONNET: ModelPricing = ModelPricing {
    input_per_million: 3.0,
    output_per_million: 15.0,
    cache_read_per_million: 0.30,
    cache_create_per_million: 3.75,
};

/// Fallback row: haiku pricing, also used for unknown model ids.
const FALLBACK: ModelPricing = ModelPricing {
    input_per_million: 0.80,
    output_per_million: 4.0,
    cache_read_per_million: 0.08,
    cache_create_per_million: 1.0,
};

/// Resolve the pricing row for a model id by family substring.
pub fn pricing_for(model: &str) -> &'static ModelPricing {
    let model = model.to_ascii_lowercase();
    if model.contains("opus") {
        &OPUS
    } else if model.contains("sonnet") {
        &SONNET
    } else {
        &FALLBACK
    }
}

/// Estimate cost in USD, rounded to cents.
pub fn estimate_cost(
    input_tokens: u64,
    output_tokens: u64,
    cache_read: u64,
    cache_create: u64,
    model: &str,
) -> f64 {
    let p = pricing_for(model);
    let cost = (input_tokens as f64 / 1_000_000.0) * p.input_per_million
        + (output_tokens as f64 / 1_000_000.0) * p.output_per_million
        + (cache_read as f64 / 1_000_000.0) * p.cache_read_per_million
        + (cache_create as f64 / 1_000_000.0) * p.cache_create_per_million;
    (cost * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_resolution() {
        assert_eq!(pricing_for("claude-opus-4-6").input_per_million, 15.0);
        assert_eq!(pricing_for("claude-sonnet-4-5").input_per_million, 3.0);
        assert_eq!(pricing_for("claude-haiku-3-5").input_per_million, 0.80);
        assert_eq!(pricing_for("gpt-whatever").input_per_million, 0.80);
        assert_eq!(pricing_for("").input_per_million, 0.80);
    }

    #[test]
    fn opus_cost_per_million_output() {
        assert_eq!(estimate_cost(0, 1_000_000, 0, 0, "claude-opus-4-6"), 75.0);
    }

    #[test]
    fn cost_rounds_to_cents() {
        // 1k input on sonnet = $0.003 → rounds to 0.0
        assert_eq!(estimate_cost(1_000, 0, 0, 0, "claude-sonnet-4-5"), 0.0);
        // 10k output on sonnet = $0.15
        assert_eq!(estimate_cost(0, 10_000, 0, 0, "claude-sonnet-4-5"), 0.15);
    }

    #[test]
    fn mixed_counters_sum() {
        let cost = estimate_cost(2_000_000, 1_000_000, 4_000_000, 1_000_000, "opus");
        // 2*15 + 1*75 + 4*1.5 + 1*18.75 = 129.75
        assert_eq!(cost, 129.75);
    }
}
