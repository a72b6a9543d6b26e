use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::types::{CostBreakdown, TokenCounts};

/// Per-1M-token USD rates for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    /// Anthropic prompt caching: writes cost more than input, reads cost less.
    pub cache_write_per_1m: f64,
    pub cache_read_per_1m: f64,
}

const OPUS: ModelPricing = ModelPricing {
    input_per_1m: 15.0,
    output_per_1m: 75.0,
    cache_write_per_1m: 18.75,
    cache_read_per_1m: 1.5,
};

const SONNET: ModelPricing = ModelPricing {
    input_per_1m: 3.0,
    output_per_1m: 15.0,
    cache_write_per_1m: 3.75,
    cache_read_per_1m: 0.3,
};

const HAIKU_4_5: ModelPricing = ModelPricing {
    input_per_1m: 1.0,
    output_per_1m: 5.0,
    cache_write_per_1m: 1.25,
    cache_read_per_1m: 0.10,
};

const HAIKU_3_5: ModelPricing = ModelPricing {
    input_per_1m: 0.8,
    output_per_1m: 4.0,
    cache_write_per_1m: 1.0,
    cache_read_per_1m: 0.08,
};

const HAIKU_3: ModelPricing = ModelPricing {
    input_per_1m: 0.25,
    output_per_1m: 1.25,
    cache_write_per_1m: 0.3,
    cache_read_per_1m: 0.03,
};

static MODEL_INDEX: phf::Map<&'static str, ModelPricing> = phf_map! {
    "claude-opus-4-1" => OPUS,
    "claude-opus-4" => OPUS,
    "claude-3-opus" => OPUS,
    "claude-sonnet-4-5" => SONNET,
    "claude-sonnet-4" => SONNET,
    "claude-3-7-sonnet" => SONNET,
    "claude-3-5-sonnet" => SONNET,
    "claude-haiku-4-5" => HAIKU_4_5,
    "claude-3-5-haiku" => HAIKU_3_5,
    "claude-3-haiku" => HAIKU_3,
};

static MODEL_ALIASES: phf::Map<&'static str, &'static str> = phf_map! {
    "claude-opus-4-20250514" => "claude-opus-4",
    "claude-opus-4-0" => "claude-opus-4",
    "claude-opus-4.1" => "claude-opus-4-1",
    "claude-opus-4-1-20250805" => "claude-opus-4-1",
    "claude-sonnet-4-20250514" => "claude-sonnet-4",
    "claude-sonnet-4-0" => "claude-sonnet-4",
    "claude-sonnet-4.5" => "claude-sonnet-4-5",
    "claude-sonnet-4-5-20250929" => "claude-sonnet-4-5",
    "claude-3-7-sonnet-20250219" => "claude-3-7-sonnet",
    "claude-3-7-sonnet-latest" => "claude-3-7-sonnet",
    "claude-3-5-sonnet-20241022" => "claude-3-5-sonnet",
    "claude-3-5-sonnet-20240620" => "claude-3-5-sonnet",
    "claude-3-5-sonnet-latest" => "claude-3-5-sonnet",
    "claude-3-5-haiku-20241022" => "claude-3-5-haiku",
    "claude-3-5-haiku-latest" => "claude-3-5-haiku",
    "claude-haiku-4.5" => "claude-haiku-4-5",
    "claude-haiku-4-5-20251001" => "claude-haiku-4-5",
    "claude-3-opus-20240229" => "claude-3-opus",
    "claude-3-haiku-20240307" => "claude-3-haiku",
};

/// Looks a model up by canonical name, alias, then model family.
pub fn get_model_pricing(model_name: &str) -> Option<&'static ModelPricing> {
    if let Some(pricing) = MODEL_INDEX.get(model_name) {
        return Some(pricing);
    }

    if let Some(&canonical_name) = MODEL_ALIASES.get(model_name) {
        return MODEL_INDEX.get(canonical_name);
    }

    // Newer dated snapshots of a known family
    let lower = model_name.to_ascii_lowercase();
    if lower.contains("opus") {
        Some(&OPUS)
    } else if lower.contains("sonnet") {
        Some(&SONNET)
    } else if lower.contains("haiku") {
        Some(&HAIKU_4_5)
    } else {
        None
    }
}

pub fn is_known_model(model_name: &str) -> bool {
    get_model_pricing(model_name).is_some()
}

/// Splits the cost of one usage record by token category.
/// Unknown models cost nothing; callers decide whether to warn.
pub fn calculate_cost(model_name: &str, tokens: &TokenCounts) -> CostBreakdown {
    let Some(pricing) = get_model_pricing(model_name) else {
        return CostBreakdown::default();
    };

    let per_1m = |count: u64, rate: f64| (count as f64 / 1_000_000.0) * rate;
    let input_cost = per_1m(tokens.input, pricing.input_per_1m);
    let output_cost = per_1m(tokens.output, pricing.output_per_1m);
    let cache_creation_cost = per_1m(tokens.cache_creation, pricing.cache_write_per_1m);
    let cache_read_cost = per_1m(tokens.cache_read, pricing.cache_read_per_1m);

    CostBreakdown {
        input_cost,
        output_cost,
        cache_creation_cost,
        cache_read_cost,
        total_cost: input_cost + output_cost + cache_creation_cost + cache_read_cost,
    }
}

pub fn calculate_total_cost(model_name: &str, tokens: &TokenCounts) -> f64 {
    calculate_cost(model_name, tokens).total_cost
}

/// Unit-cost model behind the cache savings figures, relative to a
/// full-price input token.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachePricing {
    pub read_multiplier: f64,
    pub write_multiplier: f64,
}

impl Default for CachePricing {
    fn default() -> Self {
        Self {
            read_multiplier: 0.10,
            write_multiplier: 1.25,
        }
    }
}

impl CachePricing {
    /// Base-unit savings: reads avoided full price but paid the read rate,
    /// writes paid the surcharge.
    pub fn cost_saved(&self, read: u64, created: u64) -> f64 {
        let read = read as f64;
        let created = created as f64;
        read * 1.0 - read * self.read_multiplier - created * self.write_multiplier
    }
}
