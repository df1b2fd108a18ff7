//! Model-aware cost calculation with per-model pricing.
//!
//! Pure pricing: a token triple and a model name in, a cost triple out,
//! rounded to four fractional digits. Unknown models fall back to the
//! built-in default row and warn once per name. Overrides may be installed
//! and removed at runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use crate::domain::models::CostUsage;

/// Pricing per thousand tokens for a specific model (currency units).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    /// Cost per thousand prompt tokens.
    pub prompt_per_thousand: f64,
    /// Cost per thousand completion tokens.
    pub completion_per_thousand: f64,
}

/// Built-in pricing table. Matching is by substring so dated model ids
/// (e.g. "claude-opus-4-20250514") resolve to their family row.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    (
        "opus",
        ModelPricing { prompt_per_thousand: 0.015, completion_per_thousand: 0.075 },
    ),
    (
        "sonnet",
        ModelPricing { prompt_per_thousand: 0.003, completion_per_thousand: 0.015 },
    ),
    (
        "haiku",
        ModelPricing { prompt_per_thousand: 0.0008, completion_per_thousand: 0.004 },
    ),
    (
        "gpt-4o",
        ModelPricing { prompt_per_thousand: 0.0025, completion_per_thousand: 0.01 },
    ),
    (
        "gpt-4o-mini",
        ModelPricing { prompt_per_thousand: 0.00015, completion_per_thousand: 0.0006 },
    ),
];

/// The fallback row used for models not present in the table.
const DEFAULT_PRICING: ModelPricing = ModelPricing {
    prompt_per_thousand: 0.003,
    completion_per_thousand: 0.015,
};

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Prices token usage into cost. No I/O; callable from any context.
pub struct CostCalculator {
    overrides: RwLock<HashMap<String, ModelPricing>>,
    warned_unknown: Mutex<HashSet<String>>,
}

impl CostCalculator {
    pub fn new() -> Self {
        Self {
            overrides: RwLock::new(HashMap::new()),
            warned_unknown: Mutex::new(HashSet::new()),
        }
    }

    /// Install or replace a runtime pricing override for `model`.
    pub fn set_override(&self, model: impl Into<String>, pricing: ModelPricing) {
        if let Ok(mut overrides) = self.overrides.write() {
            overrides.insert(model.into(), pricing);
        }
    }

    /// Remove a runtime override; the built-in table applies again.
    pub fn remove_override(&self, model: &str) {
        if let Ok(mut overrides) = self.overrides.write() {
            overrides.remove(model);
        }
    }

    /// Resolve the pricing row for `model`: overrides first, then the
    /// built-in table by substring, then the default row (warned once).
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        if let Ok(overrides) = self.overrides.read() {
            if let Some(pricing) = overrides.get(model) {
                return *pricing;
            }
        }

        let model_lower = model.to_lowercase();
        if let Some((_, pricing)) = PRICING_TABLE
            .iter()
            .find(|(name, _)| model_lower.contains(name))
        {
            return *pricing;
        }

        if let Ok(mut warned) = self.warned_unknown.lock() {
            if warned.insert(model.to_string()) {
                tracing::warn!(model, "unknown model, using default pricing");
            }
        }
        DEFAULT_PRICING
    }

    /// Price a token triple into a cost triple, four-digit rounded.
    pub fn calculate(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> CostUsage {
        let pricing = self.pricing_for(model);
        let prompt = round4(prompt_tokens as f64 / 1000.0 * pricing.prompt_per_thousand);
        let completion =
            round4(completion_tokens as f64 / 1000.0 * pricing.completion_per_thousand);
        CostUsage {
            prompt,
            completion,
            total: round4(prompt + completion),
        }
    }
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::new()
    }
}
