//! Per-model pricing for usage accounting.

use std::collections::HashMap;

use crate::types::Usage;

/// Per-million-token rates for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

/// Pricing table keyed by model name.
///
/// Missing models yield a zero cost with `Usage::priced == false` so the
/// caller can tell "free" apart from "unknown".
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<String, ModelRate>,
    /// Multiplier applied on top of raw provider rates.
    markup: f64,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "gpt-4o".to_string(),
            ModelRate {
                prompt_per_million: 2.50,
                completion_per_million: 10.00,
            },
        );
        rates.insert(
            "gpt-4o-mini".to_string(),
            ModelRate {
                prompt_per_million: 0.15,
                completion_per_million: 0.60,
            },
        );
        rates.insert(
            "gpt-4.1".to_string(),
            ModelRate {
                prompt_per_million: 2.00,
                completion_per_million: 8.00,
            },
        );
        rates.insert(
            "gpt-4.1-mini".to_string(),
            ModelRate {
                prompt_per_million: 0.40,
                completion_per_million: 1.60,
            },
        );
        rates.insert(
            "o3-mini".to_string(),
            ModelRate {
                prompt_per_million: 1.10,
                completion_per_million: 4.40,
            },
        );
        Self { rates, markup: 1.0 }
    }
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty table; every model reads as unpriced.
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
            markup: 1.0,
        }
    }

    /// Apply a markup factor to all computed costs.
    pub fn with_markup(mut self, markup: f64) -> Self {
        self.markup = markup;
        self
    }

    /// Add or override the rate for one model.
    pub fn with_rate(mut self, model: impl Into<String>, rate: ModelRate) -> Self {
        self.rates.insert(model.into(), rate);
        self
    }

    /// Dollar cost for the given token counts, or `None` for unknown models.
    pub fn cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> Option<f64> {
        let rate = self.rates.get(model)?;
        let cost = (f64::from(prompt_tokens) * rate.prompt_per_million
            + f64::from(completion_tokens) * rate.completion_per_million)
            / 1_000_000.0;
        Some(cost * self.markup)
    }

    /// Build a [`Usage`] from raw token counts, pricing what we can.
    pub fn usage(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> Usage {
        let total_tokens = prompt_tokens + completion_tokens;
        match self.cost(model, prompt_tokens, completion_tokens) {
            Some(cost_usd) => Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
                cost_usd,
                priced: true,
            },
            None => Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
                cost_usd: 0.0,
                priced: false,
            },
        }
    }
}
