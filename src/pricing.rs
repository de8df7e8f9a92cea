use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PricingError {
    #[error("Unknown model: {0} (no pricing entry)")]
    UnknownModel(String),
}

/// Price of one model in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
}

impl Pricing {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// Estimated cost in USD for the given token usage.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output;
        input_cost + output_cost
    }
}

// Anthropic list prices per million tokens
const ANTHROPIC_PRICING: &[(&str, Pricing)] = &[
    ("claude-sonnet-4-20250514", Pricing::new(3.00, 15.00)),
    ("claude-opus-4-20250514", Pricing::new(15.00, 75.00)),
    ("claude-3-5-sonnet-20241022", Pricing::new(3.00, 15.00)),
    ("claude-3-5-haiku-20241022", Pricing::new(0.80, 4.00)),
    ("claude-3-opus-20240229", Pricing::new(15.00, 75.00)),
    ("claude-3-haiku-20240307", Pricing::new(0.25, 1.25)),
];

/// Immutable model -> price mapping.
///
/// Built once at startup and shared by reference with every probe; there is
/// no fallback price, a missing model is reported as [`PricingError::UnknownModel`].
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, Pricing>,
}

impl PricingTable {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Pricing)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(model, pricing)| (model.into(), pricing))
                .collect(),
        }
    }

    /// The built-in Anthropic price list.
    pub fn anthropic() -> Self {
        Self::new(ANTHROPIC_PRICING.iter().copied())
    }

    /// Returns a copy of this table with `overrides` added or replacing
    /// existing entries.
    pub fn with_overrides(mut self, overrides: &HashMap<String, Pricing>) -> Self {
        for (model, pricing) in overrides {
            self.entries.insert(model.clone(), *pricing);
        }
        self
    }

    pub fn lookup(&self, model: &str) -> Result<Pricing, PricingError> {
        self.entries
            .get(model)
            .copied()
            .ok_or_else(|| PricingError::UnknownModel(model.to_string()))
    }

    pub fn cost(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<f64, PricingError> {
        Ok(self.lookup(model)?.cost(input_tokens, output_tokens))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.entries.contains_key(model)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_model() {
        let table = PricingTable::anthropic();
        let pricing = table.lookup("claude-3-haiku-20240307").unwrap();
        assert_eq!(pricing, Pricing::new(0.25, 1.25));
        assert_eq!(table.len(), 6);
    }

    #[test]
    fn test_lookup_unknown_model() {
        let table = PricingTable::anthropic();
        assert_eq!(
            table.lookup("gpt-4o"),
            Err(PricingError::UnknownModel("gpt-4o".to_string()))
        );
    }

    #[test]
    fn test_cost_formula() {
        let table = PricingTable::anthropic();
        let cost = table.cost("claude-3-haiku-20240307", 18, 5).unwrap();
        let expected = 18.0 / 1_000_000.0 * 0.25 + 5.0 / 1_000_000.0 * 1.25;
        assert!((cost - expected).abs() < 1e-12, "got {}", cost);
        assert!((cost - 0.00001075).abs() < 1e-12, "got {}", cost);
    }

    #[test]
    fn test_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("local-llama".to_string(), Pricing::new(0.0, 0.0));
        overrides.insert("claude-3-haiku-20240307".to_string(), Pricing::new(1.0, 2.0));

        let table = PricingTable::anthropic().with_overrides(&overrides);
        assert!(table.contains("local-llama"));
        assert_eq!(
            table.lookup("claude-3-haiku-20240307").unwrap(),
            Pricing::new(1.0, 2.0)
        );
        assert_eq!(table.cost("local-llama", 1000, 1000).unwrap(), 0.0);
    }
}
