// ABOUTME: Per-model pricing table for deriving generation cost from token usage
// ABOUTME: Static $/1M-token rates with a flat fallback for unknown models
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Cost derivation for completed generations
//!
//! Rates are USD per 1M tokens. Unknown models fall back to a conservative
//! flat rate so the ledger never records a zero cost for real usage.

use crate::llm::TokenUsage;

/// (model prefix, input $/1M, output $/1M)
const RATES: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1", 2.00, 8.00),
    ("o3-mini", 1.10, 4.40),
];

/// Fallback rate for models not in the table (input, output)
const FALLBACK_RATE: (f64, f64) = (2.50, 10.00);

/// Look up the per-1M-token rates for a model
///
/// Longest-prefix match so `gpt-4o-mini-2024-07-18` resolves to
/// `gpt-4o-mini`, not `gpt-4o`.
#[must_use]
pub fn rates_for(model: &str) -> (f64, f64) {
    RATES
        .iter()
        .filter(|(prefix, _, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _, _)| prefix.len())
        .map_or(FALLBACK_RATE, |(_, input, output)| (*input, *output))
}

/// Derive the USD cost of a generation from its token usage
#[must_use]
pub fn cost_for(model: &str, usage: &TokenUsage) -> f64 {
    let (input_rate, output_rate) = rates_for(model);
    let input_cost = (f64::from(usage.prompt_tokens) / 1_000_000.0) * input_rate;
    let output_cost = (f64::from(usage.completion_tokens) / 1_000_000.0) * output_rate;
    input_cost + output_cost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(rates_for("gpt-4o-mini-2024-07-18"), (0.15, 0.60));
        assert_eq!(rates_for("gpt-4o-2024-08-06"), (2.50, 10.00));
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        assert_eq!(rates_for("somebody-elses-model"), FALLBACK_RATE);
    }

    #[test]
    fn test_cost_derivation() {
        let usage = TokenUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 1_000_000,
            total_tokens: 2_000_000,
        };
        let cost = cost_for("gpt-4o-mini", &usage);
        assert!((cost - 0.75).abs() < 1e-9);
    }
}
