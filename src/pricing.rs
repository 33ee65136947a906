use crate::config::PricingOverride;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model_pattern: String,
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl ModelPricing {
    fn new(model_pattern: &str, input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            model_pattern: model_pattern.into(),
            input_per_1m,
            output_per_1m,
        }
    }
}

// More specific patterns first: resolution is first substring match.
pub fn built_in_pricing() -> Vec<ModelPricing> {
    vec![
        ModelPricing::new("llama3.1-8b", 0.025, 0.04),
        ModelPricing::new("llama3.1-70b", 0.12, 0.30),
        ModelPricing::new("llama3.3-70b", 0.12, 0.30),
        ModelPricing::new("llama-4-maverick", 0.18, 0.60),
        ModelPricing::new("llama-4-scout", 0.08, 0.30),
        ModelPricing::new("deepseek-r1", 0.54, 2.19),
        ModelPricing::new("gpt-4o-mini", 0.15, 0.60),
        ModelPricing::new("gpt-4o", 2.50, 10.0),
        ModelPricing::new("claude-3-5-haiku", 0.80, 4.0),
        ModelPricing::new("claude-3-5-sonnet", 3.0, 15.0),
    ]
}

pub fn resolve_pricing(model: &str, overrides: &[PricingOverride]) -> Option<ModelPricing> {
    if let Some(ov) = overrides.iter().find(|ov| model.contains(&ov.model_pattern)) {
        return Some(ModelPricing {
            model_pattern: ov.model_pattern.clone(),
            input_per_1m: ov.input_per_1m,
            output_per_1m: ov.output_per_1m,
        });
    }

    built_in_pricing()
        .into_iter()
        .find(|p| model.contains(&p.model_pattern))
}

/// USD cost of a call. Unknown models are free rather than guessed.
pub fn cost_for(
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    overrides: &[PricingOverride],
) -> f64 {
    let Some(pricing) = resolve_pricing(model, overrides) else {
        tracing::debug!(model, "no pricing entry; recording zero cost");
        return 0.0;
    };
    let input_cost = (input_tokens as f64 / 1_000_000.0) * pricing.input_per_1m;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * pricing.output_per_1m;
    (input_cost + output_cost).max(0.0)
}
