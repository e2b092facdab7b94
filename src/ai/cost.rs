//! Cost and token accounting across AI calls.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, ErrorCode, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per million input tokens.
    pub input_per_million: f64,
    /// USD per million output tokens.
    pub output_per_million: f64,
}

static DEFAULT_PRICING: Lazy<HashMap<String, ModelPricing>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert(
        "claude-sonnet-4-20250514".to_string(),
        ModelPricing {
            input_per_million: 3.0,
            output_per_million: 15.0,
        },
    );
    table.insert(
        "claude-3-5-haiku-20241022".to_string(),
        ModelPricing {
            input_per_million: 0.8,
            output_per_million: 4.0,
        },
    );
    table.insert(
        "gpt-4o".to_string(),
        ModelPricing {
            input_per_million: 2.5,
            output_per_million: 10.0,
        },
    );
    table.insert(
        "gpt-4o-mini".to_string(),
        ModelPricing {
            input_per_million: 0.15,
            output_per_million: 0.6,
        },
    );
    table.insert(
        "gemini-2.0-flash".to_string(),
        ModelPricing {
            input_per_million: 0.1,
            output_per_million: 0.4,
        },
    );
    table
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Soft threshold; crossing it logs a warning exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_cost_usd: Option<f64>,
}

/// Per-step cost record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCost {
    pub step_name: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostReport {
    pub steps: Vec<StepCost>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Default)]
pub struct CostTracker {
    pricing: HashMap<String, ModelPricing>,
    limits: BudgetLimits,
    report: CostReport,
    soft_warned: bool,
}

impl CostTracker {
    /// `pricing` entries from configuration are merged over the default
    /// table; unknown models cost 0.
    pub fn new(pricing: HashMap<String, ModelPricing>, limits: BudgetLimits) -> Self {
        let mut merged = DEFAULT_PRICING.clone();
        merged.extend(pricing);
        Self {
            pricing: merged,
            limits,
            report: CostReport::default(),
            soft_warned: false,
        }
    }

    pub fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.pricing.get(model) {
            Some(pricing) => {
                (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
                    + (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million
            }
            None => 0.0,
        }
    }

    pub fn record(
        &mut self,
        step_name: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        retry_attempts: u32,
    ) {
        let cost_usd = self.calculate_cost(model, input_tokens, output_tokens);
        self.report.total_input_tokens += input_tokens;
        self.report.total_output_tokens += output_tokens;
        self.report.total_cost_usd += cost_usd;
        self.report.steps.push(StepCost {
            step_name: step_name.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            retry_attempts,
        });

        if !self.soft_warned {
            if let Some(threshold) = self.limits.warn_cost_usd {
                if self.report.total_cost_usd >= threshold {
                    self.soft_warned = true;
                    tracing::warn!(
                        "AI spend ${:.4} crossed the soft budget threshold ${:.4}",
                        self.report.total_cost_usd,
                        threshold
                    );
                }
            }
        }
    }

    /// Fails fast when a hard ceiling is already reached.
    pub fn check_budget(&self) -> Result<()> {
        if let Some(limit) = self.limits.max_cost_usd {
            if self.report.total_cost_usd >= limit {
                return Err(EngineError::new(
                    ErrorCode::AiBudgetExceeded,
                    format!(
                        "AI cost ${:.4} reached the configured limit ${:.4}",
                        self.report.total_cost_usd, limit
                    ),
                )
                .with_suggestion("raise ai.budget.max_cost_usd or split the recipe"));
            }
        }
        if let Some(limit) = self.limits.max_tokens {
            let total = self.report.total_input_tokens + self.report.total_output_tokens;
            if total >= limit {
                return Err(EngineError::new(
                    ErrorCode::AiBudgetExceeded,
                    format!("AI token usage {total} reached the configured limit {limit}"),
                ));
            }
        }
        Ok(())
    }

    pub fn report(&self) -> &CostReport {
        &self.report
    }

    pub fn into_report(self) -> CostReport {
        self.report
    }
}

/// Approximate token count: ceil(chars / 4). Real tokenizer counts are
/// not required anywhere in the engine.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_models_cost_zero() {
        let tracker = CostTracker::new(HashMap::new(), BudgetLimits::default());
        assert_eq!(tracker.calculate_cost("mystery-model", 1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn config_pricing_overrides_defaults() {
        let mut pricing = HashMap::new();
        pricing.insert(
            "gpt-4o".to_string(),
            ModelPricing {
                input_per_million: 1.0,
                output_per_million: 1.0,
            },
        );
        let tracker = CostTracker::new(pricing, BudgetLimits::default());
        let cost = tracker.calculate_cost("gpt-4o", 1_000_000, 0);
        assert!((cost - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hard_limit_trips_budget_check() {
        let limits = BudgetLimits {
            max_cost_usd: Some(0.001),
            ..Default::default()
        };
        let mut tracker = CostTracker::new(HashMap::new(), limits);
        tracker.record("gen", "gpt-4o", 1_000_000, 0, 0);
        let err = tracker.check_budget().unwrap_err();
        assert_eq!(err.code, ErrorCode::AiBudgetExceeded);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn report_accumulates_totals() {
        let mut tracker = CostTracker::new(HashMap::new(), BudgetLimits::default());
        tracker.record("a", "gpt-4o", 100, 50, 0);
        tracker.record("b", "gpt-4o", 200, 25, 1);
        let report = tracker.report();
        assert_eq!(report.total_input_tokens, 300);
        assert_eq!(report.total_output_tokens, 75);
        assert_eq!(report.steps.len(), 2);
    }
}
