//! Value Evaluation Layer: default scoring against strategic values.
//!
//! Domains with a registered value plugin bypass this layer entirely; the
//! default covers `core` and any domain that opted out of custom scoring.

use serde_json::Value;

use crate::types::{JsonMap, PceEvent};

/// Explicit values that constrain and prioritize decisions. The state's
/// `strategic_values` slice can override individual weights at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategicValues {
    pub safety: f64,
    pub efficiency: f64,
    pub financial_responsibility: f64,
    pub long_term_coherence: f64,
}

impl Default for StrategicValues {
    fn default() -> Self {
        Self {
            safety: 1.0,
            efficiency: 0.8,
            financial_responsibility: 0.9,
            long_term_coherence: 1.0,
        }
    }
}

impl StrategicValues {
    pub fn from_state(state: &JsonMap) -> Self {
        let defaults = Self::default();
        let Some(overrides) = state.get("strategic_values").and_then(Value::as_object) else {
            return defaults;
        };
        let pick = |key: &str, fallback: f64| {
            overrides.get(key).and_then(Value::as_f64).unwrap_or(fallback)
        };
        Self {
            safety: pick("safety", defaults.safety),
            efficiency: pick("efficiency", defaults.efficiency),
            financial_responsibility: pick(
                "financial_responsibility",
                defaults.financial_responsibility,
            ),
            long_term_coherence: pick("long_term_coherence", defaults.long_term_coherence),
        }
    }
}

/// Score plus the value-violation tags accumulated while scoring.
#[derive(Debug, Clone)]
pub struct ValueAssessment {
    pub score: f64,
    pub violations: Vec<String>,
    /// Optional per-component breakdown exposed in the explain bag.
    pub components: Option<JsonMap>,
}

impl ValueAssessment {
    pub fn new(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            violations: Vec::new(),
            components: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValueEvaluator;

impl ValueEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Tag-driven alignment score in [0, 1]: consistency of tags,
    /// non-destructive defaults, budget positivity.
    pub fn evaluate(&self, event: &PceEvent, state: &JsonMap) -> ValueAssessment {
        let values = StrategicValues::from_state(state);
        let tags = event.tags();
        let has = |tag: &str| tags.iter().any(|t| t == tag);

        let mut score = 0.0;
        score += if has("safe") { values.safety } else { values.safety * 0.4 };
        score += if has("efficient") {
            values.efficiency
        } else {
            values.efficiency * 0.5
        };
        score += if has("budget-aware") {
            values.financial_responsibility
        } else {
            values.financial_responsibility * 0.6
        };
        score += if has("strategic") { values.long_term_coherence } else { 0.5 };

        let mut assessment = ValueAssessment::new(score / 4.0);
        if assessment.score < 0.6 {
            assessment.violations.push("long_term_coherence".to_string());
        }
        if event
            .payload
            .get("destructive")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            assessment.violations.push("safety".to_string());
        }
        assessment
    }
}
