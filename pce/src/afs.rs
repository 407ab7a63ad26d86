//! Core default Adaptive Feedback System.
//!
//! Domain plugins own their richer learning loops (bandit stats, Q-tables);
//! this default keeps the shared model slice honest: a coherence bias that
//! tracks recent outcomes and bounded reweighting of the strategic values.

use serde_json::{json, Value};

use crate::isi::slice_mut;
use crate::types::{ExecutionResult, JsonMap};
use crate::vel::StrategicValues;

const VALUE_WEIGHT_MIN: f64 = 0.2;
const VALUE_WEIGHT_MAX: f64 = 1.5;

#[derive(Debug, Default)]
pub struct AdaptiveFeedback;

impl AdaptiveFeedback {
    pub fn new() -> Self {
        Self
    }

    pub fn adapt(&self, state: &mut JsonMap, result: &ExecutionResult) {
        let outcome = if result.success {
            result.observed_impact
        } else {
            -result.observed_impact
        };

        let model = slice_mut(state, "model");
        let learning_rate = model
            .get("learning_rate")
            .and_then(Value::as_f64)
            .unwrap_or(0.1);
        let bias = model
            .get("coherence_bias")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        model.insert("coherence_bias".into(), json!(bias + learning_rate * outcome));
        model.insert("last_action".into(), json!(result.action_type));

        let violated: Vec<String> = result
            .metadata
            .get("violated_values")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let contradiction_penalty = if violated.is_empty() { 0.0 } else { 0.05 };
        let feedback_boost = 0.03 * outcome.clamp(-1.0, 1.0);

        let defaults = StrategicValues::default();
        let values = slice_mut(state, "strategic_values");
        for (key, fallback) in [
            ("safety", defaults.safety),
            ("efficiency", defaults.efficiency),
            ("financial_responsibility", defaults.financial_responsibility),
            ("long_term_coherence", defaults.long_term_coherence),
        ] {
            let current = values.get(key).and_then(Value::as_f64).unwrap_or(fallback);
            let delta = if violated.iter().any(|v| v == key) {
                contradiction_penalty
            } else {
                feedback_boost
            };
            values.insert(
                key.to_string(),
                json!((current + delta).clamp(VALUE_WEIGHT_MIN, VALUE_WEIGHT_MAX)),
            );
        }
    }
}
