//! Core default Decision Engine.
//!
//! Used whenever no domain plugin matched the event, and as the downgrade
//! target when a plugin fails. The three candidate actions are scored from
//! value alignment, coherence, state complexity and the adaptive coherence
//! bias that the feedback stage maintains in the model slice.

use serde_json::{json, Value};

use crate::types::{ActionPlan, CciReading, JsonMap};

#[derive(Debug, Default)]
pub struct DecisionEngine;

impl DecisionEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn deliberate(&self, state: &JsonMap, value_score: f64, cci: &CciReading) -> ActionPlan {
        let cci = cci.cci;
        let coherence_bias = state
            .get("model")
            .and_then(Value::as_object)
            .and_then(|m| m.get("coherence_bias"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let state_complexity = (state.len() as f64 / 10.0).min(1.0);

        let mut candidates = vec![
            (
                "stabilize",
                0.55 * (1.0 - cci)
                    + 0.25 * (1.0 - value_score)
                    + 0.20 * state_complexity
                    + 0.05 * (-coherence_bias).max(0.0),
            ),
            (
                "execute_strategy",
                0.60 * value_score
                    + 0.35 * cci
                    + 0.05 * (1.0 - state_complexity)
                    + 0.05 * coherence_bias.max(0.0),
            ),
            (
                "collect_more_data",
                0.45 * (1.0 - value_score) + 0.35 * (1.0 - cci) + 0.20 * state_complexity,
            ),
        ];
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let (action_type, best_score) = candidates[0];

        let priority = (5.0 - (cci + value_score) * 2.0).round().clamp(1.0, 5.0) as i64;
        let expected_impact = (0.55 * value_score + 0.45 * cci).clamp(0.0, 1.0);

        let mut plan = ActionPlan::new(
            action_type,
            priority,
            format!(
                "composite score={best_score:.3}; cci={cci:.3}, value_score={value_score:.3}, \
                 state_complexity={state_complexity:.3}, coherence_bias={coherence_bias:.3}"
            ),
        );
        plan.expected_impact = expected_impact;
        plan.metadata.insert(
            "candidate_scores".into(),
            Value::Object(
                candidates
                    .iter()
                    .map(|(name, score)| (name.to_string(), json!(score)))
                    .collect(),
            ),
        );
        plan.explain_section_mut("de").insert(
            "selected_by_bandit".into(),
            json!(false),
        );
        plan.explain_section_mut("de")
            .insert("final_profile".into(), json!("core_default"));
        plan
    }

    /// Minimal observe plan used when even the default deliberation should
    /// stay out of the way (e.g. pure feedback ingestion).
    pub fn observe_plan(&self, domain: &str) -> ActionPlan {
        let mut plan = ActionPlan::new("observe", 1, "no domain plugin registered; observing");
        plan.domain = domain.to_string();
        plan.expected_impact = 0.5;
        plan
    }
}
