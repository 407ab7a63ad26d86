//! Cognitive Coherence Index.
//!
//! Derives a [0, 1] coherence score from the completed-action window.
//! Weights are fixed constants loaded from configuration at boot; they do
//! not drift at runtime. With fewer than three qualifying actions the
//! engine returns 0.5 and marks the components unknown.

use crate::config::CciConfig;
use crate::error::PceResult;
use crate::store::StateStore;
use crate::types::{CciComponents, CciReading, CompletedAction};

/// Maximum variance of priorities drawn from the 1..=5 scale, used to
/// normalize the stability component.
const PRIORITY_VAR_MAX: f64 = 4.0;

/// Minimum number of completed actions before components are meaningful.
const MIN_QUALIFYING_ACTIONS: usize = 3;

const COLD_START_CCI: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct CoherenceEngine {
    config: CciConfig,
}

impl CoherenceEngine {
    pub fn new(config: CciConfig) -> Self {
        Self { config }
    }

    pub fn window(&self) -> usize {
        self.config.window
    }

    /// Reading over the store's most recent window of completed actions.
    pub fn reading_from_store(&self, store: &StateStore) -> PceResult<CciReading> {
        let actions = store.recent_actions(self.config.window)?;
        Ok(self.compute(&actions))
    }

    /// Compute the index over `actions` ordered oldest to newest.
    pub fn compute(&self, actions: &[CompletedAction]) -> CciReading {
        let window = &actions[actions.len().saturating_sub(self.config.window)..];
        if window.len() < MIN_QUALIFYING_ACTIONS {
            return CciReading {
                cci: COLD_START_CCI,
                components: None,
            };
        }

        let total = window.len() as f64;
        let with_violations = window.iter().filter(|a| !a.violations.is_empty()).count() as f64;
        let consistency = (total - with_violations) / total;
        let contradiction_rate = with_violations / total;

        let priorities: Vec<f64> = window.iter().map(|a| a.priority as f64).collect();
        let stability = (1.0 - variance(&priorities) / PRIORITY_VAR_MAX).clamp(0.0, 1.0);

        let errors: Vec<f64> = window
            .iter()
            .map(|a| (a.expected_impact - a.observed_impact).abs())
            .collect();
        let predictive_accuracy = (1.0 - mean(&errors)).clamp(0.0, 1.0);

        let weights = self.config.weights;
        let cci = weights.consistency * consistency
            + weights.stability * stability
            + weights.non_contradiction * (1.0 - contradiction_rate)
            + weights.predictive_accuracy * predictive_accuracy;

        CciReading {
            cci: cci.clamp(0.0, 1.0),
            components: Some(CciComponents {
                consistency,
                stability,
                contradiction_rate,
                predictive_accuracy,
            }),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JsonMap;
    use chrono::Utc;

    fn action(priority: i64, expected: f64, observed: f64, violations: &[&str]) -> CompletedAction {
        CompletedAction {
            action_id: uuid::Uuid::new_v4().to_string(),
            decision_id: "e".into(),
            action_type: "execute_strategy".into(),
            domain: "core".into(),
            priority,
            value_score: 0.8,
            expected_impact: expected,
            observed_impact: observed,
            success: true,
            violations: violations.iter().map(|v| v.to_string()).collect(),
            rationale: "test".into(),
            metadata: JsonMap::new(),
            completed_at: Utc::now(),
        }
    }

    fn engine() -> CoherenceEngine {
        CoherenceEngine::new(CciConfig::default())
    }

    #[test]
    fn cold_start_returns_half_with_unknown_components() {
        let reading = engine().compute(&[]);
        assert!((reading.cci - 0.5).abs() < f64::EPSILON);
        assert!(reading.components.is_none());

        let two = vec![action(2, 0.8, 0.8, &[]), action(2, 0.8, 0.8, &[])];
        let reading = engine().compute(&two);
        assert!((reading.cci - 0.5).abs() < f64::EPSILON);
        assert!(reading.components.is_none());
    }

    #[test]
    fn three_clean_accurate_actions_exceed_point_seven() {
        let actions = vec![
            action(2, 0.8, 0.75, &[]),
            action(2, 0.7, 0.7, &[]),
            action(2, 0.9, 0.85, &[]),
        ];
        let reading = engine().compute(&actions);
        assert!(reading.cci > 0.7, "cci={}", reading.cci);
        let components = reading.components.expect("components known");
        assert!((components.consistency - 1.0).abs() < f64::EPSILON);
        assert!(components.contradiction_rate.abs() < f64::EPSILON);
        assert!(components.predictive_accuracy > 0.9);
    }

    #[test]
    fn violation_share_drives_consistency_and_contradiction() {
        let actions = vec![
            action(2, 0.8, 0.7, &[]),
            action(3, 0.8, 0.7, &[]),
            action(2, 0.8, 0.7, &[]),
            action(3, 0.8, 0.7, &["safety"]),
        ];
        let reading = engine().compute(&actions);
        let components = reading.components.expect("components known");
        assert!((components.consistency - 0.75).abs() < 1e-9);
        assert!((components.contradiction_rate - 0.25).abs() < 1e-9);
        assert!((components.predictive_accuracy - 0.9).abs() < 1e-9);
    }

    #[test]
    fn erratic_priorities_lower_stability() {
        let steady = vec![
            action(2, 0.8, 0.8, &[]),
            action(2, 0.8, 0.8, &[]),
            action(2, 0.8, 0.8, &[]),
        ];
        let erratic = vec![
            action(1, 0.8, 0.8, &[]),
            action(5, 0.8, 0.8, &[]),
            action(1, 0.8, 0.8, &[]),
        ];
        let steady_reading = engine().compute(&steady);
        let erratic_reading = engine().compute(&erratic);
        let steady_stability = steady_reading.components.expect("steady").stability;
        let erratic_stability = erratic_reading.components.expect("erratic").stability;
        assert!((steady_stability - 1.0).abs() < f64::EPSILON);
        assert!(erratic_stability < steady_stability);
        assert!(erratic_reading.cci < steady_reading.cci);
    }

    #[test]
    fn only_the_last_window_counts() {
        // Fill beyond the window with violating actions, then a clean window.
        let mut actions: Vec<CompletedAction> =
            (0..10).map(|_| action(2, 0.8, 0.2, &["safety"])).collect();
        for _ in 0..50 {
            actions.push(action(2, 0.8, 0.8, &[]));
        }
        let reading = engine().compute(&actions);
        let components = reading.components.expect("components");
        assert!((components.consistency - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregate_is_clamped_into_unit_interval() {
        let actions = vec![
            action(1, 1.0, 0.0, &["safety", "efficiency"]),
            action(5, 1.0, 0.0, &["safety"]),
            action(1, 1.0, 0.0, &["safety"]),
        ];
        let reading = engine().compute(&actions);
        assert!((0.0..=1.0).contains(&reading.cci));
    }
}
