//! OS robotics domain plugins: budget-first value model, lifecycle decision
//! planner with an agent roundtable, and feedback adaptation over the twin.

pub mod agents;
pub mod twin;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::PceResult;
use crate::plugins::{AdaptationPlugin, DecisionPlugin, ValueModelPlugin};
use crate::types::{ActionPlan, CciReading, ExecutionResult, JsonMap, PceEvent};
use crate::vel::ValueAssessment;

use twin::RobotTwin;

fn is_os_robotics(event: &PceEvent) -> bool {
    event.domain() == "os.robotics"
}

fn projected_cost(event: &PceEvent, twin: &RobotTwin) -> f64 {
    event
        .payload_f64("projected_cost")
        .unwrap_or(twin.cost_projection.projected_total_cost)
}

// ---------------------------------------------------------------------------
// Value model
// ---------------------------------------------------------------------------

/// Budget-first scoring with risk and project-phase adjustments.
pub struct OsRoboticsValueModel;

impl ValueModelPlugin for OsRoboticsValueModel {
    fn name(&self) -> &'static str {
        "os.robotics.value"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap) -> bool {
        is_os_robotics(event)
    }

    fn evaluate(&self, _event: &PceEvent, state: &JsonMap) -> PceResult<ValueAssessment> {
        let twin = RobotTwin::from_state(state);
        let budget_total = if twin.budget_total > 0.0 {
            twin.budget_total
        } else {
            1.0
        };
        let budget_score = (twin.budget_remaining / budget_total).clamp(0.0, 1.0);

        let risk_penalty = match twin.risk_level.as_str() {
            "LOW" => 0.0,
            "MEDIUM" => 0.15,
            "HIGH" => 0.35,
            _ => 0.1,
        };
        let phase_bonus = match twin.phase.as_str() {
            "planning" => 0.1,
            "procurement" => 0.05,
            "integration" => 0.0,
            "testing" => 0.05,
            _ => 0.0,
        };

        let mut assessment =
            ValueAssessment::new(0.65 * budget_score + phase_bonus - risk_penalty + 0.25);
        if twin.budget_remaining < 0.0 {
            assessment
                .violations
                .push("financial_responsibility".to_string());
        }
        let mut components = JsonMap::new();
        components.insert("budget_score".into(), json!(budget_score));
        components.insert("risk_penalty".into(), json!(risk_penalty));
        components.insert("phase_bonus".into(), json!(phase_bonus));
        assessment.components = Some(components);
        Ok(assessment)
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Lifecycle planner keyed by event type.
///
/// A plan enters the approval gate when it touches a financial state field
/// (the mandatory purchase flow, or an adverse budget signal) or when the
/// event declares elevated risk (HIGH/MEDIUM). Follow-up events synthesized
/// by the control plane (`*.completed` / `*.rejected`) are never re-gated.
pub struct OsRoboticsDecisionPlugin;

/// Risk the event itself declares, if any. `risk.detected` without an
/// explicit level defaults to HIGH, matching the twin's apply rule.
fn declared_risk(event: &PceEvent) -> Option<String> {
    if event.event_type == "risk.detected" {
        return Some(event.payload_str("risk_level").unwrap_or("HIGH").to_string());
    }
    event
        .payload_str("risk_level")
        .or_else(|| event.payload_str("projected_risk_level"))
        .map(str::to_string)
}

#[async_trait]
impl DecisionPlugin for OsRoboticsDecisionPlugin {
    fn name(&self) -> &'static str {
        "os.robotics.decision"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap) -> bool {
        is_os_robotics(event)
    }

    async fn deliberate(
        &self,
        event: &PceEvent,
        state: &mut JsonMap,
        assessment: &ValueAssessment,
        cci: &CciReading,
    ) -> PceResult<ActionPlan> {
        let twin = RobotTwin::from_state(state);
        let cost = projected_cost(event, &twin);
        let event_risk = event
            .payload_str("risk_level")
            .unwrap_or(&twin.risk_level)
            .to_string();

        let (action_type, priority, rationale, risk) = match event.event_type.as_str() {
            "project.goal.defined" => (
                "os.generate_bom",
                2,
                "project goal defined; derive initial BOM and cost/risk baseline",
                twin.risk_level.clone(),
            ),
            "part.candidate.added" => (
                "os.update_project_plan",
                3,
                "component candidate added; recompute projections",
                twin.risk_level.clone(),
            ),
            "purchase.requested" => (
                "os.request_purchase_approval",
                1,
                "purchase requested; waiting for the mandatory human gate",
                event_risk.clone(),
            ),
            "purchase.completed" => (
                "os.record_purchase",
                1,
                "purchase completed; record execution and update balance",
                twin.risk_level.clone(),
            ),
            "test.result.recorded" => (
                "os.update_project_plan",
                2,
                "test result received; refresh risk and projected cost",
                twin.risk_level.clone(),
            ),
            _ => (
                "os.update_project_plan",
                4,
                "OS event processed with an incremental plan update",
                twin.risk_level.clone(),
            ),
        };

        let is_follow_up =
            event.event_type.ends_with(".completed") || event.event_type.ends_with(".rejected");
        let risk_elevated = matches!(
            declared_risk(event).as_deref(),
            Some("HIGH") | Some("MEDIUM")
        );
        let budget_adverse = event
            .payload_f64("budget_remaining")
            .map(|remaining| remaining < 0.0)
            .unwrap_or(false)
            || twin.budget_remaining < cost;

        let (gate_required, gate_rationale) = if is_follow_up {
            (false, "none")
        } else if event.event_type == "purchase.requested" {
            (true, "purchase_flow_mandatory_gate")
        } else if budget_adverse {
            (true, "budget_remaining_below_projection")
        } else if risk_elevated {
            (true, "risk_level_elevated")
        } else {
            (false, "none")
        };

        let mut plan = ActionPlan::new(action_type, priority, rationale);
        plan.domain = "os.robotics".into();
        plan.requires_approval = gate_required;
        plan.expected_impact = (0.55 * assessment.score + 0.45 * cci.cci).clamp(0.0, 1.0);
        plan.metadata.insert("projected_cost".into(), json!(cost));
        plan.metadata.insert("risk_level".into(), json!(risk));
        plan.metadata
            .insert("gate_rationale".into(), json!(gate_rationale));
        for key in ["purchase_id", "component_id"] {
            if let Some(value) = event.payload.get(key) {
                plan.metadata.insert(key.into(), value.clone());
            }
        }

        let explain = plan.explain_mut();
        explain.insert(
            "value_dimensions".into(),
            json!({
                "value_score": assessment.score,
                "cci": cci.cci,
                "budget_remaining": twin.budget_remaining,
            }),
        );
        explain.insert("risk_level".into(), json!(twin.risk_level));
        explain.insert(
            "budget_snapshot".into(),
            json!({
                "total": twin.budget_total,
                "remaining": twin.budget_remaining,
            }),
        );
        explain.insert(
            "event_snapshot".into(),
            json!({
                "event_type": event.event_type,
                "payload": Value::Object(event.payload.clone()),
            }),
        );
        explain.insert("twin_snapshot".into(), serde_json::to_value(&twin)?);
        explain.insert("gate_required".into(), json!(gate_required));
        explain.insert("gate_rationale".into(), json!(gate_rationale));

        // Agent roundtable contributions become transcript entries.
        let notes = agents::roundtable(event, &twin);
        let transcript_entries: Vec<Value> = notes
            .iter()
            .map(|note| {
                json!({
                    "kind": note.kind.as_str(),
                    "agent": note.agent,
                    "payload": note.payload,
                })
            })
            .collect();
        plan.explain_mut()
            .insert("agent_transcript".into(), Value::Array(transcript_entries));

        plan.explain_section_mut("de").extend([
            ("selected_by_bandit".to_string(), json!(false)),
            ("final_profile".to_string(), json!(action_type)),
        ]);
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Adaptation
// ---------------------------------------------------------------------------

/// Bounded feedback on cost projection and risk from recorded test results.
pub struct OsRoboticsAdaptationPlugin;

impl AdaptationPlugin for OsRoboticsAdaptationPlugin {
    fn name(&self) -> &'static str {
        "os.robotics.adaptation"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap, _result: &ExecutionResult) -> bool {
        is_os_robotics(event)
    }

    fn adapt(
        &self,
        state: &mut JsonMap,
        event: &PceEvent,
        _result: &ExecutionResult,
    ) -> PceResult<()> {
        let is_test_result = event.event_type == "test.result.recorded"
            || (event.event_type == "test.completed" && event.payload.contains_key("test_id"));
        if !is_test_result {
            return Ok(());
        }
        let mut twin = RobotTwin::from_state(state);
        let passed = event
            .payload
            .get("passed")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let confidence_shift = if passed { 0.05 } else { -0.08 };
        let cost_shift = if passed { -0.02 } else { 0.04 };

        let confidence = (twin.cost_projection.confidence + confidence_shift).clamp(0.1, 0.95);
        let cost = (twin.cost_projection.projected_total_cost * (1.0 + cost_shift)).max(0.0);
        twin.cost_projection.confidence = (confidence * 100.0).round() / 100.0;
        twin.cost_projection.projected_total_cost = (cost * 100.0).round() / 100.0;
        twin.risk_level = if passed { "LOW" } else { "MEDIUM" }.to_string();

        twin.write_into_state(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(event_type: &str, payload: Value) -> PceEvent {
        PceEvent {
            event_id: "e-1".into(),
            event_type: event_type.into(),
            source: "test".into(),
            ts: Utc::now(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    fn neutral_cci() -> CciReading {
        CciReading {
            cci: 0.6,
            components: None,
        }
    }

    fn state_with_twin(twin: &RobotTwin) -> JsonMap {
        let mut state = JsonMap::new();
        twin.write_into_state(&mut state);
        state
    }

    #[test]
    fn healthy_budget_scores_high_and_overdraft_is_a_violation() {
        let model = OsRoboticsValueModel;
        let mut twin = RobotTwin::default();
        twin.budget_total = 1000.0;
        twin.budget_remaining = 900.0;
        let state = state_with_twin(&twin);
        let healthy = model
            .evaluate(&event("budget.updated", json!({"domain": "os.robotics", "budget_total": 1000.0})), &state)
            .expect("eval");
        assert!(healthy.score > 0.8);
        assert!(healthy.violations.is_empty());

        twin.budget_remaining = -50.0;
        let state = state_with_twin(&twin);
        let overdraft = model
            .evaluate(&event("budget.updated", json!({"domain": "os.robotics", "budget_total": 1000.0})), &state)
            .expect("eval");
        assert!(overdraft
            .violations
            .contains(&"financial_responsibility".to_string()));
    }

    #[tokio::test]
    async fn purchase_request_is_always_gated() {
        let plugin = OsRoboticsDecisionPlugin;
        let mut twin = RobotTwin::default();
        twin.budget_total = 500.0;
        twin.budget_remaining = 500.0;
        let mut state = state_with_twin(&twin);

        let plan = plugin
            .deliberate(
                &event(
                    "purchase.requested",
                    json!({
                        "domain": "os.robotics", "projected_cost": 240.0,
                        "risk_level": "MEDIUM", "purchase_id": "p-1"
                    }),
                ),
                &mut state,
                &ValueAssessment::new(0.8),
                &neutral_cci(),
            )
            .await
            .expect("plan");

        assert_eq!(plan.action_type, "os.request_purchase_approval");
        assert!(plan.requires_approval);
        assert_eq!(plan.priority, 1);
        assert!((plan.projected_cost() - 240.0).abs() < 1e-9);
        assert_eq!(plan.risk_level(), "MEDIUM");
        assert_eq!(plan.metadata["explain"]["gate_required"], json!(true));
    }

    #[tokio::test]
    async fn benign_budget_update_is_not_gated() {
        let plugin = OsRoboticsDecisionPlugin;
        let mut state = state_with_twin(&RobotTwin::default());
        let plan = plugin
            .deliberate(
                &event(
                    "budget.updated",
                    json!({"domain": "os.robotics", "budget_total": 500.0}),
                ),
                &mut state,
                &ValueAssessment::new(0.7),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        assert!(!plan.requires_approval);
        assert_eq!(plan.metadata["gate_rationale"], json!("none"));
    }

    #[tokio::test]
    async fn adverse_budget_change_is_gated() {
        let plugin = OsRoboticsDecisionPlugin;
        let mut twin = RobotTwin::default();
        twin.budget_total = 500.0;
        twin.budget_remaining = 500.0;
        let mut state = state_with_twin(&twin);

        // Overdraft declared by the event itself.
        let plan = plugin
            .deliberate(
                &event(
                    "budget.updated",
                    json!({"domain": "os.robotics", "budget_total": 500.0, "budget_remaining": -50.0}),
                ),
                &mut state,
                &ValueAssessment::new(0.7),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        assert!(plan.requires_approval);
        assert_eq!(
            plan.metadata["gate_rationale"],
            json!("budget_remaining_below_projection")
        );

        // Projection above the remaining funds also gates.
        let mut tight = RobotTwin::default();
        tight.budget_total = 100.0;
        tight.budget_remaining = 100.0;
        tight.cost_projection.projected_total_cost = 400.0;
        let mut state = state_with_twin(&tight);
        let plan = plugin
            .deliberate(
                &event(
                    "part.candidate.added",
                    json!({"domain": "os.robotics", "component_id": "c-9", "name": "arm"}),
                ),
                &mut state,
                &ValueAssessment::new(0.7),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        assert!(plan.requires_approval);
    }

    #[tokio::test]
    async fn declared_risk_gates_non_purchase_events() {
        let plugin = OsRoboticsDecisionPlugin;

        let mut state = state_with_twin(&RobotTwin::default());
        let plan = plugin
            .deliberate(
                &event(
                    "risk.detected",
                    json!({"domain": "os.robotics", "description": "supplier fire"}),
                ),
                &mut state,
                &ValueAssessment::new(0.7),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        assert!(plan.requires_approval);
        assert_eq!(plan.metadata["gate_rationale"], json!("risk_level_elevated"));

        let mut state = state_with_twin(&RobotTwin::default());
        let plan = plugin
            .deliberate(
                &event(
                    "test.executed",
                    json!({
                        "domain": "os.robotics", "simulation_id": "sim-1",
                        "scenario": "load", "projected_risk_level": "MEDIUM"
                    }),
                ),
                &mut state,
                &ValueAssessment::new(0.7),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        assert!(plan.requires_approval);

        // LOW declarations execute synchronously.
        let mut state = state_with_twin(&RobotTwin::default());
        let plan = plugin
            .deliberate(
                &event(
                    "test.executed",
                    json!({
                        "domain": "os.robotics", "simulation_id": "sim-2",
                        "scenario": "load", "projected_risk_level": "LOW"
                    }),
                ),
                &mut state,
                &ValueAssessment::new(0.7),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        assert!(!plan.requires_approval);
    }

    #[tokio::test]
    async fn completed_purchase_is_never_gated_again() {
        let plugin = OsRoboticsDecisionPlugin;
        let mut state = state_with_twin(&RobotTwin::default());
        let plan = plugin
            .deliberate(
                &event(
                    "purchase.completed",
                    json!({"domain": "os.robotics", "total_cost": 240.0}),
                ),
                &mut state,
                &ValueAssessment::new(0.8),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        assert_eq!(plan.action_type, "os.record_purchase");
        assert!(!plan.requires_approval);
    }

    #[tokio::test]
    async fn roundtable_entries_ride_in_the_explain_bag() {
        let plugin = OsRoboticsDecisionPlugin;
        let mut state = state_with_twin(&RobotTwin::default());
        let plan = plugin
            .deliberate(
                &event(
                    "part.candidate.added",
                    json!({"domain": "os.robotics", "component_id": "c-1", "name": "servo"}),
                ),
                &mut state,
                &ValueAssessment::new(0.7),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        let entries = plan.metadata["explain"]["agent_transcript"]
            .as_array()
            .expect("entries");
        assert!(!entries.is_empty());
        assert!(entries
            .iter()
            .any(|e| e["kind"] == json!("actions_proposed")));
    }

    #[test]
    fn failed_test_raises_risk_and_projected_cost() {
        let plugin = OsRoboticsAdaptationPlugin;
        let mut twin = RobotTwin::default();
        twin.cost_projection.projected_total_cost = 100.0;
        twin.cost_projection.confidence = 0.5;
        let mut state = state_with_twin(&twin);

        plugin
            .adapt(
                &mut state,
                &event(
                    "test.result.recorded",
                    json!({
                        "domain": "os.robotics", "test_id": "t-1",
                        "component_id": "c-1", "passed": false
                    }),
                ),
                &ExecutionResult {
                    action_type: "os.update_project_plan".into(),
                    success: true,
                    observed_impact: 0.5,
                    notes: String::new(),
                    metadata: JsonMap::new(),
                },
            )
            .expect("adapt");

        let updated = RobotTwin::from_state(&state);
        assert_eq!(updated.risk_level, "MEDIUM");
        assert!((updated.cost_projection.projected_total_cost - 104.0).abs() < 1e-9);
        assert!((updated.cost_projection.confidence - 0.42).abs() < 1e-9);
    }
}
