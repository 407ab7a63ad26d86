//! Rover domain plugins: epsilon-greedy tabular Q policy.
//!
//! The whole policy lives in the `robotics` state slice (Q-table, hyper
//! parameters, per-episode scratch), so it survives restarts with the
//! snapshot and resets atomically with it.

pub mod rl;

use async_trait::async_trait;
use rand::thread_rng;
use serde_json::{json, Value};

use crate::error::PceResult;
use crate::isi::slice_mut;
use crate::plugins::{AdaptationPlugin, DecisionPlugin, ValueModelPlugin};
use crate::types::{ActionPlan, CciReading, ExecutionResult, JsonMap, PceEvent};
use crate::vel::ValueAssessment;

fn robotics_slice<'a>(state: &'a JsonMap) -> Option<&'a JsonMap> {
    state.get("robotics").and_then(Value::as_object)
}

fn params_of(robotics: Option<&JsonMap>) -> JsonMap {
    robotics
        .and_then(|r| r.get("params"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(rl::default_hyperparams)
}

fn param(params: &JsonMap, key: &str, fallback: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(fallback)
}

fn q_values_of(robotics: Option<&JsonMap>, state_key: &str) -> JsonMap {
    robotics
        .and_then(|r| r.get("q_table"))
        .and_then(Value::as_object)
        .and_then(|table| table.get(state_key))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Value model
// ---------------------------------------------------------------------------

/// Sensor-driven scoring: a blocked front cell is unsafe, closing distance
/// to the goal is progress, step penalties measure efficiency.
pub struct RoverValueModel;

impl ValueModelPlugin for RoverValueModel {
    fn name(&self) -> &'static str {
        "robotics.value"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap) -> bool {
        event.domain() == "robotics"
    }

    fn evaluate(&self, event: &PceEvent, _state: &JsonMap) -> PceResult<ValueAssessment> {
        let sensors = event
            .payload
            .get("sensors")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let front = sensors.get("front").and_then(Value::as_i64).unwrap_or(0);
        let distance = event
            .payload_f64("distance")
            .or_else(|| {
                event
                    .payload
                    .get("delta")
                    .and_then(Value::as_object)
                    .and_then(|d| d.get("manhattan"))
                    .and_then(Value::as_f64)
            })
            .unwrap_or(0.0);
        let step_reward = event.payload_f64("reward").unwrap_or(-0.01);

        let safety = if front == 0 { 0.0 } else { 1.0 };
        let progress = (1.0 - distance / 20.0).clamp(0.0, 1.0);
        let efficiency = (1.0 + step_reward.min(0.0)).clamp(0.0, 1.0);

        let mut assessment = ValueAssessment::new(0.5 * safety + 0.35 * progress + 0.15 * efficiency);
        if safety == 0.0 {
            assessment.violations.push("safety".to_string());
        }
        let mut components = JsonMap::new();
        components.insert("safety".into(), json!(safety));
        components.insert("progress".into(), json!(progress));
        components.insert("efficiency".into(), json!(efficiency));
        assessment.components = Some(components);
        Ok(assessment)
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

pub struct RoverDecisionPlugin;

#[async_trait]
impl DecisionPlugin for RoverDecisionPlugin {
    fn name(&self) -> &'static str {
        "robotics.decision"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap) -> bool {
        event.domain() == "robotics"
            && (event.event_type.starts_with("observation.robotics")
                || event.event_type == "robot_telemetry")
    }

    async fn deliberate(
        &self,
        event: &PceEvent,
        state: &mut JsonMap,
        _assessment: &ValueAssessment,
        _cci: &CciReading,
    ) -> PceResult<ActionPlan> {
        let episode_id = event
            .payload_str("episode_id")
            .unwrap_or("global")
            .to_string();
        let state_key = rl::build_state_key(&event.payload);

        let robotics = robotics_slice(state);
        let params = params_of(robotics);
        let epsilon = param(&params, "epsilon", rl::DEFAULT_EPSILON);
        let q_values = q_values_of(robotics, &state_key);

        let (chosen, mode) = rl::choose_action(&q_values, epsilon, &mut thread_rng());
        let best = rl::best_action(&q_values);

        // Stash the transition half; the next feedback event completes it.
        let tick = event.payload.get("tick").and_then(Value::as_i64).unwrap_or(0);
        let robotics_mut = slice_mut(state, "robotics");
        let episodes = ensure_object(robotics_mut, "episodes");
        let episode = ensure_object(episodes, &episode_id);
        episode.insert(
            "pending_transition".into(),
            json!({
                "episode_id": episode_id,
                "state_key": state_key,
                "action": chosen,
                "tick": tick,
            }),
        );

        let mut plan = ActionPlan::new(
            "robotics.action",
            2,
            format!(
                "rover epsilon-greedy: episode={episode_id}, mode={mode}, chosen={chosen}, \
                 best={best}, epsilon={epsilon:.4}"
            ),
        );
        plan.domain = "robotics".into();
        plan.expected_impact = rl::q_of(&q_values, chosen).clamp(0.0, 1.0);
        plan.metadata
            .insert("action_payload".into(), rl::action_to_robot_command(chosen));
        plan.explain_section_mut("de").extend([
            ("selected_by_bandit".to_string(), json!(true)),
            ("final_profile".to_string(), json!(chosen)),
            ("policy_mode".to_string(), json!(mode)),
            ("state_key".to_string(), json!(state_key)),
            ("epsilon".to_string(), json!(epsilon)),
            ("q".to_string(), Value::Object(q_values)),
            ("best_action".to_string(), json!(best)),
        ]);
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Adaptation
// ---------------------------------------------------------------------------

pub struct RoverAdaptationPlugin;

impl AdaptationPlugin for RoverAdaptationPlugin {
    fn name(&self) -> &'static str {
        "robotics.adaptation"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap, _result: &ExecutionResult) -> bool {
        event.domain() == "robotics" && event.event_type.starts_with("feedback.robotics")
    }

    fn adapt(
        &self,
        state: &mut JsonMap,
        event: &PceEvent,
        _result: &ExecutionResult,
    ) -> PceResult<()> {
        let episode_id = event
            .payload_str("episode_id")
            .unwrap_or("global")
            .to_string();
        let reward = event.payload_f64("reward").unwrap_or(0.0);
        let done = event
            .payload
            .get("done")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let snapshot = robotics_slice(state).cloned().unwrap_or_default();
        let params = params_of(Some(&snapshot));
        let alpha = param(&params, "alpha", rl::DEFAULT_ALPHA);
        let gamma = param(&params, "gamma", rl::DEFAULT_GAMMA);
        let epsilon = param(&params, "epsilon", rl::DEFAULT_EPSILON);
        let decay = param(&params, "epsilon_decay", rl::DEFAULT_EPSILON_DECAY);
        let epsilon_min = param(&params, "epsilon_min", rl::DEFAULT_EPSILON_MIN);

        let transition = snapshot
            .get("episodes")
            .and_then(Value::as_object)
            .and_then(|eps| eps.get(&episode_id))
            .and_then(Value::as_object)
            .and_then(|ep| ep.get("pending_transition"))
            .and_then(Value::as_object)
            .cloned();

        let mut update_echo = JsonMap::new();
        if let Some(transition) = transition {
            let state_key = transition
                .get("state_key")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let action = transition
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or("S")
                .to_string();
            if !state_key.is_empty() {
                let next_state_key = snapshot
                    .get("episodes")
                    .and_then(Value::as_object)
                    .and_then(|eps| eps.get(&episode_id))
                    .and_then(Value::as_object)
                    .and_then(|ep| ep.get("last_state_key"))
                    .and_then(Value::as_str)
                    .unwrap_or(&state_key)
                    .to_string();

                let current_q = rl::q_of(&q_values_of(Some(&snapshot), &state_key), &action);
                let max_next = if done {
                    0.0
                } else {
                    rl::max_q(&q_values_of(Some(&snapshot), &next_state_key))
                };
                let updated = rl::q_learning_update(current_q, reward, max_next, alpha, gamma);

                let robotics_mut = slice_mut(state, "robotics");
                let table = ensure_object(robotics_mut, "q_table");
                let row = ensure_object(table, &state_key);
                row.insert(action.clone(), json!(updated));

                update_echo.insert("state_key".into(), json!(state_key));
                update_echo.insert("action".into(), json!(action));
                update_echo.insert("q".into(), json!(updated));
                update_echo.insert("reward".into(), json!(reward));
            }
        }

        let next_epsilon = (epsilon * decay).max(epsilon_min);
        let robotics_mut = slice_mut(state, "robotics");
        let params_mut = ensure_object(robotics_mut, "params");
        for (key, value) in rl::default_hyperparams() {
            params_mut.entry(key).or_insert(value);
        }
        params_mut.insert("epsilon".into(), json!(next_epsilon));

        if done {
            // Episode reset: the transition scratch is consumed.
            if let Some(episode) = robotics_mut
                .get_mut("episodes")
                .and_then(Value::as_object_mut)
                .and_then(|eps| eps.get_mut(&episode_id))
                .and_then(Value::as_object_mut)
            {
                episode.remove("pending_transition");
            }
        }

        update_echo.insert("epsilon".into(), json!(next_epsilon));
        update_echo.insert("done".into(), json!(done));
        state.insert("robotics_rl".into(), Value::Object(update_echo));
        Ok(())
    }
}

fn ensure_object<'a>(map: &'a mut JsonMap, key: &str) -> &'a mut JsonMap {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(JsonMap::new()));
    if !entry.is_object() {
        *entry = Value::Object(JsonMap::new());
    }
    match entry {
        Value::Object(inner) => inner,
        _ => unreachable!("entry was just normalized to an object"),
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
            source: "rover".into(),
            ts: Utc::now(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    fn neutral_cci() -> CciReading {
        CciReading {
            cci: 0.5,
            components: None,
        }
    }

    #[test]
    fn value_model_flags_blocked_front_as_safety_violation() {
        let model = RoverValueModel;
        let blocked = event(
            "observation.robotics.v1",
            json!({"domain": "robotics", "sensors": {"front": 0}, "distance": 2.0}),
        );
        let assessment = model.evaluate(&blocked, &JsonMap::new()).expect("eval");
        assert!(assessment.violations.contains(&"safety".to_string()));
        assert!(assessment.score < 0.5);

        let clear = event(
            "observation.robotics.v1",
            json!({"domain": "robotics", "sensors": {"front": 4}, "distance": 2.0}),
        );
        let assessment = model.evaluate(&clear, &JsonMap::new()).expect("eval");
        assert!(assessment.violations.is_empty());
        assert!(assessment.score > 0.7);
    }

    #[tokio::test]
    async fn decision_records_pending_transition() {
        let plugin = RoverDecisionPlugin;
        let mut state = JsonMap::new();
        let observation = event(
            "observation.robotics.v1",
            json!({
                "domain": "robotics", "episode_id": "ep-1", "tick": 3,
                "robot": {"dir": 0}, "sensors": {"front": 2}, "delta": {"dx": 1, "dy": 0}
            }),
        );
        let plan = plugin
            .deliberate(
                &observation,
                &mut state,
                &ValueAssessment::new(0.8),
                &neutral_cci(),
            )
            .await
            .expect("plan");

        assert_eq!(plan.action_type, "robotics.action");
        assert!(!plan.requires_approval);
        let transition = state["robotics"]["episodes"]["ep-1"]["pending_transition"]
            .as_object()
            .expect("transition");
        assert_eq!(transition["state_key"], json!("d0_dx1_dy0_f2_l0_r0"));
        let chosen = transition["action"].as_str().unwrap_or_default();
        assert!(rl::ROBOT_ACTIONS.contains(&chosen));
    }

    #[test]
    fn feedback_applies_q_update_and_decays_epsilon() {
        let plugin = RoverAdaptationPlugin;
        let mut state = JsonMap::new();
        let robotics = slice_mut(&mut state, "robotics");
        robotics.insert("params".into(), Value::Object(rl::default_hyperparams()));
        robotics.insert(
            "episodes".into(),
            json!({
                "ep-1": {
                    "pending_transition": {"state_key": "s0", "action": "FWD", "tick": 1},
                    "last_state_key": "s1"
                }
            }),
        );
        robotics.insert("q_table".into(), json!({"s1": {"FWD": 0.5}}));

        let feedback = event(
            "feedback.robotics.v1",
            json!({"domain": "robotics", "episode_id": "ep-1", "reward": 1.0}),
        );
        plugin
            .adapt(
                &mut state,
                &feedback,
                &ExecutionResult {
                    action_type: "feedback.robotics.v1".into(),
                    success: true,
                    observed_impact: 1.0,
                    notes: String::new(),
                    metadata: JsonMap::new(),
                },
            )
            .expect("adapt");

        let q = state["robotics"]["q_table"]["s0"]["FWD"].as_f64().expect("q");
        // 0 + 0.2 * (1 + 0.95 * 0.5 - 0)
        assert!((q - 0.295).abs() < 1e-9);

        let epsilon = state["robotics"]["params"]["epsilon"].as_f64().expect("eps");
        assert!((epsilon - rl::DEFAULT_EPSILON * rl::DEFAULT_EPSILON_DECAY).abs() < 1e-9);

        let echo = state["robotics_rl"].as_object().expect("echo");
        assert_eq!(echo["action"], json!("FWD"));
    }

    #[test]
    fn epsilon_never_decays_below_minimum() {
        let plugin = RoverAdaptationPlugin;
        let mut state = JsonMap::new();
        let robotics = slice_mut(&mut state, "robotics");
        let mut params = rl::default_hyperparams();
        params.insert("epsilon".into(), json!(rl::DEFAULT_EPSILON_MIN));
        robotics.insert("params".into(), Value::Object(params));

        let feedback = event(
            "feedback.robotics.v1",
            json!({"domain": "robotics", "reward": -0.1}),
        );
        plugin
            .adapt(
                &mut state,
                &feedback,
                &ExecutionResult {
                    action_type: "feedback.robotics.v1".into(),
                    success: true,
                    observed_impact: -0.1,
                    notes: String::new(),
                    metadata: JsonMap::new(),
                },
            )
            .expect("adapt");

        let epsilon = state["robotics"]["params"]["epsilon"].as_f64().expect("eps");
        assert!((epsilon - rl::DEFAULT_EPSILON_MIN).abs() < 1e-12);
    }
}
