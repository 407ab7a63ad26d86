//! Tabular Q-learning helpers for the rover domain.

use rand::Rng;
use serde_json::Value;

use crate::types::JsonMap;

pub const ROBOT_ACTIONS: [&str; 4] = ["FWD", "L", "R", "S"];

pub const DEFAULT_ALPHA: f64 = 0.2;
pub const DEFAULT_GAMMA: f64 = 0.95;
pub const DEFAULT_EPSILON: f64 = 1.0;
pub const DEFAULT_EPSILON_DECAY: f64 = 0.9995;
pub const DEFAULT_EPSILON_MIN: f64 = 0.05;

/// Default hyperparameters as stored in the `robotics.params` slice.
pub fn default_hyperparams() -> JsonMap {
    let mut params = JsonMap::new();
    params.insert("alpha".into(), DEFAULT_ALPHA.into());
    params.insert("gamma".into(), DEFAULT_GAMMA.into());
    params.insert("epsilon".into(), DEFAULT_EPSILON.into());
    params.insert("epsilon_decay".into(), DEFAULT_EPSILON_DECAY.into());
    params.insert("epsilon_min".into(), DEFAULT_EPSILON_MIN.into());
    params
}

fn bucket_sensor(raw: i64) -> i64 {
    let value = raw.max(0);
    match value {
        0 => 0,
        1 => 1,
        2..=3 => 2,
        _ => 3,
    }
}

fn sign(raw: i64) -> i64 {
    match raw {
        v if v > 0 => 1,
        v if v < 0 => -1,
        _ => 0,
    }
}

fn nested_i64(payload: &JsonMap, outer: &str, inner: &str) -> i64 {
    payload
        .get(outer)
        .and_then(Value::as_object)
        .and_then(|m| m.get(inner))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Stable discretized state key from a rover observation payload.
pub fn build_state_key(payload: &JsonMap) -> String {
    let direction = nested_i64(payload, "robot", "dir").rem_euclid(4);
    let dx = sign(nested_i64(payload, "delta", "dx"));
    let dy = sign(nested_i64(payload, "delta", "dy"));
    let front = bucket_sensor(nested_i64(payload, "sensors", "front"));
    let left = bucket_sensor(nested_i64(payload, "sensors", "left"));
    let right = bucket_sensor(nested_i64(payload, "sensors", "right"));
    format!("d{direction}_dx{dx}_dy{dy}_f{front}_l{left}_r{right}")
}

/// Epsilon-greedy selection over the action set. Returns the chosen action
/// and the policy mode (`explore`/`exploit`).
pub fn choose_action<R: Rng>(
    q_values: &JsonMap,
    epsilon: f64,
    rng: &mut R,
) -> (&'static str, &'static str) {
    if rng.gen::<f64>() < epsilon {
        let index = rng.gen_range(0..ROBOT_ACTIONS.len());
        return (ROBOT_ACTIONS[index], "explore");
    }
    (best_action(q_values), "exploit")
}

/// Greedy argmax with the fixed action ordering as tie-break.
pub fn best_action(q_values: &JsonMap) -> &'static str {
    let mut best = ROBOT_ACTIONS[0];
    let mut best_q = q_of(q_values, best);
    for action in &ROBOT_ACTIONS[1..] {
        let q = q_of(q_values, action);
        if q > best_q {
            best = action;
            best_q = q;
        }
    }
    best
}

pub fn q_of(q_values: &JsonMap, action: &str) -> f64 {
    q_values.get(action).and_then(Value::as_f64).unwrap_or(0.0)
}

pub fn max_q(q_values: &JsonMap) -> f64 {
    ROBOT_ACTIONS
        .iter()
        .map(|action| q_of(q_values, action))
        .fold(f64::MIN, f64::max)
        .max(0.0)
}

/// Convert the compact RL action into the robot command payload emitted to
/// the simulator adapter.
pub fn action_to_robot_command(action: &str) -> Value {
    match action {
        "FWD" => serde_json::json!({"type": "robot.move_forward", "amount": 1}),
        "L" => serde_json::json!({"type": "robot.turn_left"}),
        "R" => serde_json::json!({"type": "robot.turn_right"}),
        _ => serde_json::json!({"type": "robot.stop"}),
    }
}

/// Tabular Q-learning update rule:
/// `Q(s,a) <- Q(s,a) + alpha * (r + gamma * max_a' Q(s',a') - Q(s,a))`.
pub fn q_learning_update(current_q: f64, reward: f64, max_next_q: f64, alpha: f64, gamma: f64) -> f64 {
    let target = reward + gamma * max_next_q;
    current_q + alpha * (target - current_q)
}
