//! Internal State Integrator: deterministic event-into-snapshot merge.
//!
//! The integrator never writes anywhere; it returns a candidate snapshot
//! that the pipeline persists after the remaining stages ran. Merges are
//! total functions: malformed slices are replaced rather than surfaced as
//! errors, and the downstream value pass flags the clamp as a violation.

use serde_json::{json, Map, Value};

use crate::plugins::rover::rl::build_state_key;
use crate::types::{JsonMap, PceEvent};

/// Bound for the `event_history` ring kept inside the snapshot. The SQLite
/// event log is the durable full history.
const EVENT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Default)]
pub struct StateIntegrator;

impl StateIntegrator {
    pub fn new() -> Self {
        Self
    }

    /// Merge one normalized event into a copy of the current snapshot.
    pub fn integrate(&self, state: &JsonMap, event: &PceEvent) -> JsonMap {
        let mut next = state.clone();
        let domain = event.domain().to_string();

        let mut slice = next
            .get(&domain)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (key, value) in &event.payload {
            slice.insert(key.clone(), value.clone());
        }
        slice.insert("last_event_id".into(), json!(event.event_id));
        slice.insert("last_event_type".into(), json!(event.event_type));
        next.insert(domain.clone(), Value::Object(slice));

        if domain == "robotics" {
            self.integrate_robotics(&mut next, event);
        }

        push_event_history(&mut next, event);
        next
    }

    /// Robotics episodes keep the rolling observation pair and the pending
    /// transition the Q-update consumes on the next feedback event.
    fn integrate_robotics(&self, next: &mut JsonMap, event: &PceEvent) {
        let mut robotics = next
            .get("robotics")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut episodes = robotics
            .get("episodes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let episode_id = event
            .payload_str("episode_id")
            .unwrap_or("global")
            .to_string();
        let tick = event
            .payload
            .get("tick")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let mut episode = episodes
            .get(&episode_id)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if event.event_type.starts_with("observation.robotics")
            || event.event_type == "robot_telemetry"
        {
            let observation = Value::Object(event.payload.clone());
            let state_key = build_state_key(&event.payload);
            let previous = episode
                .get("last_observation")
                .cloned()
                .unwrap_or(Value::Null);
            episode.insert("prev_observation".into(), previous);
            episode.insert("last_observation".into(), observation);
            episode.insert("last_state_key".into(), json!(state_key));
            episode.insert("last_tick".into(), json!(tick));
        } else if event.event_type.starts_with("feedback.robotics") {
            let reward = event.payload_f64("reward").unwrap_or(0.0);
            let done = event
                .payload
                .get("done")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let mut stats = episode
                .get("episode_stats")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let total = stats
                .get("total_reward")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let steps = stats.get("steps").and_then(Value::as_i64).unwrap_or(0);
            let collisions = event
                .payload
                .get("collisions")
                .and_then(Value::as_i64)
                .or_else(|| stats.get("collisions").and_then(Value::as_i64))
                .unwrap_or(0);
            stats.insert("total_reward".into(), json!(total + reward));
            stats.insert("steps".into(), json!(steps + 1));
            stats.insert("collisions".into(), json!(collisions));
            if done && event.payload_str("reason") == Some("goal") {
                let successes = stats.get("successes").and_then(Value::as_i64).unwrap_or(0);
                stats.insert("successes".into(), json!(successes + 1));
            }
            episode.insert("episode_stats".into(), Value::Object(stats));

            let mut transition = episode
                .get("pending_transition")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            transition.insert("reward".into(), json!(reward));
            transition.insert("done".into(), json!(done));
            transition.insert("feedback_tick".into(), json!(tick));
            episode.insert("pending_transition".into(), Value::Object(transition));
        }

        episodes.insert(episode_id, Value::Object(episode));
        robotics.insert("episodes".into(), Value::Object(episodes));
        next.insert("robotics".into(), Value::Object(robotics));
    }
}

fn push_event_history(next: &mut JsonMap, event: &PceEvent) {
    let mut history = next
        .get("event_history")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    history.push(json!({
        "event_id": event.event_id,
        "event_type": event.event_type,
        "source": event.source,
        "ts": event.ts,
        "domain": event.domain(),
    }));
    if history.len() > EVENT_HISTORY_LIMIT {
        let excess = history.len() - EVENT_HISTORY_LIMIT;
        history.drain(0..excess);
    }
    next.insert("event_history".into(), Value::Array(history));
}

/// Read a nested object slice, tolerating absent or malformed parents.
pub fn slice<'a>(state: &'a JsonMap, key: &str) -> Option<&'a Map<String, Value>> {
    state.get(key).and_then(Value::as_object)
}

/// Mutable access to a top-level slice, creating (or replacing a malformed)
/// entry with an empty object.
pub fn slice_mut<'a>(state: &'a mut JsonMap, key: &str) -> &'a mut Map<String, Value> {
    let entry = state
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("slice entry was just normalized to an object"),
    }
}
