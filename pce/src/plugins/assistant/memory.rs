//! Bounded per-session memory in the `assistant` state slice.
//!
//! Layout:
//! ```text
//! assistant:
//!   sessions: { <session_id>: { last_messages, summary, preferences, avoid } }
//!   pending:  { <session_id>: { profile_id, epsilon, value_score, cci, ts } }
//!   policy:   PolicyState
//!   reward_window: [f64; <=50]
//!   metrics:  { count_feedbacks, avg_reward, success_rate }
//! ```
//! Every list is bounded so a chatty session cannot grow the snapshot
//! without limit: 10 messages, 32 preference and 32 avoid entries per
//! session (FIFO eviction), a 600-char rolling summary.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::AssistantConfig;
use crate::isi::slice_mut;
use crate::plugins::assistant::policy::PolicyState;
use crate::types::JsonMap;

pub const MAX_MESSAGES: usize = 10;
pub const MAX_MEMORY_NOTES: usize = 32;
pub const MAX_SUMMARY_CHARS: usize = 600;
pub const MAX_NOTE_CHARS: usize = 120;
pub const MAX_MESSAGE_CHARS: usize = 800;
pub const REWARD_WINDOW: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionMemory {
    #[serde(default)]
    pub last_messages: Vec<SessionMessage>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub preferences: Vec<String>,
    #[serde(default)]
    pub avoid: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMessage {
    pub role: String,
    pub text: String,
    pub ts: String,
}

fn assistant_slice<'a>(state: &'a JsonMap) -> Option<&'a JsonMap> {
    state.get("assistant").and_then(Value::as_object)
}

fn assistant_mut<'a>(state: &'a mut JsonMap) -> &'a mut JsonMap {
    slice_mut(state, "assistant")
}

fn section_mut<'a>(state: &'a mut JsonMap, key: &str) -> &'a mut JsonMap {
    let assistant = assistant_mut(state);
    let entry = assistant
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(JsonMap::new()));
    if !entry.is_object() {
        *entry = Value::Object(JsonMap::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("section was just normalized to an object"),
    }
}

pub fn session_memory(state: &JsonMap, session_id: &str) -> SessionMemory {
    let mut memory = assistant_slice(state)
        .and_then(|a| a.get("sessions"))
        .and_then(Value::as_object)
        .and_then(|sessions| sessions.get(session_id))
        .and_then(|raw| serde_json::from_value::<SessionMemory>(raw.clone()).ok())
        .unwrap_or_default();
    truncate_memory(&mut memory);
    memory
}

pub fn save_session_memory(state: &mut JsonMap, session_id: &str, mut memory: SessionMemory) {
    truncate_memory(&mut memory);
    let sessions = section_mut(state, "sessions");
    sessions.insert(
        session_id.to_string(),
        serde_json::to_value(&memory).unwrap_or_else(|_| Value::Object(JsonMap::new())),
    );
}

fn truncate_memory(memory: &mut SessionMemory) {
    if memory.last_messages.len() > MAX_MESSAGES {
        let excess = memory.last_messages.len() - MAX_MESSAGES;
        memory.last_messages.drain(0..excess);
    }
    memory.summary = clip(&memory.summary, MAX_SUMMARY_CHARS);
    sanitize_notes(&mut memory.preferences);
    sanitize_notes(&mut memory.avoid);
}

fn sanitize_notes(notes: &mut Vec<String>) {
    let mut seen: Vec<String> = Vec::new();
    for note in notes.iter() {
        let clean = clip(note.trim(), MAX_NOTE_CHARS);
        if !clean.is_empty() && !seen.contains(&clean) {
            seen.push(clean);
        }
    }
    if seen.len() > MAX_MEMORY_NOTES {
        let excess = seen.len() - MAX_MEMORY_NOTES;
        seen.drain(0..excess);
    }
    *notes = seen;
}

fn clip(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Append one message and refresh the rolling summary snapshot.
pub fn append_session_message(state: &mut JsonMap, session_id: &str, role: &str, text: &str) {
    let mut memory = session_memory(state, session_id);
    memory.last_messages.push(SessionMessage {
        role: role.to_string(),
        text: clip(text, MAX_MESSAGE_CHARS),
        ts: chrono::Utc::now().to_rfc3339(),
    });
    if memory.last_messages.len() > MAX_MESSAGES {
        let excess = memory.last_messages.len() - MAX_MESSAGES;
        memory.last_messages.drain(0..excess);
    }
    let summary = memory
        .last_messages
        .iter()
        .map(|m| clip(&m.text, 80))
        .collect::<Vec<_>>()
        .join(" | ");
    memory.summary = tail(&summary, MAX_SUMMARY_CHARS);
    save_session_memory(state, session_id, memory);
}

fn tail(text: &str, limit: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        return text.to_string();
    }
    chars[chars.len() - limit..].iter().collect()
}

/// Record a preference note (positive feedback). FIFO-evicts past the cap.
pub fn add_preference(state: &mut JsonMap, session_id: &str, note: &str) {
    let mut memory = session_memory(state, session_id);
    push_note(&mut memory.preferences, note);
    save_session_memory(state, session_id, memory);
}

/// Record an avoid note (negative feedback). FIFO-evicts past the cap.
pub fn add_avoid(state: &mut JsonMap, session_id: &str, note: &str) {
    let mut memory = session_memory(state, session_id);
    push_note(&mut memory.avoid, note);
    save_session_memory(state, session_id, memory);
}

fn push_note(notes: &mut Vec<String>, note: &str) {
    let clean = clip(note.trim(), MAX_NOTE_CHARS);
    if clean.is_empty() || notes.contains(&clean) {
        return;
    }
    notes.push(clean);
    if notes.len() > MAX_MEMORY_NOTES {
        let excess = notes.len() - MAX_MEMORY_NOTES;
        notes.drain(0..excess);
    }
}

// ---------------------------------------------------------------------------
// Bandit policy + rolling metrics
// ---------------------------------------------------------------------------

pub fn policy_state(state: &JsonMap, config: &AssistantConfig) -> PolicyState {
    assistant_slice(state)
        .and_then(|a| a.get("policy"))
        .and_then(|raw| serde_json::from_value::<PolicyState>(raw.clone()).ok())
        .unwrap_or_else(|| PolicyState::baseline(config))
}

pub fn save_policy_state(state: &mut JsonMap, policy: &PolicyState) {
    let assistant = assistant_mut(state);
    assistant.insert(
        "policy".into(),
        serde_json::to_value(policy).unwrap_or_else(|_| Value::Object(JsonMap::new())),
    );
}

/// Stash the per-session decision metadata the adaptation pass consumes.
pub fn set_pending_feedback(state: &mut JsonMap, session_id: &str, pending: Value) {
    let section = section_mut(state, "pending");
    section.insert(session_id.to_string(), pending);
}

pub fn take_pending_feedback(state: &mut JsonMap, session_id: &str) -> Option<JsonMap> {
    let section = section_mut(state, "pending");
    section
        .remove(session_id)
        .and_then(|v| v.as_object().cloned())
}

pub fn reward_window(state: &JsonMap) -> Vec<f64> {
    assistant_slice(state)
        .and_then(|a| a.get("reward_window"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

pub fn push_reward(state: &mut JsonMap, reward: f64) -> Vec<f64> {
    let mut window = reward_window(state);
    window.push(reward);
    if window.len() > REWARD_WINDOW {
        let excess = window.len() - REWARD_WINDOW;
        window.drain(0..excess);
    }
    let assistant = assistant_mut(state);
    assistant.insert("reward_window".into(), json!(window));
    window
}

pub fn save_metrics(state: &mut JsonMap, window: &[f64]) -> JsonMap {
    let count = window.len() as f64;
    let avg = if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / count
    };
    let successes = window.iter().filter(|r| **r > 0.0).count() as f64;
    let success_rate = if window.is_empty() { 0.0 } else { successes / count };

    let mut metrics = JsonMap::new();
    metrics.insert("count_feedbacks".into(), json!(count));
    metrics.insert("avg_reward".into(), json!(avg));
    metrics.insert("success_rate".into(), json!(success_rate));

    let assistant = assistant_mut(state);
    assistant.insert("metrics".into(), Value::Object(metrics.clone()));
    metrics
}

/// Wipe the whole assistant slice (control endpoint).
pub fn clear(state: &mut JsonMap, config: &AssistantConfig) {
    state.remove("assistant");
    state.remove("assistant_learning");
    save_policy_state(state, &PolicyState::baseline(config));
}
