//! Canonical domain types shared across pipeline stages.
//!
//! Everything here is serde-serializable: events and actions are persisted
//! as JSON rows, transcript items travel over SSE/WebSocket verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON object alias used for state snapshots and metadata bags.
pub type JsonMap = serde_json::Map<String, Value>;

/// Normalized event envelope. `event_id` and `ts` are stamped exactly once
/// by the validator and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PceEvent {
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    pub ts: DateTime<Utc>,
    pub payload: JsonMap,
}

impl PceEvent {
    /// Dispatch key. Payloads without a domain fall back to `core`.
    pub fn domain(&self) -> &str {
        self.payload
            .get("domain")
            .and_then(Value::as_str)
            .unwrap_or("core")
    }

    pub fn session_id(&self) -> Option<&str> {
        self.payload
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Correlation id groups related events for audit; defaults to the
    /// event's own id when the producer did not supply one.
    pub fn correlation_id(&self) -> String {
        self.payload
            .get("correlation_id")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.event_id.clone())
    }

    pub fn tags(&self) -> Vec<String> {
        self.payload
            .get("tags")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Decision Engine output consumed by the orchestrator and approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlan {
    pub action_type: String,
    pub priority: i64,
    pub rationale: String,
    pub expected_impact: f64,
    pub requires_approval: bool,
    pub domain: String,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl ActionPlan {
    pub fn new(action_type: impl Into<String>, priority: i64, rationale: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            priority,
            rationale: rationale.into(),
            expected_impact: 0.5,
            requires_approval: false,
            domain: "core".to_string(),
            metadata: JsonMap::new(),
        }
    }

    /// Mutable access to the `metadata.explain` bag, creating it on demand.
    pub fn explain_mut(&mut self) -> &mut JsonMap {
        let entry = self
            .metadata
            .entry("explain".to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !entry.is_object() {
            *entry = Value::Object(JsonMap::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("explain entry was just normalized to an object"),
        }
    }

    /// Mutable access to one stage section inside the explain bag
    /// (e.g. `explain.de`).
    pub fn explain_section_mut(&mut self, stage: &str) -> &mut JsonMap {
        let explain = self.explain_mut();
        let entry = explain
            .entry(stage.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !entry.is_object() {
            *entry = Value::Object(JsonMap::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("stage entry was just normalized to an object"),
        }
    }

    pub fn projected_cost(&self) -> f64 {
        self.metadata
            .get("projected_cost")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    pub fn risk_level(&self) -> String {
        self.metadata
            .get("risk_level")
            .and_then(Value::as_str)
            .unwrap_or("LOW")
            .to_string()
    }
}

/// Action execution outcome fed into the adaptation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action_type: String,
    pub success: bool,
    pub observed_impact: f64,
    pub notes: String,
    #[serde(default)]
    pub metadata: JsonMap,
}

/// Plan plus observed outcome, persisted append-only in the action log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedAction {
    pub action_id: String,
    pub decision_id: String,
    pub action_type: String,
    pub domain: String,
    pub priority: i64,
    pub value_score: f64,
    pub expected_impact: f64,
    pub observed_impact: f64,
    pub success: bool,
    pub violations: Vec<String>,
    pub rationale: String,
    #[serde(default)]
    pub metadata: JsonMap,
    pub completed_at: DateTime<Utc>,
}

/// Normalized CCI components, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CciComponents {
    pub consistency: f64,
    pub stability: f64,
    pub contradiction_rate: f64,
    pub predictive_accuracy: f64,
}

/// One coherence reading. `components: None` encodes the cold-start case
/// (fewer than three qualifying actions) and serializes as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CciReading {
    pub cci: f64,
    pub components: Option<CciComponents>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CciSnapshot {
    pub ts: DateTime<Utc>,
    pub cci: f64,
    pub components: Option<CciComponents>,
}

/// Transcript record kinds. One append per pipeline stage completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    EventIngested,
    AgentMessage,
    ActionsProposed,
    ApprovalCreated,
    ApprovalUpdated,
    StateUpdated,
}

impl TranscriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptKind::EventIngested => "event_ingested",
            TranscriptKind::AgentMessage => "agent_message",
            TranscriptKind::ActionsProposed => "actions_proposed",
            TranscriptKind::ApprovalCreated => "approval_created",
            TranscriptKind::ApprovalUpdated => "approval_updated",
            TranscriptKind::StateUpdated => "state_updated",
        }
    }

    /// SSE event name for the stream surface.
    pub fn stream_event(&self) -> &'static str {
        match self {
            TranscriptKind::EventIngested => "os.event_ingested",
            TranscriptKind::AgentMessage => "os.agent_message",
            TranscriptKind::ActionsProposed => "os.actions_proposed",
            TranscriptKind::ApprovalCreated => "os.approval_created",
            TranscriptKind::ApprovalUpdated => "os.approval_updated",
            TranscriptKind::StateUpdated => "os.state_updated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "event_ingested" => Some(TranscriptKind::EventIngested),
            "agent_message" => Some(TranscriptKind::AgentMessage),
            "actions_proposed" => Some(TranscriptKind::ActionsProposed),
            "approval_created" => Some(TranscriptKind::ApprovalCreated),
            "approval_updated" => Some(TranscriptKind::ApprovalUpdated),
            "state_updated" => Some(TranscriptKind::StateUpdated),
            _ => None,
        }
    }
}

/// One transcript row. Cursors are assigned by the store and are strictly
/// monotonic and gap-free per store instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptItem {
    pub cursor: i64,
    pub ts: DateTime<Utc>,
    pub kind: TranscriptKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub payload: Value,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
}

/// Response body of one pipeline run (`POST /events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub event_id: String,
    pub correlation_id: String,
    pub value_score: f64,
    pub cci: f64,
    pub cci_components: Option<CciComponents>,
    pub action_type: String,
    pub action: Value,
    pub metadata: JsonMap,
    pub success: bool,
    pub cursor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_approval: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q_update: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_learning: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with_payload(payload: Value) -> PceEvent {
        PceEvent {
            event_id: "e-1".into(),
            event_type: "observation.assistant.v1".into(),
            source: "test".into(),
            ts: Utc::now(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn correlation_id_falls_back_to_event_id() {
        let event = event_with_payload(json!({"domain": "assistant"}));
        assert_eq!(event.correlation_id(), "e-1");

        let event = event_with_payload(json!({"domain": "assistant", "correlation_id": "c-9"}));
        assert_eq!(event.correlation_id(), "c-9");
    }

    #[test]
    fn tags_ignore_non_string_entries() {
        let event = event_with_payload(json!({"tags": ["safe", 42, "strategic"]}));
        assert_eq!(event.tags(), vec!["safe".to_string(), "strategic".to_string()]);
    }

    #[test]
    fn explain_sections_are_created_on_demand() {
        let mut plan = ActionPlan::new("observe", 1, "baseline");
        plan.explain_section_mut("de")
            .insert("final_profile".into(), json!("P0"));
        let de = plan.metadata["explain"]["de"].as_object().unwrap();
        assert_eq!(de["final_profile"], json!("P0"));
    }

    #[test]
    fn transcript_kind_roundtrip() {
        for kind in [
            TranscriptKind::EventIngested,
            TranscriptKind::AgentMessage,
            TranscriptKind::ActionsProposed,
            TranscriptKind::ApprovalCreated,
            TranscriptKind::ApprovalUpdated,
            TranscriptKind::StateUpdated,
        ] {
            assert_eq!(TranscriptKind::parse(kind.as_str()), Some(kind));
            assert!(kind.stream_event().starts_with("os."));
        }
    }
}
