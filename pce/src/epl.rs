//! Event Processing Layer: envelope validation and normalization.
//!
//! Schemas are registered per `event_type` at boot; the validator never
//! guesses a schema, and an unknown event type is a hard reject. On success
//! the raw envelope becomes a [`PceEvent`] with a freshly stamped id and
//! server wall-clock timestamp. Those two stamps are assigned exactly once:
//! re-validating an already-normalized event returns it unchanged.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PceError, PceResult};
use crate::types::PceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

/// Declarative payload schema for one event type.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub event_type: &'static str,
    pub required: &'static [FieldSpec],
    pub optional: &'static [FieldSpec],
}

/// Envelope fields shared by every event type. `domain` is the dispatch
/// key; `session_id`/`correlation_id`/`tags` are the audit companions.
const COMMON_OPTIONAL: &[FieldSpec] = &[
    field("session_id", FieldKind::String),
    field("correlation_id", FieldKind::String),
    field("tags", FieldKind::Array),
];

/// Control-plane fields stamped onto approval follow-up events
/// (`<stem>.completed` / `<stem>.rejected`). The deferred original payload
/// rides along untouched, so these schemas require nothing beyond it.
const FOLLOW_UP_OPTIONAL: &[FieldSpec] = &[
    field("approval_id", FieldKind::String),
    field("decision_id", FieldKind::String),
    field("actor", FieldKind::String),
    field("notes", FieldKind::String),
    field("reason", FieldKind::String),
    field("override", FieldKind::Boolean),
    field("total_cost", FieldKind::Number),
];

const DEFAULT_SCHEMAS: &[EventSchema] = &[
    EventSchema {
        event_type: "observation.assistant.v1",
        required: &[field("text", FieldKind::String)],
        optional: &[],
    },
    EventSchema {
        event_type: "feedback.assistant.v1",
        required: &[field("session_id", FieldKind::String)],
        optional: &[
            field("reward", FieldKind::Number),
            field("rating", FieldKind::Integer),
            field("accepted", FieldKind::Boolean),
            field("notes", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "project.goal.defined",
        required: &[],
        optional: &[
            field("phase", FieldKind::String),
            field("goal", FieldKind::String),
            field("budget_total", FieldKind::Number),
        ],
    },
    EventSchema {
        event_type: "part.candidate.added",
        required: &[
            field("component_id", FieldKind::String),
            field("name", FieldKind::String),
        ],
        optional: &[
            field("category", FieldKind::String),
            field("quantity", FieldKind::Integer),
            field("estimated_unit_cost", FieldKind::Number),
            field("risk_level", FieldKind::String),
            field("depends_on", FieldKind::Array),
        ],
    },
    EventSchema {
        event_type: "budget.updated",
        required: &[field("budget_total", FieldKind::Number)],
        optional: &[field("budget_remaining", FieldKind::Number)],
    },
    EventSchema {
        event_type: "purchase.requested",
        required: &[field("projected_cost", FieldKind::Number)],
        optional: &[
            field("purchase_id", FieldKind::String),
            field("component_id", FieldKind::String),
            field("risk_level", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "purchase.completed",
        required: &[field("total_cost", FieldKind::Number)],
        optional: &[
            field("purchase_id", FieldKind::String),
            field("component_id", FieldKind::String),
            field("approval_id", FieldKind::String),
            field("decision_id", FieldKind::String),
            field("actor", FieldKind::String),
            field("notes", FieldKind::String),
            field("override", FieldKind::Boolean),
            field("risk_level", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "purchase.rejected",
        required: &[],
        optional: &[
            field("approval_id", FieldKind::String),
            field("decision_id", FieldKind::String),
            field("actor", FieldKind::String),
            field("reason", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "budget.completed",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "budget.rejected",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "test.completed",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "test.rejected",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "risk.completed",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "risk.rejected",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "part.completed",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "part.rejected",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "project.completed",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "project.rejected",
        required: &[],
        optional: FOLLOW_UP_OPTIONAL,
    },
    EventSchema {
        event_type: "part.received",
        required: &[field("component_id", FieldKind::String)],
        optional: &[],
    },
    EventSchema {
        event_type: "test.result.recorded",
        required: &[
            field("test_id", FieldKind::String),
            field("component_id", FieldKind::String),
            field("passed", FieldKind::Boolean),
        ],
        optional: &[
            field("measured_metrics", FieldKind::Object),
            field("notes", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "test.executed",
        required: &[
            field("simulation_id", FieldKind::String),
            field("scenario", FieldKind::String),
        ],
        optional: &[
            field("projected_cost", FieldKind::Number),
            field("projected_risk_level", FieldKind::String),
            field("notes", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "risk.detected",
        required: &[],
        optional: &[
            field("description", FieldKind::String),
            field("risk_level", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "market_signal",
        required: &[field("symbol", FieldKind::String)],
        optional: &[
            field("p_win", FieldKind::Number),
            field("uncertainty", FieldKind::Number),
            field("macro_regime", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "robot_telemetry",
        required: &[],
        optional: &[
            field("robot", FieldKind::Object),
            field("sensors", FieldKind::Object),
            field("delta", FieldKind::Object),
            field("tick", FieldKind::Integer),
            field("episode_id", FieldKind::String),
        ],
    },
    EventSchema {
        event_type: "observation.robotics.v1",
        required: &[],
        optional: &[
            field("robot", FieldKind::Object),
            field("sensors", FieldKind::Object),
            field("delta", FieldKind::Object),
            field("tick", FieldKind::Integer),
            field("episode_id", FieldKind::String),
            field("distance", FieldKind::Number),
        ],
    },
    EventSchema {
        event_type: "feedback.robotics.v1",
        required: &[field("reward", FieldKind::Number)],
        optional: &[
            field("done", FieldKind::Boolean),
            field("reason", FieldKind::String),
            field("collisions", FieldKind::Integer),
            field("episode_id", FieldKind::String),
            field("tick", FieldKind::Integer),
        ],
    },
];

#[derive(Debug)]
pub struct EventValidator {
    schemas: HashMap<&'static str, &'static EventSchema>,
}

impl Default for EventValidator {
    fn default() -> Self {
        Self::with_default_schemas()
    }
}

impl EventValidator {
    pub fn with_default_schemas() -> Self {
        let mut schemas = HashMap::new();
        for schema in DEFAULT_SCHEMAS {
            schemas.insert(schema.event_type, schema);
        }
        Self { schemas }
    }

    pub fn known_event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.schemas.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Validate a raw envelope and return the normalized event with
    /// `event_id` and `ts` stamped.
    pub fn ingest(&self, raw: &Value) -> PceResult<PceEvent> {
        let envelope = raw
            .as_object()
            .ok_or_else(|| PceError::InvalidSchema("envelope must be a JSON object".into()))?;

        let event_type = envelope
            .get("event_type")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PceError::InvalidSchema("missing event_type".into()))?;
        let source = envelope
            .get("source")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PceError::InvalidSchema("missing source".into()))?;
        let payload = envelope
            .get("payload")
            .and_then(Value::as_object)
            .ok_or_else(|| PceError::InvalidSchema("missing payload object".into()))?;

        let schema = self.schemas.get(event_type).ok_or_else(|| {
            PceError::InvalidSchema(format!("unknown event_type {:?}", event_type))
        })?;

        self.validate_payload(schema, payload)?;

        Ok(PceEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            ts: Utc::now(),
            payload: payload.clone(),
        })
    }

    /// Re-validate an already-normalized event. Idempotent: the stamped
    /// `event_id`/`ts` are preserved untouched.
    pub fn revalidate(&self, event: &PceEvent) -> PceResult<PceEvent> {
        let schema = self.schemas.get(event.event_type.as_str()).ok_or_else(|| {
            PceError::InvalidSchema(format!("unknown event_type {:?}", event.event_type))
        })?;
        self.validate_payload(schema, &event.payload)?;
        Ok(event.clone())
    }

    fn validate_payload(
        &self,
        schema: &EventSchema,
        payload: &serde_json::Map<String, Value>,
    ) -> PceResult<()> {
        let domain = payload.get("domain");
        match domain {
            Some(value) if value.is_string() => {}
            Some(_) => {
                return Err(PceError::InvalidPayload("domain must be a string".into()));
            }
            None => {
                return Err(PceError::InvalidPayload("missing required field domain".into()));
            }
        }

        for spec in schema.required {
            match payload.get(spec.name) {
                Some(value) if spec.kind.matches(value) => {}
                Some(_) => {
                    return Err(PceError::InvalidPayload(format!(
                        "field {:?} must be a {}",
                        spec.name,
                        spec.kind.name()
                    )));
                }
                None => {
                    return Err(PceError::InvalidPayload(format!(
                        "missing required field {:?}",
                        spec.name
                    )));
                }
            }
        }

        for spec in schema.optional.iter().chain(COMMON_OPTIONAL) {
            if let Some(value) = payload.get(spec.name) {
                if !value.is_null() && !spec.kind.matches(value) {
                    return Err(PceError::InvalidPayload(format!(
                        "field {:?} must be a {}",
                        spec.name,
                        spec.kind.name()
                    )));
                }
            }
        }

        if let Some(tags) = payload.get("tags").and_then(Value::as_array) {
            if tags.iter().any(|t| !t.is_string()) {
                return Err(PceError::InvalidPayload("tags must be strings".into()));
            }
        }

        Ok(())
    }
}
