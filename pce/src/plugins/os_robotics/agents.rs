//! Internal agent roundtable for the OS robotics domain.
//!
//! Finance, procurement, engineering and testing agents each look at the
//! event plus the twin and contribute short messages or proposed actions.
//! Messages travel over a bounded bus with dedupe and per-agent fan-in
//! limits so a chatty agent cannot flood the transcript. The roundtable
//! output becomes `agent_message` / `actions_proposed` transcript entries.

use std::collections::{HashSet, VecDeque};

use serde_json::{json, Value};

use crate::plugins::os_robotics::twin::RobotTwin;
use crate::types::{JsonMap, PceEvent, TranscriptKind};

pub const MAX_TURNS: usize = 6;
pub const PER_AGENT_LIMIT: usize = 4;

#[derive(Debug, Clone)]
pub struct AgentMessage {
    pub from_agent: String,
    pub to_agent: String,
    pub kind: String,
    pub content: JsonMap,
}

impl AgentMessage {
    fn dedupe_key(&self) -> String {
        let mut keys: Vec<&String> = self.content.keys().collect();
        keys.sort();
        let content_key = keys
            .iter()
            .map(|k| format!("{}:{}", k, self.content[k.as_str()]))
            .collect::<Vec<_>>()
            .join("|");
        format!(
            "{}->{}:{}:{}",
            self.from_agent, self.to_agent, self.kind, content_key
        )
    }
}

/// Queue with turn limit, dedupe, and per-agent ingress rate limiting.
#[derive(Debug, Default)]
pub struct AgentBus {
    queue: VecDeque<AgentMessage>,
    seen: HashSet<String>,
}

impl AgentBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue once per deterministic dedupe key.
    pub fn enqueue(&mut self, message: AgentMessage) -> bool {
        let key = message.dedupe_key();
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key);
        self.queue.push_back(message);
        true
    }

    /// Drain one turn, dropping messages past the per-agent inbox limit.
    pub fn drain_turn(&mut self) -> Vec<AgentMessage> {
        let mut delivered: Vec<AgentMessage> = Vec::new();
        let mut inbox_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        while let Some(message) = self.queue.pop_front() {
            let count = inbox_counts.entry(message.to_agent.clone()).or_insert(0);
            if *count >= PER_AGENT_LIMIT {
                continue;
            }
            *count += 1;
            delivered.push(message);
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// One transcript contribution from the roundtable.
#[derive(Debug, Clone)]
pub struct AgentNote {
    pub kind: TranscriptKind,
    pub agent: String,
    pub payload: Value,
}

/// Run a single bounded roundtable for an OS event. Deterministic: the same
/// event and twin always produce the same notes.
pub fn roundtable(event: &PceEvent, twin: &RobotTwin) -> Vec<AgentNote> {
    let mut bus = AgentBus::new();
    let mut notes: Vec<AgentNote> = Vec::new();

    finance_agent(event, twin, &mut bus, &mut notes);
    procurement_agent(event, twin, &mut bus, &mut notes);
    engineering_agent(event, twin, &mut bus, &mut notes);
    testing_agent(event, twin, &mut bus, &mut notes);

    // Deliver at most one bus turn back into the transcript notes.
    for message in bus.drain_turn().into_iter().take(MAX_TURNS) {
        notes.push(AgentNote {
            kind: TranscriptKind::AgentMessage,
            agent: message.from_agent.clone(),
            payload: json!({
                "to": message.to_agent,
                "kind": message.kind,
                "content": Value::Object(message.content),
            }),
        });
    }
    notes
}

fn finance_agent(event: &PceEvent, twin: &RobotTwin, bus: &mut AgentBus, notes: &mut Vec<AgentNote>) {
    let projected_cost = event.payload_f64("projected_cost").unwrap_or(0.0);
    notes.push(AgentNote {
        kind: TranscriptKind::AgentMessage,
        agent: "finance".into(),
        payload: json!({
            "summary": "budget snapshot",
            "budget_total": twin.budget_total,
            "budget_remaining": twin.budget_remaining,
            "projected_cost": projected_cost,
        }),
    });
    if projected_cost > twin.budget_remaining {
        let mut content = JsonMap::new();
        content.insert("warning".into(), json!("projected cost exceeds remaining budget"));
        content.insert("shortfall".into(), json!(projected_cost - twin.budget_remaining));
        bus.enqueue(AgentMessage {
            from_agent: "finance".into(),
            to_agent: "procurement".into(),
            kind: "budget_warning".into(),
            content,
        });
    }
}

fn procurement_agent(
    event: &PceEvent,
    twin: &RobotTwin,
    bus: &mut AgentBus,
    notes: &mut Vec<AgentNote>,
) {
    if event.event_type != "part.candidate.added" && event.event_type != "purchase.requested" {
        return;
    }
    let component_id = event.payload_str("component_id").unwrap_or_default();
    let supplier = twin
        .suppliers
        .iter()
        .max_by(|a, b| {
            a.reliability_score
                .partial_cmp(&b.reliability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|s| s.supplier_id.clone());

    notes.push(AgentNote {
        kind: TranscriptKind::ActionsProposed,
        agent: "procurement".into(),
        payload: json!({
            "proposal": "source_component",
            "component_id": component_id,
            "preferred_supplier": supplier,
        }),
    });

    let mut content = JsonMap::new();
    content.insert("component_id".into(), json!(component_id));
    bus.enqueue(AgentMessage {
        from_agent: "procurement".into(),
        to_agent: "engineering".into(),
        kind: "fit_check".into(),
        content,
    });
}

fn engineering_agent(
    _event: &PceEvent,
    twin: &RobotTwin,
    _bus: &mut AgentBus,
    notes: &mut Vec<AgentNote>,
) {
    let cycle = twin.dependency_graph.find_cycle();
    notes.push(AgentNote {
        kind: TranscriptKind::AgentMessage,
        agent: "engineering".into(),
        payload: json!({
            "summary": "bom status",
            "components": twin.components.len(),
            "dependency_cycle": cycle,
        }),
    });
}

fn testing_agent(
    event: &PceEvent,
    twin: &RobotTwin,
    _bus: &mut AgentBus,
    notes: &mut Vec<AgentNote>,
) {
    if event.event_type != "test.result.recorded" && twin.tests.is_empty() {
        return;
    }
    let total = twin.tests.len();
    let passed = twin.tests.iter().filter(|t| t.passed).count();
    notes.push(AgentNote {
        kind: TranscriptKind::AgentMessage,
        agent: "testing".into(),
        payload: json!({
            "summary": "test pass rate",
            "passed": passed,
            "total": total,
        }),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(from: &str, to: &str, kind: &str, key: &str) -> AgentMessage {
        let mut content = JsonMap::new();
        content.insert("k".into(), json!(key));
        AgentMessage {
            from_agent: from.into(),
            to_agent: to.into(),
            kind: kind.into(),
            content,
        }
    }

    fn event(event_type: &str, payload: Value) -> PceEvent {
        PceEvent {
            event_id: "e-1".into(),
            event_type: event_type.into(),
            source: "test".into(),
            ts: Utc::now(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn bus_deduplicates_identical_messages() {
        let mut bus = AgentBus::new();
        assert!(bus.enqueue(message("a", "b", "ping", "1")));
        assert!(!bus.enqueue(message("a", "b", "ping", "1")));
        assert!(bus.enqueue(message("a", "b", "ping", "2")));
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn bus_caps_per_agent_inbox() {
        let mut bus = AgentBus::new();
        for i in 0..10 {
            bus.enqueue(message("a", "b", "ping", &format!("{i}")));
        }
        let delivered = bus.drain_turn();
        assert_eq!(delivered.len(), PER_AGENT_LIMIT);
        assert!(bus.is_empty());
    }

    #[test]
    fn purchase_over_budget_raises_finance_warning() {
        let mut twin = RobotTwin::default();
        twin.budget_remaining = 100.0;
        let notes = roundtable(
            &event(
                "purchase.requested",
                json!({"domain": "os.robotics", "projected_cost": 240.0, "component_id": "c-1"}),
            ),
            &twin,
        );
        let warning = notes.iter().find(|n| {
            n.payload
                .get("kind")
                .map(|k| k == &json!("budget_warning"))
                .unwrap_or(false)
        });
        assert!(warning.is_some(), "notes={notes:?}");
        assert!(notes
            .iter()
            .any(|n| n.kind == TranscriptKind::ActionsProposed));
    }

    #[test]
    fn engineering_reports_dependency_cycles() {
        let mut twin = RobotTwin::default();
        twin.dependency_graph.edges.insert("a".into(), vec!["b".into()]);
        twin.dependency_graph.edges.insert("b".into(), vec!["a".into()]);
        let notes = roundtable(
            &event("project.goal.defined", json!({"domain": "os.robotics"})),
            &twin,
        );
        let engineering = notes
            .iter()
            .find(|n| n.agent == "engineering")
            .expect("engineering note");
        assert!(!engineering.payload["dependency_cycle"].is_null());
    }

    #[test]
    fn roundtable_is_deterministic() {
        let twin = RobotTwin::default();
        let e = event(
            "part.candidate.added",
            json!({"domain": "os.robotics", "component_id": "c-1", "name": "servo"}),
        );
        let first = roundtable(&e, &twin);
        let second = roundtable(&e, &twin);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.agent, b.agent);
            assert_eq!(a.payload, b.payload);
        }
    }
}
