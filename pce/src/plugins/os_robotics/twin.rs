//! Robotics digital twin: the persisted project substate for the OS domain.
//!
//! Lives under `pce_os.robotics_twin` in the global snapshot. Event
//! application is deterministic, every applied event lands in the audit
//! trail, and dependency edges are stored as adjacency lists keyed by
//! component id (cycles are detected defensively, never materialized as
//! object references).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::isi::slice_mut;
use crate::types::{JsonMap, PceEvent};

pub const OS_SLICE: &str = "pce_os";
pub const TWIN_SLICE: &str = "robotics_twin";

/// Risk buffer charged per HIGH-risk part in the cost projection.
const HIGH_RISK_BUFFER: f64 = 50.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Supplier {
    pub supplier_id: String,
    pub name: String,
    #[serde(default = "default_reliability")]
    pub reliability_score: f64,
    #[serde(default = "default_lead_time")]
    pub avg_lead_time_days: i64,
}

fn default_reliability() -> f64 {
    0.7
}
fn default_lead_time() -> i64 {
    14
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub component_id: String,
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub estimated_unit_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_supplier_id: Option<String>,
    #[serde(default = "default_component_status")]
    pub status: String,
    #[serde(default = "default_risk")]
    pub risk_level: String,
}

fn default_category() -> String {
    "general".to_string()
}
fn default_quantity() -> i64 {
    1
}
fn default_component_status() -> String {
    "planned".to_string()
}
fn default_risk() -> String {
    "LOW".to_string()
}

/// Build-dependency adjacency lists keyed by component id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DependencyGraph {
    #[serde(default)]
    pub edges: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Depth-first cycle scan. Returns one representative cycle path when
    /// the graph is not a DAG.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut stack: Vec<&str> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            edges: &'a BTreeMap<String, Vec<String>>,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            stack.push(node);
            if let Some(targets) = edges.get(node) {
                for target in targets {
                    if let Some(cycle) = visit(target, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        for node in self.edges.keys() {
            if let Some(cycle) = visit(node, &self.edges, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostProjection {
    #[serde(default)]
    pub projected_total_cost: f64,
    #[serde(default)]
    pub projected_risk_buffer: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl Default for CostProjection {
    fn default() -> Self {
        Self {
            projected_total_cost: 0.0,
            projected_risk_buffer: 0.0,
            confidence: default_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationResult {
    pub simulation_id: String,
    pub scenario: String,
    #[serde(default)]
    pub projected_cost: f64,
    #[serde(default = "default_risk")]
    pub projected_risk_level: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRecord {
    pub test_id: String,
    pub component_id: String,
    pub passed: bool,
    #[serde(default)]
    pub measured_metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub notes: String,
}

/// Root twin state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotTwin {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default = "default_phase")]
    pub phase: String,
    #[serde(default)]
    pub budget_total: f64,
    #[serde(default)]
    pub budget_remaining: f64,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default = "default_risk")]
    pub risk_level: String,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub suppliers: Vec<Supplier>,
    #[serde(default)]
    pub dependency_graph: DependencyGraph,
    #[serde(default)]
    pub cost_projection: CostProjection,
    #[serde(default)]
    pub simulations: Vec<SimulationResult>,
    #[serde(default)]
    pub tests: Vec<TestRecord>,
    #[serde(default)]
    pub purchase_history: Vec<Value>,
    #[serde(default)]
    pub audit_trail: Vec<Value>,
}

fn default_schema_version() -> String {
    "v0".to_string()
}
fn default_project_id() -> String {
    "robotics-v0".to_string()
}
fn default_phase() -> String {
    "planning".to_string()
}

impl Default for RobotTwin {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            project_id: default_project_id(),
            phase: default_phase(),
            budget_total: 0.0,
            budget_remaining: 0.0,
            risks: Vec::new(),
            risk_level: default_risk(),
            components: Vec::new(),
            suppliers: Vec::new(),
            dependency_graph: DependencyGraph::default(),
            cost_projection: CostProjection::default(),
            simulations: Vec::new(),
            tests: Vec::new(),
            purchase_history: Vec::new(),
            audit_trail: Vec::new(),
        }
    }
}

impl RobotTwin {
    /// Load the twin from the global snapshot, tolerating an absent or
    /// malformed slice (clamped to defaults).
    pub fn from_state(state: &JsonMap) -> Self {
        state
            .get(OS_SLICE)
            .and_then(Value::as_object)
            .and_then(|os| os.get(TWIN_SLICE))
            .and_then(|raw| serde_json::from_value::<RobotTwin>(raw.clone()).ok())
            .unwrap_or_default()
    }

    /// Write the twin back into the snapshot's OS slice.
    pub fn write_into_state(&self, state: &mut JsonMap) {
        let os = slice_mut(state, OS_SLICE);
        os.insert(
            TWIN_SLICE.to_string(),
            serde_json::to_value(self).unwrap_or_else(|_| Value::Object(JsonMap::new())),
        );
    }

    /// Apply one domain event deterministically, appending an audit record.
    ///
    /// Approval follow-ups (`<stem>.completed`) carry the payload of the
    /// event that was deferred at the gate; they apply through the same
    /// branch as their source event type.
    pub fn apply_event(&self, event: &PceEvent) -> Self {
        let mut next = self.clone();
        let payload = &event.payload;

        match follow_up_source_kind(&event.event_type, payload) {
            "project.goal.defined" => {
                next.phase = payload
                    .get("phase")
                    .and_then(Value::as_str)
                    .unwrap_or("planning")
                    .to_string();
                if let Some(budget_total) = payload.get("budget_total").and_then(Value::as_f64) {
                    next.budget_total = budget_total;
                    next.budget_remaining = budget_total;
                }
            }
            "budget.updated" => {
                let budget_total = payload
                    .get("budget_total")
                    .and_then(Value::as_f64)
                    .unwrap_or(next.budget_total);
                next.budget_total = budget_total;
                next.budget_remaining = payload
                    .get("budget_remaining")
                    .and_then(Value::as_f64)
                    .unwrap_or(budget_total);
            }
            "part.candidate.added" => {
                if let Ok(component) =
                    serde_json::from_value::<Component>(Value::Object(payload.clone()))
                {
                    if let Some(depends_on) = payload.get("depends_on").and_then(Value::as_array) {
                        let edges: Vec<String> = depends_on
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                        next.dependency_graph
                            .edges
                            .insert(component.component_id.clone(), edges);
                    }
                    next.components
                        .retain(|c| c.component_id != component.component_id);
                    next.components.push(component);
                    next.cost_projection = project_cost(&next);
                }
            }
            "purchase.completed" => {
                let spent = payload.get("total_cost").and_then(Value::as_f64).unwrap_or(0.0);
                next.budget_remaining -= spent;
                let mut record = payload.clone();
                record.insert("status".into(), json!("completed"));
                next.purchase_history.push(Value::Object(record));
                next.cost_projection = project_cost(&next);
            }
            "part.received" => {
                let component_id = payload
                    .get("component_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                for component in &mut next.components {
                    if component.component_id == component_id {
                        component.status = "received".to_string();
                    }
                }
            }
            "test.result.recorded" => {
                if let Ok(test) = serde_json::from_value::<TestRecord>(Value::Object(payload.clone()))
                {
                    next.tests.push(test);
                }
            }
            "test.executed" => {
                if let Ok(simulation) =
                    serde_json::from_value::<SimulationResult>(Value::Object(payload.clone()))
                {
                    next.risk_level = simulation.projected_risk_level.clone();
                    next.simulations.push(simulation);
                }
            }
            "risk.detected" => {
                let risk = payload
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown risk")
                    .to_string();
                next.risks.push(risk);
                next.risk_level = payload
                    .get("risk_level")
                    .and_then(Value::as_str)
                    .unwrap_or("HIGH")
                    .to_string();
            }
            // purchase.rejected and everything else: audit record only.
            _ => {}
        }

        next.audit_trail.push(json!({
            "event_type": event.event_type,
            "event_id": event.event_id,
            "payload": Value::Object(payload.clone()),
            "at": event.ts,
        }));
        next
    }
}

/// Resolve an approval follow-up back to the event family whose apply
/// logic it defers. Everything else passes through unchanged
/// (`purchase.completed` has its own branch; `*.rejected` is audit-only).
fn follow_up_source_kind<'a>(event_type: &'a str, payload: &JsonMap) -> &'a str {
    match event_type {
        "budget.completed" => "budget.updated",
        "risk.completed" => "risk.detected",
        "project.completed" => "project.goal.defined",
        "part.completed" => "part.candidate.added",
        "test.completed" => {
            if payload.contains_key("simulation_id") {
                "test.executed"
            } else {
                "test.result.recorded"
            }
        }
        other => other,
    }
}

/// Aggregate projection: component costs, a 10% buffer plus a fixed charge
/// per HIGH-risk part.
pub fn project_cost(twin: &RobotTwin) -> CostProjection {
    let total: f64 = twin
        .components
        .iter()
        .map(|c| c.estimated_unit_cost * c.quantity as f64)
        .sum();
    let high_risk_parts = twin
        .components
        .iter()
        .filter(|c| c.risk_level == "HIGH")
        .count() as f64;
    CostProjection {
        projected_total_cost: round2(total),
        projected_risk_buffer: round2(total * 0.1 + high_risk_parts * HIGH_RISK_BUFFER),
        confidence: if twin.components.is_empty() { 0.5 } else { 0.55 },
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn audit_tail(twin: &RobotTwin, limit: usize) -> Vec<Value> {
    let len = twin.audit_trail.len();
    twin.audit_trail[len.saturating_sub(limit)..].to_vec()
}
