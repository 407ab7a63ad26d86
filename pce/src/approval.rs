//! Human approval gate.
//!
//! Sensitive plans are parked as pending approvals and only act on the
//! world after an operator resolves them. The state machine is
//! `pending -> approved | rejected | overridden | expired`; exactly one
//! terminal transition per record, and terminal records are immutable
//! (enforced again at the store layer).
//!
//! A `pending` approval never touches the twin: budget debits happen only
//! through the `<stem>.completed` event synthesized on approve/override.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{PceError, PceResult};
use crate::types::{ActionPlan, JsonMap, PceEvent};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Overridden,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Overridden => "overridden",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// One approval record. `stem` is the action family derived from the
/// triggering event type (`purchase.requested` -> `purchase`) and names the
/// synthesized follow-up events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub approval_id: String,
    pub decision_id: String,
    pub status: ApprovalStatus,
    pub stem: String,
    pub action: ActionPlan,
    pub projected_cost: f64,
    pub risk: String,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, rename = "override")]
    pub override_flag: bool,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl PendingApproval {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    fn ensure_pending(&self) -> PceResult<()> {
        if self.status.is_terminal() {
            return Err(PceError::ApprovalAlreadyTerminal(self.approval_id.clone()));
        }
        Ok(())
    }
}

/// Pure state machine for approvals; persistence and transcripts stay with
/// the kernel so this layer remains trivially testable.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalGate {
    pub ttl_seconds: i64,
}

impl ApprovalGate {
    pub fn new(ttl_seconds: i64) -> Self {
        Self { ttl_seconds }
    }

    /// Build a pending record for a gated plan.
    pub fn create(&self, event: &PceEvent, plan: &ActionPlan, gate_rationale: &str) -> PendingApproval {
        let stem = action_stem(event, plan);
        let mut metadata = JsonMap::new();
        metadata.insert("event_id".into(), json!(event.event_id));
        metadata.insert("event_type".into(), json!(event.event_type));
        metadata.insert("correlation_id".into(), json!(event.correlation_id()));
        metadata.insert("gate_rationale".into(), json!(gate_rationale));
        // The gated event's payload is deferred, not applied: the follow-up
        // carries it back through the pipeline on approve/override.
        metadata.insert(
            "event_payload".into(),
            Value::Object(event.payload.clone()),
        );

        PendingApproval {
            approval_id: Uuid::new_v4().to_string(),
            decision_id: event.event_id.clone(),
            status: ApprovalStatus::Pending,
            stem,
            action: plan.clone(),
            projected_cost: plan.projected_cost(),
            risk: plan.risk_level(),
            rationale: plan.rationale.clone(),
            created_at: Utc::now(),
            resolved_at: None,
            actor: None,
            notes: None,
            override_flag: false,
            metadata,
        }
    }

    /// Whether the budget precondition applies to this approval's stem.
    pub fn requires_budget(approval: &PendingApproval) -> bool {
        matches!(approval.stem.as_str(), "purchase" | "budget_commit")
    }

    /// `pending -> approved`. Fails with `insufficient_budget_for_purchase`
    /// when the twin cannot cover the projected cost; the record stays
    /// pending in that case.
    pub fn approve(
        &self,
        approval: &PendingApproval,
        actor: &str,
        notes: &str,
        budget_remaining: f64,
    ) -> PceResult<PendingApproval> {
        approval.ensure_pending()?;
        if Self::requires_budget(approval) && budget_remaining < approval.projected_cost {
            return Err(PceError::InsufficientBudget {
                required: approval.projected_cost,
                available: budget_remaining,
            });
        }
        Ok(self.resolve(approval, ApprovalStatus::Approved, actor, notes, false))
    }

    /// `pending -> rejected`. No precondition beyond pending status.
    pub fn reject(
        &self,
        approval: &PendingApproval,
        actor: &str,
        reason: &str,
    ) -> PceResult<PendingApproval> {
        approval.ensure_pending()?;
        Ok(self.resolve(approval, ApprovalStatus::Rejected, actor, reason, false))
    }

    /// `pending -> overridden`. Forces execution regardless of budget.
    pub fn override_approve(
        &self,
        approval: &PendingApproval,
        actor: &str,
        notes: &str,
    ) -> PceResult<PendingApproval> {
        approval.ensure_pending()?;
        Ok(self.resolve(approval, ApprovalStatus::Overridden, actor, notes, true))
    }

    /// `pending -> expired`, server-initiated. Returns `None` when the TTL
    /// has not elapsed yet.
    pub fn expire_if_due(&self, approval: &PendingApproval, now: DateTime<Utc>) -> Option<PendingApproval> {
        if !approval.is_pending() {
            return None;
        }
        if now - approval.created_at < Duration::seconds(self.ttl_seconds) {
            return None;
        }
        let mut expired = approval.clone();
        expired.status = ApprovalStatus::Expired;
        expired.resolved_at = Some(now);
        Some(expired)
    }

    fn resolve(
        &self,
        approval: &PendingApproval,
        status: ApprovalStatus,
        actor: &str,
        notes: &str,
        override_flag: bool,
    ) -> PendingApproval {
        let mut resolved = approval.clone();
        resolved.status = status;
        resolved.resolved_at = Some(Utc::now());
        resolved.actor = Some(actor.to_string());
        resolved.notes = Some(notes.to_string());
        resolved.override_flag = override_flag;
        resolved
    }

    /// Raw envelope for the follow-up event of a terminal resolution:
    /// `<stem>.completed` for approved/overridden, `<stem>.rejected` for
    /// rejected, nothing for expired. The completed envelope carries the
    /// deferred original payload so the twin applies the gated change only
    /// now.
    pub fn follow_up_envelope(approval: &PendingApproval) -> Option<Value> {
        let (suffix, summary_key) = match approval.status {
            ApprovalStatus::Approved | ApprovalStatus::Overridden => ("completed", "notes"),
            ApprovalStatus::Rejected => ("rejected", "reason"),
            _ => return None,
        };

        let mut payload = if suffix == "completed" {
            approval
                .metadata
                .get("event_payload")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        } else {
            JsonMap::new()
        };
        payload.insert("domain".into(), json!("os.robotics"));
        payload.insert("tags".into(), json!(["approval", approval.stem]));
        payload.insert("approval_id".into(), json!(approval.approval_id));
        payload.insert("decision_id".into(), json!(approval.decision_id));
        payload.insert("actor".into(), json!(approval.actor.clone().unwrap_or_default()));
        payload.insert(
            summary_key.into(),
            json!(approval.notes.clone().unwrap_or_default()),
        );
        if let Some(correlation) = approval.metadata.get("correlation_id") {
            payload.insert("correlation_id".into(), correlation.clone());
        }
        if suffix == "completed" {
            if Self::requires_budget(approval) {
                payload.insert("total_cost".into(), json!(approval.projected_cost));
            }
            // Fill from the plan only where the deferred payload is silent.
            for key in ["purchase_id", "component_id", "risk_level"] {
                if payload.contains_key(key) {
                    continue;
                }
                if let Some(value) = approval.action.metadata.get(key) {
                    payload.insert(key.into(), value.clone());
                }
            }
            if approval.override_flag {
                payload.insert("override".into(), json!(true));
            }
        }

        Some(json!({
            "event_type": format!("{}.{}", approval.stem, suffix),
            "source": "os.control_plane",
            "payload": Value::Object(payload),
        }))
    }
}

/// Action family for synthesized follow-ups. `purchase.requested` maps to
/// `purchase`; plans gated for other reasons fall back to their action type.
fn action_stem(event: &PceEvent, plan: &ActionPlan) -> String {
    match event.event_type.split_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => plan.action_type.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn purchase_event() -> PceEvent {
        PceEvent {
            event_id: "e-1".into(),
            event_type: "purchase.requested".into(),
            source: "test".into(),
            ts: Utc::now(),
            payload: json!({
                "domain": "os.robotics",
                "projected_cost": 240.0,
                "risk_level": "MEDIUM",
                "correlation_id": "c1",
                "purchase_id": "p-7"
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        }
    }

    fn purchase_plan() -> ActionPlan {
        let mut plan = ActionPlan::new("os.request_purchase_approval", 1, "purchase gate");
        plan.domain = "os.robotics".into();
        plan.requires_approval = true;
        plan.metadata.insert("projected_cost".into(), json!(240.0));
        plan.metadata.insert("risk_level".into(), json!("MEDIUM"));
        plan.metadata.insert("purchase_id".into(), json!("p-7"));
        plan
    }

    #[test]
    fn approve_requires_budget_for_purchase_stem() {
        let gate = ApprovalGate::new(86_400);
        let approval = gate.create(&purchase_event(), &purchase_plan(), "purchase_flow_mandatory_gate");
        assert_eq!(approval.stem, "purchase");
        assert!(approval.is_pending());

        let err = gate
            .approve(&approval, "op", "ok", 100.0)
            .expect_err("insufficient budget");
        assert!(matches!(err, PceError::InsufficientBudget { .. }));

        let approved = gate.approve(&approval, "op", "ok", 500.0).expect("approve");
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.actor.as_deref(), Some("op"));
        assert!(approved.resolved_at.is_some());
    }

    #[test]
    fn terminal_records_reject_further_transitions() {
        let gate = ApprovalGate::new(86_400);
        let approval = gate.create(&purchase_event(), &purchase_plan(), "gate");
        let approved = gate.approve(&approval, "op", "ok", 500.0).expect("approve");

        let err = gate.reject(&approved, "op", "nope").expect_err("terminal");
        assert!(matches!(err, PceError::ApprovalAlreadyTerminal(_)));
        let err = gate
            .approve(&approved, "op", "again", 500.0)
            .expect_err("terminal");
        assert!(matches!(err, PceError::ApprovalAlreadyTerminal(_)));
    }

    #[test]
    fn override_skips_budget_check_and_flags_record() {
        let gate = ApprovalGate::new(86_400);
        let approval = gate.create(&purchase_event(), &purchase_plan(), "gate");
        let overridden = gate
            .override_approve(&approval, "op", "emergency")
            .expect("override");
        assert_eq!(overridden.status, ApprovalStatus::Overridden);
        assert!(overridden.override_flag);

        let envelope = ApprovalGate::follow_up_envelope(&overridden).expect("envelope");
        assert_eq!(envelope["event_type"], json!("purchase.completed"));
        assert_eq!(envelope["payload"]["total_cost"], json!(240.0));
        assert_eq!(envelope["payload"]["override"], json!(true));
    }

    #[test]
    fn rejection_synthesizes_rejected_event() {
        let gate = ApprovalGate::new(86_400);
        let approval = gate.create(&purchase_event(), &purchase_plan(), "gate");
        let rejected = gate.reject(&approval, "op", "too pricey").expect("reject");
        let envelope = ApprovalGate::follow_up_envelope(&rejected).expect("envelope");
        assert_eq!(envelope["event_type"], json!("purchase.rejected"));
        assert!(envelope["payload"].get("total_cost").is_none());
        assert_eq!(envelope["payload"]["correlation_id"], json!("c1"));
    }

    #[test]
    fn ttl_sweep_only_moves_due_pendings() {
        let gate = ApprovalGate::new(60);
        let mut approval = gate.create(&purchase_event(), &purchase_plan(), "gate");
        let now = Utc::now();

        assert!(gate.expire_if_due(&approval, now).is_none());

        approval.created_at = now - Duration::seconds(61);
        let expired = gate.expire_if_due(&approval, now).expect("due");
        assert_eq!(expired.status, ApprovalStatus::Expired);
        assert!(ApprovalGate::follow_up_envelope(&expired).is_none());

        // Terminal records are never swept again.
        assert!(gate.expire_if_due(&expired, now).is_none());
    }
}
