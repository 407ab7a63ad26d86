//! Kernel-level scenarios: the full pipeline, the approval gate, coherence
//! progression, transcript catch-up, and assistant memory feedback.

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use pce::approval::{ApprovalGate, ApprovalStatus};
use pce::config::PceConfig;
use pce::kernel::PceKernel;
use pce::store::StateStore;
use pce::types::{ActionPlan, PceEvent};
use pce::PceError;

fn kernel() -> PceKernel {
    let store = StateStore::open_in_memory().expect("store");
    PceKernel::with_store(PceConfig::default(), store).expect("kernel")
}

fn envelope(event_type: &str, payload: Value) -> Value {
    json!({
        "event_type": event_type,
        "source": "test",
        "payload": payload,
    })
}

async fn set_budget(k: &PceKernel, budget: f64) {
    k.process_raw(&envelope(
        "budget.updated",
        json!({"domain": "os.robotics", "budget_total": budget}),
    ))
    .await
    .expect("budget event");
}

async fn request_purchase(k: &PceKernel, cost: f64) -> pce::PipelineResponse {
    k.process_raw(&envelope(
        "purchase.requested",
        json!({
            "domain": "os.robotics",
            "projected_cost": cost,
            "risk_level": "MEDIUM",
            "purchase_id": "p-7",
            "correlation_id": "c1",
        }),
    ))
    .await
    .expect("purchase event")
}

#[tokio::test]
async fn purchase_approve_path_debits_budget_once() {
    let k = kernel();
    set_budget(&k, 500.0).await;

    let response = request_purchase(&k, 240.0).await;
    assert_eq!(response.requires_approval, Some(true));
    let approval_id = response.approval_id.clone().expect("approval id");
    assert_eq!(response.correlation_id, "c1");

    // Pending approval leaves the twin untouched.
    let twin = k.robotics_twin().expect("twin");
    assert!((twin.budget_remaining - 500.0).abs() < 1e-9);
    assert!(twin.purchase_history.is_empty());

    let approve_response = k.approve(&approval_id, "op", "ok").await.expect("approve");
    assert!(approve_response.success);

    let twin = k.robotics_twin().expect("twin");
    assert!((twin.budget_remaining - 260.0).abs() < 1e-9, "remaining={}", twin.budget_remaining);
    assert_eq!(twin.purchase_history.len(), 1);

    let approvals = k.list_approvals().expect("approvals");
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, ApprovalStatus::Approved);
    assert_eq!(approvals[0].actor.as_deref(), Some("op"));

    // Exactly one terminal transition: a second approve conflicts.
    let err = k.approve(&approval_id, "op", "again").await.expect_err("terminal");
    assert!(matches!(err, PceError::ApprovalAlreadyTerminal(_)));
}

#[tokio::test]
async fn insufficient_budget_keeps_the_approval_pending() {
    let k = kernel();
    set_budget(&k, 100.0).await;

    let response = request_purchase(&k, 240.0).await;
    let approval_id = response.approval_id.expect("approval id");

    let err = k.approve(&approval_id, "op", "ok").await.expect_err("budget");
    assert!(matches!(err, PceError::InsufficientBudget { .. }));

    let approvals = k.pending_approvals().expect("pending");
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].approval_id, approval_id);

    let twin = k.robotics_twin().expect("twin");
    assert!((twin.budget_remaining - 100.0).abs() < 1e-9);
    assert!(twin.purchase_history.is_empty());
}

#[tokio::test]
async fn override_executes_despite_missing_budget() {
    let k = kernel();
    set_budget(&k, 100.0).await;

    let response = request_purchase(&k, 240.0).await;
    let approval_id = response.approval_id.expect("approval id");

    k.override_approval(&approval_id, "op", "emergency")
        .await
        .expect("override");

    let approvals = k.list_approvals().expect("approvals");
    assert_eq!(approvals[0].status, ApprovalStatus::Overridden);
    assert!(approvals[0].override_flag);

    let twin = k.robotics_twin().expect("twin");
    assert!((twin.budget_remaining + 140.0).abs() < 1e-9);
    assert_eq!(twin.purchase_history.len(), 1);
}

#[tokio::test]
async fn rejection_leaves_no_twin_delta_beyond_audit() {
    let k = kernel();
    set_budget(&k, 500.0).await;

    let response = request_purchase(&k, 240.0).await;
    let approval_id = response.approval_id.expect("approval id");

    k.reject(&approval_id, "op", "too pricey").await.expect("reject");

    let approvals = k.list_approvals().expect("approvals");
    assert_eq!(approvals[0].status, ApprovalStatus::Rejected);

    let twin = k.robotics_twin().expect("twin");
    assert!((twin.budget_remaining - 500.0).abs() < 1e-9);
    assert!(twin.purchase_history.is_empty());
    // The rejection follow-up still landed in the audit trail.
    assert!(twin
        .audit_trail
        .iter()
        .any(|record| record["event_type"] == json!("purchase.rejected")));
}

#[tokio::test]
async fn declared_risk_gates_and_defers_twin_application() {
    let k = kernel();
    let response = k
        .process_raw(&envelope(
            "risk.detected",
            json!({
                "domain": "os.robotics", "description": "supplier fire",
                "risk_level": "HIGH", "correlation_id": "c-risk"
            }),
        ))
        .await
        .expect("risk event");
    assert_eq!(response.requires_approval, Some(true));
    let approval_id = response.approval_id.expect("approval id");

    // Pending: the twin has not taken the risk yet.
    let twin = k.robotics_twin().expect("twin");
    assert_eq!(twin.risk_level, "LOW");
    assert!(twin.risks.is_empty());

    let approvals = k.pending_approvals().expect("pending");
    assert_eq!(
        approvals[0].metadata["gate_rationale"],
        json!("risk_level_elevated")
    );

    k.approve(&approval_id, "op", "acknowledged").await.expect("approve");

    let twin = k.robotics_twin().expect("twin");
    assert_eq!(twin.risk_level, "HIGH");
    assert_eq!(twin.risks, vec!["supplier fire".to_string()]);
    assert_eq!(
        k.list_approvals().expect("approvals")[0].status,
        ApprovalStatus::Approved
    );
}

#[tokio::test]
async fn adverse_budget_update_is_gated_until_approved() {
    let k = kernel();
    set_budget(&k, 500.0).await;

    let response = k
        .process_raw(&envelope(
            "budget.updated",
            json!({
                "domain": "os.robotics", "budget_total": 500.0,
                "budget_remaining": -50.0
            }),
        ))
        .await
        .expect("budget event");
    assert_eq!(response.requires_approval, Some(true));
    let approval_id = response.approval_id.expect("approval id");

    // Deferred: the overdraft is not applied while pending.
    let twin = k.robotics_twin().expect("twin");
    assert!((twin.budget_remaining - 500.0).abs() < 1e-9);

    let approvals = k.pending_approvals().expect("pending");
    assert_eq!(
        approvals[0].metadata["gate_rationale"],
        json!("budget_remaining_below_projection")
    );

    k.approve(&approval_id, "op", "accepted overdraft").await.expect("approve");

    let twin = k.robotics_twin().expect("twin");
    assert!((twin.budget_remaining + 50.0).abs() < 1e-9, "remaining={}", twin.budget_remaining);
}

#[tokio::test]
async fn rejected_risk_gate_leaves_the_twin_untouched() {
    let k = kernel();
    let response = k
        .process_raw(&envelope(
            "risk.detected",
            json!({"domain": "os.robotics", "description": "loose wiring", "risk_level": "MEDIUM"}),
        ))
        .await
        .expect("risk event");
    let approval_id = response.approval_id.expect("approval id");

    k.reject(&approval_id, "op", "false alarm").await.expect("reject");

    let twin = k.robotics_twin().expect("twin");
    assert_eq!(twin.risk_level, "LOW");
    assert!(twin.risks.is_empty());
    assert!(twin
        .audit_trail
        .iter()
        .any(|record| record["event_type"] == json!("risk.rejected")));
}

#[tokio::test]
async fn value_floor_override_reaches_the_response() {
    let k = kernel();
    let response = k
        .process_raw(&envelope(
            "observation.assistant.v1",
            json!({"domain": "assistant", "session_id": "s1", "text": "hack"}),
        ))
        .await
        .expect("response");

    let de = response.metadata["explain"]["de"].as_object().expect("de");
    assert_eq!(de["final_profile"], json!("P0"));
    let reason = de["override_reason"].as_str().expect("reason");
    assert!(reason == "value_floor" || reason == "cci_floor", "reason={reason}");
    assert!(response.value_score < 0.55);
}

#[tokio::test]
async fn negative_feedback_surfaces_as_avoid_hint_next_turn() {
    let k = kernel();
    let feedback = k
        .process_raw(&envelope(
            "feedback.assistant.v1",
            json!({
                "domain": "assistant", "session_id": "s1",
                "reward": -1.0, "notes": "não seja prolixo"
            }),
        ))
        .await
        .expect("feedback");
    let learning = feedback.assistant_learning.expect("learning");
    assert_eq!(learning["afs_explain"]["wrote_avoid"], json!(true));
    assert!(feedback.epsilon.is_some());

    let observation = k
        .process_raw(&envelope(
            "observation.assistant.v1",
            json!({"domain": "assistant", "session_id": "s1", "text": "explique o plano"}),
        ))
        .await
        .expect("observation");
    let hints = observation.metadata["explain"]["de"]["avoid_hints"]
        .as_array()
        .expect("hints");
    assert!(hints.iter().any(|h| h == "não seja prolixo"));
}

#[tokio::test]
async fn assistant_epsilon_decays_monotonically_to_the_floor() {
    let k = kernel();
    let config = k.config().clone();
    let mut previous = config.assistant.epsilon_start;
    for i in 0..120 {
        let response = k
            .process_raw(&envelope(
                "feedback.assistant.v1",
                json!({"domain": "assistant", "session_id": "s1", "reward": 0.5, "correlation_id": format!("c-{i}")}),
            ))
            .await
            .expect("feedback");
        let epsilon = response.epsilon.expect("epsilon");
        assert!(epsilon <= previous + 1e-12);
        assert!(epsilon >= config.assistant.epsilon_min - 1e-12);
        previous = epsilon;
    }
    assert!((previous - config.assistant.epsilon_min).abs() < 1e-9);
}

#[tokio::test]
async fn cci_cold_start_then_climbs_past_point_seven() {
    let k = kernel();
    let reading = k.cci_reading().expect("cci");
    assert!((reading.cci - 0.5).abs() < 1e-9);
    assert!(reading.components.is_none());

    set_budget(&k, 500.0).await;
    for phase in ["planning", "procurement", "integration"] {
        k.process_raw(&envelope(
            "project.goal.defined",
            json!({"domain": "os.robotics", "phase": phase}),
        ))
        .await
        .expect("event");
    }

    let reading = k.cci_reading().expect("cci");
    assert!(reading.cci > 0.7, "cci={}", reading.cci);
    assert!(reading.components.is_some());

    // Snapshots were appended after every completed action.
    let history = k.cci_history().expect("history");
    assert!(history.len() >= 4);
}

#[tokio::test]
async fn transcript_cursors_are_gap_free_and_catch_up_is_exact() {
    let k = kernel();
    let mut rx = k.transcript().subscribe();

    for i in 0..3 {
        k.process_raw(&envelope(
            "project.goal.defined",
            json!({"domain": "os.robotics", "correlation_id": format!("c-{i}")}),
        ))
        .await
        .expect("event");
    }

    let all = k.transcript_since(0).expect("items");
    assert!(!all.is_empty());
    for pair in all.windows(2) {
        assert_eq!(pair[1].cursor, pair[0].cursor + 1, "cursor gap");
    }

    // Disconnect after the first event's worth of items, catch up later.
    let seen = all[1].cursor;
    let missed = k.transcript_since(seen).expect("missed");
    assert_eq!(missed.len(), all.len() - 2);
    assert!(missed.iter().all(|item| item.cursor > seen));

    // Live subscribers receive each item exactly once, in cursor order.
    let mut live_cursors = Vec::new();
    while let Ok(item) = rx.try_recv() {
        live_cursors.push(item.cursor);
    }
    assert_eq!(
        live_cursors,
        all.iter().map(|i| i.cursor).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn reposting_an_envelope_creates_a_new_event_id() {
    let k = kernel();
    let raw = envelope(
        "observation.assistant.v1",
        json!({"domain": "assistant", "session_id": "s1", "text": "same envelope"}),
    );
    let first = k.process_raw(&raw).await.expect("first");
    let second = k.process_raw(&raw).await.expect("second");
    assert_ne!(first.event_id, second.event_id);
}

#[tokio::test]
async fn rover_feedback_updates_q_values_through_the_pipeline() {
    let k = kernel();
    k.process_raw(&envelope(
        "observation.robotics.v1",
        json!({
            "domain": "robotics", "episode_id": "ep-1", "tick": 1,
            "robot": {"dir": 0}, "sensors": {"front": 2, "left": 1, "right": 1},
            "delta": {"dx": 2, "dy": 0}, "distance": 4.0
        }),
    ))
    .await
    .expect("observation");

    let response = k
        .process_raw(&envelope(
            "feedback.robotics.v1",
            json!({"domain": "robotics", "episode_id": "ep-1", "reward": 1.0, "tick": 1}),
        ))
        .await
        .expect("feedback");

    let q_update = response.q_update.expect("q update");
    assert_eq!(q_update["state_key"], json!("d0_dx1_dy0_f2_l1_r1"));
    assert!(q_update["q"].as_f64().expect("q") > 0.0);
    assert!(response.epsilon.expect("epsilon") < 1.0);

    let state = k.state_snapshot().expect("state");
    assert!(state["robotics"]["q_table"]["d0_dx1_dy0_f2_l1_r1"].is_object());
}

#[tokio::test]
async fn stale_pendings_expire_during_the_boot_sweep() {
    let store = StateStore::open_in_memory().expect("store");

    let event = PceEvent {
        event_id: "e-old".into(),
        event_type: "purchase.requested".into(),
        source: "test".into(),
        ts: Utc::now(),
        payload: json!({"domain": "os.robotics", "projected_cost": 10.0})
            .as_object()
            .cloned()
            .unwrap_or_default(),
    };
    let mut plan = ActionPlan::new("os.request_purchase_approval", 1, "gate");
    plan.domain = "os.robotics".into();
    plan.requires_approval = true;
    plan.metadata.insert("projected_cost".into(), json!(10.0));

    let gate = ApprovalGate::new(86_400);
    let mut stale = gate.create(&event, &plan, "gate");
    stale.created_at = Utc::now() - Duration::days(2);
    store.insert_approval(&stale).expect("insert");

    let k = PceKernel::with_store(PceConfig::default(), store).expect("kernel");
    let approvals = k.list_approvals().expect("approvals");
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, ApprovalStatus::Expired);

    // Expired is terminal: the operator can no longer approve it.
    let err = k
        .approve(&approvals[0].approval_id, "op", "late")
        .await
        .expect_err("terminal");
    assert!(matches!(err, PceError::ApprovalAlreadyTerminal(_)));
}

#[tokio::test]
async fn trader_signal_flows_through_the_gate_chain() {
    let k = kernel();
    let response = k
        .process_raw(&envelope(
            "market_signal",
            json!({
                "domain": "trader", "symbol": "BTCUSD",
                "p_win": 0.7, "uncertainty": 0.2, "macro_regime": "bull"
            }),
        ))
        .await
        .expect("signal");
    assert_eq!(response.action_type, "trader.trade_plan");
    assert_eq!(response.action["action"], json!("BUY"));
    let gates = response.metadata["explain"]["de"]["gate_results"]
        .as_array()
        .expect("gates");
    assert_eq!(gates.len(), 3);
}
