//! Composition root and pipeline driver.
//!
//! One `PceKernel` owns every stage plus the store and serializes all
//! writes through a single async mutex: pipeline runs for different
//! correlation ids may interleave at the HTTP layer, but the write path
//! is strictly ordered. Control-plane operations (approvals, memory
//! clears, rover controls) go through the same writer, so the approval
//! invariants hold across concurrent operator calls.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::afs::AdaptiveFeedback;
use crate::approval::{ApprovalGate, ApprovalStatus, PendingApproval};
use crate::cci::CoherenceEngine;
use crate::config::PceConfig;
use crate::decision::DecisionEngine;
use crate::epl::EventValidator;
use crate::error::{PceError, PceResult};
use crate::isi::StateIntegrator;
use crate::llm::OpenRouterClient;
use crate::plugins::assistant::{
    memory as assistant_memory, AssistantAdaptationPlugin, AssistantDecisionPlugin,
    AssistantValueModel,
};
use crate::plugins::os_robotics::twin::{audit_tail, RobotTwin};
use crate::plugins::os_robotics::{
    OsRoboticsAdaptationPlugin, OsRoboticsDecisionPlugin, OsRoboticsValueModel,
};
use crate::plugins::rover::{rl, RoverAdaptationPlugin, RoverDecisionPlugin, RoverValueModel};
use crate::plugins::trader::{TraderDecisionPlugin, TraderValueModel};
use crate::plugins::PluginRegistry;
use crate::store::StateStore;
use crate::transcript::TranscriptHub;
use crate::types::{
    ActionPlan, CciReading, CciSnapshot, CompletedAction, ExecutionResult, JsonMap, PceEvent,
    PipelineResponse, TranscriptItem, TranscriptKind,
};
use crate::vel::{ValueAssessment, ValueEvaluator};

/// Bound for the `action_history` / `cci_history` rings kept inside the
/// snapshot; the SQLite logs hold the full history.
const SNAPSHOT_RING_LIMIT: usize = 50;

/// `GET /v1/os/state` view.
#[derive(Debug, Clone, Serialize)]
pub struct OsStateView {
    pub twin_snapshot: Value,
    pub os_metrics: Value,
    pub policy_state: Value,
    pub last_n_audit_trail: Vec<Value>,
}

pub struct PceKernel {
    config: PceConfig,
    store: StateStore,
    validator: EventValidator,
    integrator: StateIntegrator,
    evaluator: ValueEvaluator,
    coherence: CoherenceEngine,
    decision: DecisionEngine,
    feedback: AdaptiveFeedback,
    registry: PluginRegistry,
    gate: ApprovalGate,
    transcript: TranscriptHub,
    writer: Mutex<()>,
}

impl PceKernel {
    /// Build the kernel: open the store, register the domain plugins, and
    /// run the lazy boot sweep so expired approvals are terminal before any
    /// new ingress is accepted.
    pub fn new(config: PceConfig) -> PceResult<Self> {
        let store = StateStore::open(&config.state_db_path)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: PceConfig, store: StateStore) -> PceResult<Self> {
        let llm = Arc::new(OpenRouterClient::new(config.openrouter.clone())?);

        let mut registry = PluginRegistry::new();
        registry.register_value_model(Arc::new(RoverValueModel));
        registry.register_value_model(Arc::new(AssistantValueModel));
        registry.register_value_model(Arc::new(OsRoboticsValueModel));
        registry.register_value_model(Arc::new(TraderValueModel));
        registry.register_decision(Arc::new(RoverDecisionPlugin));
        registry.register_decision(Arc::new(OsRoboticsDecisionPlugin));
        registry.register_decision(Arc::new(AssistantDecisionPlugin::new(
            llm,
            config.assistant,
        )));
        registry.register_decision(Arc::new(TraderDecisionPlugin));
        registry.register_adaptation(Arc::new(RoverAdaptationPlugin));
        registry.register_adaptation(Arc::new(OsRoboticsAdaptationPlugin));
        registry.register_adaptation(Arc::new(AssistantAdaptationPlugin::new(config.assistant)));

        let kernel = Self {
            gate: ApprovalGate::new(config.approvals.ttl_seconds),
            coherence: CoherenceEngine::new(config.cci),
            validator: EventValidator::with_default_schemas(),
            integrator: StateIntegrator::new(),
            evaluator: ValueEvaluator::new(),
            decision: DecisionEngine::new(),
            feedback: AdaptiveFeedback::new(),
            registry,
            transcript: TranscriptHub::new(),
            writer: Mutex::new(()),
            config,
            store,
        };

        let expired = kernel.boot_sweep()?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale approvals at boot");
        }
        Ok(kernel)
    }

    pub fn config(&self) -> &PceConfig {
        &self.config
    }

    pub fn transcript(&self) -> &TranscriptHub {
        &self.transcript
    }

    // ------------------------------------------------------------------
    // Pipeline entry points
    // ------------------------------------------------------------------

    /// Ingest one raw envelope end to end. Validation happens before the
    /// writer lock so invalid producers never serialize behind the writer.
    pub async fn process_raw(&self, raw: &Value) -> PceResult<PipelineResponse> {
        let event = self.validator.ingest(raw)?;
        let _guard = self.writer.lock().await;
        self.run_with_retry(event).await
    }

    /// One retry on a lost compare-and-swap, then the conflict surfaces.
    async fn run_with_retry(&self, event: PceEvent) -> PceResult<PipelineResponse> {
        match self.run_pipeline(&event).await {
            Err(PceError::StateConflict) => {
                warn!(event_id = %event.event_id, "state conflict; retrying pipeline once");
                self.run_pipeline(&event).await
            }
            other => other,
        }
    }

    /// The seven-stage pipeline. Caller must hold the writer lock.
    async fn run_pipeline(&self, event: &PceEvent) -> PceResult<PipelineResponse> {
        let correlation_id = event.correlation_id();
        let (loaded_state, version) = self.store.load_state()?;

        self.transcript.append(
            &self.store,
            TranscriptKind::EventIngested,
            None,
            &json!({
                "event_id": event.event_id,
                "event_type": event.event_type,
                "source": event.source,
            }),
            &correlation_id,
            Some(&event.event_id),
        )?;

        let mut state = self.integrator.integrate(&loaded_state, event);
        self.store.append_event(event)?;

        let assessment = self
            .registry
            .evaluate(event, &state)
            .unwrap_or_else(|| self.evaluator.evaluate(event, &state));

        let cci_before = self.coherence.reading_from_store(&self.store)?;

        let mut plan = self
            .deliberate(event, &mut state, &assessment, &cci_before)
            .await;
        let cci_explain = json!({
            "score": cci_before.cci,
            "components": cci_before.components,
        });
        plan.explain_mut().insert("cci".into(), cci_explain);

        self.drain_agent_transcript(&mut plan, &correlation_id, &event.event_id)?;

        let is_feedback = event.event_type.starts_with("feedback.");
        let is_follow_up =
            event.event_type.ends_with(".completed") || event.event_type.ends_with(".rejected");

        let mut pending: Option<PendingApproval> = None;
        let result = if is_feedback {
            ExecutionResult {
                action_type: event.event_type.clone(),
                success: true,
                observed_impact: event.payload_f64("reward").unwrap_or(0.0),
                notes: "feedback ingestion".to_string(),
                metadata: {
                    let mut metadata = JsonMap::new();
                    metadata.insert("feedback".into(), Value::Object(event.payload.clone()));
                    metadata
                },
            }
        } else if plan.requires_approval && !is_follow_up {
            let gate_rationale = plan
                .metadata
                .get("gate_rationale")
                .and_then(Value::as_str)
                .unwrap_or("gated_action")
                .to_string();
            let approval = self.gate.create(event, &plan, &gate_rationale);
            self.store.insert_approval(&approval)?;
            self.transcript.append(
                &self.store,
                TranscriptKind::ApprovalCreated,
                None,
                &serde_json::to_value(&approval)?,
                &correlation_id,
                Some(&approval.decision_id),
            )?;
            let result = ExecutionResult {
                action_type: plan.action_type.clone(),
                success: true,
                observed_impact: 0.0,
                notes: "approval pending".to_string(),
                metadata: {
                    let mut metadata = JsonMap::new();
                    metadata.insert("approval_pending".into(), json!(true));
                    metadata.insert("approval_id".into(), json!(approval.approval_id));
                    metadata
                },
            };
            pending = Some(approval);
            result
        } else {
            self.execute(&plan)
        };

        if !self.registry.adapt(&mut state, event, &result) {
            self.feedback.adapt(&mut state, &result);
        }

        // A pending action never touches the twin: the gated event's payload
        // is applied by its synthesized `<stem>.completed` follow-up instead.
        if event.domain() == "os.robotics" && pending.is_none() {
            let twin = RobotTwin::from_state(&state).apply_event(event);
            twin.write_into_state(&mut state);
        }

        // Persist the completed action only for executed work; a plan parked
        // behind an approval reaches the log via its synthesized follow-up.
        if pending.is_none() {
            let completed = CompletedAction {
                action_id: Uuid::new_v4().to_string(),
                decision_id: event.event_id.clone(),
                action_type: plan.action_type.clone(),
                domain: plan.domain.clone(),
                priority: plan.priority,
                value_score: assessment.score,
                expected_impact: plan.expected_impact,
                observed_impact: result.observed_impact,
                success: result.success,
                violations: assessment.violations.clone(),
                rationale: plan.rationale.clone(),
                metadata: result.metadata.clone(),
                completed_at: Utc::now(),
            };
            self.store.append_action(&completed)?;
            push_ring(
                &mut state,
                "action_history",
                serde_json::to_value(&completed)?,
            );
        }

        let cci_after = self.coherence.reading_from_store(&self.store)?;
        let snapshot = CciSnapshot {
            ts: Utc::now(),
            cci: cci_after.cci,
            components: cci_after.components,
        };
        self.store.append_cci_snapshot(&snapshot)?;
        push_ring(&mut state, "cci_history", serde_json::to_value(&snapshot)?);

        self.store.save_state(&state, version)?;

        let final_item = self.transcript.append(
            &self.store,
            TranscriptKind::StateUpdated,
            None,
            &json!({
                "event_id": event.event_id,
                "action_type": plan.action_type,
            }),
            &correlation_id,
            Some(&event.event_id),
        )?;

        Ok(self.build_response(event, &correlation_id, &assessment, &cci_after, &plan, &result, pending, &state, final_item))
    }

    async fn deliberate(
        &self,
        event: &PceEvent,
        state: &mut JsonMap,
        assessment: &ValueAssessment,
        cci: &CciReading,
    ) -> ActionPlan {
        let outcome = self
            .registry
            .deliberate(event, state, assessment, cci)
            .await;
        if let Some(plan) = outcome.plan {
            return plan;
        }

        let mut plan = if outcome.plugin_name.is_none() && event.event_type.starts_with("feedback.")
        {
            self.decision.observe_plan(event.domain())
        } else {
            let mut plan = self.decision.deliberate(state, assessment.score, cci);
            plan.domain = event.domain().to_string();
            plan
        };
        if let Some(error) = outcome.plugin_error {
            let de = plan.explain_section_mut("de");
            de.insert("override_reason".into(), json!("plugin_error"));
            de.insert("plugin_error".into(), json!(error));
        }
        plan
    }

    /// Action Orchestrator: execute a non-gated plan synchronously.
    fn execute(&self, plan: &ActionPlan) -> ExecutionResult {
        let mut metadata = JsonMap::new();
        metadata.insert("executed_at".into(), json!(Utc::now()));
        metadata.insert("priority".into(), json!(plan.priority));

        // Emitted actions (adapter-facing payloads) have no local probe;
        // expected impact stands in for the observed one.
        if let Some(action_payload) = plan.metadata.get("action_payload") {
            metadata.insert("action_payload".into(), action_payload.clone());
            metadata.insert("execution_mode".into(), json!("emitted"));
            return ExecutionResult {
                action_type: plan.action_type.clone(),
                success: true,
                observed_impact: plan.expected_impact,
                notes: plan.rationale.clone(),
                metadata,
            };
        }

        let success = plan.action_type != "collect_more_data";
        ExecutionResult {
            action_type: plan.action_type.clone(),
            success,
            observed_impact: if success { 0.8 } else { 0.3 },
            notes: plan.rationale.clone(),
            metadata,
        }
    }

    fn drain_agent_transcript(
        &self,
        plan: &mut ActionPlan,
        correlation_id: &str,
        decision_id: &str,
    ) -> PceResult<()> {
        let entries = plan
            .explain_mut()
            .remove("agent_transcript")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        for entry in &entries {
            let kind = entry
                .get("kind")
                .and_then(Value::as_str)
                .and_then(TranscriptKind::parse)
                .unwrap_or(TranscriptKind::AgentMessage);
            let agent = entry.get("agent").and_then(Value::as_str);
            let payload = entry.get("payload").cloned().unwrap_or(Value::Null);
            self.transcript.append(
                &self.store,
                kind,
                agent,
                &payload,
                correlation_id,
                Some(decision_id),
            )?;
        }
        if !entries.is_empty() {
            plan.explain_mut()
                .insert("agent_transcript_len".into(), json!(entries.len()));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_response(
        &self,
        event: &PceEvent,
        correlation_id: &str,
        assessment: &ValueAssessment,
        cci: &CciReading,
        plan: &ActionPlan,
        result: &ExecutionResult,
        pending: Option<PendingApproval>,
        state: &JsonMap,
        final_item: TranscriptItem,
    ) -> PipelineResponse {
        let action = plan
            .metadata
            .get("action_payload")
            .cloned()
            .unwrap_or_else(|| json!(plan.action_type));

        let mut response = PipelineResponse {
            event_id: event.event_id.clone(),
            correlation_id: correlation_id.to_string(),
            value_score: assessment.score,
            cci: cci.cci,
            cci_components: cci.components,
            action_type: plan.action_type.clone(),
            action,
            metadata: plan.metadata.clone(),
            success: result.success,
            cursor: final_item.cursor,
            requires_approval: None,
            approval_id: None,
            epsilon: None,
            q_update: None,
            assistant_learning: None,
            updated: None,
        };

        if let Some(approval) = pending {
            response.requires_approval = Some(true);
            response.approval_id = Some(approval.approval_id);
        }

        if event.event_type.starts_with("feedback.") {
            let q_update = if event.domain() == "robotics" {
                state.get("robotics_rl").cloned()
            } else {
                None
            };
            let assistant_learning = if event.domain() == "assistant" {
                state.get("assistant_learning").cloned()
            } else {
                None
            };
            response.updated = Some(q_update.is_some() || assistant_learning.is_some());
            response.epsilon = q_update
                .as_ref()
                .and_then(|q| q.get("epsilon"))
                .and_then(Value::as_f64)
                .or_else(|| {
                    assistant_learning
                        .as_ref()
                        .and_then(|l| l.get("epsilon"))
                        .and_then(Value::as_f64)
                });
            response.q_update = q_update;
            response.assistant_learning = assistant_learning;
        }

        response
    }

    // ------------------------------------------------------------------
    // Approvals (control plane)
    // ------------------------------------------------------------------

    pub fn list_approvals(&self) -> PceResult<Vec<PendingApproval>> {
        self.store.list_approvals()
    }

    pub fn pending_approvals(&self) -> PceResult<Vec<PendingApproval>> {
        self.store.pending_approvals()
    }

    pub async fn approve(
        &self,
        approval_id: &str,
        actor: &str,
        notes: &str,
    ) -> PceResult<PipelineResponse> {
        let _guard = self.writer.lock().await;
        let approval = self.store.get_approval(approval_id)?;
        let (state, _) = self.store.load_state()?;
        let twin = RobotTwin::from_state(&state);
        let resolved = self
            .gate
            .approve(&approval, actor, notes, twin.budget_remaining)?;
        self.finish_resolution(resolved).await
    }

    pub async fn reject(
        &self,
        approval_id: &str,
        actor: &str,
        reason: &str,
    ) -> PceResult<PipelineResponse> {
        let _guard = self.writer.lock().await;
        let approval = self.store.get_approval(approval_id)?;
        let resolved = self.gate.reject(&approval, actor, reason)?;
        self.finish_resolution(resolved).await
    }

    pub async fn override_approval(
        &self,
        approval_id: &str,
        actor: &str,
        notes: &str,
    ) -> PceResult<PipelineResponse> {
        let _guard = self.writer.lock().await;
        let approval = self.store.get_approval(approval_id)?;
        let resolved = self.gate.override_approve(&approval, actor, notes)?;
        self.finish_resolution(resolved).await
    }

    /// Persist a terminal resolution, snapshot coherence, then run the
    /// synthesized follow-up event through the pipeline (writer lock is
    /// already held by the caller).
    async fn finish_resolution(&self, resolved: PendingApproval) -> PceResult<PipelineResponse> {
        self.store.update_approval(&resolved)?;
        let correlation_id = resolved
            .metadata
            .get("correlation_id")
            .and_then(Value::as_str)
            .unwrap_or(&resolved.decision_id)
            .to_string();
        self.transcript.append(
            &self.store,
            TranscriptKind::ApprovalUpdated,
            None,
            &serde_json::to_value(&resolved)?,
            &correlation_id,
            Some(&resolved.decision_id),
        )?;
        self.snapshot_coherence()?;

        info!(
            approval_id = %resolved.approval_id,
            status = resolved.status.as_str(),
            actor = resolved.actor.as_deref().unwrap_or(""),
            "approval resolved"
        );

        match ApprovalGate::follow_up_envelope(&resolved) {
            Some(raw) => {
                let event = self.validator.ingest(&raw)?;
                self.run_with_retry(event).await
            }
            None => Err(PceError::ApprovalAlreadyTerminal(resolved.approval_id)),
        }
    }

    fn snapshot_coherence(&self) -> PceResult<CciReading> {
        let reading = self.coherence.reading_from_store(&self.store)?;
        self.store.append_cci_snapshot(&CciSnapshot {
            ts: Utc::now(),
            cci: reading.cci,
            components: reading.components,
        })?;
        Ok(reading)
    }

    /// Boot-time sweep: runs before ingress so stale pendings are terminal
    /// before any new follow-up event can be synthesized.
    fn boot_sweep(&self) -> PceResult<Vec<PendingApproval>> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for approval in self.store.pending_approvals()? {
            if let Some(resolved) = self.gate.expire_if_due(&approval, now) {
                self.store.update_approval(&resolved)?;
                self.transcript.append(
                    &self.store,
                    TranscriptKind::ApprovalUpdated,
                    None,
                    &serde_json::to_value(&resolved)?,
                    &resolved.decision_id.clone(),
                    Some(&resolved.decision_id),
                )?;
                self.snapshot_coherence()?;
                expired.push(resolved);
            }
        }
        Ok(expired)
    }

    /// Periodic TTL sweep. Moves only `pending` items whose TTL elapsed.
    pub async fn sweep_expired(&self) -> PceResult<Vec<PendingApproval>> {
        let _guard = self.writer.lock().await;
        self.boot_sweep()
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    pub fn state_snapshot(&self) -> PceResult<JsonMap> {
        Ok(self.store.load_state()?.0)
    }

    pub fn cci_reading(&self) -> PceResult<CciReading> {
        self.coherence.reading_from_store(&self.store)
    }

    pub fn cci_history(&self) -> PceResult<Vec<CciSnapshot>> {
        self.store.cci_history()
    }

    pub fn transcript_since(&self, since: i64) -> PceResult<Vec<TranscriptItem>> {
        self.store.transcript_since(since)
    }

    pub fn transcript_cursor(&self) -> PceResult<i64> {
        self.store.transcript_cursor()
    }

    pub fn robotics_twin(&self) -> PceResult<RobotTwin> {
        Ok(RobotTwin::from_state(&self.store.load_state()?.0))
    }

    pub fn os_state(&self, audit_limit: usize) -> PceResult<OsStateView> {
        let (state, _) = self.store.load_state()?;
        let twin = RobotTwin::from_state(&state);
        let cci = self.coherence.reading_from_store(&self.store)?;
        let approvals = self.store.list_approvals()?;

        let total = approvals.len();
        let approved = approvals
            .iter()
            .filter(|a| {
                matches!(
                    a.status,
                    ApprovalStatus::Approved | ApprovalStatus::Overridden
                )
            })
            .count();
        let pending_count = approvals.iter().filter(|a| a.is_pending()).count();

        let actual_purchase_spend: f64 = twin
            .purchase_history
            .iter()
            .filter_map(|p| p.get("total_cost").and_then(Value::as_f64))
            .sum();

        Ok(OsStateView {
            twin_snapshot: serde_json::to_value(&twin)?,
            os_metrics: json!({
                "budget_remaining": twin.budget_remaining,
                "risk_level": twin.risk_level,
                "projected_vs_actual": {
                    "projected_cost": twin.cost_projection.projected_total_cost,
                    "actual_purchase_spend": actual_purchase_spend,
                },
                "approval_rate": if total > 0 { approved as f64 / total as f64 } else { 0.0 },
                "cci": cci.cci,
            }),
            policy_state: json!({
                "pending_count": pending_count,
                "resolved_count": total - pending_count,
                "transcript_cursor": self.store.transcript_cursor()?,
            }),
            last_n_audit_trail: audit_tail(&twin, audit_limit),
        })
    }

    // ------------------------------------------------------------------
    // Control endpoints
    // ------------------------------------------------------------------

    pub async fn clear_assistant_memory(&self) -> PceResult<Value> {
        let _guard = self.writer.lock().await;
        let (mut state, version) = self.store.load_state()?;
        let had_sessions = state
            .get("assistant")
            .and_then(Value::as_object)
            .and_then(|a| a.get("sessions"))
            .and_then(Value::as_object)
            .map(|s| s.len())
            .unwrap_or(0);
        assistant_memory::clear(&mut state, &self.config.assistant);
        self.store.save_state(&state, version)?;
        Ok(json!({
            "status": "cleared",
            "deleted": had_sessions,
            "epsilon": self.config.assistant.epsilon_start,
        }))
    }

    /// Rover control surface: start/stop/reset/reset_stats/clear_policy.
    pub async fn rover_control(&self, command: &str) -> PceResult<Value> {
        let _guard = self.writer.lock().await;
        let (mut state, version) = self.store.load_state()?;

        let response = match command {
            "start" | "stop" => {
                let running = command == "start";
                let robotics = crate::isi::slice_mut(&mut state, "robotics");
                let entry = robotics
                    .entry("runtime".to_string())
                    .or_insert_with(|| Value::Object(JsonMap::new()));
                if let Some(runtime) = entry.as_object_mut() {
                    runtime.insert("running".into(), json!(running));
                }
                json!({"status": if running { "started" } else { "stopped" }})
            }
            "reset" => {
                crate::isi::slice_mut(&mut state, "robotics").remove("episodes");
                state.insert("robotics_rl".into(), Value::Object(JsonMap::new()));
                json!({"status": "reset"})
            }
            "reset_stats" => {
                let robotics = crate::isi::slice_mut(&mut state, "robotics");
                robotics.remove("stats");
                if let Some(episodes) = robotics.get_mut("episodes").and_then(Value::as_object_mut)
                {
                    for episode in episodes.values_mut() {
                        if let Some(episode) = episode.as_object_mut() {
                            episode.remove("episode_stats");
                        }
                    }
                }
                json!({"status": "stats_reset"})
            }
            "clear_policy" => {
                let robotics = crate::isi::slice_mut(&mut state, "robotics");
                robotics.remove("q_table");
                robotics.remove("episodes");
                robotics.remove("stats");
                robotics.insert("params".into(), Value::Object(rl::default_hyperparams()));
                json!({
                    "status": "cleared",
                    "defaults": Value::Object(rl::default_hyperparams()),
                })
            }
            other => {
                return Err(PceError::InvalidSchema(format!(
                    "unknown rover control {:?}",
                    other
                )))
            }
        };

        self.store.save_state(&state, version)?;
        Ok(response)
    }
}

fn push_ring(state: &mut JsonMap, key: &str, item: Value) {
    let mut ring = state
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    ring.push(item);
    if ring.len() > SNAPSHOT_RING_LIMIT {
        let excess = ring.len() - SNAPSHOT_RING_LIMIT;
        ring.drain(0..excess);
    }
    state.insert(key.to_string(), Value::Array(ring));
}
