//! Assistant domain plugins.
//!
//! Value model scores each observation against tactical values; the
//! decision plugin picks a decoding profile through the bandit, asks the
//! LLM for a reply (falling back on any provider failure), and hands the
//! per-session decision metadata to the adaptation plugin, which learns
//! from feedback events.

pub mod memory;
pub mod policy;

use std::sync::Arc;

use async_trait::async_trait;
use rand::thread_rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::AssistantConfig;
use crate::error::PceResult;
use crate::llm::{sanitize_excerpt, ChatMessage, OpenRouterClient};
use crate::plugins::{AdaptationPlugin, DecisionPlugin, ValueModelPlugin};
use crate::types::{ActionPlan, CciReading, ExecutionResult, JsonMap, PceEvent};
use crate::vel::ValueAssessment;

const FALLBACK_REPLY: &str =
    "Assistant reply unavailable: check OPENROUTER_API_KEY/OPENROUTER_MODEL configuration.";

fn is_assistant(event: &PceEvent) -> bool {
    event.domain() == "assistant"
}

// ---------------------------------------------------------------------------
// Value model
// ---------------------------------------------------------------------------

pub struct AssistantValueModel;

impl AssistantValueModel {
    fn components(event: &PceEvent, state: &JsonMap) -> JsonMap {
        let text = event.payload_str("text").unwrap_or_default();
        let text_len = text.chars().count();
        let lowered = text.to_lowercase();

        let safety = if ["hack", "exploit", "malware"]
            .iter()
            .any(|token| lowered.contains(token))
        {
            0.2
        } else {
            1.0
        };
        let efficiency = if text_len <= 600 {
            1.0
        } else if text_len <= 1400 {
            0.7
        } else {
            0.4
        };
        let helpfulness = if text_len >= 8 { 0.8 } else { 0.4 };
        let long_term_coherence = state
            .get("strategic_values")
            .and_then(Value::as_object)
            .and_then(|v| v.get("long_term_coherence"))
            .and_then(Value::as_f64)
            .unwrap_or(0.8)
            .clamp(0.0, 1.0);

        let mut components = JsonMap::new();
        components.insert("safety".into(), json!(safety));
        components.insert("efficiency".into(), json!(efficiency));
        components.insert("long_term_coherence".into(), json!(long_term_coherence));
        components.insert("helpfulness".into(), json!(helpfulness));
        components
    }
}

impl ValueModelPlugin for AssistantValueModel {
    fn name(&self) -> &'static str {
        "assistant.value"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap) -> bool {
        is_assistant(event)
    }

    fn evaluate(&self, event: &PceEvent, state: &JsonMap) -> PceResult<ValueAssessment> {
        let components = Self::components(event, state);
        let pick = |key: &str| components.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let score = 0.35 * pick("safety")
            + 0.20 * pick("efficiency")
            + 0.20 * pick("long_term_coherence")
            + 0.25 * pick("helpfulness");

        let mut assessment = ValueAssessment::new(score);
        if pick("safety") < 0.5 {
            assessment.violations.push("safety".to_string());
        }
        assessment.components = Some(components);
        Ok(assessment)
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

pub struct AssistantDecisionPlugin {
    llm: Arc<OpenRouterClient>,
    config: AssistantConfig,
}

impl AssistantDecisionPlugin {
    pub fn new(llm: Arc<OpenRouterClient>, config: AssistantConfig) -> Self {
        Self { llm, config }
    }

    fn build_messages(
        user_text: &str,
        memory: &memory::SessionMemory,
        state: &JsonMap,
    ) -> Vec<ChatMessage> {
        let pref_section = if memory.preferences.is_empty() {
            "- none".to_string()
        } else {
            memory
                .preferences
                .iter()
                .take(10)
                .map(|p| format!("- {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let avoid_section = if memory.avoid.is_empty() {
            "- none".to_string()
        } else {
            memory
                .avoid
                .iter()
                .take(10)
                .map(|p| format!("- {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let strategic_section = state
            .get("strategic_values")
            .and_then(Value::as_object)
            .map(|values| {
                values
                    .iter()
                    .take(8)
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "none".to_string());

        let mut messages = vec![
            ChatMessage::system(format!(
                "You are a helpful, safe, objective assistant. Answer in markdown.\n\
                 Known preferences:\n{pref_section}\n\
                 Things to avoid:\n{avoid_section}\n\
                 Strategic goals: {strategic_section}."
            )),
            ChatMessage::system("Internal rule: never expose hidden reasoning."),
        ];
        if !memory.summary.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Recent context summary (may be incomplete): {}",
                memory.summary
            )));
        }
        let bounded: String = user_text.chars().take(2000).collect();
        messages.push(ChatMessage::user(bounded));
        messages
    }

    fn prompt_hash(messages: &[ChatMessage]) -> String {
        let mut hasher = Sha256::new();
        for message in messages {
            hasher.update(message.role.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(message.content.as_bytes());
            hasher.update(b"\x1e");
        }
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl DecisionPlugin for AssistantDecisionPlugin {
    fn name(&self) -> &'static str {
        "assistant.decision"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap) -> bool {
        is_assistant(event) && event.event_type.starts_with("observation.assistant")
    }

    async fn deliberate(
        &self,
        event: &PceEvent,
        state: &mut JsonMap,
        assessment: &ValueAssessment,
        cci: &CciReading,
    ) -> PceResult<ActionPlan> {
        let session_id = event.session_id().unwrap_or("global").to_string();
        let user_text = event.payload_str("text").unwrap_or_default().to_string();

        let session = memory::session_memory(state, &session_id);
        let policy = memory::policy_state(state, &self.config);
        let bandit_choice = policy::choose_profile(&policy, &mut thread_rng());
        let bandit_profile = bandit_choice.profile_id.clone();
        let (choice, override_reason) =
            policy::apply_floor_override(bandit_choice, assessment.score, cci.cci, &self.config);

        let messages = Self::build_messages(&user_text, &session, state);
        let prompt_hash = Self::prompt_hash(&messages);

        let mut openrouter_error: Option<String> = None;
        let reply_text = match self.llm.generate_reply(&messages, &choice.decoding).await {
            Ok(reply) => reply,
            Err(err) => {
                openrouter_error = Some(sanitize_excerpt(&err.to_string()));
                FALLBACK_REPLY.to_string()
            }
        };

        memory::append_session_message(state, &session_id, "user", &user_text);
        memory::append_session_message(state, &session_id, "assistant", &reply_text);
        memory::set_pending_feedback(
            state,
            &session_id,
            json!({
                "profile_id": choice.profile_id,
                "epsilon": choice.epsilon,
                "value_score": assessment.score,
                "cci": cci.cci,
                "ts": event.ts,
            }),
        );

        info!(
            session_id = %session_id,
            profile = %choice.profile_id,
            mode = choice.mode,
            epsilon = choice.epsilon,
            reply_len = reply_text.chars().count(),
            "assistant decision"
        );

        let mut plan = ActionPlan::new(
            "assistant.action",
            2,
            format!(
                "assistant profile={} mode={} epsilon={:.4}",
                choice.profile_id, choice.mode, choice.epsilon
            ),
        );
        plan.domain = "assistant".into();
        plan.expected_impact = (0.55 * assessment.score + 0.45 * cci.cci).clamp(0.0, 1.0);
        plan.metadata.insert(
            "action_payload".into(),
            json!({
                "type": "assistant.reply",
                "text": reply_text,
                "format": "markdown",
            }),
        );

        let de = plan.explain_section_mut("de");
        de.insert("selected_by_bandit".into(), json!(bandit_profile));
        de.insert("final_profile".into(), json!(choice.profile_id));
        de.insert(
            "override_reason".into(),
            override_reason.map(|r| json!(r)).unwrap_or(Value::Null),
        );
        de.insert("prompt_hash".into(), json!(prompt_hash));
        de.insert(
            "final_decoding".into(),
            serde_json::to_value(&choice.decoding)?,
        );
        de.insert("epsilon".into(), json!(choice.epsilon));
        de.insert("mode".into(), json!(choice.mode));
        de.insert("model".into(), json!(self.llm.model()));
        de.insert("avoid_hints".into(), json!(session.avoid));
        if let Some(reason) = openrouter_error {
            de.insert("openrouter_error".into(), json!(reason));
        }

        let isi = plan.explain_section_mut("isi");
        isi.insert(
            "memory_used".into(),
            json!({
                "has_summary": !session.summary.is_empty(),
                "msgs": session.last_messages.len(),
                "prefs": session.preferences.len(),
                "avoid": session.avoid.len(),
            }),
        );

        if let Some(components) = &assessment.components {
            let vel = plan.explain_section_mut("vel");
            vel.insert("value_score".into(), json!(assessment.score));
            vel.insert("components".into(), Value::Object(components.clone()));
        }

        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Adaptation
// ---------------------------------------------------------------------------

pub struct AssistantAdaptationPlugin {
    config: AssistantConfig,
}

impl AssistantAdaptationPlugin {
    pub fn new(config: AssistantConfig) -> Self {
        Self { config }
    }
}

impl AdaptationPlugin for AssistantAdaptationPlugin {
    fn name(&self) -> &'static str {
        "assistant.adaptation"
    }

    fn matches(&self, event: &PceEvent, _state: &JsonMap, _result: &ExecutionResult) -> bool {
        is_assistant(event) && event.event_type.starts_with("feedback.assistant")
    }

    fn adapt(
        &self,
        state: &mut JsonMap,
        event: &PceEvent,
        _result: &ExecutionResult,
    ) -> PceResult<()> {
        let Some(session_id) = event.session_id().map(str::to_string) else {
            return Ok(());
        };

        let reward = policy::reward_from_feedback(event);
        let pending = memory::take_pending_feedback(state, &session_id).unwrap_or_default();
        let profile_id = pending
            .get("profile_id")
            .and_then(Value::as_str)
            .unwrap_or("P3")
            .to_string();

        let current = memory::policy_state(state, &self.config);
        let updated = policy::update_policy(&current, &profile_id, reward, &self.config);
        memory::save_policy_state(state, &updated);

        let window = memory::push_reward(state, reward);
        let metrics = memory::save_metrics(state, &window);

        let notes = event.payload_str("notes").unwrap_or_default().to_string();
        let mut wrote_preference = false;
        let mut wrote_avoid = false;
        if !notes.trim().is_empty() {
            if reward > 0.0 {
                memory::add_preference(state, &session_id, &notes);
                wrote_preference = true;
            } else if reward < 0.0 {
                memory::add_avoid(state, &session_id, &notes);
                wrote_avoid = true;
            }
        }

        let profile_stats = updated
            .profiles
            .get(&profile_id)
            .cloned()
            .unwrap_or_default();

        info!(
            session_id = %session_id,
            reward,
            profile = %profile_id,
            epsilon = updated.epsilon,
            wrote_preference,
            wrote_avoid,
            "assistant feedback applied"
        );

        state.insert(
            "assistant_learning".into(),
            json!({
                "updated": true,
                "epsilon": updated.epsilon,
                "count_feedbacks": metrics.get("count_feedbacks").cloned().unwrap_or(json!(0.0)),
                "avg_reward": metrics.get("avg_reward").cloned().unwrap_or(json!(0.0)),
                "success_rate": metrics.get("success_rate").cloned().unwrap_or(json!(0.0)),
                "afs_explain": {
                    "updated": true,
                    "reward": reward,
                    "profile_stats": {
                        "profile_id": profile_id,
                        "count": profile_stats.count,
                        "avg_reward": profile_stats.avg_reward,
                    },
                    "wrote_preference": wrote_preference,
                    "wrote_avoid": wrote_avoid,
                },
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenRouterConfig;
    use chrono::Utc;

    fn event(event_type: &str, payload: Value) -> PceEvent {
        PceEvent {
            event_id: "e-1".into(),
            event_type: event_type.into(),
            source: "ui".into(),
            ts: Utc::now(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }

    fn decision_plugin() -> AssistantDecisionPlugin {
        let llm = Arc::new(
            OpenRouterClient::new(OpenRouterConfig::default()).expect("client"),
        );
        AssistantDecisionPlugin::new(llm, AssistantConfig::default())
    }

    fn neutral_cci() -> CciReading {
        CciReading {
            cci: 0.8,
            components: None,
        }
    }

    #[test]
    fn unsafe_text_drops_the_safety_component() {
        let model = AssistantValueModel;
        // Short and unsafe: safety 0.2 and helpfulness 0.4 put the score
        // under the default value floor.
        let unsafe_event = event(
            "observation.assistant.v1",
            json!({"domain": "assistant", "text": "hack"}),
        );
        let assessment = model.evaluate(&unsafe_event, &JsonMap::new()).expect("eval");
        assert!(assessment.score < 0.55);
        assert!(assessment.violations.contains(&"safety".to_string()));

        let benign = event(
            "observation.assistant.v1",
            json!({"domain": "assistant", "text": "summarize this document"}),
        );
        let assessment = model.evaluate(&benign, &JsonMap::new()).expect("eval");
        assert!(assessment.score > 0.7);
        assert!(assessment.violations.is_empty());
    }

    #[tokio::test]
    async fn low_value_forces_p0_with_value_floor_reason() {
        let plugin = decision_plugin();
        let mut state = JsonMap::new();
        let observation = event(
            "observation.assistant.v1",
            json!({"domain": "assistant", "session_id": "s1", "text": "hello"}),
        );
        let plan = plugin
            .deliberate(
                &observation,
                &mut state,
                &ValueAssessment::new(0.2),
                &neutral_cci(),
            )
            .await
            .expect("plan");

        let de = plan.metadata["explain"]["de"].as_object().expect("de");
        assert_eq!(de["final_profile"], json!("P0"));
        assert_eq!(de["override_reason"], json!("value_floor"));
        assert!(de.get("prompt_hash").and_then(Value::as_str).is_some());
        // No API key configured: the fallback reply carries a recorded reason.
        assert!(de.get("openrouter_error").is_some());
        assert_eq!(
            plan.metadata["action_payload"]["type"],
            json!("assistant.reply")
        );
    }

    #[tokio::test]
    async fn cci_floor_reason_when_value_is_healthy() {
        let plugin = decision_plugin();
        let mut state = JsonMap::new();
        let observation = event(
            "observation.assistant.v1",
            json!({"domain": "assistant", "session_id": "s1", "text": "hello"}),
        );
        let plan = plugin
            .deliberate(
                &observation,
                &mut state,
                &ValueAssessment::new(0.9),
                &CciReading {
                    cci: 0.1,
                    components: None,
                },
            )
            .await
            .expect("plan");
        let de = plan.metadata["explain"]["de"].as_object().expect("de");
        assert_eq!(de["override_reason"], json!("cci_floor"));
    }

    #[tokio::test]
    async fn avoid_notes_surface_on_the_next_turn() {
        let adaptation = AssistantAdaptationPlugin::new(AssistantConfig::default());
        let mut state = JsonMap::new();

        let feedback = event(
            "feedback.assistant.v1",
            json!({
                "domain": "assistant", "session_id": "s1",
                "reward": -1.0, "notes": "não seja prolixo"
            }),
        );
        adaptation
            .adapt(
                &mut state,
                &feedback,
                &ExecutionResult {
                    action_type: "feedback.assistant.v1".into(),
                    success: true,
                    observed_impact: -1.0,
                    notes: String::new(),
                    metadata: JsonMap::new(),
                },
            )
            .expect("adapt");

        let learning = state["assistant_learning"].as_object().expect("learning");
        assert_eq!(learning["afs_explain"]["wrote_avoid"], json!(true));

        let plugin = decision_plugin();
        let observation = event(
            "observation.assistant.v1",
            json!({"domain": "assistant", "session_id": "s1", "text": "explique de novo"}),
        );
        let plan = plugin
            .deliberate(
                &observation,
                &mut state,
                &ValueAssessment::new(0.8),
                &neutral_cci(),
            )
            .await
            .expect("plan");
        let hints = plan.metadata["explain"]["de"]["avoid_hints"]
            .as_array()
            .expect("hints");
        assert!(hints.iter().any(|h| h == "não seja prolixo"));
    }

    #[tokio::test]
    async fn feedback_decays_epsilon_and_tracks_profile_stats() {
        let config = AssistantConfig::default();
        let adaptation = AssistantAdaptationPlugin::new(config);
        let mut state = JsonMap::new();
        memory::set_pending_feedback(&mut state, "s1", json!({"profile_id": "P1"}));

        let feedback = event(
            "feedback.assistant.v1",
            json!({"domain": "assistant", "session_id": "s1", "reward": 1.0}),
        );
        adaptation
            .adapt(
                &mut state,
                &feedback,
                &ExecutionResult {
                    action_type: "feedback.assistant.v1".into(),
                    success: true,
                    observed_impact: 1.0,
                    notes: String::new(),
                    metadata: JsonMap::new(),
                },
            )
            .expect("adapt");

        let policy = memory::policy_state(&state, &config);
        assert!((policy.epsilon - config.epsilon_start * config.epsilon_decay).abs() < 1e-12);
        let stats = policy.profiles.get("P1").expect("stats");
        assert_eq!(stats.count, 1);
        assert!((stats.avg_reward - 1.0).abs() < 1e-12);
    }
}
