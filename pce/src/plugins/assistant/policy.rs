//! Epsilon-greedy decoding-profile bandit for the assistant.
//!
//! Four discrete profiles (P0 conservative .. P2 exploratory, P3 balanced)
//! are selected per turn; feedback events update the per-profile reward
//! averages and decay epsilon toward its floor. A deterministic safety
//! override replaces the bandit choice with P0 when value or coherence
//! drops under the configured floors.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::AssistantConfig;
use crate::llm::Decoding;
use crate::types::PceEvent;
use serde_json::Value;

pub const PROFILE_IDS: [&str; 4] = ["P0", "P1", "P2", "P3"];

pub fn profile_decoding(profile_id: &str) -> Decoding {
    match profile_id {
        "P0" => Decoding {
            temperature: 0.2,
            top_p: 0.8,
            presence_penalty: 0.0,
        },
        "P1" => Decoding {
            temperature: 0.7,
            top_p: 0.9,
            presence_penalty: 0.1,
        },
        "P2" => Decoding {
            temperature: 0.9,
            top_p: 0.95,
            presence_penalty: 0.2,
        },
        _ => Decoding {
            temperature: 0.4,
            top_p: 0.9,
            presence_penalty: 0.0,
        },
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileStats {
    pub count: u64,
    pub avg_reward: f64,
}

/// Persisted bandit state, stored in the `assistant.policy` slice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyState {
    pub epsilon: f64,
    pub feedback_count: u64,
    pub selected_profile: String,
    pub profiles: BTreeMap<String, ProfileStats>,
}

impl PolicyState {
    pub fn baseline(config: &AssistantConfig) -> Self {
        Self {
            epsilon: config.epsilon_start,
            feedback_count: 0,
            selected_profile: "P3".to_string(),
            profiles: PROFILE_IDS
                .iter()
                .map(|id| (id.to_string(), ProfileStats::default()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyChoice {
    pub profile_id: String,
    pub mode: &'static str,
    pub epsilon: f64,
    pub decoding: Decoding,
}

/// Epsilon-greedy selection over the profile set.
pub fn choose_profile<R: Rng>(policy: &PolicyState, rng: &mut R) -> PolicyChoice {
    let epsilon = policy.epsilon;
    let (profile_id, mode) = if rng.gen::<f64>() < epsilon {
        let index = rng.gen_range(0..PROFILE_IDS.len());
        (PROFILE_IDS[index].to_string(), "explore")
    } else {
        let best = PROFILE_IDS
            .iter()
            .max_by(|a, b| {
                let reward = |id: &str| {
                    policy
                        .profiles
                        .get(id)
                        .map(|s| s.avg_reward)
                        .unwrap_or(0.0)
                };
                reward(a)
                    .partial_cmp(&reward(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
            .unwrap_or("P3");
        (best.to_string(), "exploit")
    };

    PolicyChoice {
        decoding: profile_decoding(&profile_id),
        profile_id,
        mode,
        epsilon,
    }
}

/// Deterministic floor override. Returns the (possibly replaced) choice and
/// the override reason (`value_floor` / `cci_floor`) when it fired.
pub fn apply_floor_override(
    choice: PolicyChoice,
    value_score: f64,
    cci: f64,
    config: &AssistantConfig,
) -> (PolicyChoice, Option<&'static str>) {
    let reason = if value_score < config.value_floor {
        Some("value_floor")
    } else if cci < config.cci_floor {
        Some("cci_floor")
    } else {
        None
    };

    match reason {
        Some(reason) => {
            let safe = Decoding {
                temperature: 0.2,
                top_p: 0.8,
                presence_penalty: 0.0,
            };
            (
                PolicyChoice {
                    profile_id: "P0".to_string(),
                    mode: "override_safe",
                    epsilon: choice.epsilon,
                    decoding: safe,
                },
                Some(reason),
            )
        }
        None => (choice, None),
    }
}

/// Normalize the accepted feedback contracts (`reward`, `rating`,
/// `accepted`) into [-1, 1].
pub fn reward_from_feedback(event: &PceEvent) -> f64 {
    if let Some(reward) = event.payload_f64("reward") {
        return reward.clamp(-1.0, 1.0);
    }
    if let Some(rating) = event.payload.get("rating").and_then(Value::as_i64) {
        return ((rating as f64 - 3.0) / 2.0).clamp(-1.0, 1.0);
    }
    if let Some(accepted) = event.payload.get("accepted").and_then(Value::as_bool) {
        return if accepted { 1.0 } else { -1.0 };
    }
    0.0
}

/// Update profile stats with one reward and decay epsilon toward the floor.
pub fn update_policy(
    policy: &PolicyState,
    profile_id: &str,
    reward: f64,
    config: &AssistantConfig,
) -> PolicyState {
    let mut next = policy.clone();
    let stats = next.profiles.entry(profile_id.to_string()).or_default();
    stats.count += 1;
    stats.avg_reward += (reward - stats.avg_reward) / stats.count as f64;

    next.epsilon = (policy.epsilon * config.epsilon_decay).max(config.epsilon_min);
    next.feedback_count += 1;
    next.selected_profile = profile_id.to_string();
    next
}
