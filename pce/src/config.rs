//! Runtime configuration.
//!
//! Resolution order per field: environment variable > JSON config file >
//! built-in default. The file is optional so the engine can boot with pure
//! defaults and emit controlled fallbacks (e.g. for a missing OpenRouter
//! key) instead of refusing to start.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PceError, PceResult};

pub const DEFAULT_CONFIG_PATH: &str = "pce_config.json";
pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_OPENROUTER_MODEL: &str = "meta-llama/llama-3.2-3b-instruct:free";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PceConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_state_db_path")]
    pub state_db_path: PathBuf,
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
    #[serde(default)]
    pub cci: CciConfig,
    #[serde(default)]
    pub approvals: ApprovalsConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
}

impl Default for PceConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            state_db_path: default_state_db_path(),
            openrouter: OpenRouterConfig::default(),
            cci: CciConfig::default(),
            approvals: ApprovalsConfig::default(),
            assistant: AssistantConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenRouterConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openrouter_model")]
    pub model: String,
    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,
    #[serde(default = "default_openrouter_timeout_s")]
    pub timeout_s: f64,
    #[serde(default)]
    pub http_referer: String,
    #[serde(default = "default_openrouter_title")]
    pub x_title: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_openrouter_model(),
            base_url: default_openrouter_base_url(),
            timeout_s: default_openrouter_timeout_s(),
            http_referer: String::new(),
            x_title: default_openrouter_title(),
        }
    }
}

/// Fixed aggregation weights for the coherence index. Documented values;
/// they do not drift at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CciWeights {
    #[serde(default = "default_weight_consistency")]
    pub consistency: f64,
    #[serde(default = "default_weight_stability")]
    pub stability: f64,
    #[serde(default = "default_weight_non_contradiction")]
    pub non_contradiction: f64,
    #[serde(default = "default_weight_predictive")]
    pub predictive_accuracy: f64,
}

impl Default for CciWeights {
    fn default() -> Self {
        Self {
            consistency: default_weight_consistency(),
            stability: default_weight_stability(),
            non_contradiction: default_weight_non_contradiction(),
            predictive_accuracy: default_weight_predictive(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CciConfig {
    #[serde(default = "default_cci_window")]
    pub window: usize,
    #[serde(default)]
    pub weights: CciWeights,
}

impl Default for CciConfig {
    fn default() -> Self {
        Self {
            window: default_cci_window(),
            weights: CciWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ApprovalsConfig {
    #[serde(default = "default_approval_ttl_seconds")]
    pub ttl_seconds: i64,
    #[serde(default = "default_approval_sweep_interval_s")]
    pub sweep_interval_s: u64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_approval_ttl_seconds(),
            sweep_interval_s: default_approval_sweep_interval_s(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AssistantConfig {
    #[serde(default = "default_value_floor")]
    pub value_floor: f64,
    #[serde(default = "default_cci_floor")]
    pub cci_floor: f64,
    #[serde(default = "default_epsilon_start")]
    pub epsilon_start: f64,
    #[serde(default = "default_epsilon_min")]
    pub epsilon_min: f64,
    #[serde(default = "default_epsilon_decay")]
    pub epsilon_decay: f64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            value_floor: default_value_floor(),
            cci_floor: default_cci_floor(),
            epsilon_start: default_epsilon_start(),
            epsilon_min: default_epsilon_min(),
            epsilon_decay: default_epsilon_decay(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}
fn default_state_db_path() -> PathBuf {
    PathBuf::from("pce_state.db")
}
fn default_openrouter_model() -> String {
    DEFAULT_OPENROUTER_MODEL.to_string()
}
fn default_openrouter_base_url() -> String {
    DEFAULT_OPENROUTER_BASE_URL.to_string()
}
fn default_openrouter_timeout_s() -> f64 {
    12.0
}
fn default_openrouter_title() -> String {
    "pce-engine".to_string()
}
fn default_cci_window() -> usize {
    50
}
fn default_weight_consistency() -> f64 {
    0.35
}
fn default_weight_stability() -> f64 {
    0.25
}
fn default_weight_non_contradiction() -> f64 {
    0.25
}
fn default_weight_predictive() -> f64 {
    0.15
}
fn default_approval_ttl_seconds() -> i64 {
    86_400
}
fn default_approval_sweep_interval_s() -> u64 {
    60
}
fn default_value_floor() -> f64 {
    0.55
}
fn default_cci_floor() -> f64 {
    0.45
}
fn default_epsilon_start() -> f64 {
    0.6
}
fn default_epsilon_min() -> f64 {
    0.05
}
fn default_epsilon_decay() -> f64 {
    0.92
}

impl PceConfig {
    /// Load from the process environment plus the optional JSON file named
    /// by `PCE_CONFIG_PATH` (default `pce_config.json`).
    pub fn load() -> PceResult<Self> {
        let path = env::var("PCE_CONFIG_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// Load from an explicit file path (tests, custom runners). A missing
    /// file yields defaults; a malformed file is a hard config error.
    pub fn load_from(path: &Path) -> PceResult<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| PceError::Config(format!("read {}: {}", path.display(), e)))?;
            serde_json::from_str::<PceConfig>(&raw)
                .map_err(|e| PceError::Config(format!("parse {}: {}", path.display(), e)))?
        } else {
            PceConfig::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> PceResult<()> {
        if let Some(raw) = env_field("PCE_API_PORT") {
            self.api_port = raw
                .parse()
                .map_err(|_| PceError::Config(format!("PCE_API_PORT: invalid port {:?}", raw)))?;
        }
        if let Some(raw) = env_field("PCE_STATE_DB_PATH") {
            self.state_db_path = PathBuf::from(raw);
        }

        if let Some(raw) = env_field("OPENROUTER_API_KEY") {
            self.openrouter.api_key = raw;
        }
        if let Some(raw) = env_field("OPENROUTER_MODEL") {
            self.openrouter.model = raw;
        }
        if let Some(raw) = env_field("OPENROUTER_BASE_URL") {
            self.openrouter.base_url = raw;
        }
        if let Some(raw) = env_field("OPENROUTER_TIMEOUT_S") {
            self.openrouter.timeout_s = parse_f64("OPENROUTER_TIMEOUT_S", &raw)?;
        }
        if let Some(raw) = env_field("OPENROUTER_HTTP_REFERER") {
            self.openrouter.http_referer = raw;
        }
        if let Some(raw) = env_field("OPENROUTER_X_TITLE") {
            self.openrouter.x_title = raw;
        }

        if let Some(raw) = env_field("PCE_CCI_WINDOW") {
            self.cci.window = raw
                .parse()
                .map_err(|_| PceError::Config(format!("PCE_CCI_WINDOW: invalid value {:?}", raw)))?;
        }
        if let Some(raw) = env_field("PCE_APPROVAL_TTL_SECONDS") {
            self.approvals.ttl_seconds = raw.parse().map_err(|_| {
                PceError::Config(format!("PCE_APPROVAL_TTL_SECONDS: invalid value {:?}", raw))
            })?;
        }
        if let Some(raw) = env_field("PCE_APPROVAL_SWEEP_INTERVAL_S") {
            self.approvals.sweep_interval_s = raw.parse().map_err(|_| {
                PceError::Config(format!("PCE_APPROVAL_SWEEP_INTERVAL_S: invalid value {:?}", raw))
            })?;
        }

        if let Some(raw) = env_field("PCE_ASSISTANT_VALUE_FLOOR") {
            self.assistant.value_floor = parse_f64("PCE_ASSISTANT_VALUE_FLOOR", &raw)?;
        }
        if let Some(raw) = env_field("PCE_ASSISTANT_CCI_FLOOR") {
            self.assistant.cci_floor = parse_f64("PCE_ASSISTANT_CCI_FLOOR", &raw)?;
        }
        if let Some(raw) = env_field("PCE_ASSISTANT_EPSILON_START") {
            self.assistant.epsilon_start = parse_f64("PCE_ASSISTANT_EPSILON_START", &raw)?;
        }
        if let Some(raw) = env_field("PCE_ASSISTANT_EPSILON_MIN") {
            self.assistant.epsilon_min = parse_f64("PCE_ASSISTANT_EPSILON_MIN", &raw)?;
        }
        if let Some(raw) = env_field("PCE_ASSISTANT_EPSILON_DECAY") {
            self.assistant.epsilon_decay = parse_f64("PCE_ASSISTANT_EPSILON_DECAY", &raw)?;
        }
        Ok(())
    }

    fn validate(&self) -> PceResult<()> {
        if self.openrouter.timeout_s <= 0.0 {
            return Err(PceError::Config(
                "openrouter.timeout_s must be greater than zero".to_string(),
            ));
        }
        if self.cci.window < 3 {
            return Err(PceError::Config("cci.window must be at least 3".to_string()));
        }
        if self.approvals.ttl_seconds <= 0 {
            return Err(PceError::Config(
                "approvals.ttl_seconds must be positive".to_string(),
            ));
        }
        if self.assistant.epsilon_min > self.assistant.epsilon_start {
            return Err(PceError::Config(
                "assistant.epsilon_min must not exceed epsilon_start".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_field(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_f64(name: &str, raw: &str) -> PceResult<f64> {
    raw.parse()
        .map_err(|_| PceError::Config(format!("{}: invalid value {:?}", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PceConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.cci.window, 50);
        assert!((config.cci.weights.consistency - 0.35).abs() < f64::EPSILON);
        assert!((config.cci.weights.stability - 0.25).abs() < f64::EPSILON);
        assert!((config.cci.weights.non_contradiction - 0.25).abs() < f64::EPSILON);
        assert!((config.cci.weights.predictive_accuracy - 0.15).abs() < f64::EPSILON);
        assert_eq!(config.approvals.ttl_seconds, 86_400);
        assert_eq!(config.approvals.sweep_interval_s, 60);
        assert!((config.openrouter.timeout_s - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn json_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"api_port": 9100, "approvals": {"ttl_seconds": 120}}"#,
        )
        .expect("write config");

        let config = PceConfig::load_from(&path).expect("load");
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.approvals.ttl_seconds, 120);
        // Untouched sections keep defaults.
        assert_eq!(config.cci.window, 50);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PceConfig::load_from(&dir.path().join("nope.json")).expect("load");
        assert_eq!(config, PceConfig::default());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write config");
        assert!(PceConfig::load_from(&path).is_err());
    }
}
