//! OpenRouter chat-completions client.
//!
//! The assistant decision plugin calls this with a hard deadline so the
//! pipeline writer is never blocked on a provider: timeouts get one retry,
//! every other failure surfaces immediately, and error strings are
//! sanitized (no key material, whitespace collapsed, bounded length)
//! because they end up in explain bags and transcripts.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::OpenRouterConfig;
use crate::error::{PceError, PceResult};

/// Excerpt bound applied to provider bodies before they may be recorded.
const ERROR_EXCERPT_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// Discrete decoding parameters selected by the profile bandit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decoding {
    pub temperature: f64,
    pub top_p: f64,
    pub presence_penalty: f64,
}

#[derive(Debug)]
pub struct OpenRouterClient {
    config: OpenRouterConfig,
    http: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(config: OpenRouterConfig) -> PceResult<Self> {
        let timeout = Duration::from_secs_f64(config.timeout_s.max(0.1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PceError::Llm(format!("build http client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Generate one reply. Two attempts on timeout, single shot otherwise.
    pub async fn generate_reply(
        &self,
        messages: &[ChatMessage],
        decoding: &Decoding,
    ) -> PceResult<String> {
        if self.config.api_key.trim().is_empty() {
            return Err(PceError::Llm("OPENROUTER_API_KEY is not configured".into()));
        }
        if self.config.model.trim().is_empty() {
            return Err(PceError::Llm("OPENROUTER_MODEL is not configured".into()));
        }

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": decoding.temperature,
            "top_p": decoding.top_p,
            "presence_penalty": decoding.presence_penalty,
        });

        for attempt in 0..2 {
            match self.post_once(&body).await {
                Ok(reply) => return Ok(reply),
                Err(err) if is_timeout(&err) && attempt == 0 => {
                    warn!(attempt, "openrouter timeout, retrying once");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) if is_timeout(&err) => {
                    return Err(PceError::Llm("openrouter timeout after retry".into()));
                }
                Err(err) => return Err(err),
            }
        }
        Err(PceError::Llm("openrouter request failed unexpectedly".into()))
    }

    async fn post_once(&self, body: &Value) -> PceResult<String> {
        let mut request = self
            .http
            .post(&self.config.base_url)
            .bearer_auth(&self.config.api_key)
            .json(body);
        if !self.config.http_referer.is_empty() {
            request = request.header("HTTP-Referer", &self.config.http_referer);
        }
        if !self.config.x_title.is_empty() {
            request = request.header("X-Title", &self.config.x_title);
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PceError::Llm(format!(
                "openrouter status={} body={}",
                status.as_u16(),
                sanitize_excerpt(&text)
            )));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| PceError::Llm(format!("openrouter body parse: {}", e)))?;
        debug!(model = %self.config.model, "openrouter reply received");
        extract_reply(&parsed)
    }
}

fn extract_reply(body: &Value) -> PceResult<String> {
    let content = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PceError::Llm("openrouter response without reply content".into()))?;
    Ok(content.to_string())
}

fn classify_reqwest_error(err: reqwest::Error) -> PceError {
    if err.is_timeout() {
        PceError::Llm("timeout".into())
    } else {
        // reqwest error strings do not carry auth headers; still collapse
        // whitespace and bound length before recording.
        PceError::Llm(sanitize_excerpt(&err.to_string()))
    }
}

fn is_timeout(err: &PceError) -> bool {
    matches!(err, PceError::Llm(message) if message == "timeout")
}

/// Collapse whitespace and keep a short excerpt fit for audit trails.
pub fn sanitize_excerpt(raw: &str) -> String {
    let compact = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.is_empty() {
        return "<empty>".to_string();
    }
    compact.chars().take(ERROR_EXCERPT_LIMIT).collect()
}
