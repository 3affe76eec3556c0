//! OpenAI-compatible chat completion client (Upstage Solar by default).
//!
//! Used by the LLM judge and the LLM refine agent. Every request passes
//! through the shared [`AdaptiveLimiter`], which owns the 429 retry.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::OracleError;
use crate::rate_limit::{AdaptiveLimiter, RetryPolicy, throttle_error};

pub const DEFAULT_BASE_URL: &str = "https://api.upstage.ai/v1";
pub const DEFAULT_MODEL: &str = "solar-pro2";

/// LLM transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// USD per 1M prompt tokens.
    pub input_price_per_mtok: f64,
    /// USD per 1M completion tokens.
    pub output_price_per_mtok: f64,
    pub requests_per_second: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            input_price_per_mtok: 0.15,
            output_price_per_mtok: 0.60,
            requests_per_second: 2,
        }
    }
}

/// Token usage reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A completed chat call.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Shared chat client. Cheap to clone.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    config: LlmConfig,
    timeout: Duration,
    limiter: Arc<AdaptiveLimiter>,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("api_key", &"***")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LlmClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        config: LlmConfig,
        timeout: Duration,
    ) -> Self {
        let limiter = Arc::new(AdaptiveLimiter::per_second(config.requests_per_second));
        Self {
            http,
            api_key: api_key.into(),
            config,
            timeout,
            limiter,
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// USD cost of a call with the given usage.
    pub fn calculate_cost(&self, usage: TokenUsage) -> f64 {
        calculate_cost(&self.config, usage)
    }

    /// Send a system + user prompt pair and return the raw reply.
    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<ChatReply, OracleError> {
        self.limiter
            .call(&RetryPolicy::capped_at(self.timeout), || {
                self.send(system, user, temperature)
            })
            .await
    }

    async fn send(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<ChatReply, OracleError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if let Some(throttled) = throttle_error(resp.status(), resp.headers()) {
            return Err(throttled);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OracleError::Api {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("chat response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OracleError::Malformed("empty choices".into()))?;

        Ok(ChatReply {
            content,
            usage: parsed.usage.unwrap_or_default(),
        })
    }

    fn map_transport_error(&self, e: reqwest::Error) -> OracleError {
        if e.is_timeout() {
            OracleError::Timeout(self.timeout)
        } else {
            OracleError::Http(e.to_string())
        }
    }
}

pub fn calculate_cost(config: &LlmConfig, usage: TokenUsage) -> f64 {
    (usage.prompt_tokens as f64 * config.input_price_per_mtok
        + usage.completion_tokens as f64 * config.output_price_per_mtok)
        / 1_000_000.0
}

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```\s*$").unwrap());

/// Unwrap a reply enclosed in a Markdown code fence.
pub fn strip_code_fence(content: &str) -> &str {
    match CODE_FENCE.captures(content).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => content.trim(),
    }
}

/// Parse a JSON reply, tolerating code fences.
pub fn parse_json_reply<T: DeserializeOwned>(content: &str) -> Result<T, OracleError> {
    serde_json::from_str(strip_code_fence(content))
        .map_err(|e| OracleError::Malformed(format!("invalid JSON reply: {e}")))
}

/// Truncate to at most `max` characters.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let reply = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(reply), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fence() {
        assert_eq!(strip_code_fence("```\n{}\n```\n"), "{}");
    }

    #[test]
    fn leaves_plain_json() {
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn parse_reply_reports_malformed() {
        let err = parse_json_reply::<serde_json::Value>("not json").unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }

    #[test]
    fn cost_uses_per_million_prices() {
        let cfg = LlmConfig::default();
        let cost = calculate_cost(
            &cfg,
            TokenUsage {
                prompt_tokens: 1_000_000,
                completion_tokens: 500_000,
            },
        );
        assert!((cost - 0.45).abs() < 1e-12);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("한국어 문서", 3), "한국어");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn request_body_asks_for_json_object() {
        let req = ChatRequest {
            model: "solar-pro2",
            messages: [
                Message {
                    role: "system",
                    content: "s",
                },
                Message {
                    role: "user",
                    content: "u",
                },
            ],
            max_tokens: 10,
            temperature: 0.3,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["response_format"]["type"], "json_object");
        assert_eq!(v["messages"][1]["role"], "user");
    }
}
