//! LLM-backed refine agent.

use serde::Deserialize;

use super::{RefineAction, RefineAgent, RefineIssues, RefinedText, ValidationVerdict};
use crate::OracleError;
use crate::backend::BoxFuture;
use crate::llm::{LlmClient, parse_json_reply};
use crate::prompts;

pub struct LlmRefineAgent {
    client: LlmClient,
    validation_temperature: f32,
    refine_temperature: f32,
}

impl LlmRefineAgent {
    pub fn new(client: LlmClient, validation_temperature: f32, refine_temperature: f32) -> Self {
        Self {
            client,
            validation_temperature,
            refine_temperature,
        }
    }

    async fn check(&self, page: u32, text: &str) -> Result<ValidationVerdict, OracleError> {
        let user = prompts::refine_validation_prompt(page, text);
        let reply = self
            .client
            .chat(
                prompts::REFINE_VALIDATION_SYSTEM_PROMPT,
                &user,
                self.validation_temperature,
            )
            .await?;
        let mut verdict = parse_validation_reply(&reply.content)?;
        verdict.usage = reply.usage;
        verdict.cost_usd = self.client.calculate_cost(reply.usage);
        Ok(verdict)
    }

    async fn clean(
        &self,
        page: u32,
        text: &str,
        issues: RefineIssues,
    ) -> Result<RefinedText, OracleError> {
        let user = prompts::refine_prompt(page, text, &issues);
        let reply = self
            .client
            .chat(prompts::REFINE_SYSTEM_PROMPT, &user, self.refine_temperature)
            .await?;
        let mut refined = parse_refine_reply(&reply.content)?;
        refined.usage = reply.usage;
        refined.cost_usd = self.client.calculate_cost(reply.usage);
        Ok(refined)
    }
}

impl RefineAgent for LlmRefineAgent {
    fn name(&self) -> &str {
        "llm"
    }

    fn validate<'a>(
        &'a self,
        page: u32,
        text: &'a str,
    ) -> BoxFuture<'a, Result<ValidationVerdict, OracleError>> {
        Box::pin(self.check(page, text))
    }

    fn refine<'a>(
        &'a self,
        page: u32,
        text: &'a str,
        issues: RefineIssues,
    ) -> BoxFuture<'a, Result<RefinedText, OracleError>> {
        Box::pin(self.clean(page, text, issues))
    }
}

#[derive(Debug, Deserialize)]
struct ValidationReply {
    need_refine: Option<bool>,
    #[serde(default)]
    issues: RefineIssues,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

/// `need_refine` is required; everything else defaults. Usage and cost are
/// left for the caller to fill in.
pub fn parse_validation_reply(content: &str) -> Result<ValidationVerdict, OracleError> {
    let reply: ValidationReply = parse_json_reply(content)?;
    let need_refine = reply
        .need_refine
        .ok_or_else(|| OracleError::Malformed("missing need_refine".into()))?;
    Ok(ValidationVerdict {
        need_refine,
        issues: reply.issues,
        confidence: reply.confidence.clamp(0.0, 1.0),
        reason: reply.reason,
        usage: Default::default(),
        cost_usd: 0.0,
    })
}

#[derive(Debug, Deserialize)]
struct RefineReply {
    refined_text: Option<String>,
    #[serde(default)]
    refine_actions: Vec<String>,
    #[serde(default)]
    improvements: serde_json::Value,
    #[serde(default)]
    summary: String,
}

/// Unknown action names are dropped; an absent or blank `refined_text` is
/// malformed.
pub fn parse_refine_reply(content: &str) -> Result<RefinedText, OracleError> {
    let reply: RefineReply = parse_json_reply(content)?;
    let text = reply
        .refined_text
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| OracleError::Malformed("missing refined_text".into()))?;
    let actions = reply
        .refine_actions
        .iter()
        .filter_map(|a| match a.parse::<RefineAction>() {
            Ok(action) => Some(action),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring refine action");
                None
            }
        })
        .collect();
    Ok(RefinedText {
        text,
        actions,
        improvements: reply.improvements,
        summary: reply.summary,
        usage: Default::default(),
        cost_usd: 0.0,
    })
}
