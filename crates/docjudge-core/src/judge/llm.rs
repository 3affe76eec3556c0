//! LLM-backed judge.

use serde::Deserialize;

use super::{JudgeOracle, JudgeRequest, JudgeResponse};
use crate::OracleError;
use crate::backend::BoxFuture;
use crate::llm::{LlmClient, parse_json_reply};
use crate::prompts;
use crate::quality::SubScores;

pub struct LlmJudge {
    client: LlmClient,
    temperature: f32,
}

impl LlmJudge {
    pub fn new(client: LlmClient, temperature: f32) -> Self {
        Self {
            client,
            temperature,
        }
    }

    async fn score(&self, request: JudgeRequest<'_>) -> Result<JudgeResponse, OracleError> {
        let user = prompts::judge_prompt(request.strategy, request.page, request.text);
        let reply = self
            .client
            .chat(prompts::JUDGE_SYSTEM_PROMPT, &user, self.temperature)
            .await?;
        let (scores, notes) = parse_judge_reply(&reply.content)?;
        Ok(JudgeResponse {
            scores,
            notes,
            usage: reply.usage,
            cost_usd: self.client.calculate_cost(reply.usage),
        })
    }
}

impl JudgeOracle for LlmJudge {
    fn name(&self) -> &str {
        "llm"
    }

    fn judge<'a>(
        &'a self,
        request: JudgeRequest<'a>,
    ) -> BoxFuture<'a, Result<JudgeResponse, OracleError>> {
        Box::pin(self.score(request))
    }
}

#[derive(Debug, Deserialize)]
struct JudgeReply {
    #[serde(rename = "S_read")]
    read: Option<f64>,
    #[serde(rename = "S_sent")]
    sent: Option<f64>,
    #[serde(rename = "S_noise")]
    noise: Option<f64>,
    #[serde(rename = "S_table")]
    table: Option<f64>,
    #[serde(rename = "S_fig", default)]
    fig: Option<f64>,
    #[serde(default)]
    notes: String,
}

/// Parse the judge's JSON. The four binary axes are required; the figure
/// axis may be null or absent. Scores are clamped to 0..=100.
pub fn parse_judge_reply(content: &str) -> Result<(SubScores, String), OracleError> {
    let reply: JudgeReply = parse_json_reply(content)?;
    let required = |name: &str, v: Option<f64>| {
        v.map(clamp)
            .ok_or_else(|| OracleError::Malformed(format!("missing {name}")))
    };
    let scores = SubScores {
        read: Some(required("S_read", reply.read)?),
        sent: Some(required("S_sent", reply.sent)?),
        noise: Some(required("S_noise", reply.noise)?),
        table: Some(required("S_table", reply.table)?),
        fig: reply.fig.map(clamp),
    };
    Ok((scores, reply.notes))
}

fn clamp(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 100.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_reply() {
        let (scores, notes) = parse_judge_reply(
            r#"{"S_read": 90, "S_sent": 88, "S_noise": 95, "S_table": 40, "S_fig": 80, "notes": "table cells merged"}"#,
        )
        .unwrap();
        assert_eq!(scores, SubScores::full(90.0, 88.0, 95.0, 40.0, 80.0));
        assert_eq!(notes, "table cells merged");
    }

    #[test]
    fn null_figure_is_absent() {
        let (scores, _) = parse_judge_reply(
            "```json\n{\"S_read\": 70, \"S_sent\": 70, \"S_noise\": 70, \"S_table\": 70, \"S_fig\": null}\n```",
        )
        .unwrap();
        assert_eq!(scores.fig, None);
    }

    #[test]
    fn missing_required_axis_is_malformed() {
        let err = parse_judge_reply(r#"{"S_read": 70, "S_sent": 70, "S_noise": 70}"#).unwrap_err();
        match err {
            OracleError::Malformed(msg) => assert!(msg.contains("S_table")),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let (scores, _) = parse_judge_reply(
            r#"{"S_read": 140, "S_sent": -5, "S_noise": 50, "S_table": 50}"#,
        )
        .unwrap();
        assert_eq!(scores.read, Some(100.0));
        assert_eq!(scores.sent, Some(0.0));
    }
}
