//! Mock judge oracle for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{JudgeOracle, JudgeRequest, JudgeResponse};
use crate::OracleError;
use crate::backend::BoxFuture;
use crate::llm::TokenUsage;
use crate::quality::SubScores;

/// Judge that answers by page text, falling back to a default answer.
pub struct MockJudge {
    by_text: HashMap<String, Result<SubScores, OracleError>>,
    default: Result<SubScores, OracleError>,
    cost_per_call: f64,
    delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl MockJudge {
    pub fn new(default: SubScores) -> Self {
        Self {
            by_text: HashMap::new(),
            default: Ok(default),
            cost_per_call: 0.0,
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: OracleError) -> Self {
        Self {
            default: Err(error),
            ..Self::new(SubScores::default())
        }
    }

    /// Score pages whose text equals `text` with `scores`.
    pub fn on_text(mut self, text: &str, scores: SubScores) -> Self {
        self.by_text.insert(text.to_string(), Ok(scores));
        self
    }

    /// Fail pages whose text equals `text`.
    pub fn fail_on_text(mut self, text: &str, error: OracleError) -> Self {
        self.by_text.insert(text.to_string(), Err(error));
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl JudgeOracle for MockJudge {
    fn name(&self) -> &str {
        "mock"
    }

    fn judge<'a>(
        &'a self,
        request: JudgeRequest<'a>,
    ) -> BoxFuture<'a, Result<JudgeResponse, OracleError>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .by_text
            .get(request.text)
            .unwrap_or(&self.default)
            .clone();
        let cost_usd = self.cost_per_call;
        let delay = self.delay;
        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            answer.map(|scores| JudgeResponse {
                scores,
                notes: String::from("mock"),
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                },
                cost_usd,
            })
        })
    }
}
