//! Mock refine agent for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{RefineAction, RefineAgent, RefineIssues, RefinedText, ValidationVerdict};
use crate::OracleError;
use crate::backend::BoxFuture;
use crate::llm::TokenUsage;

/// Agent keyed by page text. Pages not registered with
/// [`needs_refine`](MockRefineAgent::needs_refine) are judged clean.
#[derive(Default)]
pub struct MockRefineAgent {
    flagged: HashMap<String, RefineIssues>,
    refined: HashMap<String, String>,
    validation_errors: HashMap<String, OracleError>,
    refine_errors: HashMap<String, OracleError>,
    cost_per_call: f64,
    validate_calls: AtomicUsize,
    refine_calls: AtomicUsize,
}

impl MockRefineAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_refine(mut self, text: &str) -> Self {
        self.flagged.insert(
            text.to_string(),
            RefineIssues {
                line_break_errors: true,
                ..Default::default()
            },
        );
        self
    }

    pub fn refine_to(mut self, text: &str, refined: &str) -> Self {
        self.refined.insert(text.to_string(), refined.to_string());
        self
    }

    pub fn fail_validation(mut self, text: &str, error: OracleError) -> Self {
        self.validation_errors.insert(text.to_string(), error);
        self
    }

    pub fn fail_refine(mut self, text: &str, error: OracleError) -> Self {
        self.refine_errors.insert(text.to_string(), error);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn validate_count(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn refine_count(&self) -> usize {
        self.refine_calls.load(Ordering::SeqCst)
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            prompt_tokens: 200,
            completion_tokens: 40,
        }
    }
}

impl RefineAgent for MockRefineAgent {
    fn name(&self) -> &str {
        "mock"
    }

    fn validate<'a>(
        &'a self,
        _page: u32,
        text: &'a str,
    ) -> BoxFuture<'a, Result<ValidationVerdict, OracleError>> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let result = match self.validation_errors.get(text) {
            Some(e) => Err(e.clone()),
            None => {
                let issues = self.flagged.get(text).copied();
                Ok(ValidationVerdict {
                    need_refine: issues.is_some(),
                    issues: issues.unwrap_or_default(),
                    confidence: 0.9,
                    reason: String::from("mock"),
                    usage: Self::usage(),
                    cost_usd: self.cost_per_call,
                })
            }
        };
        Box::pin(async move { result })
    }

    fn refine<'a>(
        &'a self,
        _page: u32,
        text: &'a str,
        _issues: RefineIssues,
    ) -> BoxFuture<'a, Result<RefinedText, OracleError>> {
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        let result = match self.refine_errors.get(text) {
            Some(e) => Err(e.clone()),
            None => Ok(RefinedText {
                text: self
                    .refined
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| text.to_string()),
                actions: vec![RefineAction::SentenceReconstruction],
                improvements: serde_json::json!({ "fixed_line_breaks": 1 }),
                summary: String::from("mock"),
                usage: Self::usage(),
                cost_usd: self.cost_per_call,
            }),
        };
        Box::pin(async move { result })
    }
}
