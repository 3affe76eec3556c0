//! Judge oracle trait and per-page scoring.
//!
//! A judge failure never aborts the document: [`judge_page`] turns errors
//! and timeouts into [`JudgeOutcome::Degraded`], which callers must not
//! confuse with a zero score.

pub mod llm;
pub mod mock;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::OracleError;
use crate::backend::BoxFuture;
use crate::llm::TokenUsage;
use crate::model::{ExtractionOrigin, PageKey, PageResult};
use crate::quality::{Axis, Classification, QualityAggregator, SubScores};

/// Input to a judge call.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    /// SHA-256 of the document the page belongs to.
    pub document_id: &'a str,
    pub text: &'a str,
    pub page: u32,
    pub strategy: &'a str,
}

/// Raw oracle answer, before aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResponse {
    pub scores: SubScores,
    pub notes: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

pub trait JudgeOracle: Send + Sync {
    fn name(&self) -> &str;

    fn judge<'a>(&'a self, request: JudgeRequest<'a>)
    -> BoxFuture<'a, Result<JudgeResponse, OracleError>>;
}

/// A successfully scored page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageScore {
    pub sub_scores: SubScores,
    pub total: f64,
    pub classification: Classification,
    pub failing_axes: Vec<Axis>,
    pub notes: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JudgeOutcome {
    Scored(PageScore),
    /// The oracle failed; the page is unscored and cost nothing.
    Degraded { reason: String },
}

impl JudgeOutcome {
    pub fn score(&self) -> Option<&PageScore> {
        match self {
            JudgeOutcome::Scored(s) => Some(s),
            JudgeOutcome::Degraded { .. } => None,
        }
    }

    pub fn cost_usd(&self) -> f64 {
        self.score().map_or(0.0, |s| s.cost_usd)
    }
}

/// One judge invocation for one page. Re-judging creates a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeScore {
    pub key: PageKey,
    pub origin: ExtractionOrigin,
    /// 1 for the primary judging pass, incremented per re-judge of the key.
    pub invocation: u32,
    pub outcome: JudgeOutcome,
    pub elapsed_ms: f64,
}

impl JudgeScore {
    pub fn scored(&self) -> Option<&PageScore> {
        self.outcome.score()
    }
}

/// Score one page, applying the timeout and the aggregator.
pub async fn judge_page(
    oracle: &dyn JudgeOracle,
    document_id: &str,
    aggregator: &QualityAggregator,
    page: &PageResult,
    origin: ExtractionOrigin,
    invocation: u32,
    timeout: Duration,
) -> JudgeScore {
    let request = JudgeRequest {
        document_id,
        text: &page.text,
        page: page.key.page,
        strategy: &page.key.strategy,
    };
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, oracle.judge(request)).await {
        Ok(r) => r,
        Err(_) => Err(OracleError::Timeout(timeout)),
    };
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let outcome = match result {
        Ok(response) => {
            let aggregate = aggregator.aggregate(&response.scores);
            tracing::debug!(
                key = %page.key,
                total = aggregate.total,
                classification = aggregate.classification.as_str(),
                "page judged"
            );
            JudgeOutcome::Scored(PageScore {
                failing_axes: aggregator.failing_axes(&response.scores),
                sub_scores: response.scores,
                total: aggregate.total,
                classification: aggregate.classification,
                notes: response.notes,
                usage: response.usage,
                cost_usd: response.cost_usd,
            })
        }
        Err(e) => {
            tracing::warn!(key = %page.key, oracle = oracle.name(), error = %e, "judge degraded");
            JudgeOutcome::Degraded {
                reason: e.to_string(),
            }
        }
    };

    JudgeScore {
        key: page.key.clone(),
        origin,
        invocation,
        outcome,
        elapsed_ms,
    }
}
