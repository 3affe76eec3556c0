//! Fallback controller: bounded per-axis remediation of one strategy's pages.
//!
//! For each failing binary axis the controller walks the fixed action
//! priority list. Every attempt reprocesses the failing pages, re-judges them
//! and compares the mean normalized axis score against the current baseline.
//! An attempt is kept only when it improves the axis by at least the
//! configured delta; rejected output is discarded and only the
//! [`FallbackAttempt`] record survives.
//!
//! Per (strategy, axis) state: `NotAttempted -> Attempting(n) -> Accepted | Exhausted`.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::backend::{ExtractionBackend, RemediationHint};
use crate::judge::{JudgeOracle, JudgeScore, PageScore, judge_page};
use crate::layout::LayoutConfig;
use crate::model::{Document, ExtractionOrigin, ExtractionResult, PageResult, RawPage};
use crate::quality::{Axis, QualityAggregator};
use crate::{BackendError, CoreError};

/// Tolerance for float noise in the acceptance comparison.
const DELTA_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    CustomSplit,
    LayoutReorder,
    TableEnhancement,
}

impl FallbackAction {
    pub const ALL: [FallbackAction; 3] = [
        FallbackAction::CustomSplit,
        FallbackAction::LayoutReorder,
        FallbackAction::TableEnhancement,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FallbackAction::CustomSplit => "custom_split",
            FallbackAction::LayoutReorder => "layout_reorder",
            FallbackAction::TableEnhancement => "table_enhancement",
        }
    }

    /// Axes this action can improve.
    pub fn targets(self) -> &'static [Axis] {
        match self {
            FallbackAction::CustomSplit => &[Axis::Read, Axis::Table],
            FallbackAction::LayoutReorder => &[Axis::Read],
            FallbackAction::TableEnhancement => &[Axis::Table],
        }
    }
}

impl std::fmt::Display for FallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FallbackAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FallbackAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s.trim())
            .ok_or_else(|| {
                format!("unknown fallback action '{s}' (expected custom_split, layout_reorder, table_enhancement)")
            })
    }
}

/// What to do with a priority-list action that targets none of the open axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrrelevantActionPolicy {
    /// Move on without recording anything.
    #[default]
    Skip,
    /// Record a non-applicable attempt against every open axis.
    ConsumeSlot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub max_attempts: u32,
    /// Minimum improvement on the normalized [0, 1] axis scale.
    pub min_improvement_delta: f64,
    pub priority: Vec<FallbackAction>,
    pub irrelevant_action_policy: IrrelevantActionPolicy,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            min_improvement_delta: 0.1,
            priority: FallbackAction::ALL.to_vec(),
            irrelevant_action_policy: IrrelevantActionPolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "attempts", rename_all = "snake_case")]
pub enum AxisState {
    NotAttempted,
    Attempting(u32),
    Accepted,
    Exhausted,
}

impl AxisState {
    fn is_open(self) -> bool {
        matches!(self, AxisState::NotAttempted | AxisState::Attempting(_))
    }

    fn attempts(self) -> u32 {
        match self {
            AxisState::Attempting(n) => n,
            _ => 0,
        }
    }
}

/// Audit record of one remediation attempt for one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackAttempt {
    pub strategy: String,
    pub axis: Axis,
    pub action: FallbackAction,
    /// 1-based within the (strategy, axis) sequence.
    pub attempt: u32,
    pub prior_score: f64,
    pub new_score: f64,
    pub delta: f64,
    pub accepted: bool,
    /// False when the action did not target the axis and only used up a slot.
    pub applicable: bool,
    pub pages: Vec<u32>,
    pub error: Option<String>,
    /// Judge spend on output that was discarded. Carried by the first
    /// record of an attempt; adopted output keeps its cost on its scores.
    #[serde(default)]
    pub judge_cost_usd: f64,
}

/// The current best page for one page number, with its judge score.
#[derive(Debug, Clone)]
pub struct BaselinePage {
    pub page: PageResult,
    pub origin: ExtractionOrigin,
    pub score: Option<PageScore>,
    pub invocation: u32,
}

/// Current best pages of one strategy.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub strategy: String,
    pages: BTreeMap<u32, BaselinePage>,
}

impl Baseline {
    /// Fold a strategy's extractions (primary first, then accepted fallback
    /// results) into the latest page per page number, each with the latest
    /// judge score recorded for that page and origin.
    pub fn from_history(
        strategy: &str,
        extractions: &[ExtractionResult],
        judge_scores: &[JudgeScore],
    ) -> Self {
        let mut pages = BTreeMap::new();
        for extraction in extractions.iter().filter(|e| e.strategy == strategy) {
            for page in &extraction.pages {
                let latest = judge_scores
                    .iter()
                    .filter(|s| s.key == page.key && s.origin == extraction.origin)
                    .max_by_key(|s| s.invocation);
                pages.insert(
                    page.key.page,
                    BaselinePage {
                        page: page.clone(),
                        origin: extraction.origin.clone(),
                        score: latest.and_then(|s| s.scored().cloned()),
                        invocation: latest.map_or(0, |s| s.invocation),
                    },
                );
            }
        }
        Self {
            strategy: strategy.to_string(),
            pages,
        }
    }

    pub fn pages(&self) -> impl Iterator<Item = &BaselinePage> {
        self.pages.values()
    }

    /// Binary axes failing on at least one scored page.
    pub fn failing_axes(&self) -> Vec<Axis> {
        Axis::BINARY
            .into_iter()
            .filter(|axis| {
                self.pages
                    .values()
                    .any(|p| p.score.as_ref().is_some_and(|s| s.failing_axes.contains(axis)))
            })
            .collect()
    }

    fn failing_pages(&self, axes: &[Axis]) -> Vec<u32> {
        self.pages
            .values()
            .filter(|p| {
                p.score
                    .as_ref()
                    .is_some_and(|s| s.failing_axes.iter().any(|a| axes.contains(a)))
            })
            .map(|p| p.page.key.page)
            .collect()
    }

    /// Mean normalized axis score over `pages`, ignoring pages without it.
    fn axis_score(&self, axis: Axis, pages: &[u32]) -> Option<f64> {
        mean(pages.iter().filter_map(|n| {
            self.pages
                .get(n)
                .and_then(|p| p.score.as_ref())
                .and_then(|s| s.sub_scores.normalized(axis))
        }))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Everything remediation produced for one strategy.
#[derive(Debug, Clone, Default)]
pub struct FallbackOutcome {
    /// Accepted fallback extractions only.
    pub extractions: Vec<ExtractionResult>,
    /// Judge scores of the accepted extractions.
    pub judge_scores: Vec<JudgeScore>,
    /// Every attempt, accepted or not.
    pub attempts: Vec<FallbackAttempt>,
    pub axis_states: BTreeMap<Axis, AxisState>,
}

/// A failed attempt and what its judge calls cost before it failed.
#[derive(Debug)]
struct AttemptFailure {
    reason: String,
    judge_cost_usd: f64,
}

pub struct FallbackController {
    config: FallbackConfig,
    aggregator: QualityAggregator,
    layout: LayoutConfig,
    backend_timeout: Duration,
    judge_timeout: Duration,
}

impl FallbackController {
    pub fn new(
        config: FallbackConfig,
        aggregator: QualityAggregator,
        layout: LayoutConfig,
        backend_timeout: Duration,
        judge_timeout: Duration,
    ) -> Self {
        Self {
            config,
            aggregator,
            layout,
            backend_timeout,
            judge_timeout,
        }
    }

    /// Remediate the failing axes of one strategy, starting from `baseline`.
    pub async fn remediate(
        &self,
        document: &Document,
        backend: &dyn ExtractionBackend,
        judge: &dyn JudgeOracle,
        mut baseline: Baseline,
    ) -> FallbackOutcome {
        let strategy = baseline.strategy.clone();
        let mut outcome = FallbackOutcome {
            axis_states: baseline
                .failing_axes()
                .into_iter()
                .map(|a| (a, AxisState::NotAttempted))
                .collect(),
            ..Default::default()
        };
        let mut invocations: HashMap<u32, u32> = baseline
            .pages()
            .map(|p| (p.page.key.page, p.invocation))
            .collect();

        for &action in &self.config.priority {
            // Axes the current baseline already passes need no more attempts.
            let still_failing = baseline.failing_axes();
            for (axis, state) in outcome.axis_states.iter_mut() {
                if state.is_open() && !still_failing.contains(axis) {
                    *state = AxisState::Accepted;
                }
            }

            let open: Vec<Axis> = outcome
                .axis_states
                .iter()
                .filter(|(_, s)| s.is_open())
                .map(|(a, _)| *a)
                .collect();
            if open.is_empty() {
                break;
            }
            if !backend.supports(action) {
                tracing::debug!(strategy = %strategy, action = action.as_str(), "action unsupported by backend, skipped");
                continue;
            }

            let relevant: Vec<Axis> = open
                .iter()
                .copied()
                .filter(|a| action.targets().contains(a))
                .collect();
            if relevant.is_empty() {
                if self.config.irrelevant_action_policy == IrrelevantActionPolicy::ConsumeSlot {
                    for axis in open {
                        let prior = baseline
                            .axis_score(axis, &baseline.failing_pages(&[axis]))
                            .unwrap_or(0.0);
                        self.record(
                            &mut outcome,
                            FallbackAttempt {
                                strategy: strategy.clone(),
                                axis,
                                action,
                                attempt: 0,
                                prior_score: prior,
                                new_score: prior,
                                delta: 0.0,
                                accepted: false,
                                applicable: false,
                                pages: Vec::new(),
                                error: None,
                                judge_cost_usd: 0.0,
                            },
                        );
                    }
                }
                continue;
            }

            let pages = baseline.failing_pages(&relevant);
            let priors: Vec<(Axis, f64)> = relevant
                .iter()
                .map(|a| (*a, baseline.axis_score(*a, &pages).unwrap_or(0.0)))
                .collect();

            let attempt = self
                .run_attempt(document, backend, judge, &baseline, action, &relevant, &pages, &mut invocations)
                .await;

            match attempt {
                Err(failure) => {
                    tracing::warn!(strategy = %strategy, action = action.as_str(), error = %failure.reason, "fallback attempt failed");
                    for (i, (axis, prior)) in priors.into_iter().enumerate() {
                        self.record(
                            &mut outcome,
                            FallbackAttempt {
                                strategy: strategy.clone(),
                                axis,
                                action,
                                attempt: 0,
                                prior_score: prior,
                                new_score: prior,
                                delta: 0.0,
                                accepted: false,
                                applicable: true,
                                pages: pages.clone(),
                                error: Some(failure.reason.clone()),
                                judge_cost_usd: if i == 0 { failure.judge_cost_usd } else { 0.0 },
                            },
                        );
                    }
                }
                Ok((extraction, scores)) => {
                    let judged: Vec<(Axis, f64, f64)> = priors
                        .into_iter()
                        .map(|(axis, prior)| {
                            let new_score = mean(
                                scores
                                    .iter()
                                    .filter_map(|s| s.scored())
                                    .filter_map(|s| s.sub_scores.normalized(axis)),
                            )
                            .unwrap_or(prior);
                            (axis, prior, new_score)
                        })
                        .collect();
                    let improved = judged
                        .iter()
                        .any(|(_, prior, new)| new - prior + DELTA_EPSILON >= self.config.min_improvement_delta);
                    let regressed = judged
                        .iter()
                        .any(|(_, prior, new)| new - prior < -DELTA_EPSILON);
                    // Output that makes any targeted axis worse is never adopted.
                    let adopt = improved && !regressed;
                    if improved && regressed {
                        tracing::info!(strategy = %strategy, action = action.as_str(), "fallback output discarded, another axis regressed");
                    }
                    let discarded_cost = if adopt {
                        0.0
                    } else {
                        scores.iter().map(|s| s.outcome.cost_usd()).sum()
                    };

                    for (i, (axis, prior, new_score)) in judged.into_iter().enumerate() {
                        let delta = new_score - prior;
                        let accepted =
                            adopt && delta + DELTA_EPSILON >= self.config.min_improvement_delta;
                        tracing::info!(
                            strategy = %strategy,
                            axis = axis.as_str(),
                            action = action.as_str(),
                            prior,
                            new_score,
                            delta,
                            accepted,
                            "fallback attempt judged"
                        );
                        self.record(
                            &mut outcome,
                            FallbackAttempt {
                                strategy: strategy.clone(),
                                axis,
                                action,
                                attempt: 0,
                                prior_score: prior,
                                new_score,
                                delta,
                                accepted,
                                applicable: true,
                                pages: pages.clone(),
                                error: None,
                                judge_cost_usd: if i == 0 { discarded_cost } else { 0.0 },
                            },
                        );
                    }
                    if adopt {
                        for score in &scores {
                            if let Some(page) = extraction.page(score.key.page) {
                                baseline.pages.insert(
                                    score.key.page,
                                    BaselinePage {
                                        page: page.clone(),
                                        origin: extraction.origin.clone(),
                                        score: score.scored().cloned(),
                                        invocation: score.invocation,
                                    },
                                );
                            }
                        }
                        outcome.extractions.push(extraction);
                        outcome.judge_scores.extend(scores);
                    }
                }
            }
        }

        for state in outcome.axis_states.values_mut() {
            if state.is_open() {
                *state = AxisState::Exhausted;
            }
        }
        outcome
    }

    /// Append an attempt, numbering it and advancing the axis state.
    fn record(&self, outcome: &mut FallbackOutcome, mut attempt: FallbackAttempt) {
        let state = outcome
            .axis_states
            .entry(attempt.axis)
            .or_insert(AxisState::NotAttempted);
        let n = state.attempts() + 1;
        attempt.attempt = n;
        *state = if attempt.accepted {
            AxisState::Accepted
        } else if n >= self.config.max_attempts {
            AxisState::Exhausted
        } else {
            AxisState::Attempting(n)
        };
        outcome.attempts.push(attempt);
    }

    /// Reprocess and re-judge `pages`. Any backend or judge failure fails the
    /// whole attempt; the failure keeps the spend of judge calls already made.
    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        document: &Document,
        backend: &dyn ExtractionBackend,
        judge: &dyn JudgeOracle,
        baseline: &Baseline,
        action: FallbackAction,
        axes: &[Axis],
        pages: &[u32],
        invocations: &mut HashMap<u32, u32>,
    ) -> Result<(ExtractionResult, Vec<JudgeScore>), AttemptFailure> {
        let fail = |reason: String, judge_cost_usd: f64| AttemptFailure {
            reason,
            judge_cost_usd,
        };
        let input: Vec<RawPage> = pages
            .iter()
            .filter_map(|n| baseline.pages.get(n))
            .map(|p| p.page.to_raw())
            .collect();
        let hint = RemediationHint {
            action,
            layout: self.layout,
        };

        let start = Instant::now();
        let processed = tokio::time::timeout(
            self.backend_timeout,
            backend.process(input, document, hint),
        )
        .await
        .unwrap_or(Err(BackendError::Timeout(self.backend_timeout)))
        .map_err(|e| fail(CoreError::from(e).to_string(), 0.0))?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut returned: Vec<u32> = processed.iter().map(|p| p.page).collect();
        returned.sort_unstable();
        if returned != pages {
            return Err(fail(
                CoreError::from(BackendError::Malformed(format!(
                    "process() returned pages {returned:?}, expected {pages:?}"
                )))
                .to_string(),
                0.0,
            ));
        }

        let origin = ExtractionOrigin::Fallback {
            action,
            axes: axes.to_vec(),
        };
        let extraction = ExtractionResult::from_raw(
            &baseline.strategy,
            origin.clone(),
            crate::model::RawExtraction {
                pages: processed,
                settings: serde_json::json!({ "fallback_action": action.as_str() }),
            },
            elapsed_ms,
            0.0,
        );

        let mut scores = Vec::with_capacity(extraction.pages.len());
        let mut spent = 0.0;
        for page in &extraction.pages {
            let invocation = invocations.entry(page.key.page).or_insert(0);
            *invocation += 1;
            let score = judge_page(
                judge,
                &document.id,
                &self.aggregator,
                page,
                origin.clone(),
                *invocation,
                self.judge_timeout,
            )
            .await;
            spent += score.outcome.cost_usd();
            if let crate::judge::JudgeOutcome::Degraded { reason } = &score.outcome {
                return Err(fail(
                    format!("judge failed on page {}: {reason}", page.key.page),
                    spent,
                ));
            }
            scores.push(score);
        }
        Ok((extraction, scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OracleError;
    use crate::backend::mock::{MockBackend, MockProcess};
    use crate::judge::mock::MockJudge;
    use crate::model::PageKey;
    use crate::quality::SubScores;
    use std::path::Path;

    fn doc() -> Document {
        Document::from_bytes(Path::new("doc.pdf"), b"%PDF")
    }

    fn controller(config: FallbackConfig) -> FallbackController {
        FallbackController::new(
            config,
            QualityAggregator::default(),
            LayoutConfig::default(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    /// Primary extraction of `texts` under "A", judged by `judge`.
    async fn baseline(texts: &[&str], judge: &MockJudge) -> Baseline {
        let backend = MockBackend::with_pages("A", texts);
        let raw = backend.extract(&doc()).await.unwrap();
        let extraction = ExtractionResult::from_raw("A", ExtractionOrigin::Primary, raw, 10.0, 0.0);
        let mut scores = Vec::new();
        for page in &extraction.pages {
            scores.push(
                judge_page(
                    judge,
                    &doc().id,
                    &QualityAggregator::default(),
                    page,
                    ExtractionOrigin::Primary,
                    1,
                    Duration::from_secs(5),
                )
                .await,
            );
        }
        Baseline::from_history("A", &[extraction], &scores)
    }

    fn table(score: f64) -> SubScores {
        SubScores::full(90.0, 88.0, 95.0, score, 80.0)
    }

    #[tokio::test]
    async fn accepted_attempt_becomes_baseline() {
        let judge = MockJudge::new(table(40.0)).on_text("enhanced", table(55.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .supporting(&[FallbackAction::TableEnhancement])
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("enhanced".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        assert_eq!(out.attempts.len(), 1);
        let a = &out.attempts[0];
        assert_eq!(a.axis, Axis::Table);
        assert_eq!(a.attempt, 1);
        assert!(a.accepted);
        assert!((a.delta - 0.15).abs() < 1e-9);
        assert_eq!(out.extractions.len(), 1);
        assert_eq!(out.extractions[0].pages[0].text, "enhanced");
        assert_eq!(out.extractions[0].pages[0].cost_usd, 0.0);
        assert_eq!(out.judge_scores.len(), 1);
        assert_eq!(out.judge_scores[0].invocation, 2);
        assert_eq!(out.axis_states[&Axis::Table], AxisState::Accepted);
    }

    #[tokio::test]
    async fn delta_exactly_min_is_accepted() {
        let judge = MockJudge::new(table(40.0)).on_text("enhanced", table(50.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .supporting(&[FallbackAction::TableEnhancement])
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("enhanced".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;
        assert!(out.attempts[0].accepted);
    }

    #[tokio::test]
    async fn small_delta_rejected_and_discarded() {
        let judge = MockJudge::new(table(40.0)).on_text("marginal", table(49.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .on_process(FallbackAction::CustomSplit, MockProcess::Text("marginal".into()))
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("marginal".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        // custom_split then table_enhancement; layout_reorder does not target table.
        assert_eq!(out.attempts.len(), 2);
        assert!(out.attempts.iter().all(|a| !a.accepted));
        assert!((out.attempts[0].delta - 0.09).abs() < 1e-9);
        // The second attempt starts from the original baseline, not the rejected output.
        assert!((out.attempts[1].prior_score - 0.40).abs() < 1e-9);
        assert!(out.extractions.is_empty());
        assert!(out.judge_scores.is_empty());
        assert_eq!(out.axis_states[&Axis::Table], AxisState::Exhausted);
        assert_eq!(
            backend.process_calls(),
            vec![FallbackAction::CustomSplit, FallbackAction::TableEnhancement]
        );
    }

    #[tokio::test]
    async fn output_regressing_another_axis_is_not_adopted() {
        let judge = MockJudge::new(SubScores::full(30.0, 88.0, 95.0, 45.0, 80.0))
            .on_text("split", SubScores::full(60.0, 88.0, 95.0, 20.0, 80.0))
            .on_text("enhanced", SubScores::full(30.0, 88.0, 95.0, 60.0, 80.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .supporting(&[FallbackAction::CustomSplit, FallbackAction::TableEnhancement])
            .on_process(FallbackAction::CustomSplit, MockProcess::Text("split".into()))
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("enhanced".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        assert_eq!(out.attempts.len(), 3);
        let (read, table) = (&out.attempts[0], &out.attempts[1]);
        assert_eq!((read.axis, table.axis), (Axis::Read, Axis::Table));
        assert!((read.delta - 0.30).abs() < 1e-9);
        assert!((table.delta + 0.25).abs() < 1e-9);
        // Read improved, but table got worse, so the split output is dropped.
        assert!(!read.accepted);
        assert!(!table.accepted);

        // table_enhancement is measured against the untouched baseline.
        let enhanced = &out.attempts[2];
        assert_eq!(enhanced.action, FallbackAction::TableEnhancement);
        assert!((enhanced.prior_score - 0.45).abs() < 1e-9);
        assert!(enhanced.accepted);

        assert_eq!(out.extractions.len(), 1);
        assert_eq!(out.extractions[0].pages[0].text, "enhanced");
        assert_eq!(out.axis_states[&Axis::Table], AxisState::Accepted);
        assert_eq!(out.axis_states[&Axis::Read], AxisState::Exhausted);
    }

    #[tokio::test]
    async fn worse_output_never_replaces_baseline() {
        let judge = MockJudge::new(SubScores::full(30.0, 88.0, 95.0, 45.0, 80.0))
            .on_text("split", SubScores::full(60.0, 88.0, 95.0, 20.0, 80.0))
            .on_text("enhanced", SubScores::full(60.0, 88.0, 95.0, 35.0, 80.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .supporting(&[FallbackAction::CustomSplit, FallbackAction::TableEnhancement])
            .on_process(FallbackAction::CustomSplit, MockProcess::Text("split".into()))
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("enhanced".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        let enhanced = &out.attempts[2];
        assert!((enhanced.prior_score - 0.45).abs() < 1e-9);
        assert!((enhanced.delta + 0.10).abs() < 1e-9);
        assert!(out.attempts.iter().all(|a| !a.accepted));
        assert!(out.extractions.is_empty());
        assert!(out.judge_scores.is_empty());
    }

    #[tokio::test]
    async fn discarded_output_keeps_its_judge_cost() {
        let judge = MockJudge::new(table(40.0))
            .on_text("marginal", table(45.0))
            .with_cost(0.01);
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .supporting(&[FallbackAction::TableEnhancement])
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("marginal".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        assert!(!out.attempts[0].accepted);
        assert!(out.judge_scores.is_empty());
        assert!((out.attempts[0].judge_cost_usd - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn adopted_output_carries_cost_on_its_scores() {
        let judge = MockJudge::new(table(40.0))
            .on_text("enhanced", table(70.0))
            .with_cost(0.01);
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .supporting(&[FallbackAction::TableEnhancement])
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("enhanced".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        assert!(out.attempts[0].accepted);
        assert_eq!(out.attempts[0].judge_cost_usd, 0.0);
        assert!((out.judge_scores[0].outcome.cost_usd() - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn judge_failure_keeps_cost_of_pages_already_judged() {
        let judge = MockJudge::new(table(40.0))
            .on_text("enhanced", table(70.0))
            .fail_on_text("broken", OracleError::Malformed("bad json".into()))
            .with_cost(0.01);
        let base = baseline(&["raw", "raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw", "raw"])
            .supporting(&[FallbackAction::TableEnhancement])
            .on_process(
                FallbackAction::TableEnhancement,
                MockProcess::PerPage(vec!["enhanced".into(), "broken".into()]),
            );

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        assert!(out.attempts[0].error.is_some());
        assert!((out.attempts[0].judge_cost_usd - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn attempts_never_exceed_cap() {
        let judge = MockJudge::new(SubScores::full(30.0, 88.0, 95.0, 30.0, 80.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"]);
        let config = FallbackConfig {
            max_attempts: 1,
            ..Default::default()
        };

        let out = controller(config).remediate(&doc(), &backend, &judge, base).await;

        for axis in [Axis::Read, Axis::Table] {
            let n = out.attempts.iter().filter(|a| a.axis == axis).count();
            assert_eq!(n, 1, "{axis} attempts");
            assert_eq!(out.axis_states[&axis], AxisState::Exhausted);
        }
        // Both axes exhausted by custom_split, so nothing else runs.
        assert_eq!(backend.process_calls(), vec![FallbackAction::CustomSplit]);
    }

    #[tokio::test]
    async fn consume_slot_policy_records_irrelevant_action() {
        let judge = MockJudge::new(table(40.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"]);
        let config = FallbackConfig {
            irrelevant_action_policy: IrrelevantActionPolicy::ConsumeSlot,
            ..Default::default()
        };

        let out = controller(config).remediate(&doc(), &backend, &judge, base).await;

        assert_eq!(out.attempts.len(), 2);
        assert_eq!(out.attempts[1].action, FallbackAction::LayoutReorder);
        assert!(!out.attempts[1].applicable);
        assert_eq!(out.attempts[1].delta, 0.0);
        // table_enhancement never gets a slot.
        assert_eq!(backend.process_calls(), vec![FallbackAction::CustomSplit]);
    }

    #[tokio::test]
    async fn unsupported_actions_do_not_consume_attempts() {
        let judge = MockJudge::new(table(40.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"]).supporting(&[]);

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        assert!(out.attempts.is_empty());
        assert_eq!(out.axis_states[&Axis::Table], AxisState::Exhausted);
    }

    #[tokio::test]
    async fn backend_error_is_a_failed_attempt() {
        let judge = MockJudge::new(table(40.0)).on_text("fixed", table(90.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .on_process(FallbackAction::CustomSplit, MockProcess::Error("boom".into()))
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("fixed".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;

        assert_eq!(out.attempts.len(), 2);
        let failed = &out.attempts[0];
        assert!(!failed.accepted);
        assert_eq!(failed.delta, 0.0);
        assert!(failed.error.as_deref().unwrap().contains("boom"));
        assert!(out.attempts[1].accepted);
    }

    #[tokio::test]
    async fn missing_pages_are_malformed() {
        let judge = MockJudge::new(table(40.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .supporting(&[FallbackAction::TableEnhancement])
            .on_process(FallbackAction::TableEnhancement, MockProcess::DropPages);

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;
        assert!(out.attempts[0].error.as_deref().unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn judge_error_during_attempt_is_a_failed_attempt() {
        let judge = MockJudge::new(table(40.0))
            .fail_on_text("fixed", OracleError::Malformed("bad json".into()));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"])
            .supporting(&[FallbackAction::TableEnhancement])
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("fixed".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;
        assert!(!out.attempts[0].accepted);
        assert!(out.attempts[0].error.is_some());
        assert!(out.extractions.is_empty());
    }

    #[tokio::test]
    async fn only_failing_pages_are_reprocessed() {
        let judge = MockJudge::new(table(40.0))
            .on_text("good", table(90.0))
            .on_text("enhanced", table(70.0));
        let base = baseline(&["good", "bad"], &judge).await;
        let backend = MockBackend::with_pages("A", &["good", "bad"])
            .supporting(&[FallbackAction::TableEnhancement])
            .on_process(FallbackAction::TableEnhancement, MockProcess::Text("enhanced".into()));

        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;
        assert_eq!(out.attempts[0].pages, vec![2]);
        assert_eq!(out.extractions[0].pages.len(), 1);
        assert_eq!(out.extractions[0].pages[0].key, PageKey::new("A", 2));
    }

    #[tokio::test]
    async fn passing_strategy_triggers_nothing() {
        let judge = MockJudge::new(SubScores::full(80.0, 80.0, 80.0, 80.0, 80.0));
        let base = baseline(&["raw"], &judge).await;
        let backend = MockBackend::with_pages("A", &["raw"]);
        let out = controller(FallbackConfig::default())
            .remediate(&doc(), &backend, &judge, base)
            .await;
        assert!(out.attempts.is_empty());
        assert!(out.axis_states.is_empty());
        assert!(backend.process_calls().is_empty());
    }

    #[test]
    fn action_names_round_trip() {
        for action in FallbackAction::ALL {
            assert_eq!(action.as_str().parse::<FallbackAction>().unwrap(), action);
        }
        assert!("unknown".parse::<FallbackAction>().is_err());
    }
}
