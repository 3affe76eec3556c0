//! Strategy-selection pipeline.
//!
//! `init → extracting → validating → fallback_remediation → selecting →
//! completed | fatal_error`. Each stage reads what earlier stages recorded
//! in [`DocumentState`] and appends its own output; nothing is overwritten.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::backend::ExtractionBackend;
use crate::config::Config;
use crate::events::{self, EventSink, PipelineEvent};
use crate::fallback::{AxisState, Baseline, FallbackAction, FallbackAttempt, FallbackController};
use crate::judge::{self, JudgeOracle, JudgeOutcome, JudgeScore};
use crate::model::{Document, ExtractionOrigin, ExtractionResult};
use crate::quality::Axis;
use crate::report::ReportSink;
use crate::selection::{
    FallbackState, FinalSelection, RankedCandidate, SelectionCandidate, StrategySelector,
};
use crate::{BackendError, CoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Extracting,
    Validating,
    FallbackRemediation,
    Selecting,
    Completed,
    FatalError,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Extracting => "extracting",
            Stage::Validating => "validating",
            Stage::FallbackRemediation => "fallback_remediation",
            Stage::Selecting => "selecting",
            Stage::Completed => "completed",
            Stage::FatalError => "fatal_error",
        }
    }
}

/// Last stage to run before the document is marked completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageLimit {
    /// Stop after extraction.
    Extraction,
    /// Stop after judging and per-axis validation.
    Validation,
    /// Stop after fallback remediation.
    Judge,
    #[default]
    All,
}

impl StageLimit {
    pub fn as_str(self) -> &'static str {
        match self {
            StageLimit::Extraction => "extraction",
            StageLimit::Validation => "validation",
            StageLimit::Judge => "judge",
            StageLimit::All => "all",
        }
    }
}

impl FromStr for StageLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extraction" => Ok(StageLimit::Extraction),
            "validation" => Ok(StageLimit::Validation),
            "judge" => Ok(StageLimit::Judge),
            "all" => Ok(StageLimit::All),
            other => Err(format!(
                "unknown stage '{other}' (expected extraction, validation, judge or all)"
            )),
        }
    }
}

/// One entry of a document's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: String,
    pub strategy: Option<String>,
    pub page: Option<u32>,
    pub message: String,
}

/// Append-only record of everything that happened to one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentState {
    document: Document,
    stage: Stage,
    stage_limit: StageLimit,
    extractions: Vec<ExtractionResult>,
    judge_scores: Vec<JudgeScore>,
    fallback_attempts: Vec<FallbackAttempt>,
    /// Final per-axis fallback state, by strategy.
    axis_states: BTreeMap<String, BTreeMap<Axis, AxisState>>,
    candidates: Vec<RankedCandidate>,
    final_selection: Option<FinalSelection>,
    errors: Vec<ErrorEntry>,
    elapsed_ms: f64,
}

impl DocumentState {
    pub(crate) fn new(document: Document, stage_limit: StageLimit) -> Self {
        Self {
            document,
            stage: Stage::Init,
            stage_limit,
            extractions: Vec::new(),
            judge_scores: Vec::new(),
            fallback_attempts: Vec::new(),
            axis_states: BTreeMap::new(),
            candidates: Vec::new(),
            final_selection: None,
            errors: Vec::new(),
            elapsed_ms: 0.0,
        }
    }

    /// A document that failed before any stage ran.
    pub(crate) fn fatal(document: Document, stage_limit: StageLimit, message: String) -> Self {
        let mut state = Self::new(document, stage_limit);
        state.push_error(Stage::Init, None, None, message);
        state.stage = Stage::FatalError;
        state
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn stage_limit(&self) -> StageLimit {
        self.stage_limit
    }

    pub fn extractions(&self) -> &[ExtractionResult] {
        &self.extractions
    }

    pub fn judge_scores(&self) -> &[JudgeScore] {
        &self.judge_scores
    }

    pub fn fallback_attempts(&self) -> &[FallbackAttempt] {
        &self.fallback_attempts
    }

    pub fn axis_states(&self) -> &BTreeMap<String, BTreeMap<Axis, AxisState>> {
        &self.axis_states
    }

    /// Ranked candidate table, winner first. Empty before selection.
    pub fn candidates(&self) -> &[RankedCandidate] {
        &self.candidates
    }

    pub fn final_selection(&self) -> Option<&FinalSelection> {
        self.final_selection.as_ref()
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    pub fn is_fatal(&self) -> bool {
        self.stage == Stage::FatalError
    }

    pub fn is_completed(&self) -> bool {
        self.stage == Stage::Completed
    }

    /// Extraction spend across every recorded extraction.
    pub fn extraction_cost_usd(&self) -> f64 {
        self.extractions.iter().map(|e| e.total_cost_usd).sum()
    }

    /// LLM spend across every judge invocation, including judging of
    /// fallback output that was discarded.
    pub fn judge_cost_usd(&self) -> f64 {
        let kept: f64 = self.judge_scores.iter().map(|s| s.outcome.cost_usd()).sum();
        let discarded: f64 = self.fallback_attempts.iter().map(|a| a.judge_cost_usd).sum();
        kept + discarded
    }

    /// Primary extraction of a strategy, if it succeeded.
    pub fn primary(&self, strategy: &str) -> Option<&ExtractionResult> {
        self.extractions
            .iter()
            .find(|e| e.strategy == strategy && e.origin.is_primary())
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub(crate) fn push_extraction(&mut self, extraction: ExtractionResult) {
        self.extractions.push(extraction);
    }

    pub(crate) fn push_judge_score(&mut self, score: JudgeScore) {
        self.judge_scores.push(score);
    }

    pub(crate) fn push_attempt(&mut self, attempt: FallbackAttempt) {
        self.fallback_attempts.push(attempt);
    }

    pub(crate) fn push_error(
        &mut self,
        stage: Stage,
        strategy: Option<&str>,
        page: Option<u32>,
        message: String,
    ) {
        self.errors.push(ErrorEntry {
            stage: stage.as_str().to_string(),
            strategy: strategy.map(str::to_string),
            page,
            message,
        });
    }

    fn record_axis_states(&mut self, strategy: &str, states: BTreeMap<Axis, AxisState>) {
        self.axis_states.insert(strategy.to_string(), states);
    }

    fn set_selection(&mut self, candidates: Vec<RankedCandidate>, selection: FinalSelection) {
        if self.final_selection.is_none() {
            self.candidates = candidates;
            self.final_selection = Some(selection);
        }
    }
}

/// Run one backend with the extraction timeout and price its pages.
pub(crate) async fn extract_strategy(
    backend: &dyn ExtractionBackend,
    document: &Document,
    timeout: Duration,
    cost_per_page: f64,
) -> Result<ExtractionResult, BackendError> {
    let start = Instant::now();
    let raw = match tokio::time::timeout(timeout, backend.extract(document)).await {
        Ok(r) => r?,
        Err(_) => return Err(BackendError::Timeout(timeout)),
    };
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    Ok(ExtractionResult::from_raw(
        backend.name(),
        ExtractionOrigin::Primary,
        raw,
        elapsed_ms,
        cost_per_page,
    ))
}

pub struct StrategyPipeline {
    config: Arc<Config>,
    /// In configured strategy order.
    backends: Vec<Arc<dyn ExtractionBackend>>,
    judge: Arc<dyn JudgeOracle>,
    report: Option<Arc<dyn ReportSink>>,
    events: Option<EventSink>,
}

impl StrategyPipeline {
    /// Bind the configured strategies to backends. Backends not named in
    /// `config.strategies` are ignored.
    pub fn new(
        config: Arc<Config>,
        backends: Vec<Arc<dyn ExtractionBackend>>,
        judge: Arc<dyn JudgeOracle>,
    ) -> Result<Self, CoreError> {
        let backends = resolve_backends(&config.strategies, backends)?;
        Ok(Self {
            config,
            backends,
            judge,
            report: None,
            events: None,
        })
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report = Some(sink);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process one document to `completed` or `fatal_error`. Never fails.
    pub async fn run(&self, document: Document) -> DocumentState {
        let start = Instant::now();
        let name = document.name.clone();
        let mut state = DocumentState::new(document, self.config.stage_limit);

        match self.drive(&mut state).await {
            Ok(()) => {
                state.set_stage(Stage::Completed);
                tracing::info!(document = %name, "document completed");
            }
            Err(e) => {
                let stage = state.stage();
                tracing::error!(document = %name, stage = stage.as_str(), error = %e, "document failed");
                state.push_error(stage, None, None, e.to_string());
                state.set_stage(Stage::FatalError);
            }
        }
        state.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.finish(state)
    }

    /// Fatal state for a document the pipeline never got to run (unreadable
    /// file, panicked task). Still reported like any other failure.
    pub(crate) fn fatal(&self, document: Document, message: String) -> DocumentState {
        tracing::error!(document = %document.name, error = %message, "document failed");
        let state = DocumentState::fatal(document, self.config.stage_limit, message);
        self.finish(state)
    }

    fn finish(&self, state: DocumentState) -> DocumentState {
        let name = state.document().name.clone();
        if let Some(sink) = &self.report {
            match sink.write_strategy_report(&state) {
                Ok(paths) => {
                    tracing::debug!(document = %name, files = paths.len(), "strategy report written")
                }
                Err(e) => {
                    tracing::warn!(document = %name, error = %e, "failed to write strategy report")
                }
            }
        }

        events::emit(
            &self.events,
            PipelineEvent::DocumentFinished {
                document: name,
                stage: state.stage().as_str(),
                fatal: state.is_fatal(),
                selected: state.final_selection().map(|s| s.candidate.id()),
            },
        );
        state
    }

    async fn drive(&self, state: &mut DocumentState) -> Result<(), CoreError> {
        self.extract(state).await?;
        if self.config.stage_limit == StageLimit::Extraction {
            return Ok(());
        }
        self.validate(state).await;
        if self.config.stage_limit == StageLimit::Validation {
            return Ok(());
        }
        self.remediate(state).await;
        if self.config.stage_limit == StageLimit::Judge {
            return Ok(());
        }
        self.select(state)
    }

    fn enter(&self, state: &mut DocumentState, stage: Stage) {
        state.set_stage(stage);
        tracing::info!(document = %state.document().name, stage = stage.as_str(), "entering stage");
        events::emit(
            &self.events,
            PipelineEvent::StageEntered {
                document: state.document().name.clone(),
                stage: stage.as_str(),
            },
        );
    }

    /// Fan out every strategy concurrently; record results in configured order.
    async fn extract(&self, state: &mut DocumentState) -> Result<(), CoreError> {
        self.enter(state, Stage::Extracting);

        let mut join_set = tokio::task::JoinSet::new();
        for (index, backend) in self.backends.iter().enumerate() {
            let backend = Arc::clone(backend);
            let document = state.document().clone();
            let timeout = self.config.extraction_timeout;
            let cost = self.config.cost_per_page(backend.name());
            join_set.spawn(async move {
                let result = extract_strategy(backend.as_ref(), &document, timeout, cost).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<ExtractionResult, BackendError>>> =
            (0..self.backends.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => {
                    tracing::error!(error = %e, "extraction task failed");
                }
            }
        }

        let document = state.document().name.clone();
        for (backend, result) in self.backends.iter().zip(results) {
            let strategy = backend.name();
            let result = result.unwrap_or_else(|| {
                Err(BackendError::ExtractionError("extraction task panicked".into()))
            });
            match result {
                Ok(extraction) => {
                    tracing::info!(
                        document = %document,
                        strategy,
                        pages = extraction.pages.len(),
                        time_ms = extraction.total_time_ms,
                        "extraction finished"
                    );
                    events::emit(
                        &self.events,
                        PipelineEvent::ExtractionFinished {
                            document: document.clone(),
                            strategy: strategy.to_string(),
                            pages: extraction.pages.len(),
                            error: None,
                        },
                    );
                    state.push_extraction(extraction);
                }
                Err(e) => {
                    tracing::warn!(document = %document, strategy, error = %e, "extraction failed");
                    events::emit(
                        &self.events,
                        PipelineEvent::ExtractionFinished {
                            document: document.clone(),
                            strategy: strategy.to_string(),
                            pages: 0,
                            error: Some(e.to_string()),
                        },
                    );
                    state.push_error(Stage::Extracting, Some(strategy), None, e.to_string());
                }
            }
        }

        if state.extractions().is_empty() {
            return Err(CoreError::AllStrategiesFailed);
        }
        Ok(())
    }

    /// Judge every page of every primary extraction, in extraction order.
    async fn validate(&self, state: &mut DocumentState) {
        self.enter(state, Stage::Validating);
        let document = state.document().name.clone();
        let document_id = state.document().id.clone();
        let pages: Vec<_> = state
            .extractions()
            .iter()
            .flat_map(|e| e.pages.iter().map(|p| (p.clone(), e.origin.clone())))
            .collect();

        for (page, origin) in pages {
            let score = judge::judge_page(
                self.judge.as_ref(),
                &document_id,
                &self.config.quality,
                &page,
                origin,
                1,
                self.config.llm_timeout,
            )
            .await;
            if let JudgeOutcome::Degraded { reason } = &score.outcome {
                state.push_error(
                    Stage::Validating,
                    Some(&page.key.strategy),
                    Some(page.key.page),
                    reason.clone(),
                );
            }
            events::emit(
                &self.events,
                PipelineEvent::PageJudged {
                    document: document.clone(),
                    key: score.key.clone(),
                    total: score.scored().map(|s| s.total),
                },
            );
            state.push_judge_score(score);
        }
    }

    /// Run the fallback controller for every strategy with a failing axis.
    async fn remediate(&self, state: &mut DocumentState) {
        self.enter(state, Stage::FallbackRemediation);
        let controller = FallbackController::new(
            self.config.fallback.clone(),
            self.config.quality.clone(),
            self.config.layout,
            self.config.extraction_timeout,
            self.config.llm_timeout,
        );
        let document = state.document().clone();

        for backend in &self.backends {
            let strategy = backend.name();
            if state.primary(strategy).is_none() {
                continue;
            }
            let baseline = Baseline::from_history(strategy, state.extractions(), state.judge_scores());
            if baseline.failing_axes().is_empty() {
                continue;
            }

            let outcome = controller
                .remediate(&document, backend.as_ref(), self.judge.as_ref(), baseline)
                .await;

            for extraction in outcome.extractions {
                state.push_extraction(extraction);
            }
            for score in outcome.judge_scores {
                state.push_judge_score(score);
            }
            for attempt in outcome.attempts {
                if let Some(error) = &attempt.error {
                    state.push_error(
                        Stage::FallbackRemediation,
                        Some(strategy),
                        None,
                        format!("{} for {}: {error}", attempt.action, attempt.axis),
                    );
                }
                events::emit(
                    &self.events,
                    PipelineEvent::FallbackAttemptRecorded {
                        document: document.name.clone(),
                        attempt: Box::new(attempt.clone()),
                    },
                );
                state.push_attempt(attempt);
            }
            state.record_axis_states(strategy, outcome.axis_states);
        }
    }

    fn select(&self, state: &mut DocumentState) -> Result<(), CoreError> {
        self.enter(state, Stage::Selecting);
        let mut candidates = build_candidates(state, &self.config);
        StrategySelector::mark_superseded(&mut candidates);
        let outcome = StrategySelector::new(self.config.selection.clone()).select(candidates)?;
        state.set_selection(outcome.table, outcome.selection);
        Ok(())
    }
}

/// One original candidate per extracted strategy, plus a remediated one
/// when fallback output was accepted. Costs and times are extraction-side.
pub(crate) fn build_candidates(state: &DocumentState, config: &Config) -> Vec<SelectionCandidate> {
    let mut strategies: Vec<&str> = Vec::new();
    for e in state.extractions() {
        if e.origin.is_primary() && !strategies.contains(&e.strategy.as_str()) {
            strategies.push(&e.strategy);
        }
    }

    let mut candidates = Vec::new();
    for strategy in strategies {
        let history: Vec<ExtractionResult> = state
            .extractions()
            .iter()
            .filter(|e| e.strategy == strategy)
            .cloned()
            .collect();
        let Some(primary) = history.iter().find(|e| e.origin.is_primary()) else {
            continue;
        };

        let original = Baseline::from_history(
            strategy,
            std::slice::from_ref(primary),
            state.judge_scores(),
        );
        candidates.push(SelectionCandidate::from_baseline(
            &original,
            FallbackState::Original,
            &config.quality,
            primary.total_cost_usd,
            primary.total_time_ms,
        ));

        let mut actions: Vec<FallbackAction> = Vec::new();
        for e in &history {
            if let ExtractionOrigin::Fallback { action, .. } = &e.origin {
                if !actions.contains(action) {
                    actions.push(*action);
                }
            }
        }
        if actions.is_empty() {
            continue;
        }
        let remediated = Baseline::from_history(strategy, &history, state.judge_scores());
        candidates.push(SelectionCandidate::from_baseline(
            &remediated,
            FallbackState::Remediated { actions },
            &config.quality,
            history.iter().map(|e| e.total_cost_usd).sum(),
            history.iter().map(|e| e.total_time_ms).sum(),
        ));
    }
    candidates
}

fn resolve_backends(
    strategies: &[String],
    backends: Vec<Arc<dyn ExtractionBackend>>,
) -> Result<Vec<Arc<dyn ExtractionBackend>>, CoreError> {
    strategies
        .iter()
        .map(|name| {
            backends
                .iter()
                .find(|b| b.name() == name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownStrategy(name.clone()))
        })
        .collect()
}
