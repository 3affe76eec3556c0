//! Refine pipeline: `init → extracting → refine_validating → refining →
//! reporting → complete | fatal_error`.
//!
//! Unlike the strategy pipeline this makes a binary decision per page.
//! Oracle failures degrade the page ("no refine needed", zero confidence)
//! and never abort the document.

pub mod llm;
pub mod mock;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backend::{BoxFuture, ExtractionBackend};
use crate::config::Config;
use crate::events::{self, EventSink, PipelineEvent};
use crate::llm::TokenUsage;
use crate::model::{Document, ExtractionResult, PageKey, PageResult};
use crate::pipeline::{ErrorEntry, extract_strategy};
use crate::report::ReportSink;
use crate::{CoreError, OracleError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineConfig {
    /// Strategy to extract with; the first enabled strategy when unset.
    pub strategy: Option<String>,
    /// Pages with less trimmed text than this are never sent to the oracle.
    pub min_text_length: usize,
    pub validation_temperature: f32,
    pub refine_temperature: f32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            min_text_length: 50,
            validation_temperature: 0.3,
            refine_temperature: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineIssues {
    pub line_break_errors: bool,
    pub header_footer_noise: bool,
    pub mixed_content: bool,
    pub encoding_errors: bool,
    pub paragraph_structure: bool,
}

impl RefineIssues {
    pub fn any(&self) -> bool {
        self.line_break_errors
            || self.header_footer_noise
            || self.mixed_content
            || self.encoding_errors
            || self.paragraph_structure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineAction {
    SentenceReconstruction,
    NoiseRemoval,
    TableImprovement,
    ParagraphSeparation,
    CharacterNormalization,
}

impl RefineAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RefineAction::SentenceReconstruction => "sentence_reconstruction",
            RefineAction::NoiseRemoval => "noise_removal",
            RefineAction::TableImprovement => "table_improvement",
            RefineAction::ParagraphSeparation => "paragraph_separation",
            RefineAction::CharacterNormalization => "character_normalization",
        }
    }
}

impl std::str::FromStr for RefineAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sentence_reconstruction" => Ok(RefineAction::SentenceReconstruction),
            "noise_removal" => Ok(RefineAction::NoiseRemoval),
            "table_improvement" => Ok(RefineAction::TableImprovement),
            "paragraph_separation" => Ok(RefineAction::ParagraphSeparation),
            "character_normalization" => Ok(RefineAction::CharacterNormalization),
            other => Err(format!("unknown refine action '{other}'")),
        }
    }
}

/// Oracle verdict on whether a page needs cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub need_refine: bool,
    pub issues: RefineIssues,
    pub confidence: f64,
    pub reason: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// Oracle output for one refined page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedText {
    pub text: String,
    pub actions: Vec<RefineAction>,
    pub improvements: serde_json::Value,
    pub summary: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// The validate/refine oracle pair.
pub trait RefineAgent: Send + Sync {
    fn name(&self) -> &str;

    fn validate<'a>(
        &'a self,
        page: u32,
        text: &'a str,
    ) -> BoxFuture<'a, Result<ValidationVerdict, OracleError>>;

    fn refine<'a>(
        &'a self,
        page: u32,
        text: &'a str,
        issues: RefineIssues,
    ) -> BoxFuture<'a, Result<RefinedText, OracleError>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineValidationResult {
    pub key: PageKey,
    pub need_refine: bool,
    pub issues: RefineIssues,
    pub confidence: f64,
    pub reason: String,
    pub processing_time_ms: f64,
    pub cost_usd: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRefineResult {
    pub key: PageKey,
    pub original_text: String,
    pub refined_text: Option<String>,
    pub need_refine: bool,
    pub refined: bool,
    pub refine_actions: Vec<RefineAction>,
    pub improvements: serde_json::Value,
    pub summary: String,
    /// `len(refined) - len(original)` in characters; 0 when not refined.
    pub character_delta: i64,
    pub processing_time_ms: f64,
    pub cost_usd: f64,
    pub error: Option<String>,
}

impl PageRefineResult {
    fn unrefined(page: &PageResult, need_refine: bool, error: Option<String>) -> Self {
        Self {
            key: page.key.clone(),
            original_text: page.text.clone(),
            refined_text: None,
            need_refine,
            refined: false,
            refine_actions: Vec::new(),
            improvements: serde_json::Value::Null,
            summary: String::new(),
            character_delta: 0,
            processing_time_ms: 0.0,
            cost_usd: 0.0,
            error,
        }
    }
}

/// Per-document refine statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefineReport {
    pub strategy: String,
    pub total_pages: usize,
    pub pages_need_refine: usize,
    pub pages_refined: usize,
    pub pages_skipped: usize,
    /// Refined pages as a share of all pages (0–1).
    pub refine_rate: f64,
    /// Validation plus refine time.
    pub total_processing_time_ms: f64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefineStage {
    Init,
    Extracting,
    RefineValidating,
    Refining,
    Reporting,
    Complete,
    FatalError,
}

impl RefineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RefineStage::Init => "init",
            RefineStage::Extracting => "extracting",
            RefineStage::RefineValidating => "refine_validating",
            RefineStage::Refining => "refining",
            RefineStage::Reporting => "reporting",
            RefineStage::Complete => "complete",
            RefineStage::FatalError => "fatal_error",
        }
    }
}

/// Append-only record of one document's refine run.
#[derive(Debug, Clone, Serialize)]
pub struct RefineDocumentState {
    document: Document,
    stage: RefineStage,
    extraction: Option<ExtractionResult>,
    validation_results: Vec<RefineValidationResult>,
    refine_results: Vec<PageRefineResult>,
    report: Option<RefineReport>,
    errors: Vec<ErrorEntry>,
}

impl RefineDocumentState {
    pub(crate) fn new(document: Document) -> Self {
        Self {
            document,
            stage: RefineStage::Init,
            extraction: None,
            validation_results: Vec::new(),
            refine_results: Vec::new(),
            report: None,
            errors: Vec::new(),
        }
    }

    pub(crate) fn fatal(document: Document, message: String) -> Self {
        let mut state = Self::new(document);
        state.push_error(None, message);
        state.stage = RefineStage::FatalError;
        state
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn stage(&self) -> RefineStage {
        self.stage
    }

    pub fn extraction(&self) -> Option<&ExtractionResult> {
        self.extraction.as_ref()
    }

    pub fn validation_results(&self) -> &[RefineValidationResult] {
        &self.validation_results
    }

    pub fn refine_results(&self) -> &[PageRefineResult] {
        &self.refine_results
    }

    pub fn report(&self) -> Option<&RefineReport> {
        self.report.as_ref()
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn is_fatal(&self) -> bool {
        self.stage == RefineStage::FatalError
    }

    pub fn is_complete(&self) -> bool {
        self.stage == RefineStage::Complete
    }

    fn validation_for(&self, key: &PageKey) -> Option<&RefineValidationResult> {
        self.validation_results.iter().find(|v| &v.key == key)
    }

    fn push_error(&mut self, page: Option<&PageKey>, message: String) {
        self.errors.push(ErrorEntry {
            stage: self.stage.as_str().to_string(),
            strategy: page.map(|k| k.strategy.clone()),
            page: page.map(|k| k.page),
            message,
        });
    }

    fn summarize(&self, strategy: &str) -> RefineReport {
        let total_pages = self.refine_results.len();
        let pages_refined = self.refine_results.iter().filter(|r| r.refined).count();
        let time = self
            .validation_results
            .iter()
            .map(|v| v.processing_time_ms)
            .chain(self.refine_results.iter().map(|r| r.processing_time_ms))
            .sum();
        let cost = self
            .validation_results
            .iter()
            .map(|v| v.cost_usd)
            .chain(self.refine_results.iter().map(|r| r.cost_usd))
            .sum();
        RefineReport {
            strategy: strategy.to_string(),
            total_pages,
            pages_need_refine: self.validation_results.iter().filter(|v| v.need_refine).count(),
            pages_refined,
            pages_skipped: total_pages - pages_refined,
            refine_rate: if total_pages == 0 {
                0.0
            } else {
                pages_refined as f64 / total_pages as f64
            },
            total_processing_time_ms: time,
            total_cost_usd: cost,
        }
    }
}

pub struct RefinePipeline {
    config: Arc<Config>,
    backend: Arc<dyn ExtractionBackend>,
    agent: Arc<dyn RefineAgent>,
    report: Option<Arc<dyn ReportSink>>,
    events: Option<EventSink>,
}

impl RefinePipeline {
    /// Pick the refine strategy's backend out of `backends`.
    pub fn new(
        config: Arc<Config>,
        backends: &[Arc<dyn ExtractionBackend>],
        agent: Arc<dyn RefineAgent>,
    ) -> Result<Self, CoreError> {
        let strategy = config
            .refine_strategy()
            .ok_or_else(|| CoreError::UnknownStrategy(String::from("<none>")))?;
        let backend = backends
            .iter()
            .find(|b| b.name() == strategy)
            .cloned()
            .ok_or_else(|| CoreError::UnknownStrategy(strategy.to_string()))?;
        Ok(Self {
            config,
            backend,
            agent,
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

    /// Process one document to `complete` or `fatal_error`. Never fails.
    pub async fn run(&self, document: Document) -> RefineDocumentState {
        let name = document.name.clone();
        let mut state = RefineDocumentState::new(document);

        match self.drive(&mut state).await {
            Ok(()) => {
                state.stage = RefineStage::Complete;
                tracing::info!(document = %name, "refine completed");
            }
            Err(e) => {
                tracing::error!(document = %name, stage = state.stage.as_str(), error = %e, "refine failed");
                state.push_error(None, e.to_string());
                state.stage = RefineStage::FatalError;
            }
        }
        self.finish(&mut state);
        state
    }

    /// Fatal state for a document the pipeline never got to run.
    pub(crate) fn fatal(&self, document: Document, message: String) -> RefineDocumentState {
        tracing::error!(document = %document.name, error = %message, "refine failed");
        let mut state = RefineDocumentState::fatal(document, message);
        self.finish(&mut state);
        state
    }

    /// Write the report once the terminal stage is set, then announce it.
    fn finish(&self, state: &mut RefineDocumentState) {
        if let Some(sink) = &self.report {
            if let Err(e) = sink.write_refine_report(state) {
                tracing::warn!(document = %state.document.name, error = %e, "failed to write refine report");
                state.push_error(None, format!("report: {e}"));
            }
        }
        events::emit(
            &self.events,
            PipelineEvent::DocumentFinished {
                document: state.document.name.clone(),
                stage: state.stage.as_str(),
                fatal: state.is_fatal(),
                selected: None,
            },
        );
    }

    fn enter(&self, state: &mut RefineDocumentState, stage: RefineStage) {
        state.stage = stage;
        tracing::info!(document = %state.document.name, stage = stage.as_str(), "entering stage");
        events::emit(
            &self.events,
            PipelineEvent::StageEntered {
                document: state.document.name.clone(),
                stage: stage.as_str(),
            },
        );
    }

    async fn drive(&self, state: &mut RefineDocumentState) -> Result<(), CoreError> {
        self.enter(state, RefineStage::Extracting);
        let strategy = self.backend.name().to_string();
        let extraction = extract_strategy(
            self.backend.as_ref(),
            &state.document,
            self.config.extraction_timeout,
            self.config.cost_per_page(&strategy),
        )
        .await?;
        let pages = extraction.pages.clone();
        state.extraction = Some(extraction);

        self.enter(state, RefineStage::RefineValidating);
        for page in &pages {
            let result = self.validate_page(page).await;
            if let Some(error) = &result.error {
                state.push_error(Some(&page.key), error.clone());
            }
            state.validation_results.push(result);
        }

        self.enter(state, RefineStage::Refining);
        for page in &pages {
            let need_refine = state
                .validation_for(&page.key)
                .is_some_and(|v| v.need_refine);
            let result = if need_refine {
                let issues = state
                    .validation_for(&page.key)
                    .map(|v| v.issues)
                    .unwrap_or_default();
                self.refine_page(page, issues).await
            } else {
                PageRefineResult::unrefined(page, false, None)
            };
            if let Some(error) = &result.error {
                state.push_error(Some(&page.key), error.clone());
            }
            events::emit(
                &self.events,
                PipelineEvent::PageRefined {
                    document: state.document.name.clone(),
                    key: result.key.clone(),
                    need_refine: result.need_refine,
                    refined: result.refined,
                },
            );
            state.refine_results.push(result);
        }

        self.enter(state, RefineStage::Reporting);
        state.report = Some(state.summarize(&strategy));
        Ok(())
    }

    async fn validate_page(&self, page: &PageResult) -> RefineValidationResult {
        if page.text.trim().chars().count() < self.config.refine.min_text_length {
            return RefineValidationResult {
                key: page.key.clone(),
                need_refine: false,
                issues: RefineIssues::default(),
                confidence: 1.0,
                reason: "text too short to refine".to_string(),
                processing_time_ms: 0.0,
                cost_usd: 0.0,
                error: None,
            };
        }

        let start = Instant::now();
        let timeout = self.config.llm_timeout;
        let result = match tokio::time::timeout(timeout, self.agent.validate(page.key.page, &page.text)).await {
            Ok(r) => r,
            Err(_) => Err(OracleError::Timeout(timeout)),
        };
        let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(verdict) => RefineValidationResult {
                key: page.key.clone(),
                need_refine: verdict.need_refine,
                issues: verdict.issues,
                confidence: verdict.confidence,
                reason: verdict.reason,
                processing_time_ms,
                cost_usd: verdict.cost_usd,
                error: None,
            },
            Err(e) => {
                tracing::warn!(key = %page.key, error = %e, "refine validation failed");
                RefineValidationResult {
                    key: page.key.clone(),
                    need_refine: false,
                    issues: RefineIssues::default(),
                    confidence: 0.0,
                    reason: format!("validation failed: {e}"),
                    processing_time_ms,
                    cost_usd: 0.0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn refine_page(&self, page: &PageResult, issues: RefineIssues) -> PageRefineResult {
        let start = Instant::now();
        let timeout = self.config.llm_timeout;
        let result = match tokio::time::timeout(
            timeout,
            self.agent.refine(page.key.page, &page.text, issues),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(OracleError::Timeout(timeout)),
        };
        let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(refined) => {
                let character_delta =
                    refined.text.chars().count() as i64 - page.text.chars().count() as i64;
                PageRefineResult {
                    key: page.key.clone(),
                    original_text: page.text.clone(),
                    refined_text: Some(refined.text),
                    need_refine: true,
                    refined: true,
                    refine_actions: refined.actions,
                    improvements: refined.improvements,
                    summary: refined.summary,
                    character_delta,
                    processing_time_ms,
                    cost_usd: refined.cost_usd,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(key = %page.key, error = %e, "refine failed");
                let mut result = PageRefineResult::unrefined(page, true, Some(e.to_string()));
                result.processing_time_ms = processing_time_ms;
                result
            }
        }
    }
}
