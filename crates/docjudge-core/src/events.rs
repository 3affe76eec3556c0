use std::sync::Arc;

use crate::fallback::FallbackAttempt;
use crate::model::PageKey;

/// Progress events emitted by both pipelines.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    DocumentStarted {
        document: String,
        index: usize,
        total: usize,
    },
    StageEntered {
        document: String,
        stage: &'static str,
    },
    ExtractionFinished {
        document: String,
        strategy: String,
        pages: usize,
        error: Option<String>,
    },
    PageJudged {
        document: String,
        key: PageKey,
        /// `None` when the judge degraded.
        total: Option<f64>,
    },
    FallbackAttemptRecorded {
        document: String,
        attempt: Box<FallbackAttempt>,
    },
    PageRefined {
        document: String,
        key: PageKey,
        need_refine: bool,
        refined: bool,
    },
    DocumentFinished {
        document: String,
        stage: &'static str,
        fatal: bool,
        /// Winning strategy, when a selection was made.
        selected: Option<String>,
    },
}

/// Progress callback shared across workers.
pub type EventSink = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

pub(crate) fn emit(sink: &Option<EventSink>, event: PipelineEvent) {
    if let Some(sink) = sink {
        sink(event);
    }
}
