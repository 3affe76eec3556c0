use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod backend;
pub mod batch;
pub mod cache;
pub mod config;
pub mod config_file;
pub mod events;
pub mod fallback;
pub mod judge;
pub mod layout;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod quality;
pub mod rate_limit;
pub mod refine;
pub mod report;
pub mod selection;

// Re-export for convenience
pub use backend::{BoxFuture, ExtractionBackend, RemediationHint};
pub use batch::{BatchOutcome, DocumentPipeline, discover_inputs, run_batch};
pub use cache::{ArtifactCache, CachedBackend, CachedJudge};
pub use config::Config;
pub use events::{EventSink, PipelineEvent};
pub use fallback::{FallbackAction, FallbackAttempt, FallbackController};
pub use judge::{JudgeOracle, JudgeOutcome, JudgeScore};
pub use model::{Document, DocumentFormat, ExtractionResult, PageKey, PageResult, RawExtraction, RawPage};
pub use pipeline::{DocumentState, Stage, StageLimit, StrategyPipeline};
pub use quality::{Axis, Classification, QualityAggregator, SubScores};
pub use refine::{RefineDocumentState, RefinePipeline, RefineStage};
pub use report::ReportSink;
pub use selection::{FinalSelection, SelectionCandidate, StrategySelector};

/// Failure of an extraction backend, either on first extraction or during
/// fallback reprocessing.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("cannot open document: {0}")]
    OpenError(String),
    #[error("extraction failed: {0}")]
    ExtractionError(String),
    #[error("unsupported document format: {0}")]
    Unsupported(String),
    #[error("malformed backend output: {0}")]
    Malformed(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure of an LLM-backed oracle (judge, refine validator, refiner).
#[derive(Error, Debug, Clone)]
pub enum OracleError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("malformed oracle response: {0}")]
    Malformed(String),
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
}

/// Invalid or incomplete configuration. Always fatal before any document is processed.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file {path}: {message}")]
    File { path: PathBuf, message: String },
}

/// Failure while writing a report artifact.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Stage-level error. Any of these aborts the current document (`fatal_error`)
/// but never the batch.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot read document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("every extraction strategy failed")]
    AllStrategiesFailed,
    #[error("no selection candidates available")]
    NoCandidates,
    #[error("no backend registered for strategy {0}")]
    UnknownStrategy(String),
    #[error("pipeline task panicked: {0}")]
    Panicked(String),
}
