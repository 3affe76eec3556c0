use std::path::PathBuf;

use crate::ReportError;
use crate::pipeline::DocumentState;
use crate::refine::RefineDocumentState;

/// Consumer of finished document states. Implementations write the
/// comparison table and final selection to disk; both pipelines call the
/// sink once per document, fatal documents included.
pub trait ReportSink: Send + Sync {
    /// Returns the files written or appended to.
    fn write_strategy_report(&self, state: &DocumentState) -> Result<Vec<PathBuf>, ReportError>;

    fn write_refine_report(&self, state: &RefineDocumentState) -> Result<Vec<PathBuf>, ReportError>;
}
