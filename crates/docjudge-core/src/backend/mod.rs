//! Extraction backend trait and the Upstage HTTP implementations.

pub mod mock;
pub mod upstage;

use std::future::Future;
use std::pin::Pin;

use crate::BackendError;
use crate::fallback::FallbackAction;
use crate::layout::{self, LayoutConfig};
use crate::model::{Document, RawExtraction, RawPage};

/// Boxed future returned by the object-safe async traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What fallback reprocessing should do to the pages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemediationHint {
    pub action: FallbackAction,
    pub layout: LayoutConfig,
}

/// A named extraction strategy.
pub trait ExtractionBackend: Send + Sync {
    /// Strategy id, e.g. `upstage_ocr`.
    fn name(&self) -> &str;

    /// Extract every page of the document.
    fn extract<'a>(&'a self, document: &'a Document)
    -> BoxFuture<'a, Result<RawExtraction, BackendError>>;

    /// Whether `process()` can carry out this fallback action.
    fn supports(&self, _action: FallbackAction) -> bool {
        true
    }

    /// Reprocess pages for fallback remediation. The default applies the
    /// layout algorithms to each page's stored block layout.
    fn process<'a>(
        &'a self,
        pages: Vec<RawPage>,
        _document: &'a Document,
        hint: RemediationHint,
    ) -> BoxFuture<'a, Result<Vec<RawPage>, BackendError>> {
        Box::pin(async move {
            Ok(pages
                .iter()
                .map(|p| layout::remediate(hint.action, p, &hint.layout))
                .collect())
        })
    }
}
