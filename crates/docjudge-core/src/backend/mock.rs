//! Mock extraction backend for testing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{BoxFuture, ExtractionBackend, RemediationHint};
use crate::BackendError;
use crate::fallback::FallbackAction;
use crate::model::{Document, PageLayout, RawExtraction, RawPage};

/// What `process()` returns for a given action.
#[derive(Clone, Debug)]
pub enum MockProcess {
    /// Replace each page's text with this text (page numbers are kept).
    Text(String),
    /// Replace page texts in order; pages beyond the list keep their text.
    PerPage(Vec<String>),
    /// Return the pages untouched.
    PassThrough,
    /// Fail with an extraction error.
    Error(String),
    /// Drop every page, producing malformed output.
    DropPages,
}

/// A hand-rolled mock implementing [`ExtractionBackend`].
///
/// Supports fixed extraction output or an error, per-action `process()`
/// responses, a restricted set of supported actions, optional latency, and
/// call counting.
pub struct MockBackend {
    name: String,
    pages: Result<Vec<RawPage>, BackendError>,
    process: HashMap<FallbackAction, MockProcess>,
    supported: Option<Vec<FallbackAction>>,
    delay: Option<Duration>,
    extract_calls: AtomicUsize,
    process_calls: Mutex<Vec<FallbackAction>>,
}

impl MockBackend {
    /// A backend producing one page per text.
    pub fn with_pages(name: &str, texts: &[&str]) -> Self {
        let pages = texts
            .iter()
            .enumerate()
            .map(|(i, t)| RawPage {
                page: i as u32 + 1,
                text: t.to_string(),
                layout: PageLayout::default(),
            })
            .collect();
        Self::from_pages(name, pages)
    }

    pub fn from_pages(name: &str, pages: Vec<RawPage>) -> Self {
        Self {
            name: name.to_string(),
            pages: Ok(pages),
            process: HashMap::new(),
            supported: None,
            delay: None,
            extract_calls: AtomicUsize::new(0),
            process_calls: Mutex::new(Vec::new()),
        }
    }

    /// A backend whose extraction always fails.
    pub fn failing(name: &str, error: BackendError) -> Self {
        Self {
            pages: Err(error),
            ..Self::from_pages(name, Vec::new())
        }
    }

    pub fn on_process(mut self, action: FallbackAction, response: MockProcess) -> Self {
        self.process.insert(action, response);
        self
    }

    /// Restrict the fallback actions this backend claims to support.
    pub fn supporting(mut self, actions: &[FallbackAction]) -> Self {
        self.supported = Some(actions.to_vec());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn extract_count(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    /// Actions passed to `process()`, in call order.
    pub fn process_calls(&self) -> Vec<FallbackAction> {
        self.process_calls.lock().unwrap().clone()
    }
}

impl ExtractionBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract<'a>(
        &'a self,
        _document: &'a Document,
    ) -> BoxFuture<'a, Result<RawExtraction, BackendError>> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.pages.clone().map(|pages| RawExtraction {
            pages,
            settings: serde_json::json!({ "mock": true }),
        });
        let delay = self.delay;
        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            result
        })
    }

    fn supports(&self, action: FallbackAction) -> bool {
        self.supported
            .as_ref()
            .is_none_or(|actions| actions.contains(&action))
    }

    fn process<'a>(
        &'a self,
        pages: Vec<RawPage>,
        _document: &'a Document,
        hint: RemediationHint,
    ) -> BoxFuture<'a, Result<Vec<RawPage>, BackendError>> {
        self.process_calls.lock().unwrap().push(hint.action);
        let response = self
            .process
            .get(&hint.action)
            .cloned()
            .unwrap_or(MockProcess::PassThrough);
        Box::pin(async move {
            match response {
                MockProcess::Text(text) => Ok(pages
                    .into_iter()
                    .map(|p| RawPage {
                        text: text.clone(),
                        ..p
                    })
                    .collect()),
                MockProcess::PerPage(texts) => Ok(pages
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| match texts.get(i) {
                        Some(text) => RawPage {
                            text: text.clone(),
                            ..p
                        },
                        None => p,
                    })
                    .collect()),
                MockProcess::PassThrough => Ok(pages),
                MockProcess::Error(msg) => Err(BackendError::ExtractionError(msg)),
                MockProcess::DropPages => Ok(Vec::new()),
            }
        })
    }
}
