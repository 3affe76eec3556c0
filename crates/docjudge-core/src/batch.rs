//! Batch driver: distribute documents to a fixed pool of workers.
//!
//! Documents are queued on an `async-channel`; each of `workers` tasks pulls
//! the next path, loads it and runs the pipeline in its own task so that a
//! panic only marks that document fatal. Cancellation stops new documents
//! from starting; documents already in flight run to the end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::CoreError;
use crate::backend::BoxFuture;
use crate::events::{self, EventSink, PipelineEvent};
use crate::model::{Document, DocumentFormat};
use crate::pipeline::{DocumentState, StrategyPipeline};
use crate::refine::{RefineDocumentState, RefinePipeline};

/// A per-document pipeline the batch driver can run.
pub trait DocumentPipeline: Send + Sync + 'static {
    type State: Send + 'static;

    fn run_document<'a>(&'a self, document: Document) -> BoxFuture<'a, Self::State>;

    /// State for a document that failed outside the pipeline (unreadable
    /// file, panicked task).
    fn fatal_state(&self, document: Document, message: String) -> Self::State;

    fn is_success(state: &Self::State) -> bool;
}

impl DocumentPipeline for StrategyPipeline {
    type State = DocumentState;

    fn run_document<'a>(&'a self, document: Document) -> BoxFuture<'a, DocumentState> {
        Box::pin(self.run(document))
    }

    fn fatal_state(&self, document: Document, message: String) -> DocumentState {
        StrategyPipeline::fatal(self, document, message)
    }

    fn is_success(state: &DocumentState) -> bool {
        state.is_completed()
    }
}

impl DocumentPipeline for RefinePipeline {
    type State = RefineDocumentState;

    fn run_document<'a>(&'a self, document: Document) -> BoxFuture<'a, RefineDocumentState> {
        Box::pin(self.run(document))
    }

    fn fatal_state(&self, document: Document, message: String) -> RefineDocumentState {
        RefinePipeline::fatal(self, document, message)
    }

    fn is_success(state: &RefineDocumentState) -> bool {
        state.is_complete()
    }
}

/// Outcome of one input path.
#[derive(Debug)]
pub struct BatchItem<S> {
    pub path: PathBuf,
    /// `None` when the batch was cancelled before this document started.
    pub state: Option<S>,
}

#[derive(Debug)]
pub struct BatchOutcome<S> {
    /// In input order.
    pub items: Vec<BatchItem<S>>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl<S> BatchOutcome<S> {
    pub fn any_succeeded(&self) -> bool {
        self.succeeded > 0
    }
}

/// Run `pipeline` over every path with `workers` concurrent documents.
pub async fn run_batch<P: DocumentPipeline>(
    pipeline: Arc<P>,
    paths: Vec<PathBuf>,
    workers: usize,
    cancel: CancellationToken,
    events: Option<EventSink>,
) -> BatchOutcome<P::State> {
    let total = paths.len();
    let (job_tx, job_rx) = async_channel::unbounded::<(usize, PathBuf)>();
    for job in paths.iter().cloned().enumerate() {
        // Unbounded and the receiver is alive: send cannot fail.
        let _ = job_tx.send(job).await;
    }
    job_tx.close();

    let mut handles = Vec::new();
    for worker in 0..workers.max(1) {
        let rx = job_rx.clone();
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        let events = events.clone();
        handles.push(tokio::spawn(async move {
            let mut done: Vec<(usize, P::State)> = Vec::new();
            while let Ok((index, path)) = rx.recv().await {
                if cancel.is_cancelled() {
                    tracing::debug!(worker, path = %path.display(), "skipping: cancelled");
                    continue;
                }
                events::emit(
                    &events,
                    PipelineEvent::DocumentStarted {
                        document: Document::unread(&path).name,
                        index,
                        total,
                    },
                );
                let state = process_one(&pipeline, &path).await;
                done.push((index, state));
            }
            done
        }));
    }

    let mut states: Vec<Option<P::State>> = (0..total).map(|_| None).collect();
    for handle in handles {
        match handle.await {
            Ok(done) => {
                for (index, state) in done {
                    states[index] = Some(state);
                }
            }
            Err(e) => tracing::error!(error = %e, "batch worker failed"),
        }
    }

    let mut outcome = BatchOutcome {
        items: Vec::with_capacity(total),
        succeeded: 0,
        failed: 0,
        skipped: 0,
    };
    for (path, state) in paths.into_iter().zip(states) {
        match &state {
            Some(s) if P::is_success(s) => outcome.succeeded += 1,
            Some(_) => outcome.failed += 1,
            None => outcome.skipped += 1,
        }
        outcome.items.push(BatchItem { path, state });
    }
    tracing::info!(
        succeeded = outcome.succeeded,
        failed = outcome.failed,
        skipped = outcome.skipped,
        "batch finished"
    );
    outcome
}

async fn process_one<P: DocumentPipeline>(pipeline: &Arc<P>, path: &Path) -> P::State {
    let document = match tokio::fs::read(path).await {
        Ok(bytes) => Document::from_bytes(path, &bytes),
        Err(source) => {
            let error = CoreError::Io {
                path: path.to_path_buf(),
                source,
            };
            tracing::error!(path = %path.display(), error = %error, "cannot read document");
            return pipeline.fatal_state(Document::unread(path), error.to_string());
        }
    };

    let task_pipeline = Arc::clone(pipeline);
    let task_document = document.clone();
    let handle = tokio::spawn(async move { task_pipeline.run_document(task_document).await });
    match handle.await {
        Ok(state) => state,
        Err(e) => {
            let error = CoreError::Panicked(e.to_string());
            tracing::error!(document = %document.name, error = %error, "pipeline task failed");
            pipeline.fatal_state(document, error.to_string())
        }
    }
}

/// Supported documents directly inside `dir`, sorted by path.
pub fn discover_inputs(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let entries = std::fs::read_dir(dir).map_err(|source| CoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && DocumentFormat::from_path(p).is_some())
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails documents whose name contains "bad" and panics on "panic".
    struct Flaky {
        runs: AtomicUsize,
    }

    impl DocumentPipeline for Flaky {
        type State = (String, bool);

        fn run_document<'a>(&'a self, document: Document) -> BoxFuture<'a, (String, bool)> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if document.name.contains("panic") {
                    panic!("boom");
                }
                let ok = !document.name.contains("bad");
                (document.name, ok)
            })
        }

        fn fatal_state(&self, document: Document, _message: String) -> (String, bool) {
            (document.name, false)
        }

        fn is_success(state: &(String, bool)) -> bool {
            state.1
        }
    }

    fn write_inputs(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|n| {
                let p = dir.join(n);
                std::fs::write(&p, b"%PDF").unwrap();
                p
            })
            .collect()
    }

    #[tokio::test]
    async fn panics_and_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = write_inputs(dir.path(), &["a.pdf", "bad.pdf", "panic.pdf", "d.pdf"]);
        paths.push(dir.path().join("missing.pdf"));
        let pipeline = Arc::new(Flaky {
            runs: AtomicUsize::new(0),
        });

        let outcome = run_batch(pipeline, paths, 3, CancellationToken::new(), None).await;
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.skipped, 0);
        let names: Vec<_> = outcome
            .items
            .iter()
            .map(|i| i.state.as_ref().unwrap().0.clone())
            .collect();
        assert_eq!(names, vec!["a.pdf", "bad.pdf", "panic.pdf", "d.pdf", "missing.pdf"]);
    }

    #[tokio::test]
    async fn cancelled_batch_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_inputs(dir.path(), &["a.pdf", "b.pdf"]);
        let pipeline = Arc::new(Flaky {
            runs: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run_batch(pipeline.clone(), paths, 1, cancel, None).await;
        assert_eq!(outcome.skipped, 2);
        assert!(!outcome.any_succeeded());
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discovery_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["b.PDF", "a.hwp", "notes.txt", "c.pdf"]);
        std::fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let found = discover_inputs(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.hwp", "b.PDF", "c.pdf"]);
    }

    #[test]
    fn discovery_of_missing_dir_is_an_error() {
        assert!(matches!(
            discover_inputs(Path::new("/definitely/not/here")),
            Err(CoreError::Io { .. })
        ));
    }
}
