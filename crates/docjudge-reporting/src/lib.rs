//! File-based report sink.
//!
//! Per-document JSON reports go under `reports/`; the batch-level CSV tables
//! under `tables/` are appended to, one row per candidate or document, with
//! a header written when the file is first created.

pub mod export;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use docjudge_core::pipeline::DocumentState;
use docjudge_core::refine::RefineDocumentState;
use docjudge_core::{ReportError, ReportSink};

pub const REPORTS_DIR: &str = "reports";
pub const TABLES_DIR: &str = "tables";
pub const FULL_COMBINATIONS_CSV: &str = "full_combinations.csv";
pub const FINAL_SELECTION_CSV: &str = "final_selection.csv";
pub const FAILED_DOCUMENTS_CSV: &str = "failed_documents.csv";

/// Writes reports under one output directory. Safe to share across workers.
pub struct ReportWriter {
    output_dir: PathBuf,
    /// Serializes appends to the shared CSV tables.
    append_lock: Mutex<()>,
}

impl ReportWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.output_dir.join(REPORTS_DIR)
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.output_dir.join(TABLES_DIR)
    }

    /// Create `reports/` and `tables/`.
    pub fn ensure_dirs(&self) -> Result<(), ReportError> {
        for dir in [self.reports_dir(), self.tables_dir()] {
            fs::create_dir_all(&dir).map_err(|source| ReportError::Io { path: dir, source })?;
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<(), ReportError> {
        fs::write(path, content).map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn append_rows(&self, file: &str, header: &str, rows: &str) -> Result<PathBuf, ReportError> {
        let path = self.tables_dir().join(file);
        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
        let io_err = |source| ReportError::Io {
            path: path.clone(),
            source,
        };
        let is_new = !path.exists();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        if is_new {
            writeln!(f, "{header}").map_err(io_err)?;
        }
        f.write_all(rows.as_bytes()).map_err(io_err)?;
        Ok(path)
    }
}

impl ReportSink for ReportWriter {
    fn write_strategy_report(&self, state: &DocumentState) -> Result<Vec<PathBuf>, ReportError> {
        self.ensure_dirs()?;
        let stem = state.document().safe_stem();
        let mut written = Vec::new();

        let json_path = self.reports_dir().join(format!("{stem}_judge_report.json"));
        self.write_file(&json_path, &export::judge_report_json(state)?)?;
        written.push(json_path);

        if state.is_fatal() {
            written.push(self.append_rows(
                FAILED_DOCUMENTS_CSV,
                export::FAILED_DOCUMENTS_HEADER,
                &export::failed_document_row(state.document(), "strategy", state.errors()),
            )?);
            return Ok(written);
        }

        let combinations = export::full_combination_rows(state);
        if !combinations.is_empty() {
            written.push(self.append_rows(
                FULL_COMBINATIONS_CSV,
                export::FULL_COMBINATIONS_HEADER,
                &combinations,
            )?);
        }
        if let Some(row) = export::final_selection_row(state) {
            written.push(self.append_rows(
                FINAL_SELECTION_CSV,
                export::FINAL_SELECTION_HEADER,
                &row,
            )?);
        }
        tracing::debug!(document = %state.document().name, files = written.len(), "strategy report written");
        Ok(written)
    }

    fn write_refine_report(&self, state: &RefineDocumentState) -> Result<Vec<PathBuf>, ReportError> {
        self.ensure_dirs()?;
        let stem = state.document().safe_stem();
        let mut written = Vec::new();

        let json_path = self.reports_dir().join(format!("{stem}_refine_report.json"));
        self.write_file(&json_path, &export::refine_report_json(state)?)?;
        written.push(json_path);

        if state.is_fatal() {
            written.push(self.append_rows(
                FAILED_DOCUMENTS_CSV,
                export::FAILED_DOCUMENTS_HEADER,
                &export::failed_document_row(state.document(), "refine", state.errors()),
            )?);
            return Ok(written);
        }

        let rows = export::refine_log_rows(state);
        if !rows.is_empty() {
            let csv_path = self.tables_dir().join(format!(
                "{stem}_refine_log_{}.csv",
                export::file_timestamp()
            ));
            let mut content = String::from(export::REFINE_LOG_HEADER);
            content.push('\n');
            content.push_str(&rows);
            self.write_file(&csv_path, &content)?;
            written.push(csv_path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use docjudge_core::backend::mock::MockBackend;
    use docjudge_core::judge::mock::MockJudge;
    use docjudge_core::refine::mock::MockRefineAgent;
    use docjudge_core::{
        BackendError, Config, Document, ExtractionBackend, JudgeOracle, RefinePipeline,
        StrategyPipeline, SubScores,
    };

    fn config(strategies: &[&str]) -> Arc<Config> {
        Arc::new(Config {
            strategies: strategies.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    async fn strategy_state(backends: Vec<MockBackend>, name: &str) -> DocumentState {
        let strategies: Vec<String> = backends.iter().map(|b| b.name().to_string()).collect();
        let strategies: Vec<&str> = strategies.iter().map(String::as_str).collect();
        let backends: Vec<Arc<dyn ExtractionBackend>> = backends
            .into_iter()
            .map(|b| Arc::new(b) as Arc<dyn ExtractionBackend>)
            .collect();
        let judge: Arc<dyn JudgeOracle> =
            Arc::new(MockJudge::new(SubScores::full(90.0, 85.0, 80.0, 75.0, 70.0)));
        let pipeline = StrategyPipeline::new(config(&strategies), backends, judge).unwrap();
        pipeline
            .run(Document::from_bytes(Path::new(name), name.as_bytes()))
            .await
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn strategy_report_writes_json_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let state = strategy_state(
            vec![
                MockBackend::with_pages("a", &["one", "two"]),
                MockBackend::with_pages("b", &["uno"]),
            ],
            "my paper.pdf",
        )
        .await;

        let written = writer.write_strategy_report(&state).unwrap();
        assert_eq!(written.len(), 3);

        let json: serde_json::Value =
            serde_json::from_str(&read(&dir.path().join("reports/my_paper_judge_report.json")))
                .unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["state"]["fallback_attempts"], serde_json::json!([]));
        assert_eq!(json["state"]["candidates"].as_array().unwrap().len(), 2);

        let combos = read(&dir.path().join("tables/full_combinations.csv"));
        let lines: Vec<_> = combos.lines().collect();
        assert_eq!(lines[0], export::FULL_COMBINATIONS_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("my paper.pdf,"));

        let selection = read(&dir.path().join("tables/final_selection.csv"));
        assert_eq!(selection.lines().count(), 2);
        assert!(!dir.path().join("tables/failed_documents.csv").exists());
    }

    #[tokio::test]
    async fn tables_are_appended_with_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        for name in ["first.pdf", "second.pdf"] {
            let state =
                strategy_state(vec![MockBackend::with_pages("a", &["text"])], name)
                    .await;
            writer.write_strategy_report(&state).unwrap();
        }

        let selection = read(&dir.path().join("tables/final_selection.csv"));
        let lines: Vec<_> = selection.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("first.pdf,a,original,"));
        assert!(lines[2].starts_with("second.pdf,a,original,"));
    }

    #[tokio::test]
    async fn fatal_document_goes_to_failed_table() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let state = strategy_state(
            vec![MockBackend::failing(
                "a",
                BackendError::OpenError("encrypted, cannot open".into()),
            )],
            "locked.pdf",
        )
        .await;

        writer.write_strategy_report(&state).unwrap();

        let failed = read(&dir.path().join("tables/failed_documents.csv"));
        let lines: Vec<_> = failed.lines().collect();
        assert_eq!(lines[0], export::FAILED_DOCUMENTS_HEADER);
        assert!(lines[1].starts_with("locked.pdf,"));
        assert!(lines[1].contains(",strategy,extracting,every extraction strategy failed,2"));
        assert!(!dir.path().join("tables/final_selection.csv").exists());
        let json: serde_json::Value =
            serde_json::from_str(&read(&dir.path().join("reports/locked_judge_report.json")))
                .unwrap();
        assert_eq!(json["status"], "failed");
    }

    #[tokio::test]
    async fn refine_report_writes_json_and_log() {
        const MESSY: &str =
            "A messy para-\ngraph with \"quotes\", commas and enough text to be validated.";
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ReportWriter::new(dir.path()));
        let backends: Vec<Arc<dyn ExtractionBackend>> =
            vec![Arc::new(MockBackend::with_pages("a", &[MESSY, "tiny"]))];
        let agent = Arc::new(
            MockRefineAgent::new()
                .needs_refine(MESSY)
                .refine_to(MESSY, "A messy paragraph."),
        );
        let pipeline = RefinePipeline::new(config(&["a"]), &backends, agent)
            .unwrap()
            .with_report_sink(writer);

        let state = pipeline
            .run(Document::from_bytes(Path::new("notes.pdf"), b"notes"))
            .await;
        assert!(state.is_complete());

        let json: serde_json::Value =
            serde_json::from_str(&read(&dir.path().join("reports/notes_refine_report.json")))
                .unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["refine_rate"], "50.0%");
        assert_eq!(json["statistics"]["pages_refined"], 1);

        let log = fs::read_dir(dir.path().join("tables"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("notes_refine_log_")
            })
            .unwrap();
        let content = read(&log);
        assert!(content.starts_with(export::REFINE_LOG_HEADER));
        assert!(content.contains("1,a,Yes,Yes,Yes,No,No,No,No,0.90"));
        assert!(content.contains("2,a,No,No,No,No,No,No,No,1.00,text too short to refine"));
    }
}
