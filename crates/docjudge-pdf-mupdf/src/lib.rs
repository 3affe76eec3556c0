use std::path::{Path, PathBuf};

use mupdf::{Document as PdfDocument, Rect, TextPageFlags};

use docjudge_core::config::{STRATEGY_MUPDF_SPLIT, STRATEGY_MUPDF_TEXT};
use docjudge_core::layout::{self, LayoutConfig};
use docjudge_core::model::{
    BBox, Document, DocumentFormat, PageLayout, RawExtraction, RawPage, TextBlock, TextLine,
};
use docjudge_core::{BackendError, BoxFuture, ExtractionBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Split,
}

/// MuPDF text-layer implementation of [`ExtractionBackend`].
///
/// This crate is the sole AGPL island: it isolates the mupdf dependency
/// (which is AGPL-3.0) so that the Upstage-only code paths do not
/// transitively depend on it.
///
/// Two strategies share the same reader. `mupdf_text` keeps MuPDF's block
/// order; `mupdf_split` re-orders each page with the left/right column split.
/// Both keep block and line boxes so fallback reprocessing can work on them.
pub struct MupdfBackend {
    mode: Mode,
    layout: LayoutConfig,
}

impl MupdfBackend {
    /// The `mupdf_text` strategy.
    pub fn text() -> Self {
        Self {
            mode: Mode::Text,
            layout: LayoutConfig::default(),
        }
    }

    /// The `mupdf_split` strategy.
    pub fn split(layout: LayoutConfig) -> Self {
        Self {
            mode: Mode::Split,
            layout,
        }
    }

    fn settings(&self) -> serde_json::Value {
        match self.mode {
            Mode::Text => serde_json::json!({ "engine": "mupdf", "mode": "text" }),
            Mode::Split => serde_json::json!({
                "engine": "mupdf",
                "mode": "split",
                "midline": self.layout.midline,
                "overlap_ratio": self.layout.overlap_ratio,
            }),
        }
    }

    async fn run(&self, document: &Document) -> Result<RawExtraction, BackendError> {
        if document.format != Some(DocumentFormat::Pdf) {
            return Err(BackendError::Unsupported(format!(
                "{} reads PDF only, got {}",
                self.name(),
                document.name
            )));
        }

        let path: PathBuf = document.path.clone();
        let pages = tokio::task::spawn_blocking(move || read_pages(&path))
            .await
            .map_err(|e| BackendError::ExtractionError(format!("mupdf task failed: {e}")))??;

        let pages = match self.mode {
            Mode::Text => pages,
            Mode::Split => pages
                .iter()
                .map(|p| layout::custom_split(p, &self.layout))
                .collect(),
        };
        tracing::debug!(strategy = self.name(), document = %document.name, pages = pages.len(), "mupdf extraction done");

        Ok(RawExtraction {
            pages,
            settings: self.settings(),
        })
    }
}

impl ExtractionBackend for MupdfBackend {
    fn name(&self) -> &str {
        match self.mode {
            Mode::Text => STRATEGY_MUPDF_TEXT,
            Mode::Split => STRATEGY_MUPDF_SPLIT,
        }
    }

    fn extract<'a>(
        &'a self,
        document: &'a Document,
    ) -> BoxFuture<'a, Result<RawExtraction, BackendError>> {
        Box::pin(self.run(document))
    }
}

/// Read every page's text layer with block and line geometry.
fn read_pages(path: &Path) -> Result<Vec<RawPage>, BackendError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| BackendError::OpenError("invalid path encoding".into()))?;

    let document =
        PdfDocument::open(path_str).map_err(|e| BackendError::OpenError(e.to_string()))?;

    let mut pages = Vec::new();
    for (index, page_result) in document
        .pages()
        .map_err(|e| BackendError::ExtractionError(e.to_string()))?
        .enumerate()
    {
        let page = page_result.map_err(|e| BackendError::ExtractionError(e.to_string()))?;
        let text_page = page
            .to_text_page(TextPageFlags::empty())
            .map_err(|e| BackendError::ExtractionError(e.to_string()))?;
        let bounds = page
            .bounds()
            .map_err(|e| BackendError::ExtractionError(e.to_string()))?;

        let mut blocks = Vec::new();
        for block in text_page.blocks() {
            let lines: Vec<TextLine> = block
                .lines()
                .map(|line| {
                    TextLine {
                        bbox: relative(&line.bounds(), &bounds),
                        text: line
                            .chars()
                            .map(|c| c.char().unwrap_or('\u{FFFD}'))
                            .collect(),
                    }
                })
                .collect();
            if lines.is_empty() {
                continue;
            }
            blocks.push(TextBlock {
                bbox: relative(&block.bounds(), &bounds),
                lines,
            });
        }

        pages.push(assemble_page(
            index as u32 + 1,
            bounds.x1 - bounds.x0,
            bounds.y1 - bounds.y0,
            blocks,
        ));
    }

    if pages.is_empty() {
        return Err(BackendError::Malformed("document has no pages".into()));
    }
    Ok(pages)
}

/// Box relative to the page's top-left corner.
fn relative(r: &Rect, page: &Rect) -> BBox {
    BBox::new(r.x0 - page.x0, r.y0 - page.y0, r.x1 - page.x0, r.y1 - page.y0)
}

fn assemble_page(page: u32, width: f32, height: f32, blocks: Vec<TextBlock>) -> RawPage {
    RawPage {
        page,
        text: layout::render_blocks(&blocks),
        layout: PageLayout {
            width,
            height,
            blocks,
            tables: Vec::new(),
        },
    }
}
