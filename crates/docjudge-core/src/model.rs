//! Shared data model: documents, extracted pages and their layout metadata.
//!
//! Everything here is immutable once created. Fallback remediation never edits
//! a [`PageResult`] in place; it produces a new [`ExtractionResult`] tagged with
//! the action that created it.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::CoreError;
use crate::fallback::FallbackAction;
use crate::quality::Axis;

/// Document file formats accepted by the pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Hwp,
}

impl DocumentFormat {
    /// Detect the format from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("pdf") {
            Some(Self::Pdf)
        } else if ext.eq_ignore_ascii_case("hwp") {
            Some(Self::Hwp)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Hwp => "hwp",
        }
    }
}

/// An input document. `id` is the SHA-256 of the file contents, which keys
/// the artifact cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub path: PathBuf,
    pub id: String,
    pub format: Option<DocumentFormat>,
    pub size_bytes: u64,
}

impl Document {
    /// Read the document from disk and fingerprint it.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let bytes = std::fs::read(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_bytes(path, &bytes))
    }

    /// Build a document identity from bytes already in memory.
    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Self {
        Self {
            name: display_name(path),
            path: path.to_path_buf(),
            id: sha256_hex(bytes),
            format: DocumentFormat::from_path(path),
            size_bytes: bytes.len() as u64,
        }
    }

    /// Identity for a document that could not be read. Used only to attach a
    /// fatal error to the right file name.
    pub fn unread(path: &Path) -> Self {
        Self {
            name: display_name(path),
            path: path.to_path_buf(),
            id: String::new(),
            format: DocumentFormat::from_path(path),
            size_bytes: 0,
        }
    }

    /// File stem with spaces replaced, suitable for report file names.
    pub fn safe_stem(&self) -> String {
        let stem = Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name);
        stem.replace(' ', "_")
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Composite key identifying one page of one strategy's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageKey {
    pub strategy: String,
    pub page: u32,
}

impl PageKey {
    pub fn new(strategy: impl Into<String>, page: u32) -> Self {
        Self {
            strategy: strategy.into(),
            page,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#p{}", self.strategy, self.page)
    }
}

/// Axis-aligned bounding box in page coordinates (y grows downwards).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn center_x(&self) -> f32 {
        (self.x0 + self.x1) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) / 2.0
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

/// One visual line of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub bbox: BBox,
    pub text: String,
}

/// A block of lines as reported by the extraction backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub bbox: BBox,
    pub lines: Vec<TextLine>,
}

impl TextBlock {
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A table detected by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRegion {
    pub bbox: Option<BBox>,
    /// First characters of the table content, for reports.
    pub preview: String,
}

/// Layout metadata attached to a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageLayout {
    pub width: f32,
    pub height: f32,
    pub blocks: Vec<TextBlock>,
    pub tables: Vec<TableRegion>,
}

/// A page as produced by a backend, before the pipeline attributes cost and
/// timing to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
    pub page: u32,
    pub text: String,
    pub layout: PageLayout,
}

/// Raw backend output for a whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    pub pages: Vec<RawPage>,
    /// Backend-specific settings echoed into reports.
    pub settings: serde_json::Value,
}

/// One page's extracted text from one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub key: PageKey,
    pub text: String,
    pub layout: PageLayout,
    pub cost_usd: f64,
    pub time_ms: f64,
}

impl PageResult {
    pub fn to_raw(&self) -> RawPage {
        RawPage {
            page: self.key.page,
            text: self.text.clone(),
            layout: self.layout.clone(),
        }
    }
}

/// How an [`ExtractionResult`] came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionOrigin {
    Primary,
    Fallback {
        action: FallbackAction,
        /// Axes the action was attempted for.
        axes: Vec<Axis>,
    },
}

impl ExtractionOrigin {
    pub fn is_primary(&self) -> bool {
        matches!(self, ExtractionOrigin::Primary)
    }

    pub fn label(&self) -> String {
        match self {
            ExtractionOrigin::Primary => "primary".to_string(),
            ExtractionOrigin::Fallback { action, .. } => format!("fallback:{}", action.as_str()),
        }
    }
}

/// One strategy's output for a document. Fallback remediation creates a new
/// result containing only the reprocessed pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub strategy: String,
    pub origin: ExtractionOrigin,
    pub pages: Vec<PageResult>,
    pub settings: serde_json::Value,
    pub total_time_ms: f64,
    pub total_cost_usd: f64,
}

impl ExtractionResult {
    /// Attribute cost and time evenly across the backend's pages.
    pub fn from_raw(
        strategy: &str,
        origin: ExtractionOrigin,
        raw: RawExtraction,
        total_time_ms: f64,
        cost_per_page: f64,
    ) -> Self {
        let count = raw.pages.len().max(1) as f64;
        let time_per_page = total_time_ms / count;
        let pages: Vec<PageResult> = raw
            .pages
            .into_iter()
            .map(|p| PageResult {
                key: PageKey::new(strategy, p.page),
                text: p.text,
                layout: p.layout,
                cost_usd: cost_per_page,
                time_ms: time_per_page,
            })
            .collect();
        let total_cost_usd = cost_per_page * pages.len() as f64;
        Self {
            strategy: strategy.to_string(),
            origin,
            pages,
            settings: raw.settings,
            total_time_ms,
            total_cost_usd,
        }
    }

    pub fn page(&self, page: u32) -> Option<&PageResult> {
        self.pages.iter().find(|p| p.key.page == page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection_is_case_insensitive() {
        assert_eq!(
            DocumentFormat::from_path(Path::new("a/B.PDF")),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(
            DocumentFormat::from_path(Path::new("report.hwp")),
            Some(DocumentFormat::Hwp)
        );
        assert_eq!(DocumentFormat::from_path(Path::new("notes.txt")), None);
    }

    #[test]
    fn document_id_is_content_hash() {
        let a = Document::from_bytes(Path::new("x.pdf"), b"hello");
        let b = Document::from_bytes(Path::new("y.pdf"), b"hello");
        assert_eq!(a.id, b.id);
        assert_eq!(
            a.id,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn safe_stem_strips_extension_and_spaces() {
        let doc = Document::unread(Path::new("/in/annual report 2024.pdf"));
        assert_eq!(doc.safe_stem(), "annual_report_2024");
    }

    #[test]
    fn from_raw_spreads_time_and_cost() {
        let raw = RawExtraction {
            pages: vec![
                RawPage {
                    page: 1,
                    text: "a".into(),
                    layout: PageLayout::default(),
                },
                RawPage {
                    page: 2,
                    text: "b".into(),
                    layout: PageLayout::default(),
                },
            ],
            settings: serde_json::Value::Null,
        };
        let result = ExtractionResult::from_raw("ocr", ExtractionOrigin::Primary, raw, 100.0, 0.01);
        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.pages[1].key, PageKey::new("ocr", 2));
        assert!((result.pages[0].time_ms - 50.0).abs() < 1e-9);
        assert!((result.total_cost_usd - 0.02).abs() < 1e-12);
    }

    #[test]
    fn bbox_geometry() {
        let b = BBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(b.width(), 20.0);
        assert_eq!(b.center_y(), 40.0);
        assert!(b.contains_point(15.0, 25.0));
        let u = b.union(&BBox::new(0.0, 0.0, 5.0, 5.0));
        assert_eq!(u, BBox::new(0.0, 0.0, 30.0, 60.0));
    }
}
