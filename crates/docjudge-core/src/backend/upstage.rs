//! Upstage document digitization backends (`document-parse` and `ocr`).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;

use super::{BoxFuture, ExtractionBackend};
use crate::BackendError;
use crate::llm::truncate;
use crate::model::{BBox, Document, PageLayout, RawExtraction, RawPage, TableRegion, TextBlock, TextLine};

pub const DEFAULT_ENDPOINT: &str = "https://api.upstage.ai/v1/document-digitization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstageModel {
    DocumentParse,
    Ocr,
}

impl UpstageModel {
    fn model_name(self) -> &'static str {
        match self {
            UpstageModel::DocumentParse => "document-parse",
            UpstageModel::Ocr => "ocr",
        }
    }

    pub fn strategy(self) -> &'static str {
        match self {
            UpstageModel::DocumentParse => "upstage_document_parse",
            UpstageModel::Ocr => "upstage_ocr",
        }
    }
}

pub struct UpstageBackend {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: UpstageModel,
    timeout: Duration,
}

impl UpstageBackend {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: UpstageModel,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            model,
            timeout,
        }
    }

    fn settings(&self) -> serde_json::Value {
        json!({
            "endpoint": self.endpoint,
            "model": self.model.model_name(),
            "ocr": "auto",
            "merge_multipage_tables": true,
        })
    }

    async fn request(&self, document: &Document) -> Result<RawExtraction, BackendError> {
        let bytes = tokio::fs::read(&document.path)
            .await
            .map_err(|e| BackendError::OpenError(format!("{}: {e}", document.path.display())))?;

        let form = Form::new()
            .part(
                "document",
                Part::bytes(bytes).file_name(document.name.clone()),
            )
            .text("ocr", "auto")
            .text("model", self.model.model_name())
            .text("merge_multipage_tables", "true");

        let start = Instant::now();
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout)
                } else {
                    BackendError::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Http(format!(
                "{} returned {}: {}",
                self.model.model_name(),
                status.as_u16(),
                truncate(&body, 300)
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        tracing::debug!(
            document = %document.name,
            model = self.model.model_name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "upstage response received"
        );

        parse_upstage_response(body, self.settings())
    }
}

impl ExtractionBackend for UpstageBackend {
    fn name(&self) -> &str {
        self.model.strategy()
    }

    fn extract<'a>(
        &'a self,
        document: &'a Document,
    ) -> BoxFuture<'a, Result<RawExtraction, BackendError>> {
        Box::pin(self.request(document))
    }
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    #[serde(default)]
    elements: Option<Vec<Element>>,
    #[serde(default)]
    pages: Option<Vec<OcrPage>>,
}

#[derive(Debug, Deserialize)]
struct Element {
    #[serde(default)]
    category: String,
    #[serde(default)]
    content: ElementContent,
    #[serde(default)]
    coordinates: Vec<Point>,
    #[serde(default = "first_page")]
    page: u32,
}

fn first_page() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
struct ElementContent {
    markdown: Option<String>,
    text: Option<String>,
    html: Option<String>,
}

impl ElementContent {
    fn best(&self) -> &str {
        [&self.markdown, &self.text, &self.html]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct Point {
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    text: String,
}

#[derive(Default)]
struct PageAccumulator {
    texts: Vec<String>,
    blocks: Vec<TextBlock>,
    tables: Vec<TableRegion>,
}

/// Convert a document-digitization response into pages. Coordinates are
/// normalized, so every page is 1.0 x 1.0.
pub fn parse_upstage_response(
    body: serde_json::Value,
    settings: serde_json::Value,
) -> Result<RawExtraction, BackendError> {
    let parsed: ParseResponse =
        serde_json::from_value(body).map_err(|e| BackendError::Malformed(e.to_string()))?;

    let mut pages: Vec<RawPage> = match (parsed.elements, parsed.pages) {
        (Some(elements), _) => pages_from_elements(elements),
        (None, Some(ocr_pages)) => ocr_pages
            .into_iter()
            .enumerate()
            .map(|(i, p)| RawPage {
                page: i as u32 + 1,
                text: p.text,
                layout: PageLayout {
                    width: 1.0,
                    height: 1.0,
                    ..Default::default()
                },
            })
            .collect(),
        (None, None) => Vec::new(),
    };

    if pages.is_empty() {
        pages.push(RawPage {
            page: 1,
            text: String::new(),
            layout: PageLayout::default(),
        });
    }

    Ok(RawExtraction { pages, settings })
}

fn pages_from_elements(elements: Vec<Element>) -> Vec<RawPage> {
    let mut by_page: BTreeMap<u32, PageAccumulator> = BTreeMap::new();
    for element in elements {
        let acc = by_page.entry(element.page).or_default();
        let text = element.content.best().to_string();
        let bbox = match element.coordinates.as_slice() {
            [a, _, c, _, ..] => Some(BBox::new(a.x, a.y, c.x, c.y)),
            _ => None,
        };

        if element.category == "table" {
            acc.tables.push(TableRegion {
                bbox,
                preview: truncate(&text, 200),
            });
        }
        if text.trim().is_empty() {
            continue;
        }
        if let Some(bbox) = bbox {
            acc.blocks.push(block_from_text(bbox, &text));
        }
        acc.texts.push(text);
    }

    by_page
        .into_iter()
        .map(|(page, acc)| RawPage {
            page,
            text: acc.texts.join("\n\n"),
            layout: PageLayout {
                width: 1.0,
                height: 1.0,
                blocks: acc.blocks,
                tables: acc.tables,
            },
        })
        .collect()
}

/// Split an element into lines spread evenly over its bbox height.
fn block_from_text(bbox: BBox, text: &str) -> TextBlock {
    let raw_lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let n = raw_lines.len().max(1) as f32;
    let step = bbox.height() / n;
    let lines = raw_lines
        .into_iter()
        .enumerate()
        .map(|(i, l)| TextLine {
            bbox: BBox::new(
                bbox.x0,
                bbox.y0 + step * i as f32,
                bbox.x1,
                bbox.y0 + step * (i as f32 + 1.0),
            ),
            text: l.to_string(),
        })
        .collect();
    TextBlock { bbox, lines }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(x0: f32, y0: f32, x1: f32, y1: f32) -> serde_json::Value {
        json!([
            {"x": x0, "y": y0}, {"x": x1, "y": y0},
            {"x": x1, "y": y1}, {"x": x0, "y": y1}
        ])
    }

    #[test]
    fn groups_elements_by_page() {
        let body = json!({
            "elements": [
                {"category": "heading1", "page": 1,
                 "content": {"markdown": "# Title", "text": "Title"},
                 "coordinates": coords(0.1, 0.05, 0.9, 0.1)},
                {"category": "paragraph", "page": 2,
                 "content": {"markdown": "", "text": "Second page"},
                 "coordinates": coords(0.1, 0.2, 0.9, 0.3)},
                {"category": "paragraph", "page": 1,
                 "content": {"html": "<p>Body</p>"}}
            ]
        });
        let raw = parse_upstage_response(body, json!({})).unwrap();
        assert_eq!(raw.pages.len(), 2);
        assert_eq!(raw.pages[0].page, 1);
        assert_eq!(raw.pages[0].text, "# Title\n\n<p>Body</p>");
        assert_eq!(raw.pages[0].layout.blocks.len(), 1);
        assert_eq!(raw.pages[1].text, "Second page");
        assert_eq!(raw.pages[1].layout.width, 1.0);
    }

    #[test]
    fn table_elements_become_regions() {
        let body = json!({
            "elements": [
                {"category": "table", "page": 1,
                 "content": {"markdown": "| a | b |\n|---|---|\n| 1 | 2 |"},
                 "coordinates": coords(0.1, 0.4, 0.8, 0.6)}
            ]
        });
        let raw = parse_upstage_response(body, json!({})).unwrap();
        let layout = &raw.pages[0].layout;
        assert_eq!(layout.tables.len(), 1);
        assert_eq!(layout.tables[0].bbox, Some(BBox::new(0.1, 0.4, 0.8, 0.6)));
        assert_eq!(layout.blocks[0].lines.len(), 3);
    }

    #[test]
    fn empty_response_yields_single_empty_page() {
        let raw = parse_upstage_response(json!({"elements": []}), json!({})).unwrap();
        assert_eq!(raw.pages.len(), 1);
        assert_eq!(raw.pages[0].page, 1);
        assert!(raw.pages[0].text.is_empty());
    }

    #[test]
    fn ocr_pages_shape_is_accepted() {
        let body = json!({"pages": [{"id": 0, "text": "one"}, {"id": 1, "text": "two"}]});
        let raw = parse_upstage_response(body, json!({"model": "ocr"})).unwrap();
        assert_eq!(raw.pages.len(), 2);
        assert_eq!(raw.pages[1].page, 2);
        assert_eq!(raw.pages[1].text, "two");
        assert_eq!(raw.settings["model"], "ocr");
    }

    #[test]
    fn non_object_is_malformed() {
        let err = parse_upstage_response(json!("oops"), json!({})).unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }
}
