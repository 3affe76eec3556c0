//! Layout remediation used by fallback reprocessing.
//!
//! All tolerances are fractions of the page size so the same code handles
//! point-based MuPDF coordinates and Upstage's normalized coordinates.

use serde::{Deserialize, Serialize};

use crate::fallback::FallbackAction;
use crate::model::{PageLayout, RawPage, TextBlock, TextLine};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidlineMode {
    /// Look for a whitespace gutter in the middle third of the page.
    #[default]
    Auto,
    /// Always split at the page centre.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub midline: MidlineMode,
    /// Column overlap tolerance as a fraction of page width.
    pub overlap_ratio: f32,
    /// Same-row tolerance as a fraction of page height.
    pub row_tolerance_ratio: f32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            midline: MidlineMode::Auto,
            overlap_ratio: 0.004,
            row_tolerance_ratio: 0.0036,
        }
    }
}

/// Blocks wider than this share of the page are ignored for gutter detection.
const GUTTER_MAX_BLOCK_SHARE: f32 = 0.6;

/// Page extent, falling back to the block union when the backend reported
/// no size.
fn page_size(layout: &PageLayout) -> (f32, f32) {
    let mut width = layout.width;
    let mut height = layout.height;
    if width <= 0.0 || height <= 0.0 {
        for block in &layout.blocks {
            width = width.max(block.bbox.x1);
            height = height.max(block.bbox.y1);
        }
    }
    (width, height)
}

/// Apply a fallback action to one page. Pages without block layout are
/// returned unchanged.
pub fn remediate(action: FallbackAction, page: &RawPage, config: &LayoutConfig) -> RawPage {
    if page.layout.blocks.is_empty() {
        return page.clone();
    }
    match action {
        FallbackAction::CustomSplit => custom_split(page, config),
        FallbackAction::LayoutReorder => layout_reorder(page, config),
        FallbackAction::TableEnhancement => enhance_tables(page, config),
    }
}

/// X coordinate separating the left and right column.
pub fn detect_midline(layout: &PageLayout, config: &LayoutConfig) -> f32 {
    let (width, _) = page_size(layout);
    let centre = width / 2.0;
    if config.midline == MidlineMode::Fixed || width <= 0.0 {
        return centre;
    }

    let lo = width / 3.0;
    let hi = 2.0 * width / 3.0;
    let mut intervals: Vec<(f32, f32)> = layout
        .blocks
        .iter()
        .filter(|b| b.bbox.width() < GUTTER_MAX_BLOCK_SHARE * width)
        .filter(|b| b.bbox.x1 > lo && b.bbox.x0 < hi)
        .map(|b| (b.bbox.x0.max(lo), b.bbox.x1.min(hi)))
        .collect();
    intervals.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut best: Option<(f32, f32)> = None;
    let mut cursor = lo;
    let mut consider = |start: f32, end: f32| {
        if end > start && best.is_none_or(|(s, e)| end - start > e - s) {
            best = Some((start, end));
        }
    };
    for (x0, x1) in intervals {
        if x0 > cursor {
            consider(cursor, x0);
        }
        cursor = cursor.max(x1);
    }
    consider(cursor, hi);

    let overlap = config.overlap_ratio * width;
    match best {
        Some((start, end)) if end - start > 2.0 * overlap => (start + end) / 2.0,
        _ => centre,
    }
}

/// Left column top-to-bottom, then the right column.
pub fn custom_split(page: &RawPage, config: &LayoutConfig) -> RawPage {
    let (width, _) = page_size(&page.layout);
    let midline = detect_midline(&page.layout, config);
    let overlap = config.overlap_ratio * width;

    let (mut left, mut right): (Vec<TextBlock>, Vec<TextBlock>) = page
        .layout
        .blocks
        .iter()
        .cloned()
        .partition(|b| b.bbox.center_x() < midline + overlap);
    let by_position = |a: &TextBlock, b: &TextBlock| {
        a.bbox
            .y0
            .total_cmp(&b.bbox.y0)
            .then(a.bbox.x0.total_cmp(&b.bbox.x0))
    };
    left.sort_by(by_position);
    right.sort_by(by_position);
    left.extend(right);

    rebuild(page, left)
}

/// Top-to-bottom, and left-to-right within a visual row.
pub fn layout_reorder(page: &RawPage, config: &LayoutConfig) -> RawPage {
    let (_, height) = page_size(&page.layout);
    let tolerance = config.row_tolerance_ratio * height;

    let rows = group_rows(page.layout.blocks.clone(), tolerance, |b| b.bbox.y0);
    let ordered: Vec<TextBlock> = rows
        .into_iter()
        .flat_map(|mut row| {
            row.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
            row
        })
        .collect();

    rebuild(page, ordered)
}

/// Group items into rows: sort by `key`, then start a new row whenever an
/// item lies further than `tolerance` below the row's first item.
fn group_rows<T>(mut items: Vec<T>, tolerance: f32, key: impl Fn(&T) -> f32) -> Vec<Vec<T>> {
    items.sort_by(|a, b| key(a).total_cmp(&key(b)));
    let mut rows: Vec<Vec<T>> = Vec::new();
    let mut anchor = f32::NEG_INFINITY;
    for item in items {
        let y = key(&item);
        match rows.last_mut() {
            Some(row) if y - anchor <= tolerance => row.push(item),
            _ => {
                anchor = y;
                rows.push(vec![item]);
            }
        }
    }
    rows
}

fn rebuild(page: &RawPage, blocks: Vec<TextBlock>) -> RawPage {
    let text = render_blocks(&blocks);
    RawPage {
        page: page.page,
        text,
        layout: PageLayout {
            blocks,
            ..page.layout.clone()
        },
    }
}

/// Join block texts with blank lines, skipping empty blocks.
pub fn render_blocks(blocks: &[TextBlock]) -> String {
    blocks
        .iter()
        .map(|b| b.text())
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Regroup table lines into pipe-separated rows.
pub fn enhance_tables(page: &RawPage, config: &LayoutConfig) -> RawPage {
    let (width, height) = page_size(&page.layout);
    let tolerance = config.row_tolerance_ratio * height;
    let overlap = config.overlap_ratio * width;

    // (block index, line) in reading order
    let lines: Vec<(usize, &TextLine)> = page
        .layout
        .blocks
        .iter()
        .enumerate()
        .flat_map(|(i, b)| b.lines.iter().map(move |l| (i, l)))
        .collect();

    let membership = table_membership(&page.layout, &lines, tolerance, overlap);
    let table_count = membership.iter().flatten().max().map_or(0, |m| m + 1);
    if table_count == 0 {
        return page.clone();
    }

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_block = None;
    let mut emitted = vec![false; table_count];

    for (idx, (block, line)) in lines.iter().enumerate() {
        if current_block != Some(*block) && !current.is_empty() {
            paragraphs.push(current.join("\n"));
            current.clear();
        }
        current_block = Some(*block);
        match membership[idx] {
            Some(table) => {
                if emitted[table] {
                    continue;
                }
                emitted[table] = true;
                if !current.is_empty() {
                    paragraphs.push(current.join("\n"));
                    current.clear();
                }
                let members: Vec<&TextLine> = lines
                    .iter()
                    .zip(&membership)
                    .filter(|(_, m)| **m == Some(table))
                    .map(|((_, l), _)| *l)
                    .collect();
                paragraphs.push(render_table(members, tolerance));
            }
            None => {
                if !line.text.trim().is_empty() {
                    current.push(&line.text);
                }
            }
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    RawPage {
        page: page.page,
        text: paragraphs.join("\n\n"),
        layout: page.layout.clone(),
    }
}

/// Table id per line, from the backend's table regions when they carry a
/// bbox, otherwise from rows of horizontally separated lines.
fn table_membership(
    layout: &PageLayout,
    lines: &[(usize, &TextLine)],
    tolerance: f32,
    overlap: f32,
) -> Vec<Option<usize>> {
    let regions: Vec<_> = layout.tables.iter().filter_map(|t| t.bbox).collect();
    if !regions.is_empty() {
        return lines
            .iter()
            .map(|(_, l)| {
                regions
                    .iter()
                    .position(|r| r.contains_point(l.bbox.center_x(), l.bbox.center_y()))
            })
            .collect();
    }

    let indexed: Vec<usize> = (0..lines.len()).collect();
    let rows = group_rows(indexed, tolerance, |i| lines[*i].1.bbox.center_y());

    let mut membership = vec![None; lines.len()];
    let mut table = 0usize;
    let mut in_table = false;
    for mut row in rows {
        row.sort_by(|a, b| lines[*a].1.bbox.x0.total_cmp(&lines[*b].1.bbox.x0));
        let separated = row.len() >= 2
            && row
                .windows(2)
                .all(|w| lines[w[1]].1.bbox.x0 >= lines[w[0]].1.bbox.x1 - overlap);
        if separated {
            for i in &row {
                membership[*i] = Some(table);
            }
            in_table = true;
        } else if in_table {
            table += 1;
            in_table = false;
        }
    }
    membership
}

fn render_table(lines: Vec<&TextLine>, tolerance: f32) -> String {
    group_rows(lines, tolerance, |l| l.bbox.center_y())
        .into_iter()
        .map(|mut row| {
            row.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
            let cells: Vec<&str> = row.iter().map(|l| l.text.trim()).collect();
            format!("| {} |", cells.join(" | "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BBox, TableRegion};

    fn block(x0: f32, y0: f32, x1: f32, y1: f32, text: &str) -> TextBlock {
        TextBlock {
            bbox: BBox::new(x0, y0, x1, y1),
            lines: vec![TextLine {
                bbox: BBox::new(x0, y0, x1, y1),
                text: text.to_string(),
            }],
        }
    }

    fn page(blocks: Vec<TextBlock>) -> RawPage {
        RawPage {
            page: 1,
            text: render_blocks(&blocks),
            layout: PageLayout {
                width: 600.0,
                height: 800.0,
                blocks,
                tables: vec![],
            },
        }
    }

    /// Two columns interleaved in backend order: L1 R1 L2 R2.
    fn two_column_page() -> RawPage {
        page(vec![
            block(50.0, 100.0, 270.0, 140.0, "L1"),
            block(330.0, 100.0, 550.0, 140.0, "R1"),
            block(50.0, 200.0, 270.0, 240.0, "L2"),
            block(330.0, 200.0, 550.0, 240.0, "R2"),
        ])
    }

    #[test]
    fn midline_found_in_gutter() {
        let p = two_column_page();
        let m = detect_midline(&p.layout, &LayoutConfig::default());
        assert!((m - 300.0).abs() < 1e-3, "midline {m}");
    }

    #[test]
    fn midline_fixed_is_centre() {
        let p = page(vec![
            block(50.0, 100.0, 200.0, 140.0, "L"),
            block(250.0, 100.0, 550.0, 140.0, "R"),
        ]);
        let cfg = LayoutConfig {
            midline: MidlineMode::Fixed,
            ..Default::default()
        };
        assert_eq!(detect_midline(&p.layout, &cfg), 300.0);
        // Auto finds the gutter between 200 and 250 instead.
        let auto = detect_midline(&p.layout, &LayoutConfig::default());
        assert!((auto - 225.0).abs() < 1e-3);
    }

    #[test]
    fn full_width_blocks_do_not_hide_gutter() {
        let mut p = two_column_page();
        p.layout
            .blocks
            .push(block(40.0, 20.0, 560.0, 60.0, "Title spanning the page"));
        let m = detect_midline(&p.layout, &LayoutConfig::default());
        assert!((m - 300.0).abs() < 1e-3);
    }

    #[test]
    fn custom_split_reads_left_column_first() {
        let out = custom_split(&two_column_page(), &LayoutConfig::default());
        assert_eq!(out.text, "L1\n\nL2\n\nR1\n\nR2");
        assert_eq!(out.page, 1);
        assert_eq!(out.layout.blocks.len(), 4);
    }

    #[test]
    fn layout_reorder_reads_rows_left_to_right() {
        let p = page(vec![
            block(330.0, 101.0, 550.0, 140.0, "B"),
            block(50.0, 300.0, 270.0, 340.0, "C"),
            block(50.0, 100.0, 270.0, 140.0, "A"),
        ]);
        let out = layout_reorder(&p, &LayoutConfig::default());
        // 1pt apart is within 0.0036 * 800 = 2.88
        assert_eq!(out.text, "A\n\nB\n\nC");
    }

    #[test]
    fn enhance_tables_with_region() {
        let mut p = page(vec![
            block(50.0, 50.0, 550.0, 70.0, "Quarterly results"),
            block(50.0, 100.0, 150.0, 120.0, "Q1"),
            block(200.0, 100.0, 300.0, 120.0, "10"),
            block(50.0, 130.0, 150.0, 150.0, "Q2"),
            block(200.0, 130.0, 300.0, 150.0, "12"),
        ]);
        p.layout.tables.push(TableRegion {
            bbox: Some(BBox::new(40.0, 90.0, 320.0, 160.0)),
            preview: String::new(),
        });
        let out = enhance_tables(&p, &LayoutConfig::default());
        assert_eq!(out.text, "Quarterly results\n\n| Q1 | 10 |\n| Q2 | 12 |");
    }

    #[test]
    fn enhance_tables_heuristic_rows() {
        let p = page(vec![
            block(50.0, 50.0, 550.0, 70.0, "Intro paragraph"),
            block(50.0, 100.0, 150.0, 120.0, "a"),
            block(200.0, 100.0, 300.0, 120.0, "b"),
        ]);
        let out = enhance_tables(&p, &LayoutConfig::default());
        assert_eq!(out.text, "Intro paragraph\n\n| a | b |");
    }

    #[test]
    fn enhance_tables_without_tables_is_identity() {
        let p = page(vec![block(50.0, 50.0, 550.0, 70.0, "Only prose")]);
        assert_eq!(enhance_tables(&p, &LayoutConfig::default()), p);
    }

    #[test]
    fn remediate_without_blocks_is_identity() {
        let p = RawPage {
            page: 3,
            text: "plain".into(),
            layout: PageLayout::default(),
        };
        for action in FallbackAction::ALL {
            assert_eq!(remediate(action, &p, &LayoutConfig::default()), p);
        }
    }

    #[test]
    fn normalized_coordinates_work() {
        let mut p = two_column_page();
        for b in &mut p.layout.blocks {
            for v in [&mut b.bbox.x0, &mut b.bbox.x1] {
                *v /= 600.0;
            }
            for v in [&mut b.bbox.y0, &mut b.bbox.y1] {
                *v /= 800.0;
            }
        }
        p.layout.width = 1.0;
        p.layout.height = 1.0;
        let out = custom_split(&p, &LayoutConfig::default());
        assert_eq!(out.text, "L1\n\nL2\n\nR1\n\nR2");
    }
}
