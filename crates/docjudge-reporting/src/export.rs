use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use docjudge_core::pipeline::{DocumentState, ErrorEntry};
use docjudge_core::quality::Axis;
use docjudge_core::refine::{PageRefineResult, RefineDocumentState, RefineReport, RefineStage};
use docjudge_core::selection::RankedCandidate;
use docjudge_core::{Document, Stage};

pub const FULL_COMBINATIONS_HEADER: &str = "document,strategy,fallback_state,rank,superseded,eligible,quality_score,classification,S_read,S_sent,S_noise,S_table,S_fig,normalized_quality,normalized_speed,S_total,cost_usd,time_ms,scored_pages,unscored_pages,failing_axes";

pub const FINAL_SELECTION_HEADER: &str = "document,strategy,fallback_state,quality_score,classification,S_total,cost_usd,time_ms,below_threshold,fallback_attempts,accepted_attempts,errors,judge_cost_usd,elapsed_ms,justification";

pub const FAILED_DOCUMENTS_HEADER: &str = "document,path,mode,stage,error,error_count";

pub const REFINE_LOG_HEADER: &str = "page_num,strategy,need_refine,refined,line_break_errors,header_footer_noise,mixed_content,encoding_errors,paragraph_structure,confidence,reason,refine_actions,character_diff,original_preview,refined_preview,validation_time_ms,refine_time_ms,validation_cost_usd,refine_cost_usd,error";

/// Characters of page text kept in the refine log previews.
const PREVIEW_CHARS: usize = 100;

pub(crate) fn csv_escape(s: &str) -> String {
    if s.contains('"') || s.contains(',') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn csv_row(fields: &[String]) -> String {
    let mut row = fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

fn yes_no(b: bool) -> String {
    if b { "Yes" } else { "No" }.to_string()
}

fn fmt_score(v: f64) -> String {
    format!("{:.2}", v)
}

fn fmt_opt_score(v: Option<f64>) -> String {
    v.map(fmt_score).unwrap_or_default()
}

fn axes_list(axes: &[Axis]) -> String {
    axes.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(";")
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// One `full_combinations.csv` row per candidate, in table order.
pub fn full_combination_rows(state: &DocumentState) -> String {
    let document = &state.document().name;
    state
        .candidates()
        .iter()
        .map(|r| combination_row(document, r))
        .collect()
}

fn combination_row(document: &str, ranked: &RankedCandidate) -> String {
    let c = &ranked.candidate;
    let axis = |a: Axis| fmt_opt_score(c.axis_means.get(&a).copied());
    csv_row(&[
        document.to_string(),
        c.strategy.clone(),
        c.fallback_state.label(),
        ranked.rank.map(|r| r.to_string()).unwrap_or_default(),
        c.superseded.to_string(),
        ranked.eligible.to_string(),
        fmt_score(c.quality_score),
        c.classification.as_str().to_string(),
        axis(Axis::Read),
        axis(Axis::Sentence),
        axis(Axis::Noise),
        axis(Axis::Table),
        axis(Axis::Figure),
        format!("{:.4}", ranked.normalized_quality),
        format!("{:.4}", ranked.normalized_speed),
        format!("{:.4}", ranked.s_total),
        format!("{:.6}", c.total_cost_usd),
        format!("{:.0}", c.total_time_ms),
        c.scored_pages.to_string(),
        c.unscored_pages.to_string(),
        axes_list(&c.failing_axes),
    ])
}

/// The `final_selection.csv` row, if a selection was made.
pub fn final_selection_row(state: &DocumentState) -> Option<String> {
    let s = state.final_selection()?;
    let accepted = state.fallback_attempts().iter().filter(|a| a.accepted).count();
    Some(csv_row(&[
        state.document().name.clone(),
        s.strategy.clone(),
        s.fallback_state.label(),
        fmt_score(s.candidate.quality_score),
        s.candidate.classification.as_str().to_string(),
        format!("{:.4}", s.s_total),
        format!("{:.6}", s.candidate.total_cost_usd),
        format!("{:.0}", s.candidate.total_time_ms),
        s.below_threshold.to_string(),
        state.fallback_attempts().len().to_string(),
        accepted.to_string(),
        state.errors().len().to_string(),
        format!("{:.6}", state.judge_cost_usd()),
        format!("{:.0}", state.elapsed_ms()),
        s.justification.clone(),
    ]))
}

/// The `failed_documents.csv` row for a fatal document.
pub fn failed_document_row(
    document: &Document,
    mode: &str,
    errors: &[ErrorEntry],
) -> String {
    // The last entry is the one that aborted the document.
    let last = errors.last();
    csv_row(&[
        document.name.clone(),
        document.path.display().to_string(),
        mode.to_string(),
        last.map(|e| e.stage.clone()).unwrap_or_default(),
        last.map(|e| e.message.clone()).unwrap_or_default(),
        errors.len().to_string(),
    ])
}

/// Refine log rows: one per validated page, joined with its refine result.
pub fn refine_log_rows(state: &RefineDocumentState) -> String {
    state
        .validation_results()
        .iter()
        .map(|v| {
            let refined: Option<&PageRefineResult> =
                state.refine_results().iter().find(|r| r.key == v.key);
            let actions = refined
                .map(|r| {
                    r.refine_actions
                        .iter()
                        .map(|a| a.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            let error = v
                .error
                .clone()
                .or_else(|| refined.and_then(|r| r.error.clone()))
                .unwrap_or_default();
            csv_row(&[
                v.key.page.to_string(),
                v.key.strategy.clone(),
                yes_no(v.need_refine),
                yes_no(refined.is_some_and(|r| r.refined)),
                yes_no(v.issues.line_break_errors),
                yes_no(v.issues.header_footer_noise),
                yes_no(v.issues.mixed_content),
                yes_no(v.issues.encoding_errors),
                yes_no(v.issues.paragraph_structure),
                format!("{:.2}", v.confidence),
                v.reason.clone(),
                actions,
                refined.map(|r| r.character_delta).unwrap_or(0).to_string(),
                refined.map(|r| preview(&r.original_text)).unwrap_or_default(),
                refined
                    .and_then(|r| r.refined_text.as_deref())
                    .map(preview)
                    .unwrap_or_default(),
                format!("{:.0}", v.processing_time_ms),
                format!("{:.0}", refined.map(|r| r.processing_time_ms).unwrap_or(0.0)),
                format!("${:.6}", v.cost_usd),
                format!("${:.6}", refined.map(|r| r.cost_usd).unwrap_or(0.0)),
                error,
            ])
        })
        .collect()
}

#[derive(Serialize)]
struct JudgeReport<'a> {
    generated_at: String,
    document: &'a str,
    status: &'a str,
    extraction_cost_usd: f64,
    judge_cost_usd: f64,
    state: &'a DocumentState,
}

/// The per-document `{doc}_judge_report.json`.
pub fn judge_report_json(state: &DocumentState) -> Result<String, serde_json::Error> {
    let status = match state.stage() {
        Stage::Completed => "completed",
        _ => "failed",
    };
    serde_json::to_string_pretty(&JudgeReport {
        generated_at: iso_timestamp(),
        document: &state.document().name,
        status,
        extraction_cost_usd: state.extraction_cost_usd(),
        judge_cost_usd: state.judge_cost_usd(),
        state,
    })
}

#[derive(Serialize)]
struct RefineJsonReport<'a> {
    generated_at: String,
    document: &'a str,
    status: &'a str,
    statistics: Option<&'a RefineReport>,
    /// Refined pages as a percentage string, e.g. `"50.0%"`.
    refine_rate: String,
    state: &'a RefineDocumentState,
}

/// The per-document `{doc}_refine_report.json`.
pub fn refine_report_json(state: &RefineDocumentState) -> Result<String, serde_json::Error> {
    let status = match state.stage() {
        RefineStage::Complete => "complete",
        _ => "failed",
    };
    let rate = state.report().map(|r| r.refine_rate).unwrap_or(0.0);
    serde_json::to_string_pretty(&RefineJsonReport {
        generated_at: iso_timestamp(),
        document: &state.document().name,
        status,
        statistics: state.report(),
        refine_rate: format!("{:.1}%", rate * 100.0),
        state,
    })
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// UTC `(y, m, d, hh, mm, ss)` for seconds since the epoch.
fn civil_time(secs: u64) -> (u64, u64, u64, u64, u64, u64) {
    let (y, m, d) = days_to_ymd(secs / 86400);
    let rem = secs % 86400;
    (y, m, d, rem / 3600, (rem % 3600) / 60, rem % 60)
}

/// `YYYYMMDD_HHMMSS` in UTC, for file names.
pub(crate) fn file_timestamp() -> String {
    let (y, mo, d, h, mi, s) = civil_time(now_secs());
    format!("{y:04}{mo:02}{d:02}_{h:02}{mi:02}{s:02}")
}

fn iso_timestamp() -> String {
    let (y, mo, d, h, mi, s) = civil_time(now_secs());
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}Z")
}

/// Convert days since Unix epoch to (year, month, day).
fn days_to_ymd(days: u64) -> (u64, u64, u64) {
    // Simplified civil calendar conversion
    let z = days + 719468;
    let era = z / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_preview_truncates_on_chars() {
        let korean = "가".repeat(150);
        let p = preview(&korean);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn test_civil_time() {
        assert_eq!(civil_time(0), (1970, 1, 1, 0, 0, 0));
        // 2024-02-29T12:34:56Z
        assert_eq!(civil_time(1_709_210_096), (2024, 2, 29, 12, 34, 56));
    }

    #[test]
    fn test_days_to_ymd_known_dates() {
        assert_eq!(days_to_ymd(19_723), (2024, 1, 1));
        assert_eq!(days_to_ymd(10_957), (2000, 1, 1));
    }

    #[test]
    fn test_headers_have_matching_widths() {
        assert_eq!(FULL_COMBINATIONS_HEADER.split(',').count(), 21);
        assert_eq!(FINAL_SELECTION_HEADER.split(',').count(), 15);
        assert_eq!(REFINE_LOG_HEADER.split(',').count(), 20);
    }
}
