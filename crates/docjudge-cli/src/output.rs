use std::io::Write;
use std::path::Path;

use docjudge_core::{BatchOutcome, DocumentState, PipelineEvent, RefineDocumentState};
use docjudge_reporting::{REPORTS_DIR, TABLES_DIR};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn header(w: &mut dyn Write, title: &str, color: ColorMode) -> std::io::Result<()> {
    writeln!(w)?;
    let sep = "=".repeat(60);
    if color.enabled() {
        writeln!(w, "{}", sep.bold())?;
        writeln!(w, "{}", title.bold())?;
        writeln!(w, "{}", sep.bold())?;
    } else {
        writeln!(w, "{}", sep)?;
        writeln!(w, "{}", title)?;
        writeln!(w, "{}", sep)?;
    }
    Ok(())
}

/// One console line for a progress event, or `None` for events that are
/// only logged.
pub fn format_event(event: &PipelineEvent, color: ColorMode) -> Option<String> {
    match event {
        PipelineEvent::DocumentStarted {
            document,
            index,
            total,
        } => Some(format!("[{}/{}] Processing: {}", index + 1, total, document)),
        PipelineEvent::ExtractionFinished {
            document,
            strategy,
            error: Some(error),
            ..
        } => {
            let label = if color.enabled() {
                "WARNING:".yellow().to_string()
            } else {
                "WARNING:".to_string()
            };
            Some(format!("{label} {document}: {strategy} failed: {error}"))
        }
        PipelineEvent::FallbackAttemptRecorded { document, attempt } => {
            let verdict = if attempt.accepted { "accepted" } else { "rejected" };
            let verdict = match (color.enabled(), attempt.accepted) {
                (true, true) => verdict.green().to_string(),
                (true, false) => verdict.dimmed().to_string(),
                (false, _) => verdict.to_string(),
            };
            Some(format!(
                "  {document}: {} {} on {} ({:+.2}) {verdict}",
                attempt.strategy,
                attempt.action.as_str(),
                attempt.axis.as_str(),
                attempt.delta
            ))
        }
        PipelineEvent::DocumentFinished {
            document,
            stage,
            fatal,
            selected,
        } => {
            let status = if *fatal {
                if color.enabled() {
                    "FAILED".red().to_string()
                } else {
                    "FAILED".to_string()
                }
            } else if color.enabled() {
                stage.green().to_string()
            } else {
                stage.to_string()
            };
            Some(match selected {
                Some(strategy) => format!("  {document} -> {status} (selected {strategy})"),
                None => format!("  {document} -> {status}"),
            })
        }
        PipelineEvent::ExtractionFinished { .. }
        | PipelineEvent::StageEntered { .. }
        | PipelineEvent::PageJudged { .. }
        | PipelineEvent::PageRefined { .. } => None,
    }
}

fn counts_line<S>(outcome: &BatchOutcome<S>) -> String {
    let mut line = format!(
        "Completed: {}  Failed: {}  Total: {}",
        outcome.succeeded,
        outcome.failed,
        outcome.items.len()
    );
    if outcome.skipped > 0 {
        line.push_str(&format!("  Skipped (interrupted): {}", outcome.skipped));
    }
    line
}

/// Strategy batch summary: counts, then the winner per document.
pub fn print_strategy_summary(
    w: &mut dyn Write,
    outcome: &BatchOutcome<DocumentState>,
    color: ColorMode,
) -> std::io::Result<()> {
    header(w, "STRATEGY SUMMARY", color)?;
    writeln!(w, "  {}", counts_line(outcome))?;
    writeln!(w)?;

    for item in &outcome.items {
        let Some(state) = &item.state else {
            writeln!(w, "  {}: not started", item.path.display())?;
            continue;
        };
        let name = &state.document().name;
        if state.is_fatal() {
            let reason = state
                .errors()
                .last()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            if color.enabled() {
                writeln!(w, "  {}: {} ({})", name, "FAILED".red(), reason)?;
            } else {
                writeln!(w, "  {}: FAILED ({})", name, reason)?;
            }
            continue;
        }
        match state.final_selection() {
            Some(selection) => {
                let winner = format!(
                    "{} [{}]",
                    selection.strategy,
                    selection.fallback_state.label()
                );
                let winner = if color.enabled() {
                    winner.cyan().to_string()
                } else {
                    winner
                };
                write!(
                    w,
                    "  {}: {}  S_total {:.4}  quality {:.2}",
                    name, winner, selection.s_total, selection.candidate.quality_score
                )?;
                if selection.below_threshold {
                    if color.enabled() {
                        write!(w, "  {}", "(below threshold)".yellow())?;
                    } else {
                        write!(w, "  (below threshold)")?;
                    }
                }
                writeln!(w)?;
            }
            None => writeln!(
                w,
                "  {}: stopped after {}",
                name,
                state.stage_limit().as_str()
            )?,
        }
    }
    Ok(())
}

/// Refine batch summary: counts, then per-document refine statistics.
pub fn print_refine_summary(
    w: &mut dyn Write,
    outcome: &BatchOutcome<RefineDocumentState>,
    color: ColorMode,
) -> std::io::Result<()> {
    header(w, "REFINE SUMMARY", color)?;
    writeln!(w, "  {}", counts_line(outcome))?;
    writeln!(w)?;

    let mut total_cost = 0.0;
    for item in &outcome.items {
        let Some(state) = &item.state else {
            writeln!(w, "  {}: not started", item.path.display())?;
            continue;
        };
        let name = &state.document().name;
        match state.report() {
            Some(report) => {
                total_cost += report.total_cost_usd;
                writeln!(
                    w,
                    "  {}: {}/{} pages refined ({:.1}%), {} skipped, ${:.4}",
                    name,
                    report.pages_refined,
                    report.total_pages,
                    report.refine_rate * 100.0,
                    report.pages_skipped,
                    report.total_cost_usd
                )?;
            }
            None => {
                let reason = state
                    .errors()
                    .last()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error");
                if color.enabled() {
                    writeln!(w, "  {}: {} ({})", name, "FAILED".red(), reason)?;
                } else {
                    writeln!(w, "  {}: FAILED ({})", name, reason)?;
                }
            }
        }
    }
    writeln!(w)?;
    writeln!(w, "  Total refine cost: ${:.4}", total_cost)?;
    Ok(())
}

pub fn print_output_locations(
    w: &mut dyn Write,
    output_dir: &Path,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    let reports = output_dir.join(REPORTS_DIR);
    let tables = output_dir.join(TABLES_DIR);
    if color.enabled() {
        writeln!(w, "Reports: {}", reports.display().dimmed())?;
        writeln!(w, "Tables:  {}", tables.display().dimmed())?;
    } else {
        writeln!(w, "Reports: {}", reports.display())?;
        writeln!(w, "Tables:  {}", tables.display())?;
    }
    Ok(())
}
