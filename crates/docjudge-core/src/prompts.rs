//! Prompt templates for the judge and refine oracles.

use crate::llm::truncate;
use crate::refine::RefineIssues;

/// Characters of page text sent to the judge.
pub const JUDGE_TEXT_LIMIT: usize = 6000;
/// Characters of page text sent to the refine validator.
pub const REFINE_VALIDATION_TEXT_LIMIT: usize = 2000;

pub const JUDGE_SYSTEM_PROMPT: &str = r#"You evaluate the quality of text extracted from a document page.
Score each dimension from 0 to 100:

- S_read: reading order is correct (columns, headings, captions in a natural order)
- S_sent: sentences are complete and not broken across lines or fragments
- S_noise: free of page numbers, repeated headers/footers and other artifacts
- S_table: tables are parsed with recognisable rows and cells
- S_fig: figure captions and chart labels are preserved

If the page has no figures, set S_fig to null.

Respond with JSON only:
{"S_read": 0-100, "S_sent": 0-100, "S_noise": 0-100, "S_table": 0-100, "S_fig": 0-100 or null, "notes": "short rationale"}"#;

pub fn judge_prompt(strategy: &str, page: u32, text: &str) -> String {
    format!(
        "Extraction strategy: {strategy}\nPage: {page}\n\nExtracted text:\n```\n{}\n```\n\nScore this page.",
        truncate(text, JUDGE_TEXT_LIMIT)
    )
}

pub const REFINE_VALIDATION_SYSTEM_PROMPT: &str = r#"You decide whether text extracted from a document page needs cleanup.
Look for these issues:

- line_break_errors: line breaks inside sentences, split words, broken spacing
- header_footer_noise: page numbers, repeated headers or footers mixed into the body
- mixed_content: table or table-of-contents text interleaved with body text
- encoding_errors: garbled characters or broken symbols
- paragraph_structure: missing or misplaced paragraph boundaries

Minor problems do not need refinement. Only answer true when cleanup would clearly improve the text.

Respond with JSON only:
{"need_refine": true|false, "issues": {"line_break_errors": bool, "header_footer_noise": bool, "mixed_content": bool, "encoding_errors": bool, "paragraph_structure": bool}, "confidence": 0.0-1.0, "reason": "short explanation"}"#;

pub fn refine_validation_prompt(page: u32, text: &str) -> String {
    format!(
        "Text extracted from page {page}:\n```\n{}\n```\n\nDoes it need refinement?",
        truncate(text, REFINE_VALIDATION_TEXT_LIMIT)
    )
}

pub const REFINE_SYSTEM_PROMPT: &str = r#"You clean up text extracted from a document page without changing its meaning.
Available actions:

- sentence_reconstruction: join broken lines and split words, normalise spacing
- noise_removal: drop page numbers and repeated headers or footers
- table_improvement: make table rows and list items readable
- paragraph_separation: separate logical paragraphs and headings
- character_normalization: repair garbled or mis-encoded characters

Never add, remove or reword content beyond these actions.

Respond with JSON only:
{"refined_text": "full cleaned text", "refine_actions": ["sentence_reconstruction", ...], "improvements": {"fixed_line_breaks": 0, "removed_noise_lines": 0}, "summary": "what changed"}"#;

pub fn refine_prompt(page: u32, text: &str, issues: &RefineIssues) -> String {
    let mut found: Vec<&str> = Vec::new();
    if issues.line_break_errors {
        found.push("- line break or spacing errors");
    }
    if issues.header_footer_noise {
        found.push("- header, footer or page number noise");
    }
    if issues.mixed_content {
        found.push("- tables or contents mixed into body text");
    }
    if issues.encoding_errors {
        found.push("- special character or encoding errors");
    }
    if issues.paragraph_structure {
        found.push("- inconsistent paragraph structure");
    }
    let issues_text = if found.is_empty() {
        "- general quality improvement".to_string()
    } else {
        found.join("\n")
    };
    format!(
        "Text extracted from page {page}.\n\nIssues found:\n{issues_text}\n\nOriginal text:\n```\n{text}\n```\n\nReturn the refined text."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judge_prompt_truncates_long_pages() {
        let text = "x".repeat(JUDGE_TEXT_LIMIT + 100);
        let prompt = judge_prompt("ocr", 2, &text);
        assert!(prompt.contains("Page: 2"));
        assert!(!prompt.contains(&"x".repeat(JUDGE_TEXT_LIMIT + 1)));
    }

    #[test]
    fn refine_prompt_lists_issues() {
        let issues = RefineIssues {
            header_footer_noise: true,
            ..Default::default()
        };
        let prompt = refine_prompt(1, "body", &issues);
        assert!(prompt.contains("page number noise"));
        assert!(!prompt.contains("general quality"));

        let none = refine_prompt(1, "body", &RefineIssues::default());
        assert!(none.contains("general quality improvement"));
    }
}
