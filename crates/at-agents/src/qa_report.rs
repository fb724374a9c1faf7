//! Turns QA agent output into a [`QaReport`].
//!
//! Parsing never panics and never invents a passing verdict: anything that
//! cannot be read defaults to a failure, and output without a valid report
//! yields `None` so the caller has to fall back to
//! [`create_fallback_report`].

use at_core::types::{
    CheckOutcome, QaIssue, QaReport, QaResult, QaScreenshot, QaSeverity, VerificationSuite,
};
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

/// Parse the first valid report found in `text`.
///
/// Fenced ```json blocks are tried first, in order. Only when none of them
/// parses as JSON are bare `{...}` spans mentioning `"result"` considered.
pub fn parse_qa_report(text: &str, duration_ms: u64) -> Option<QaReport> {
    let mut candidates: Vec<Value> = fenced_json_blocks(text)
        .into_iter()
        .filter_map(|block| serde_json::from_str(block).ok())
        .collect();

    if candidates.is_empty() {
        candidates = brace_spans(text)
            .into_iter()
            .filter(|span| span.contains("\"result\""))
            .filter_map(|span| serde_json::from_str(span).ok())
            .collect();
    }

    let report = candidates
        .iter()
        .filter_map(Value::as_object)
        .find_map(|obj| coerce_report(obj, duration_ms));
    if report.is_none() {
        debug!(candidates = candidates.len(), "no valid QA report in agent output");
    }
    report
}

/// The failing report used whenever agent output yields nothing usable.
pub fn create_fallback_report(duration_ms: u64, error: Option<&str>) -> QaReport {
    let issues = error
        .map(|message| {
            vec![QaIssue {
                severity: QaSeverity::Critical,
                category: "parse_error".to_string(),
                description: message.to_string(),
                screenshot: None,
                location: None,
            }]
        })
        .unwrap_or_default();

    QaReport {
        result: QaResult::Fail,
        checks_run: 0,
        checks_passed: 0,
        issues,
        verification_suite: VerificationSuite::all_failed(),
        screenshots: Vec::new(),
        duration: duration_ms,
    }
}

// ---------------------------------------------------------------------------
// Candidate extraction
// ---------------------------------------------------------------------------

fn fenced_json_blocks(text: &str) -> Vec<&str> {
    const OPEN: &str = "```json";
    const CLOSE: &str = "```";

    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let body = &rest[start + OPEN.len()..];
        match body.find(CLOSE) {
            Some(end) => {
                blocks.push(body[..end].trim());
                rest = &body[end + CLOSE.len()..];
            }
            None => break,
        }
    }
    blocks
}

/// Top-level balanced `{...}` spans. Braces inside JSON strings are ignored.
fn brace_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if depth > 0 && in_string {
            match (escaped, ch) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = idx;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=idx]);
                }
            }
            _ => {}
        }
    }
    spans
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

fn coerce_report(obj: &Map<String, Value>, duration_ms: u64) -> Option<QaReport> {
    let result = obj.get("result").and_then(Value::as_str).and_then(QaResult::parse)?;

    let verification_suite = obj
        .get("verificationSuite")
        .and_then(Value::as_object)
        .map(coerce_suite)
        .unwrap_or_else(VerificationSuite::all_failed);

    let issues: Vec<QaIssue> = obj
        .get("issues")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(coerce_issue).collect())
        .unwrap_or_default();

    let screenshots: Vec<QaScreenshot> = obj
        .get("screenshots")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(coerce_screenshot).collect())
        .unwrap_or_default();

    let passes = verification_suite.pass_count();
    let checks_run = count_field(obj, "checksRun")
        .unwrap_or_else(|| passes.saturating_add(issues.len() as u32));
    let checks_passed = count_field(obj, "checksPassed").unwrap_or(passes);

    Some(QaReport {
        result,
        checks_run,
        checks_passed,
        issues,
        verification_suite,
        screenshots,
        duration: duration_ms,
    })
}

fn count_field(obj: &Map<String, Value>, key: &str) -> Option<u32> {
    obj.get(key)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

fn coerce_suite(obj: &Map<String, Value>) -> VerificationSuite {
    let outcome = |key: &str| match obj.get(key).and_then(Value::as_str) {
        Some("pass") => CheckOutcome::Pass,
        _ => CheckOutcome::Fail,
    };
    VerificationSuite {
        lint: outcome("lint"),
        typecheck: outcome("typecheck"),
        test: outcome("test"),
        build: outcome("build"),
        docs: outcome("docs"),
    }
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn coerce_issue(value: &Value) -> Option<QaIssue> {
    let obj = value.as_object()?;
    let description = non_empty_str(obj, "description")?;
    Some(QaIssue {
        severity: obj
            .get("severity")
            .and_then(Value::as_str)
            .and_then(QaSeverity::parse)
            .unwrap_or(QaSeverity::Minor),
        category: non_empty_str(obj, "category")
            .unwrap_or("unknown")
            .to_string(),
        description: description.to_string(),
        screenshot: non_empty_str(obj, "screenshot").map(str::to_string),
        location: non_empty_str(obj, "location").map(str::to_string),
    })
}

fn coerce_screenshot(value: &Value) -> Option<QaScreenshot> {
    let obj = value.as_object()?;
    let path = non_empty_str(obj, "path")?;
    Some(QaScreenshot {
        label: non_empty_str(obj, "label")
            .unwrap_or("Screenshot")
            .to_string(),
        path: path.to_string(),
        timestamp: non_empty_str(obj, "timestamp")
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339()),
        annotated: obj
            .get("annotated")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}
