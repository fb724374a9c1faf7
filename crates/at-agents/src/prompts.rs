//! Directive strings sent to agent processes.
//!
//! Planning and execution use the agent's slash commands
//! (`/plan-feature`, `/implement-feature`). QA directives are longer
//! instructions that end with a fixed block describing the verification
//! suite and the JSON report schema the report parser expects.

use at_core::types::QaMode;

use crate::qa_runner::QaContext;

/// Plan excerpts longer than this are cut at a char boundary.
pub const PLAN_EXCERPT_LIMIT: usize = 4_000;

pub fn planning_directive(description: &str) -> String {
    format!("/plan-feature {}", description.trim())
}

pub fn execution_directive(description: &str, plan_ref: Option<&str>) -> String {
    let mut directive = format!("/implement-feature {}", description.trim());
    if let Some(plan) = plan_ref.map(str::trim).filter(|p| !p.is_empty()) {
        directive.push_str(" --plan ");
        directive.push_str(plan);
    }
    directive
}

pub fn replan_directive(description: &str, feedback: &str) -> String {
    format!(
        "{}\n\nReviewer feedback:\n{}",
        planning_directive(description),
        feedback.trim()
    )
}

// ---------------------------------------------------------------------------
// QA directives
// ---------------------------------------------------------------------------

const QUIET_HEADER: &str = "\
You are running a QUIET QA pass. Keep the scope tight:
1. Start the application and watch the console for errors and warnings.
2. Exercise only the areas touched by the changes below.
3. Capture one screenshot per affected screen.";

const FULL_HEADER: &str = "\
You are running a FULL QA pass. Be exhaustive:
1. Walk through every user-facing flow, not only the changed areas.
2. Review accessibility: keyboard navigation, focus order, contrast, labels.
3. Capture annotated screenshots for every issue you find.
4. Record the console output for each flow.";

const REPORT_FOOTER: &str = r#"Finally, run the verification suite: lint, typecheck, test, build, docs.

Report your findings as exactly one fenced ```json block using this schema:
{
  "result": "pass" | "fail" | "warnings",
  "checksRun": <integer>,
  "checksPassed": <integer>,
  "issues": [
    {
      "severity": "critical" | "major" | "minor" | "cosmetic",
      "category": "<string>",
      "description": "<string>",
      "screenshot": "<path, optional>",
      "location": "<where, optional>"
    }
  ],
  "verificationSuite": {
    "lint": "pass" | "fail",
    "typecheck": "pass" | "fail",
    "test": "pass" | "fail",
    "build": "pass" | "fail",
    "docs": "pass" | "fail"
  },
  "screenshots": [
    { "label": "<string>", "path": "<path>", "timestamp": "<ISO-8601>", "annotated": true | false }
  ]
}
Use "fail" if any critical issue was found or any verification step failed."#;

/// Build the QA directive for `mode`.
pub fn qa_directive(mode: QaMode, task_id: &str, context: &QaContext) -> String {
    let mut out = String::new();
    out.push_str(match mode {
        QaMode::Quiet => QUIET_HEADER,
        QaMode::Full => FULL_HEADER,
    });
    out.push_str(&format!("\n\nTask: {task_id}"));
    if let Some(description) = context.task_description.as_deref() {
        out.push_str(&format!("\nDescription: {}", description.trim()));
    }

    if !context.changed_files.is_empty() {
        out.push_str("\n\nChanged files:");
        for file in &context.changed_files {
            out.push_str("\n- ");
            out.push_str(file);
        }
    }

    if let Some(plan) = context
        .plan_excerpt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        out.push_str("\n\nImplementation plan (excerpt):\n");
        out.push_str(truncate_chars(plan, PLAN_EXCERPT_LIMIT));
    }

    out.push_str("\n\n");
    out.push_str(REPORT_FOOTER);
    out
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn context() -> QaContext {
        QaContext {
            project_path: PathBuf::from("/tmp/proj"),
            task_description: Some("Add dark mode".into()),
            changed_files: vec!["src/theme.rs".into(), "src/ui.rs".into()],
            plan_excerpt: Some("1. add palette\n2. wire toggle".into()),
        }
    }

    #[test]
    fn planning_and_execution_directives() {
        assert_eq!(planning_directive(" Add dark mode "), "/plan-feature Add dark mode");
        assert_eq!(
            execution_directive("Add dark mode", Some("docs/plan.md")),
            "/implement-feature Add dark mode --plan docs/plan.md"
        );
        assert_eq!(
            execution_directive("Add dark mode", Some("  ")),
            "/implement-feature Add dark mode"
        );
    }

    #[test]
    fn replan_appends_feedback() {
        let d = replan_directive("Add dark mode", "Split the palette work out");
        assert!(d.starts_with("/plan-feature Add dark mode\n\nReviewer feedback:\n"));
        assert!(d.ends_with("Split the palette work out"));
    }

    #[test]
    fn qa_directive_embeds_context() {
        let d = qa_directive(QaMode::Quiet, "task-7", &context());
        assert!(d.starts_with("You are running a QUIET QA pass"));
        assert!(d.contains("Task: task-7"));
        assert!(d.contains("- src/theme.rs\n- src/ui.rs"));
        assert!(d.contains("Implementation plan (excerpt):\n1. add palette"));
        assert!(d.contains("\"verificationSuite\""));
        assert!(d.contains("```json"));
    }

    #[test]
    fn full_directive_mentions_accessibility() {
        let d = qa_directive(QaMode::Full, "task-7", &QaContext::new("/tmp/proj"));
        assert!(d.contains("accessibility"));
        assert!(!d.contains("Changed files:"));
        assert!(!d.contains("Implementation plan"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
