//! Validator gate: the capability trait plus a deterministic static-check
//! implementation and a scripted fake for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::AdapterFailure;
use crate::models::{FatalFinding, ValidationReport, WarningFinding};

pub const CODE_CONFLICT_MARKER: &str = "SYNTAX_CONFLICT_MARKER";
pub const CODE_LONG_LINE: &str = "STYLE_LONG_LINE";
pub const CODE_TRAILING_WHITESPACE: &str = "STYLE_TRAILING_WHITESPACE";

const MAX_LINE_LENGTH: usize = 120;

/// Capability for validating one coder result. Implementations must be
/// deterministic for identical input.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        step_id: Uuid,
        changed_files: &[String],
        diff: &str,
    ) -> Result<ValidationReport, AdapterFailure>;
}

/// Deterministic in-process checks over the added lines of a diff. Conflict
/// markers are fatal; style issues are warnings.
#[derive(Debug, Default)]
pub struct StaticCheckGate;

impl StaticCheckGate {
    pub fn new() -> Self {
        Self
    }

    fn inspect(step_id: Uuid, changed_files: &[String], diff: &str) -> ValidationReport {
        let mut report = ValidationReport::clean(step_id);
        let mut current_file: Option<String> = None;
        let mut in_hunk = false;
        // Position in the post-patch file, tracked from the hunk header's
        // `+start`; context and added lines advance it, removals do not.
        let mut line_no: u32 = 0;

        for line in diff.lines() {
            if line.starts_with("diff --git ") {
                current_file = None;
                in_hunk = false;
                continue;
            }
            if let Some(path) = line.strip_prefix("+++ b/") {
                current_file = Some(path.to_string());
                in_hunk = false;
                continue;
            }
            if line.starts_with("@@") {
                line_no = hunk_new_start(line).unwrap_or(1);
                in_hunk = true;
                continue;
            }
            if !in_hunk {
                continue;
            }
            let Some(file) = current_file.as_deref() else {
                continue;
            };

            let Some(added) = line.strip_prefix('+') else {
                if !line.starts_with('-') {
                    line_no += 1;
                }
                continue;
            };
            let at = line_no;
            line_no += 1;
            // Added lines only, in files the caller flagged as changed.
            if !changed_files.iter().any(|f| f == file) {
                continue;
            }

            if added.starts_with("<<<<<<<")
                || added.starts_with("=======")
                || added.starts_with(">>>>>>>")
            {
                report.fatal.push(FatalFinding {
                    code: CODE_CONFLICT_MARKER.to_string(),
                    file: file.to_string(),
                    line: Some(at),
                    msg: "merge conflict marker in added line".to_string(),
                });
                continue;
            }
            if added.len() > MAX_LINE_LENGTH {
                report.warnings.push(WarningFinding {
                    code: CODE_LONG_LINE.to_string(),
                    file: file.to_string(),
                    msg: format!("added line exceeds {} characters", MAX_LINE_LENGTH),
                });
            }
            if added != added.trim_end() {
                report.warnings.push(WarningFinding {
                    code: CODE_TRAILING_WHITESPACE.to_string(),
                    file: file.to_string(),
                    msg: "trailing whitespace on added line".to_string(),
                });
            }
        }

        report.metrics.lint_errors = (report.fatal.len() + report.warnings.len()) as u32;
        report
    }
}

/// Start position of a hunk in the post-patch file, from `@@ -a,b +c,d @@`.
fn hunk_new_start(header: &str) -> Option<u32> {
    let after_plus = header.split('+').nth(1)?;
    let digits: String = after_plus
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[async_trait]
impl Validator for StaticCheckGate {
    async fn validate(
        &self,
        step_id: Uuid,
        changed_files: &[String],
        diff: &str,
    ) -> Result<ValidationReport, AdapterFailure> {
        Ok(Self::inspect(step_id, changed_files, diff))
    }
}

/// Validator that sleeps before returning a clean report, for exercising
/// in-flight pauses and adapter timeouts.
#[derive(Debug)]
pub struct StallingValidator {
    pub delay: std::time::Duration,
}

#[async_trait]
impl Validator for StallingValidator {
    async fn validate(
        &self,
        step_id: Uuid,
        _changed_files: &[String],
        _diff: &str,
    ) -> Result<ValidationReport, AdapterFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(ValidationReport::clean(step_id))
    }
}

/// Fake validator that replays queued reports. When the queue runs dry it
/// returns a clean report, so tests only script the interesting passes.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    reports: Mutex<VecDeque<ValidationReport>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_report(&self, report: ValidationReport) {
        self.reports
            .lock()
            .expect("scripted validator lock")
            .push_back(report);
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(
        &self,
        step_id: Uuid,
        _changed_files: &[String],
        _diff: &str,
    ) -> Result<ValidationReport, AdapterFailure> {
        let next = self
            .reports
            .lock()
            .expect("scripted validator lock")
            .pop_front();
        Ok(match next {
            Some(mut report) => {
                report.step_id = step_id;
                report
            }
            None => ValidationReport::clean(step_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff_with_added_lines(path: &str, lines: &[&str]) -> String {
        let mut out = format!("diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n");
        out.push_str(&format!("@@ -1,1 +1,{} @@\n", lines.len()));
        for line in lines {
            out.push('+');
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    #[tokio::test]
    async fn conflict_markers_are_fatal() {
        let diff = diff_with_added_lines("src/app.js", &["<<<<<<< HEAD", "ok line"]);
        let report = StaticCheckGate::new()
            .validate(Uuid::new_v4(), &["src/app.js".to_string()], &diff)
            .await
            .unwrap();
        assert_eq!(report.fatal_count(), 1);
        assert_eq!(report.fatal[0].code, CODE_CONFLICT_MARKER);
        assert_eq!(report.fatal[0].line, Some(1));
    }

    #[tokio::test]
    async fn finding_lines_honor_hunk_offsets() {
        let diff = "\
diff --git a/src/app.js b/src/app.js
--- a/src/app.js
+++ b/src/app.js
@@ -9,3 +10,4 @@
 context line
+<<<<<<< HEAD
 more context
@@ -40,2 +42,3 @@
 context line
+>>>>>>> theirs
";
        let report = StaticCheckGate::new()
            .validate(Uuid::new_v4(), &["src/app.js".to_string()], diff)
            .await
            .unwrap();
        assert_eq!(report.fatal_count(), 2);
        assert_eq!(report.fatal[0].line, Some(11));
        assert_eq!(report.fatal[1].line, Some(43));
    }

    #[tokio::test]
    async fn style_issues_are_warnings_only() {
        let long = "x".repeat(150);
        let diff = diff_with_added_lines("src/app.js", &[&long, "trailing  "]);
        let report = StaticCheckGate::new()
            .validate(Uuid::new_v4(), &["src/app.js".to_string()], &diff)
            .await
            .unwrap();
        assert!(!report.has_fatal());
        assert_eq!(report.warning_count(), 2);
        let codes: Vec<&str> = report.warnings.iter().map(|w| w.code.as_str()).collect();
        assert!(codes.contains(&CODE_LONG_LINE));
        assert!(codes.contains(&CODE_TRAILING_WHITESPACE));
        assert_eq!(report.metrics.lint_errors, 2);
    }

    #[tokio::test]
    async fn files_outside_the_change_set_are_ignored() {
        let diff = diff_with_added_lines("src/other.js", &["<<<<<<< HEAD"]);
        let report = StaticCheckGate::new()
            .validate(Uuid::new_v4(), &["src/app.js".to_string()], &diff)
            .await
            .unwrap();
        assert!(!report.has_fatal());
        assert_eq!(report.warning_count(), 0);
    }

    #[tokio::test]
    async fn identical_input_yields_identical_reports() {
        let diff = diff_with_added_lines("src/app.js", &["fine", "also fine  "]);
        let gate = StaticCheckGate::new();
        let step_id = Uuid::new_v4();
        let files = vec!["src/app.js".to_string()];
        let a = gate.validate(step_id, &files, &diff).await.unwrap();
        let b = gate.validate(step_id, &files, &diff).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn scripted_validator_replays_then_returns_clean() {
        let validator = ScriptedValidator::new();
        let mut scripted = ValidationReport::clean(Uuid::nil());
        scripted.fatal.push(FatalFinding {
            code: "TEST_FATAL".into(),
            file: "src/x.rs".into(),
            line: None,
            msg: "scripted".into(),
        });
        validator.push_report(scripted);

        let step_id = Uuid::new_v4();
        let first = validator.validate(step_id, &[], "").await.unwrap();
        assert!(first.has_fatal());
        assert_eq!(first.step_id, step_id);

        let second = validator.validate(step_id, &[], "").await.unwrap();
        assert!(!second.has_fatal());
    }
}
