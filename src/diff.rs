//! Unified-diff inspection: format detection, numstat-style summaries, and
//! new-file extraction. The size guard and validator gate consume these
//! statistics instead of re-parsing diffs themselves.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::AdapterFailure;

static HUNK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -\d+(,\d+)? \+\d+(,\d+)? @@").expect("valid hunk regex"));

/// Aggregated statistics for a diff under validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub changed_files: usize,
    pub additions: usize,
    pub deletions: usize,
    pub new_files: usize,
}

impl DiffStats {
    /// Total added plus removed lines, the quantity bounded by the guard.
    pub fn changed_lines(&self) -> usize {
        self.additions + self.deletions
    }

    /// Parse statistics out of a unified diff. Fails with `MalformedDiff`
    /// when the payload lacks `diff --git` headers or contains a corrupt
    /// hunk header.
    pub fn from_unified(diff: &str) -> Result<Self, AdapterFailure> {
        if !is_unified_diff(diff) {
            return Err(AdapterFailure::MalformedDiff {
                reason: "expected 'diff --git' header".into(),
            });
        }

        let mut files: BTreeSet<String> = BTreeSet::new();
        let mut additions = 0usize;
        let mut deletions = 0usize;

        for line in diff.lines() {
            if let Some(rest) = line.strip_prefix("diff --git ") {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                if let Some(target) = parts.get(1) {
                    files.insert(target.trim_start_matches("b/").to_string());
                }
                continue;
            }
            if let Some(path) = line.strip_prefix("+++ b/") {
                files.insert(path.to_string());
                continue;
            }
            if line.starts_with("--- ") || line.starts_with("+++ ") {
                continue;
            }
            if line.starts_with("@@") {
                if !HUNK_HEADER.is_match(line) {
                    return Err(AdapterFailure::MalformedDiff {
                        reason: format!("corrupt hunk header: {}", line),
                    });
                }
                continue;
            }
            if line.starts_with('+') {
                additions += 1;
            } else if line.starts_with('-') {
                deletions += 1;
            }
        }

        Ok(Self {
            changed_files: files.len(),
            additions,
            deletions,
            new_files: new_file_paths(diff).len(),
        })
    }
}

/// Return true when `text` looks like a `diff --git` payload. Leading blank
/// lines are ignored; the first non-blank line decides.
pub fn is_unified_diff(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_some_and(|line| line.starts_with("diff --git "))
}

/// Repo-relative paths introduced by the diff (files added from /dev/null
/// or marked with a `new file mode` line).
pub fn new_file_paths(diff: &str) -> Vec<String> {
    let mut new_files: Vec<String> = Vec::new();
    let mut from_dev_null = false;
    let mut new_mode = false;

    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            from_dev_null = false;
            new_mode = false;
            continue;
        }
        if line.starts_with("new file mode") {
            new_mode = true;
            continue;
        }
        if line.starts_with("--- /dev/null") {
            from_dev_null = true;
            continue;
        }
        if let Some(path) = line.strip_prefix("+++ b/") {
            if (from_dev_null || new_mode) && !new_files.iter().any(|p| p == path) {
                new_files.push(path.to_string());
            }
            from_dev_null = false;
            new_mode = false;
        }
    }

    new_files
}

/// All repo-relative paths the diff touches, in first-seen order.
pub fn changed_file_paths(diff: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for line in diff.lines() {
        if let Some(path) = line.strip_prefix("+++ b/") {
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

/// Build a synthetic single-file diff with `additions` added lines. Used by
/// fakes and tests to produce diffs of a controlled size.
pub fn synthetic_diff(path: &str, additions: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("diff --git a/{path} b/{path}\n"));
    out.push_str("new file mode 100644\n");
    out.push_str("--- /dev/null\n");
    out.push_str(&format!("+++ b/{path}\n"));
    out.push_str(&format!("@@ -0,0 +1,{} @@\n", additions.max(1)));
    for i in 0..additions {
        out.push_str(&format!("+line {}\n", i));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
diff --git a/src/app.js b/src/app.js
--- a/src/app.js
+++ b/src/app.js
@@ -1,4 +1,5 @@
 function main() {
-  return 1;
+  return 2;
+  // extra
 }
diff --git a/src/new.js b/src/new.js
new file mode 100644
--- /dev/null
+++ b/src/new.js
@@ -0,0 +1,2 @@
+export const x = 1;
+export const y = 2;
";

    #[test]
    fn detects_unified_diff_headers() {
        assert!(is_unified_diff(SAMPLE));
        assert!(is_unified_diff("\n\ndiff --git a/x b/x\n"));
        assert!(!is_unified_diff("just some prose"));
        assert!(!is_unified_diff(""));
    }

    #[test]
    fn stats_count_files_and_lines() {
        let stats = DiffStats::from_unified(SAMPLE).unwrap();
        assert_eq!(stats.changed_files, 2);
        assert_eq!(stats.additions, 4);
        assert_eq!(stats.deletions, 1);
        assert_eq!(stats.changed_lines(), 5);
        assert_eq!(stats.new_files, 1);
    }

    #[test]
    fn stats_reject_non_diff_payload() {
        let err = DiffStats::from_unified("hello world").unwrap_err();
        assert!(matches!(err, AdapterFailure::MalformedDiff { .. }));
    }

    #[test]
    fn stats_reject_corrupt_hunk_header() {
        let diff = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ bad hunk @@\n+1\n";
        let err = DiffStats::from_unified(diff).unwrap_err();
        assert!(matches!(err, AdapterFailure::MalformedDiff { .. }));
    }

    #[test]
    fn new_file_paths_finds_dev_null_and_mode_markers() {
        let new_files = new_file_paths(SAMPLE);
        assert_eq!(new_files, vec!["src/new.js".to_string()]);
    }

    #[test]
    fn changed_file_paths_preserves_order_without_duplicates() {
        let paths = changed_file_paths(SAMPLE);
        assert_eq!(
            paths,
            vec!["src/app.js".to_string(), "src/new.js".to_string()]
        );
    }

    #[test]
    fn synthetic_diff_parses_with_requested_size() {
        let diff = synthetic_diff("src/gen.rs", 120);
        let stats = DiffStats::from_unified(&diff).unwrap();
        assert_eq!(stats.additions, 120);
        assert_eq!(stats.new_files, 1);
        assert_eq!(stats.changed_files, 1);
    }

    #[test]
    fn stats_are_deterministic_for_identical_input() {
        let a = DiffStats::from_unified(SAMPLE).unwrap();
        let b = DiffStats::from_unified(SAMPLE).unwrap();
        assert_eq!(a, b);
    }
}
