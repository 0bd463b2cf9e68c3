//! Size guard: bounds the blast radius of a single coder result before any
//! validator runs. A disabled guard still reports what it observed so the
//! metrics land in the validation event.

use serde::{Deserialize, Serialize};

use crate::diff::DiffStats;

/// Limits applied to every coder result. Constructed from `EngineConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeGuard {
    pub max_changed_lines: usize,
    pub max_new_files: usize,
    pub enabled: bool,
}

/// Outcome of a guard check. `Ok` always carries the observed stats so the
/// caller can report them even when nothing was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardResult {
    Ok {
        observed: DiffStats,
    },
    Exceeded {
        reason: &'static str,
        observed_value: usize,
        limit: usize,
    },
}

impl GuardResult {
    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded { .. })
    }
}

impl SizeGuard {
    /// Check diff statistics against the limits. Changed lines are checked
    /// before new files, so a diff exceeding both reports the line limit.
    pub fn check(&self, stats: &DiffStats) -> GuardResult {
        if !self.enabled {
            return GuardResult::Ok { observed: *stats };
        }
        if stats.changed_lines() > self.max_changed_lines {
            return GuardResult::Exceeded {
                reason: "changed lines exceed limit",
                observed_value: stats.changed_lines(),
                limit: self.max_changed_lines,
            };
        }
        if stats.new_files > self.max_new_files {
            return GuardResult::Exceeded {
                reason: "new files exceed limit",
                observed_value: stats.new_files,
                limit: self.max_new_files,
            };
        }
        GuardResult::Ok { observed: *stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SizeGuard {
        SizeGuard {
            max_changed_lines: 5000,
            max_new_files: 50,
            enabled: true,
        }
    }

    fn stats(additions: usize, deletions: usize, new_files: usize) -> DiffStats {
        DiffStats {
            changed_files: new_files.max(1),
            additions,
            deletions,
            new_files,
        }
    }

    #[test]
    fn within_limits_passes_with_observed_stats() {
        let result = guard().check(&stats(100, 20, 2));
        match result {
            GuardResult::Ok { observed } => assert_eq!(observed.changed_lines(), 120),
            GuardResult::Exceeded { .. } => panic!("should pass"),
        }
    }

    #[test]
    fn at_the_limit_passes() {
        assert!(!guard().check(&stats(5000, 0, 50)).is_exceeded());
    }

    #[test]
    fn one_over_the_line_limit_fails() {
        let result = guard().check(&stats(5001, 0, 0));
        match result {
            GuardResult::Exceeded {
                observed_value,
                limit,
                ..
            } => {
                assert_eq!(observed_value, 5001);
                assert_eq!(limit, 5000);
            }
            GuardResult::Ok { .. } => panic!("should exceed"),
        }
    }

    #[test]
    fn deletions_count_toward_changed_lines() {
        assert!(guard().check(&stats(3000, 2001, 0)).is_exceeded());
    }

    #[test]
    fn new_file_limit_fails_independently() {
        let result = guard().check(&stats(10, 0, 51));
        match result {
            GuardResult::Exceeded { reason, .. } => {
                assert!(reason.contains("new files"));
            }
            GuardResult::Ok { .. } => panic!("should exceed"),
        }
    }

    #[test]
    fn line_limit_reported_before_file_limit() {
        let result = guard().check(&stats(6000, 0, 60));
        match result {
            GuardResult::Exceeded { reason, .. } => {
                assert!(reason.contains("changed lines"));
            }
            GuardResult::Ok { .. } => panic!("should exceed"),
        }
    }

    #[test]
    fn disabled_guard_never_blocks() {
        let mut g = guard();
        g.enabled = false;
        let result = g.check(&stats(100_000, 0, 500));
        match result {
            GuardResult::Ok { observed } => assert_eq!(observed.changed_lines(), 100_000),
            GuardResult::Exceeded { .. } => panic!("disabled guard must not block"),
        }
    }
}
