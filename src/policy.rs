//! Merge policy: decides what happens to a step after its PR is updated.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::models::ValidationReport;

/// Configured merge behavior for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// An operator must call `merge` explicitly.
    #[default]
    Manual,
    /// Merge immediately after the PR body is updated, unless blocked.
    Auto,
}

impl MergePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            _ => Err(format!("Invalid merge policy: {}", s)),
        }
    }
}

/// Action to take for a step at PR_UPDATED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Leave the step at PR_UPDATED for an operator.
    Manual,
    /// Merge now.
    Auto,
    /// Never merge this attempt.
    Blocked,
}

/// A merge action plus the reason it was chosen, for event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDecision {
    pub action: MergeAction,
    pub reason: &'static str,
}

/// Evaluate the merge policy against the step's latest validation report.
/// Fatal findings always block, regardless of policy.
pub fn decide_merge(policy: MergePolicy, report: &ValidationReport) -> MergeDecision {
    if report.has_fatal() {
        return MergeDecision {
            action: MergeAction::Blocked,
            reason: "fatal_validation",
        };
    }
    match policy {
        MergePolicy::Auto => MergeDecision {
            action: MergeAction::Auto,
            reason: "auto_policy",
        },
        MergePolicy::Manual => MergeDecision {
            action: MergeAction::Manual,
            reason: "manual_policy",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FatalFinding;
    use uuid::Uuid;

    #[test]
    fn clean_report_under_manual_policy_waits_for_operator() {
        let report = ValidationReport::clean(Uuid::new_v4());
        let decision = decide_merge(MergePolicy::Manual, &report);
        assert_eq!(decision.action, MergeAction::Manual);
    }

    #[test]
    fn clean_report_under_auto_policy_merges() {
        let report = ValidationReport::clean(Uuid::new_v4());
        let decision = decide_merge(MergePolicy::Auto, &report);
        assert_eq!(decision.action, MergeAction::Auto);
    }

    #[test]
    fn fatal_findings_block_even_under_auto_policy() {
        let mut report = ValidationReport::clean(Uuid::new_v4());
        report.fatal.push(FatalFinding {
            code: "SYNTAX_CONFLICT_MARKER".into(),
            file: "src/app.js".into(),
            line: Some(1),
            msg: "conflict marker".into(),
        });
        let decision = decide_merge(MergePolicy::Auto, &report);
        assert_eq!(decision.action, MergeAction::Blocked);
        assert_eq!(decision.reason, "fatal_validation");
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("auto".parse::<MergePolicy>().unwrap(), MergePolicy::Auto);
        assert_eq!(
            "manual".parse::<MergePolicy>().unwrap(),
            MergePolicy::Manual
        );
        assert!("yolo".parse::<MergePolicy>().is_err());
    }
}
