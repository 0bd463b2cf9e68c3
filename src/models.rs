//! Core data model: runs, steps, contract payloads, artifacts, and PR bindings.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Required coder output format. The only supported value in v0.
pub const RETURN_FORMAT_UNIFIED_DIFF: &str = "unified-diff";

/// Lifecycle states for the overall run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Failed,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Lifecycle states for an individual step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Queued,
    Planned,
    Executing,
    Validating,
    Committing,
    PrUpdated,
    Merged,
    Paused,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Planned => "planned",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Committing => "committing",
            Self::PrUpdated => "pr_updated",
            Self::Merged => "merged",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }

    /// True for states from which the step will never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed)
    }

    /// True for states that count toward run completion. A step at
    /// PR_UPDATED under a manual merge policy is done for this run even
    /// though an operator may still merge it later.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::PrUpdated | Self::Merged)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "planned" => Ok(Self::Planned),
            "executing" => Ok(Self::Executing),
            "validating" => Ok(Self::Validating),
            "committing" => Ok(Self::Committing),
            "pr_updated" => Ok(Self::PrUpdated),
            "merged" => Ok(Self::Merged),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid step state: {}", s)),
        }
    }
}

/// One end-to-end execution of an ordered sequence of steps against a
/// target repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub repo: String,
    pub base_ref: String,
    /// Working branch for this run; mutated only by the step currently
    /// in COMMITTING.
    pub branch_ref: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator-provided description of a step, accepted by `start_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub index: u32,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl StepSpec {
    pub fn new(index: u32, title: impl Into<String>) -> Self {
        Self {
            index,
            title: title.into(),
            body: String::new(),
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_acceptance_criteria(
        mut self,
        criteria: impl IntoIterator<Item = String>,
    ) -> Self {
        self.acceptance_criteria = criteria.into_iter().collect();
        self
    }
}

/// Persisted step record. Mutated only by the step state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Unique within the run; defines execution order.
    pub index: u32,
    pub title: String,
    pub body: String,
    pub status: StepState,
    pub acceptance_criteria: Vec<String>,
    /// Rendered plan text, set when the step reaches PLANNED.
    pub plan_md: Option<String>,
    /// 1-based attempt counter; incremented by operator retry.
    pub attempt: u32,
    /// State to re-enter when a paused step is retried.
    pub resume_state: Option<StepState>,
    pub pause_code: Option<String>,
    pub pause_message: Option<String>,
    /// Latest normalized work order for this step, if planned.
    pub work_order: Option<WorkOrder>,
    /// Latest coder result for this attempt, if executed.
    pub coder_result: Option<CoderResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn from_spec(run_id: Uuid, spec: &StepSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            index: spec.index,
            title: spec.title.clone(),
            body: spec.body.clone(),
            status: StepState::Queued,
            acceptance_criteria: spec.acceptance_criteria.clone(),
            plan_md: None,
            attempt: 1,
            resume_state: None,
            pause_code: None,
            pause_message: None,
            work_order: None,
            coder_result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The constrained task specification handed to the coder. Immutable once
/// issued; a retry reuses the same work order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub work_order_id: Uuid,
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    pub return_format: String,
}

/// Coder output for exactly one work order. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoderResult {
    pub work_order_id: Uuid,
    pub diff: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Fatal validation finding that blocks progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatalFinding {
    pub code: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub msg: String,
}

/// Non-blocking validation finding, attached to the eventual PR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningFinding {
    pub code: String,
    pub file: String,
    pub msg: String,
}

/// Aggregate metrics captured during a validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    #[serde(default)]
    pub lint_errors: u32,
    #[serde(default)]
    pub tests_run: u32,
    #[serde(default)]
    pub tests_failed: u32,
}

/// Structured validator output for one coder result. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub step_id: Uuid,
    #[serde(default)]
    pub fatal: Vec<FatalFinding>,
    #[serde(default)]
    pub warnings: Vec<WarningFinding>,
    #[serde(default)]
    pub metrics: ValidationMetrics,
}

impl ValidationReport {
    pub fn clean(step_id: Uuid) -> Self {
        Self {
            step_id,
            fatal: Vec::new(),
            warnings: Vec::new(),
            metrics: ValidationMetrics::default(),
        }
    }

    pub fn has_fatal(&self) -> bool {
        !self.fatal.is_empty()
    }

    pub fn fatal_count(&self) -> usize {
        self.fatal.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

/// Kind tag for persisted step byproducts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Diff,
    Doc,
    Log,
    Blob,
    Rejected,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diff => "diff",
            Self::Doc => "doc",
            Self::Log => "log",
            Self::Blob => "blob",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "diff" => Ok(Self::Diff),
            "doc" => Ok(Self::Doc),
            "log" => Ok(Self::Log),
            "blob" => Ok(Self::Blob),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid artifact kind: {}", s)),
        }
    }
}

/// Persisted byproduct of a step: a diff, a doc, a log, or a rejected patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub kind: ArtifactKind,
    /// Opaque storage locator.
    pub uri: String,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Binding between a run and its pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrBinding {
    pub run_id: Uuid,
    pub pr_number: i64,
    pub pr_url: String,
    pub head: String,
    pub base: String,
}

/// Summary returned by the GitHub integrator after applying a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchSummary {
    pub changed_files: usize,
    pub additions: usize,
    pub deletions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_strings() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Failed,
            RunStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn step_state_round_trips_through_strings() {
        for state in [
            StepState::Queued,
            StepState::Planned,
            StepState::Executing,
            StepState::Validating,
            StepState::Committing,
            StepState::PrUpdated,
            StepState::Merged,
            StepState::Paused,
            StepState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<StepState>().unwrap(), state);
        }
    }

    #[test]
    fn terminal_and_complete_states() {
        assert!(StepState::Merged.is_terminal());
        assert!(StepState::Failed.is_terminal());
        assert!(!StepState::PrUpdated.is_terminal());
        assert!(StepState::PrUpdated.is_complete());
        assert!(StepState::Merged.is_complete());
        assert!(!StepState::Paused.is_complete());
    }

    #[test]
    fn step_from_spec_starts_queued_at_attempt_one() {
        let run_id = Uuid::new_v4();
        let spec = StepSpec::new(0, "Add login form")
            .with_body("Render the form")
            .with_acceptance_criteria(vec!["form submits".to_string()]);
        let step = Step::from_spec(run_id, &spec);
        assert_eq!(step.run_id, run_id);
        assert_eq!(step.status, StepState::Queued);
        assert_eq!(step.attempt, 1);
        assert_eq!(step.acceptance_criteria.len(), 1);
        assert!(step.work_order.is_none());
    }

    #[test]
    fn validation_report_fatal_helpers() {
        let step_id = Uuid::new_v4();
        let clean = ValidationReport::clean(step_id);
        assert!(!clean.has_fatal());
        assert_eq!(clean.warning_count(), 0);

        let mut report = ValidationReport::clean(step_id);
        report.fatal.push(FatalFinding {
            code: "SYNTAX".into(),
            file: "src/app.js".into(),
            line: Some(10),
            msg: "unexpected token".into(),
        });
        assert!(report.has_fatal());
        assert_eq!(report.fatal_count(), 1);
    }

    #[test]
    fn validation_report_json_matches_contract_shape() {
        let step_id = Uuid::new_v4();
        let mut report = ValidationReport::clean(step_id);
        report.warnings.push(WarningFinding {
            code: "STYLE_LONG_LINE".into(),
            file: "src/lib.rs".into(),
            msg: "line exceeds 120 characters".into(),
        });
        report.metrics.lint_errors = 1;

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["step_id"], step_id.to_string());
        assert_eq!(json["fatal"].as_array().unwrap().len(), 0);
        assert_eq!(json["warnings"][0]["code"], "STYLE_LONG_LINE");
        assert_eq!(json["metrics"]["lint_errors"], 1);
    }

    #[test]
    fn artifact_kind_round_trips() {
        for kind in [
            ArtifactKind::Diff,
            ArtifactKind::Doc,
            ArtifactKind::Log,
            ArtifactKind::Blob,
            ArtifactKind::Rejected,
        ] {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
        }
    }

    #[test]
    fn coder_result_omits_absent_notes() {
        let result = CoderResult {
            work_order_id: Uuid::new_v4(),
            diff: "diff --git a/x b/x".into(),
            notes: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("notes"));
    }
}
