//! Append-only lifecycle events. Every state transition emits exactly one
//! event; the `seq` column gives a per-run total order.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type tags, persisted as dot-separated strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    RunCreated,
    RunStatusChanged,
    RunCompleted,
    StepPlanned,
    StepExecuting,
    StepValidated,
    StepCommitted,
    StepPrUpdated,
    StepMerged,
    StepPaused,
    StepFailed,
    StepRetried,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run.created",
            Self::RunStatusChanged => "run.status_changed",
            Self::RunCompleted => "run.completed",
            Self::StepPlanned => "step.planned",
            Self::StepExecuting => "step.executing",
            Self::StepValidated => "step.validated",
            Self::StepCommitted => "step.committed",
            Self::StepPrUpdated => "step.pr_updated",
            Self::StepMerged => "step.merged",
            Self::StepPaused => "step.paused",
            Self::StepFailed => "step.failed",
            Self::StepRetried => "step.retried",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run.created" => Ok(Self::RunCreated),
            "run.status_changed" => Ok(Self::RunStatusChanged),
            "run.completed" => Ok(Self::RunCompleted),
            "step.planned" => Ok(Self::StepPlanned),
            "step.executing" => Ok(Self::StepExecuting),
            "step.validated" => Ok(Self::StepValidated),
            "step.committed" => Ok(Self::StepCommitted),
            "step.pr_updated" => Ok(Self::StepPrUpdated),
            "step.merged" => Ok(Self::StepMerged),
            "step.paused" => Ok(Self::StepPaused),
            "step.failed" => Ok(Self::StepFailed),
            "step.retried" => Ok(Self::StepRetried),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

/// A persisted lifecycle event. `seq` is monotonic within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub run_id: Uuid,
    pub step_id: Option<Uuid>,
    pub seq: i64,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}
