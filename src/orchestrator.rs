//! Run orchestration: accepts run specs, schedules exactly one live step at
//! a time, and exposes the operator commands (pause, resume, retry, merge).

use std::sync::Arc;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::agents::{Coder, GitHub, SubPlanner};
use crate::config::EngineConfig;
use crate::contracts::ContractRegistry;
use crate::errors::{OrchestratorError, PauseReason};
use crate::events::{EventRecord, EventType};
use crate::gate::Validator;
use crate::machine::{StepAdvance, StepMachine};
use crate::models::{
    Artifact, PrBinding, Run, RunStatus, Step, StepSpec, StepState, ValidationReport,
};
use crate::policy::{decide_merge, MergeAction, MergePolicy};
use crate::store::StoreHandle;

/// What one `advance` call did.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Advanced {
        step_id: Uuid,
        from: StepState,
        to: StepState,
    },
    Paused {
        step_id: Uuid,
        reason: PauseReason,
    },
    Failed {
        step_id: Uuid,
        error: String,
    },
    /// A late adapter result was shelved because the run was paused.
    Held {
        step_id: Uuid,
    },
    /// Every step is done; the run is (now) completed.
    RunCompleted,
    /// Nothing to do (failed run, or waiting on an operator).
    Idle,
}

pub struct Orchestrator {
    store: StoreHandle,
    machine: StepMachine,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: StoreHandle,
        registry: Arc<ContractRegistry>,
        planner: Arc<dyn SubPlanner>,
        coder: Arc<dyn Coder>,
        validator: Arc<dyn Validator>,
        github: Arc<dyn GitHub>,
        config: EngineConfig,
    ) -> Self {
        let machine = StepMachine::new(
            store.clone(),
            registry,
            planner,
            coder,
            validator,
            github,
            config.clone(),
        );
        Self {
            store,
            machine,
            config,
        }
    }

    /// Create a run and its steps, then mark it running. The working branch
    /// is derived from the configured prefix plus a short random suffix.
    pub async fn start_run(
        &self,
        repo: &str,
        base_ref: &str,
        specs: Vec<StepSpec>,
    ) -> Result<Run, OrchestratorError> {
        if specs.is_empty() {
            return Err(OrchestratorError::InvalidRunSpec {
                reason: "a run needs at least one step".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &specs {
            if spec.title.trim().is_empty() {
                return Err(OrchestratorError::InvalidRunSpec {
                    reason: format!("step {} has an empty title", spec.index),
                });
            }
            if !seen.insert(spec.index) {
                return Err(OrchestratorError::InvalidRunSpec {
                    reason: format!("duplicate step index {}", spec.index),
                });
            }
        }

        let suffix = Uuid::new_v4().simple().to_string();
        let now = chrono::Utc::now();
        let mut run = Run {
            id: Uuid::new_v4(),
            repo: repo.to_string(),
            base_ref: base_ref.to_string(),
            branch_ref: format!("{}-{}", self.config.branch_prefix, &suffix[..8]),
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
        };
        let steps: Vec<Step> = specs.iter().map(|s| Step::from_spec(run.id, s)).collect();

        let (run_cl, steps_cl) = (run.clone(), steps.clone());
        self.store
            .call(move |s| {
                s.create_run(&run_cl)?;
                s.insert_steps(&steps_cl)?;
                s.append_event(
                    run_cl.id,
                    None,
                    EventType::RunCreated,
                    json!({
                        "repo": run_cl.repo,
                        "base_ref": run_cl.base_ref,
                        "branch_ref": run_cl.branch_ref,
                        "step_count": steps_cl.len(),
                    }),
                )?;
                s.update_run_status(run_cl.id, RunStatus::Running)?;
                s.append_event(
                    run_cl.id,
                    None,
                    EventType::RunStatusChanged,
                    json!({ "status": RunStatus::Running.as_str() }),
                )?;
                Ok(())
            })
            .await?;
        run.status = RunStatus::Running;
        info!(run_id = %run.id, repo, steps = steps.len(), "run started");
        Ok(run)
    }

    /// Drive the run one transition forward. Exactly one step is live at a
    /// time; steps execute in index order.
    pub async fn advance(&self, run_id: Uuid) -> Result<StepOutcome, OrchestratorError> {
        let run = self.load_run(run_id).await?;
        match run.status {
            RunStatus::Paused => return Err(OrchestratorError::RunPaused { run_id }),
            RunStatus::Failed => return Ok(StepOutcome::Idle),
            RunStatus::Completed => return Ok(StepOutcome::RunCompleted),
            RunStatus::Queued | RunStatus::Running => {}
        }

        let steps = self.list_steps(run_id).await?;
        let next = steps.iter().find(|s| self.actionable(s.status)).cloned();
        let Some(step) = next else {
            if steps.iter().all(|s| self.step_done(s.status)) {
                self.complete_run(&run).await?;
                return Ok(StepOutcome::RunCompleted);
            }
            // A non-done, non-actionable step is waiting on an operator.
            return Ok(StepOutcome::Idle);
        };

        let step_id = step.id;
        let advance = self.machine.advance_step(&run, step).await?;
        Ok(match advance {
            StepAdvance::Transitioned { from, to } => StepOutcome::Advanced { step_id, from, to },
            StepAdvance::Paused { reason } => StepOutcome::Paused { step_id, reason },
            StepAdvance::Failed { error } => StepOutcome::Failed { step_id, error },
            StepAdvance::Held => StepOutcome::Held { step_id },
        })
    }

    /// Keep advancing until the run completes, pauses, fails, or idles.
    /// Returns the last outcome.
    pub async fn advance_until_blocked(
        &self,
        run_id: Uuid,
    ) -> Result<StepOutcome, OrchestratorError> {
        loop {
            match self.advance(run_id).await {
                Ok(StepOutcome::Advanced { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Pause the run. In-flight adapter work is not interrupted; its result
    /// will be shelved when it lands.
    pub async fn pause(&self, run_id: Uuid) -> Result<(), OrchestratorError> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(());
        }
        self.store
            .call(move |s| {
                s.update_run_status(run_id, RunStatus::Paused)?;
                s.append_event(
                    run_id,
                    None,
                    EventType::RunStatusChanged,
                    json!({ "status": RunStatus::Paused.as_str() }),
                )?;
                Ok(())
            })
            .await?;
        info!(run_id = %run_id, "run paused");
        Ok(())
    }

    /// Resume a paused run. A paused step still needs `retry` before it
    /// moves again.
    pub async fn resume(&self, run_id: Uuid) -> Result<(), OrchestratorError> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Paused {
            return Ok(());
        }
        self.store
            .call(move |s| {
                s.update_run_status(run_id, RunStatus::Running)?;
                s.append_event(
                    run_id,
                    None,
                    EventType::RunStatusChanged,
                    json!({ "status": RunStatus::Running.as_str() }),
                )?;
                Ok(())
            })
            .await?;
        info!(run_id = %run_id, "run resumed");
        Ok(())
    }

    /// Retry a paused step: bump the attempt, clear the pause, and re-enter
    /// the state that produced it. Also resumes the run.
    pub async fn retry(&self, run_id: Uuid, step_id: Uuid) -> Result<Step, OrchestratorError> {
        let run = self.load_run(run_id).await?;
        let mut step = self.load_step(step_id).await?;
        if step.run_id != run_id {
            return Err(OrchestratorError::StepNotFound { step_id });
        }
        if step.status != StepState::Paused {
            return Err(OrchestratorError::NotPaused {
                step_id,
                status: step.status.to_string(),
            });
        }

        let target = step.resume_state.unwrap_or(StepState::Queued);
        step.attempt += 1;
        step.status = target;
        step.resume_state = None;
        step.pause_code = None;
        step.pause_message = None;
        // Work behind the re-entry point is rebuilt on the new attempt.
        if matches!(target, StepState::Queued) {
            step.work_order = None;
            step.plan_md = None;
        }
        if matches!(target, StepState::Queued | StepState::Planned) {
            step.coder_result = None;
        }

        let step_cl = step.clone();
        let attempt = step.attempt;
        self.store
            .call(move |s| {
                s.update_step(&step_cl)?;
                s.append_event(
                    step_cl.run_id,
                    Some(step_cl.id),
                    EventType::StepRetried,
                    json!({
                        "attempt": attempt,
                        "resume_state": target.as_str(),
                    }),
                )?;
                Ok(())
            })
            .await?;
        if run.status == RunStatus::Paused {
            self.resume(run_id).await?;
        }
        info!(run_id = %run_id, step_id = %step_id, attempt, state = %target, "step retried");
        Ok(step)
    }

    /// Operator merge for a step sitting at PR_UPDATED. Fatal findings in
    /// the latest report block it regardless of policy.
    pub async fn merge(&self, run_id: Uuid, step_id: Uuid) -> Result<Step, OrchestratorError> {
        let run = self.load_run(run_id).await?;
        if run.status == RunStatus::Paused {
            return Err(OrchestratorError::RunPaused { run_id });
        }
        let step = self.load_step(step_id).await?;
        if step.run_id != run_id {
            return Err(OrchestratorError::StepNotFound { step_id });
        }
        if step.status != StepState::PrUpdated {
            return Err(OrchestratorError::InvalidTransition {
                from: step.status.to_string(),
                to: StepState::Merged.to_string(),
            });
        }
        let report = self.latest_report(step_id).await?;
        if decide_merge(MergePolicy::Manual, &report).action == MergeAction::Blocked {
            return Err(OrchestratorError::InvalidTransition {
                from: StepState::PrUpdated.to_string(),
                to: StepState::Merged.to_string(),
            });
        }
        self.machine.merge_step(&run, step).await?;
        info!(run_id = %run_id, step_id = %step_id, "step merged");
        self.load_step(step_id).await
    }

    // ── Read access ───────────────────────────────────────────────────

    pub async fn run(&self, run_id: Uuid) -> Result<Run, OrchestratorError> {
        self.load_run(run_id).await
    }

    pub async fn steps(&self, run_id: Uuid) -> Result<Vec<Step>, OrchestratorError> {
        self.list_steps(run_id).await
    }

    pub async fn events(&self, run_id: Uuid) -> Result<Vec<EventRecord>, OrchestratorError> {
        Ok(self.store.call(move |s| s.list_events(run_id)).await?)
    }

    pub async fn artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>, OrchestratorError> {
        Ok(self.store.call(move |s| s.list_artifacts(run_id)).await?)
    }

    pub async fn validation_reports(
        &self,
        step_id: Uuid,
    ) -> Result<Vec<(u32, ValidationReport)>, OrchestratorError> {
        Ok(self
            .store
            .call(move |s| s.list_validation_reports(step_id))
            .await?)
    }

    pub async fn pr_binding(&self, run_id: Uuid) -> Result<Option<PrBinding>, OrchestratorError> {
        Ok(self.store.call(move |s| s.get_pr_binding(run_id)).await?)
    }

    // ── Scheduling ────────────────────────────────────────────────────

    fn actionable(&self, state: StepState) -> bool {
        match state {
            StepState::Queued
            | StepState::Planned
            | StepState::Executing
            | StepState::Validating
            | StepState::Committing => true,
            StepState::PrUpdated => self.config.merge_policy == MergePolicy::Auto,
            StepState::Merged | StepState::Paused | StepState::Failed => false,
        }
    }

    fn step_done(&self, state: StepState) -> bool {
        match self.config.merge_policy {
            MergePolicy::Auto => state == StepState::Merged,
            MergePolicy::Manual => state.is_complete(),
        }
    }

    async fn complete_run(&self, run: &Run) -> Result<(), OrchestratorError> {
        let run_id = run.id;
        self.store
            .call(move |s| {
                s.update_run_status(run_id, RunStatus::Completed)?;
                s.append_event(run_id, None, EventType::RunCompleted, json!({}))?;
                Ok(())
            })
            .await?;
        info!(run_id = %run.id, "run completed");
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Run, OrchestratorError> {
        self.store
            .call(move |s| s.get_run(run_id))
            .await?
            .ok_or(OrchestratorError::RunNotFound { run_id })
    }

    async fn load_step(&self, step_id: Uuid) -> Result<Step, OrchestratorError> {
        self.store
            .call(move |s| s.get_step(step_id))
            .await?
            .ok_or(OrchestratorError::StepNotFound { step_id })
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, OrchestratorError> {
        Ok(self.store.call(move |s| s.list_steps(run_id)).await?)
    }

    async fn latest_report(&self, step_id: Uuid) -> Result<ValidationReport, OrchestratorError> {
        let reports = self
            .store
            .call(move |s| s.list_validation_reports(step_id))
            .await?;
        Ok(reports
            .into_iter()
            .next_back()
            .map(|(_, report)| report)
            .unwrap_or_else(|| ValidationReport::clean(step_id)))
    }
}
