//! The step state machine. One call to `advance_step` drives exactly one
//! transition; everything the next transition needs is persisted first, so
//! a crash between calls loses nothing.

use std::sync::Arc;
use std::future::Future;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{Coder, GitHub, SubPlanner};
use crate::config::EngineConfig;
use crate::contracts::{ContractRegistry, KIND_CODER_RESULT, KIND_WORK_ORDER};
use crate::diff::{self, DiffStats};
use crate::errors::{AdapterFailure, OrchestratorError, PauseReason};
use crate::events::EventType;
use crate::gate::Validator;
use crate::guard::GuardResult;
use crate::models::{
    Artifact, ArtifactKind, CoderResult, PrBinding, Run, RunStatus, Step, StepState,
    ValidationReport, WorkOrder,
};
use crate::policy::{decide_merge, MergeAction};
use crate::store::StoreHandle;

/// The single forward edge out of a live pipeline state, if any.
pub fn next_state(from: StepState) -> Option<StepState> {
    match from {
        StepState::Queued => Some(StepState::Planned),
        StepState::Planned => Some(StepState::Executing),
        StepState::Executing => Some(StepState::Validating),
        StepState::Validating => Some(StepState::Committing),
        StepState::Committing => Some(StepState::PrUpdated),
        StepState::PrUpdated => Some(StepState::Merged),
        StepState::Merged | StepState::Paused | StepState::Failed => None,
    }
}

/// Full validity table, including pause edges and retry re-entry.
pub fn is_valid_transition(from: StepState, to: StepState) -> bool {
    if from.is_terminal() {
        return false;
    }
    if from == StepState::Paused {
        // Retry re-entry: back into any live pipeline state.
        return !matches!(
            to,
            StepState::Paused | StepState::Merged | StepState::Failed
        );
    }
    match to {
        StepState::Paused | StepState::Failed => true,
        _ => next_state(from) == Some(to),
    }
}

/// Outcome of one machine step.
#[derive(Debug, Clone)]
pub enum StepAdvance {
    Transitioned { from: StepState, to: StepState },
    Paused { reason: PauseReason },
    Failed { error: String },
    /// Nothing changed; the run was paused while an adapter call was in
    /// flight and its result was shelved.
    Held,
}

/// Drives individual steps through their lifecycle. Owned by the
/// orchestrator; all collaborators are trait objects so tests inject fakes.
pub struct StepMachine {
    store: StoreHandle,
    registry: Arc<ContractRegistry>,
    planner: Arc<dyn SubPlanner>,
    coder: Arc<dyn Coder>,
    validator: Arc<dyn Validator>,
    github: Arc<dyn GitHub>,
    config: EngineConfig,
}

impl StepMachine {
    pub fn new(
        store: StoreHandle,
        registry: Arc<ContractRegistry>,
        planner: Arc<dyn SubPlanner>,
        coder: Arc<dyn Coder>,
        validator: Arc<dyn Validator>,
        github: Arc<dyn GitHub>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            planner,
            coder,
            validator,
            github,
            config,
        }
    }

    /// Drive `step` one transition forward. The caller has already checked
    /// that the run is live and that this step is the scheduled one.
    pub async fn advance_step(
        &self,
        run: &Run,
        step: Step,
    ) -> Result<StepAdvance, OrchestratorError> {
        match step.status {
            StepState::Queued => self.plan(run, step).await,
            StepState::Planned => self.execute(run, step).await,
            StepState::Executing => self.validate(run, step).await,
            StepState::Validating => self.commit(run, step).await,
            StepState::Committing => self.update_pr(run, step).await,
            StepState::PrUpdated => self.auto_merge(run, step).await,
            other => Err(OrchestratorError::InvalidTransition {
                from: other.to_string(),
                to: "<advance>".to_string(),
            }),
        }
    }

    // ── QUEUED → PLANNED ──────────────────────────────────────────────

    async fn plan(&self, run: &Run, mut step: Step) -> Result<StepAdvance, OrchestratorError> {
        let started = std::time::Instant::now();
        let order = match self
            .bounded(self.planner.build_work_order(&step))
            .await
        {
            Ok(order) => order,
            Err(failure) => {
                return self
                    .pause(run, step, PauseReason::from_adapter(&failure), StepState::Queued)
                    .await
            }
        };

        let payload = serde_json::to_value(&order).map_err(anyhow::Error::from)?;
        let normalized = match self.registry.validate(KIND_WORK_ORDER, &payload) {
            Ok(normalized) => normalized,
            Err(violation) => return self.fail(run, step, violation.to_string()).await,
        };
        let order: WorkOrder =
            serde_json::from_value(normalized.payload.clone()).map_err(anyhow::Error::from)?;

        step.plan_md = Some(render_plan(&order));
        step.work_order = Some(order);
        self.transition(&mut step, StepState::Planned).await?;
        self.emit(
            run.id,
            Some(step.id),
            EventType::StepPlanned,
            json!({
                "attempt": step.attempt,
                "transforms": normalized.transforms,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        )
        .await?;
        Ok(StepAdvance::Transitioned {
            from: StepState::Queued,
            to: StepState::Planned,
        })
    }

    // ── PLANNED → EXECUTING ───────────────────────────────────────────

    async fn execute(&self, run: &Run, mut step: Step) -> Result<StepAdvance, OrchestratorError> {
        let order = step
            .work_order
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Step {} has no work order at PLANNED", step.id))?;

        let started = std::time::Instant::now();
        let result = match self.bounded(self.coder.execute(&order)).await {
            Ok(result) => result,
            Err(failure) => {
                return self
                    .pause(run, step, PauseReason::from_adapter(&failure), StepState::Planned)
                    .await
            }
        };

        // The run may have been paused while the coder was out. A late
        // result is shelved, never applied.
        if self.paused_mid_flight(run.id).await? {
            self.shelve_rejected(
                run,
                &step,
                result.diff.clone(),
                json!({ "role": "coder_result", "work_order_id": result.work_order_id }),
            )
            .await?;
            return Ok(StepAdvance::Held);
        }

        let payload = serde_json::to_value(&result).map_err(anyhow::Error::from)?;
        if let Err(violation) = self.registry.validate(KIND_CODER_RESULT, &payload) {
            return self.fail(run, step, violation.to_string()).await;
        }
        if result.work_order_id != order.work_order_id {
            return self
                .fail(
                    run,
                    step,
                    format!(
                        "Coder result answers work order {} but {} was issued",
                        result.work_order_id, order.work_order_id
                    ),
                )
                .await;
        }
        if !diff::is_unified_diff(&result.diff) {
            return self
                .pause(
                    run,
                    step,
                    PauseReason::MalformedDiff {
                        reason: "expected 'diff --git' header".into(),
                    },
                    StepState::Planned,
                )
                .await;
        }

        self.store_diff_artifacts(run, &step, &result).await?;
        step.coder_result = Some(result);
        self.transition(&mut step, StepState::Executing).await?;
        self.emit(
            run.id,
            Some(step.id),
            EventType::StepExecuting,
            json!({
                "attempt": step.attempt,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        )
        .await?;
        Ok(StepAdvance::Transitioned {
            from: StepState::Planned,
            to: StepState::Executing,
        })
    }

    // ── EXECUTING → VALIDATING ────────────────────────────────────────

    async fn validate(&self, run: &Run, mut step: Step) -> Result<StepAdvance, OrchestratorError> {
        let result = step
            .coder_result
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Step {} has no coder result at EXECUTING", step.id))?;

        let stats = match DiffStats::from_unified(&result.diff) {
            Ok(stats) => stats,
            Err(failure) => {
                return self
                    .pause(run, step, PauseReason::from_adapter(&failure), StepState::Planned)
                    .await
            }
        };

        let guard = self.config.size_guard();
        if let GuardResult::Exceeded {
            reason,
            observed_value,
            limit,
        } = guard.check(&stats)
        {
            return self
                .pause(
                    run,
                    step,
                    PauseReason::GuardExceeded {
                        reason: reason.to_string(),
                        observed_value,
                        limit,
                    },
                    StepState::Planned,
                )
                .await;
        }

        let changed_files = diff::changed_file_paths(&result.diff);
        let started = std::time::Instant::now();
        let report = match self
            .bounded(self.validator.validate(step.id, &changed_files, &result.diff))
            .await
        {
            Ok(report) => report,
            Err(failure) => {
                return self
                    .pause(run, step, PauseReason::from_adapter(&failure), StepState::Planned)
                    .await
            }
        };

        // A report that lands after an operator pause is shelved; nothing
        // is recorded against the step and no transition happens.
        if self.paused_mid_flight(run.id).await? {
            let content = serde_json::to_string(&report).map_err(anyhow::Error::from)?;
            self.shelve_rejected(run, &step, content, json!({ "role": "validation_report" }))
                .await?;
            return Ok(StepAdvance::Held);
        }

        let (step_id, attempt, report_cl) = (step.id, step.attempt, report.clone());
        self.store
            .call(move |s| s.add_validation_report(step_id, attempt, &report_cl))
            .await?;
        self.emit(
            run.id,
            Some(step.id),
            EventType::StepValidated,
            json!({
                "attempt": step.attempt,
                "fatal_count": report.fatal_count(),
                "warning_count": report.warning_count(),
                "changed_files": stats.changed_files,
                "changed_lines": stats.changed_lines(),
                "new_files": stats.new_files,
                "guards_enabled": guard.enabled,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        )
        .await?;

        if report.has_fatal() {
            return self
                .pause(
                    run,
                    step,
                    PauseReason::ValidationFatal {
                        fatal_count: report.fatal_count(),
                    },
                    StepState::Planned,
                )
                .await;
        }

        self.transition(&mut step, StepState::Validating).await?;
        Ok(StepAdvance::Transitioned {
            from: StepState::Executing,
            to: StepState::Validating,
        })
    }

    // ── VALIDATING → COMMITTING ───────────────────────────────────────

    async fn commit(&self, run: &Run, mut step: Step) -> Result<StepAdvance, OrchestratorError> {
        let result = step
            .coder_result
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Step {} has no coder result at VALIDATING", step.id))?;

        let started = std::time::Instant::now();
        let first_time = self.first_effect(&step, "apply_patch").await?;
        let summary = if first_time {
            if let Err(failure) = self
                .github
                .ensure_branch(&run.repo, &run.base_ref, &run.branch_ref)
                .await
            {
                return self
                    .pause(run, step, PauseReason::from_adapter(&failure), StepState::Validating)
                    .await;
            }
            match self
                .github
                .apply_patch(&run.repo, &run.branch_ref, &result.diff)
                .await
            {
                Ok(summary) => Some(summary),
                Err(failure) => {
                    return self
                        .pause(
                            run,
                            step,
                            PauseReason::ApplyFailure {
                                message: failure.to_string(),
                            },
                            StepState::Validating,
                        )
                        .await
                }
            }
        } else {
            // Patch already landed on a previous crashed attempt.
            None
        };

        // A pause that lands while the patch is in flight defers the
        // transition. The branch already has the patch; the effect key
        // stops a re-apply when the run resumes.
        if self.paused_mid_flight(run.id).await? {
            if let Some(summary) = summary {
                let content = serde_json::to_string(&summary).map_err(anyhow::Error::from)?;
                self.shelve_rejected(run, &step, content, json!({ "role": "patch_summary" }))
                    .await?;
            }
            return Ok(StepAdvance::Held);
        }

        if let Some(summary) = summary {
            let artifact = self.new_artifact(run, &step, ArtifactKind::Doc);
            let meta = json!({
                "role": "patch_summary",
                "changed_files": summary.changed_files,
                "additions": summary.additions,
                "deletions": summary.deletions,
            });
            let content = serde_json::to_string(&summary).map_err(anyhow::Error::from)?;
            let artifact = Artifact { meta, ..artifact };
            self.store
                .call(move |s| s.add_artifact(&artifact, &content))
                .await?;
        }

        self.transition(&mut step, StepState::Committing).await?;
        self.emit(
            run.id,
            Some(step.id),
            EventType::StepCommitted,
            json!({
                "attempt": step.attempt,
                "branch_ref": run.branch_ref,
                "reapplied": !first_time,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        )
        .await?;
        Ok(StepAdvance::Transitioned {
            from: StepState::Validating,
            to: StepState::Committing,
        })
    }

    // ── COMMITTING → PR_UPDATED ───────────────────────────────────────

    async fn update_pr(&self, run: &Run, mut step: Step) -> Result<StepAdvance, OrchestratorError> {
        let started = std::time::Instant::now();
        let report = self.latest_report(&step).await?;
        let title = format!("{} ({})", step.title, run.repo);
        let body = render_pr_body(&step, &report);

        let run_id = run.id;
        let existing = self.store.call(move |s| s.get_pr_binding(run_id)).await?;
        let first_time = self.first_effect(&step, "update_pr").await?;

        let binding = match existing {
            Some(binding) => {
                if first_time {
                    if let Err(failure) = self
                        .github
                        .update_pr_body(&run.repo, binding.pr_number, &title, &body)
                        .await
                    {
                        return self
                            .pause(
                                run,
                                step,
                                PauseReason::from_adapter(&failure),
                                StepState::Committing,
                            )
                            .await;
                    }
                }
                binding
            }
            None => {
                let (pr_number, pr_url) = match self
                    .github
                    .upsert_pr(&run.repo, &run.branch_ref, &run.base_ref, &title, &body)
                    .await
                {
                    Ok(pr) => pr,
                    Err(failure) => {
                        return self
                            .pause(
                                run,
                                step,
                                PauseReason::from_adapter(&failure),
                                StepState::Committing,
                            )
                            .await
                    }
                };
                let binding = PrBinding {
                    run_id: run.id,
                    pr_number,
                    pr_url,
                    head: run.branch_ref.clone(),
                    base: run.base_ref.clone(),
                };
                let binding_cl = binding.clone();
                self.store
                    .call(move |s| s.upsert_pr_binding(&binding_cl))
                    .await?;
                binding
            }
        };

        // The binding is stored either way; a pause that landed while the
        // PR call was out only defers the transition.
        if self.paused_mid_flight(run.id).await? {
            self.shelve_rejected(
                run,
                &step,
                binding.pr_url.clone(),
                json!({ "role": "pr_binding", "pr_number": binding.pr_number }),
            )
            .await?;
            return Ok(StepAdvance::Held);
        }

        self.transition(&mut step, StepState::PrUpdated).await?;
        self.emit(
            run.id,
            Some(step.id),
            EventType::StepPrUpdated,
            json!({
                "attempt": step.attempt,
                "pr_number": binding.pr_number,
                "pr_url": binding.pr_url,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        )
        .await?;
        Ok(StepAdvance::Transitioned {
            from: StepState::Committing,
            to: StepState::PrUpdated,
        })
    }

    // ── PR_UPDATED → MERGED (auto policy only) ────────────────────────

    async fn auto_merge(&self, run: &Run, step: Step) -> Result<StepAdvance, OrchestratorError> {
        let report = self.latest_report(&step).await?;
        match decide_merge(self.config.merge_policy, &report).action {
            MergeAction::Auto => self.merge_step(run, step).await,
            MergeAction::Manual | MergeAction::Blocked => Err(OrchestratorError::InvalidTransition {
                from: StepState::PrUpdated.to_string(),
                to: StepState::Merged.to_string(),
            }),
        }
    }

    /// Merge the run's PR on behalf of `step`. Shared by auto-merge and
    /// the operator `merge` command; the caller has already authorized it.
    pub async fn merge_step(
        &self,
        run: &Run,
        mut step: Step,
    ) -> Result<StepAdvance, OrchestratorError> {
        let started = std::time::Instant::now();
        let run_id = run.id;
        let binding = self
            .store
            .call(move |s| s.get_pr_binding(run_id))
            .await?
            .ok_or_else(|| anyhow::anyhow!("Run {} has no PR binding to merge", run.id))?;

        if self.first_effect(&step, "merge_pr").await? {
            if let Err(failure) = self.github.merge_pr(&run.repo, binding.pr_number).await {
                return self
                    .pause(run, step, PauseReason::from_adapter(&failure), StepState::PrUpdated)
                    .await;
            }
        }

        // The merge itself may already have happened; the effect key keeps
        // it from repeating, and a mid-flight pause only defers the
        // transition until the run resumes.
        if self.paused_mid_flight(run.id).await? {
            self.shelve_rejected(
                run,
                &step,
                binding.pr_url.clone(),
                json!({ "role": "merge", "pr_number": binding.pr_number }),
            )
            .await?;
            return Ok(StepAdvance::Held);
        }

        self.transition(&mut step, StepState::Merged).await?;
        self.emit(
            run.id,
            Some(step.id),
            EventType::StepMerged,
            json!({
                "pr_number": binding.pr_number,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        )
        .await?;
        Ok(StepAdvance::Transitioned {
            from: StepState::PrUpdated,
            to: StepState::Merged,
        })
    }

    // ── Shared plumbing ───────────────────────────────────────────────

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, AdapterFailure>>,
    ) -> Result<T, AdapterFailure> {
        match tokio::time::timeout(self.config.adapter_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdapterFailure::Timeout {
                seconds: self.config.adapter_timeout.as_secs(),
            }),
        }
    }

    async fn transition(
        &self,
        step: &mut Step,
        to: StepState,
    ) -> Result<(), OrchestratorError> {
        if !is_valid_transition(step.status, to) {
            return Err(OrchestratorError::InvalidTransition {
                from: step.status.to_string(),
                to: to.to_string(),
            });
        }
        info!(step_id = %step.id, from = %step.status, to = %to, "step transition");
        step.status = to;
        let step_cl = step.clone();
        self.store.call(move |s| s.update_step(&step_cl)).await?;
        Ok(())
    }

    async fn pause(
        &self,
        run: &Run,
        mut step: Step,
        reason: PauseReason,
        resume_state: StepState,
    ) -> Result<StepAdvance, OrchestratorError> {
        warn!(step_id = %step.id, code = reason.code(), %reason, "step paused");
        step.resume_state = Some(resume_state);
        step.pause_code = Some(reason.code().to_string());
        step.pause_message = Some(reason.to_string());
        self.transition(&mut step, StepState::Paused).await?;

        let run_id = run.id;
        self.store
            .call(move |s| s.update_run_status(run_id, RunStatus::Paused))
            .await?;
        self.emit(
            run.id,
            Some(step.id),
            EventType::StepPaused,
            json!({
                "attempt": step.attempt,
                "code": reason.code(),
                "message": reason.to_string(),
                "resume_state": resume_state.as_str(),
            }),
        )
        .await?;
        self.emit(
            run.id,
            None,
            EventType::RunStatusChanged,
            json!({ "status": RunStatus::Paused.as_str() }),
        )
        .await?;
        Ok(StepAdvance::Paused { reason })
    }

    async fn fail(
        &self,
        run: &Run,
        mut step: Step,
        error: String,
    ) -> Result<StepAdvance, OrchestratorError> {
        warn!(step_id = %step.id, %error, "step failed");
        step.pause_code = Some("failed".to_string());
        step.pause_message = Some(error.clone());
        self.transition(&mut step, StepState::Failed).await?;

        let run_id = run.id;
        self.store
            .call(move |s| s.update_run_status(run_id, RunStatus::Failed))
            .await?;
        self.emit(
            run.id,
            Some(step.id),
            EventType::StepFailed,
            json!({ "attempt": step.attempt, "error": error }),
        )
        .await?;
        self.emit(
            run.id,
            None,
            EventType::RunStatusChanged,
            json!({ "status": RunStatus::Failed.as_str() }),
        )
        .await?;
        Ok(StepAdvance::Failed { error })
    }

    async fn emit(
        &self,
        run_id: Uuid,
        step_id: Option<Uuid>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        self.store
            .call(move |s| s.append_event(run_id, step_id, event_type, payload).map(|_| ()))
            .await?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Run, OrchestratorError> {
        self.store
            .call(move |s| s.get_run(run_id))
            .await?
            .ok_or(OrchestratorError::RunNotFound { run_id })
    }

    /// True when this keyed effect has not run before for this attempt.
    async fn first_effect(&self, step: &Step, action: &str) -> Result<bool, OrchestratorError> {
        let key = format!("step:{}:attempt:{}:{}", step.id, step.attempt, action);
        Ok(self.store.call(move |s| s.record_effect(&key)).await?)
    }

    fn new_artifact(&self, run: &Run, step: &Step, kind: ArtifactKind) -> Artifact {
        let id = Uuid::new_v4();
        Artifact {
            id,
            run_id: run.id,
            step_id: step.id,
            kind,
            uri: format!("artifact://{}/{}/{}", run.id, step.id, id),
            meta: json!({}),
            created_at: chrono::Utc::now(),
        }
    }

    async fn store_diff_artifacts(
        &self,
        run: &Run,
        step: &Step,
        result: &CoderResult,
    ) -> Result<(), OrchestratorError> {
        if !self.first_effect(step, "diff_artifact").await? {
            return Ok(());
        }
        let diff_artifact = Artifact {
            meta: json!({ "work_order_id": result.work_order_id }),
            ..self.new_artifact(run, step, ArtifactKind::Diff)
        };
        let content = result.diff.clone();
        self.store
            .call(move |s| s.add_artifact(&diff_artifact, &content))
            .await?;

        if let Some(notes) = &result.notes {
            let notes_artifact = Artifact {
                meta: json!({ "role": "coder_notes" }),
                ..self.new_artifact(run, step, ArtifactKind::Doc)
            };
            let notes = notes.clone();
            self.store
                .call(move |s| s.add_artifact(&notes_artifact, &notes))
                .await?;
        }
        Ok(())
    }

    /// True when the run was paused while this advance held an adapter
    /// call in flight.
    async fn paused_mid_flight(&self, run_id: Uuid) -> Result<bool, OrchestratorError> {
        Ok(self.load_run(run_id).await?.status == RunStatus::Paused)
    }

    /// Persist a late adapter result as a rejected artifact. The step does
    /// not transition and nothing else is recorded against it.
    async fn shelve_rejected(
        &self,
        run: &Run,
        step: &Step,
        content: String,
        mut meta: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        warn!(step_id = %step.id, "run paused mid-flight; shelving late result");
        if let Some(map) = meta.as_object_mut() {
            map.insert("reason".to_string(), json!("run_paused"));
        }
        let artifact = Artifact {
            meta,
            ..self.new_artifact(run, step, ArtifactKind::Rejected)
        };
        self.store
            .call(move |s| s.add_artifact(&artifact, &content))
            .await?;
        Ok(())
    }

    async fn latest_report(&self, step: &Step) -> Result<ValidationReport, OrchestratorError> {
        let step_id = step.id;
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

fn render_plan(order: &WorkOrder) -> String {
    let mut out = format!("# {}\n\n{}\n", order.title, order.objective);
    if !order.acceptance_criteria.is_empty() {
        out.push_str("\n## Acceptance criteria\n");
        for criterion in &order.acceptance_criteria {
            out.push_str(&format!("- {}\n", criterion));
        }
    }
    out
}

/// PR body rendered after each commit: the step text plus validation counts.
pub fn render_pr_body(step: &Step, report: &ValidationReport) -> String {
    format!(
        "## Step: {}\n\n{}\n\n## Validation\n\nFatal issues: {}\nWarnings: {}",
        step.title,
        step.body,
        report.fatal_count(),
        report.warning_count()
    )
}
